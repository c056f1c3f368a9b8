pub mod convert;
pub mod loader;

use std::borrow::BorrowMut;
use std::hash::Hash;
use std::net::Ipv4Addr;

use aya::Pod;
use aya::maps::{HashMap, MapData};
use pod_guard_common::EnforcementFlag;

use crate::Result;

/// Enforcement table as exposed by the engine.
pub type BlockedPodsMap = HashMap<MapData, u32, u8>;

pub trait BpfMap<K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()>;
    fn delete(&mut self, key: &K) -> Result<()>;
    fn get(&self, key: &K) -> Result<V>;
    fn get_state(&self) -> Result<ahash::HashMap<K, V>>;
}

impl<T: BorrowMut<MapData>, K: Pod + Eq + Hash, V: Pod> BpfMap<K, V> for HashMap<T, K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()> {
        Ok(self.insert(key, value, 0)?)
    }
    fn delete(&mut self, key: &K) -> Result<()> {
        Ok(self.remove(key)?)
    }
    fn get(&self, key: &K) -> Result<V> {
        Ok(<HashMap<T, K, V>>::get(self, key, 0)?)
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        let mut map = ahash::HashMap::default();
        for v in self.iter() {
            let (k, v) = v?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

impl<K: Eq + Hash + Clone, V: Clone> BpfMap<K, V> for ahash::HashMap<K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()> {
        self.insert(key, value);
        Ok(())
    }
    fn delete(&mut self, key: &K) -> Result<()> {
        self.remove(key);
        Ok(())
    }
    fn get(&self, key: &K) -> Result<V> {
        match <ahash::HashMap<K, V>>::get(self, key) {
            Some(v) => Ok(v.clone()),
            None => Err(crate::Error::Other("not found".into())),
        }
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        Ok(self.clone())
    }
}

/// Typed view over the engine's `blocked_pods` table.
///
/// Writes are unconditional upserts: every cycle rewrites every entry, so a
/// value clobbered outside this process is restored on the next cycle.
pub struct EnforcementTable<M>
where
    M: BpfMap<u32, u8>,
{
    bpf_map: M,
}

impl<M> EnforcementTable<M>
where
    M: BpfMap<u32, u8>,
{
    pub fn new(bpf_map: M) -> Self {
        Self { bpf_map }
    }

    /// Writes `flag` for `addr` and returns the raw key used.
    pub fn write(&mut self, addr: Ipv4Addr, flag: EnforcementFlag) -> Result<u32> {
        let key = convert::table_key(addr);
        self.bpf_map.update(key, flag.into())?;
        Ok(key)
    }

    pub fn remove(&mut self, addr: Ipv4Addr) -> Result<()> {
        self.bpf_map.delete(&convert::table_key(addr))
    }

    pub fn flag(&self, addr: Ipv4Addr) -> Result<EnforcementFlag> {
        self.bpf_map
            .get(&convert::table_key(addr))
            .map(EnforcementFlag::from)
    }

    pub fn entries(&self) -> Result<ahash::HashMap<u32, u8>> {
        self.bpf_map.get_state()
    }

    #[cfg(test)]
    pub(crate) fn inner_mut(&mut self) -> &mut M {
        &mut self.bpf_map
    }
}
