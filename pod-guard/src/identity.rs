use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock};

use ahash::HashMap;
use serde::Serialize;

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PodIdentity {
    pub address: Ipv4Addr,
    pub name: String,
}

/// Immutable address -> pod mapping for one synchronization cycle.
#[derive(Clone, Debug, Default)]
pub struct IdentitySnapshot {
    version: u64,
    pods: HashMap<Ipv4Addr, PodIdentity>,
}

impl IdentitySnapshot {
    /// Later identities win when the same address appears twice.
    pub fn from_identities(identities: impl IntoIterator<Item = PodIdentity>) -> Self {
        let pods = identities
            .into_iter()
            .map(|identity| (identity.address, identity))
            .collect();
        Self { version: 0, pods }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, address: &Ipv4Addr) -> Option<&PodIdentity> {
        self.pods.get(address)
    }

    pub fn contains(&self, address: &Ipv4Addr) -> bool {
        self.pods.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    /// Identities ordered by address.
    pub fn sorted(&self) -> Vec<&PodIdentity> {
        let mut pods: Vec<&PodIdentity> = self.pods.values().collect();
        pods.sort_by_key(|p| p.address);
        pods
    }
}

#[derive(Serialize)]
struct SnapshotView<'a> {
    version: u64,
    pods: Vec<&'a PodIdentity>,
}

impl Serialize for IdentitySnapshot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SnapshotView {
            version: self.version,
            pods: self.sorted(),
        }
        .serialize(serializer)
    }
}

/// Shared handle to the current `IdentitySnapshot`.
///
/// There is a single writer (the synchronizer). The lock is only held to swap
/// or clone the `Arc`, so readers never observe a partially built snapshot and
/// never wait on a rebuild.
#[derive(Clone, Default)]
pub struct IdentityTable {
    current: Arc<RwLock<Arc<IdentitySnapshot>>>,
}

impl IdentityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current snapshot and returns the published version.
    pub fn publish(&self, mut snapshot: IdentitySnapshot) -> u64 {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        snapshot.version = current.version + 1;
        let version = snapshot.version;
        *current = Arc::new(snapshot);
        version
    }

    pub fn snapshot(&self) -> Arc<IdentitySnapshot> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&current)
    }

    pub fn lookup(&self, address: &Ipv4Addr) -> Option<PodIdentity> {
        self.snapshot().get(address).cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn identity(address: [u8; 4], name: &str) -> PodIdentity {
        PodIdentity {
            address: Ipv4Addr::from(address),
            name: name.into(),
        }
    }

    #[test]
    fn test_duplicate_address_last_writer_wins() {
        let snapshot = IdentitySnapshot::from_identities([
            identity([10, 0, 0, 5], "web-1"),
            identity([10, 0, 0, 5], "web-2"),
        ]);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot.get(&Ipv4Addr::new(10, 0, 0, 5)).map(|p| p.name.as_str()),
            Some("web-2")
        );
    }

    #[test]
    fn test_distinct_addresses_do_not_collide() {
        let snapshot = IdentitySnapshot::from_identities([
            identity([10, 0, 0, 5], "web-1"),
            identity([5, 0, 0, 10], "web-2"),
            identity([10, 0, 5, 0], "web-3"),
        ]);
        assert_eq!(snapshot.len(), 3);
        for pod in snapshot.sorted() {
            assert_eq!(snapshot.get(&pod.address), Some(pod));
        }
        assert_eq!(snapshot.get(&Ipv4Addr::new(10, 0, 0, 5)).unwrap().name, "web-1");
        assert_eq!(snapshot.get(&Ipv4Addr::new(5, 0, 0, 10)).unwrap().name, "web-2");
        assert!(snapshot.get(&Ipv4Addr::new(0, 5, 0, 10)).is_none());
    }

    #[test]
    fn test_publish_replaces_whole_snapshot() {
        let table = IdentityTable::new();
        assert!(table.snapshot().is_empty());
        assert_eq!(table.snapshot().version(), 0);

        let first = table.publish(IdentitySnapshot::from_identities([
            identity([10, 0, 0, 5], "web-1"),
            identity([10, 0, 0, 6], "web-2"),
        ]));
        let held = table.snapshot();

        let second =
            table.publish(IdentitySnapshot::from_identities([identity([10, 0, 0, 7], "web-3")]));
        assert!(second > first);

        // a reader holding the old snapshot keeps a complete view
        assert_eq!(held.version(), first);
        assert_eq!(held.len(), 2);
        assert!(held.contains(&Ipv4Addr::new(10, 0, 0, 5)));

        let current = table.snapshot();
        assert_eq!(current.version(), second);
        assert_eq!(current.len(), 1);
        assert!(table.lookup(&Ipv4Addr::new(10, 0, 0, 5)).is_none());
        assert_eq!(
            table.lookup(&Ipv4Addr::new(10, 0, 0, 7)).map(|p| p.name),
            Some("web-3".to_string())
        );
    }

    #[test]
    fn test_snapshot_serializes_sorted() {
        let snapshot = IdentitySnapshot::from_identities([
            identity([10, 0, 0, 9], "b"),
            identity([10, 0, 0, 2], "a"),
        ]);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "version": 0,
                "pods": [
                    {"address": "10.0.0.2", "name": "a"},
                    {"address": "10.0.0.9", "name": "b"},
                ]
            })
        );
    }
}
