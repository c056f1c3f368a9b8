#![no_std]

// Types shared with the enforcement engine. Layouts here must match the
// engine object loaded at runtime.

use core::fmt::Display;

/// Hash map of pod address -> `EnforcementFlag`.
pub const MAP_BLOCKED_PODS: &str = "blocked_pods";
/// Ring buffer carrying one `FlowEvent` per observed packet.
pub const MAP_EVENTS: &str = "events";
/// TC classifier attached to the host side of each pod veth.
pub const PROGRAM_MONITOR_EGRESS: &str = "monitor_egress";

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default)]
pub enum EnforcementFlag {
    #[default]
    Monitor = 0,
    Block = 1,
}

impl EnforcementFlag {
    pub fn from_block_mode(block: bool) -> Self {
        if block {
            EnforcementFlag::Block
        } else {
            EnforcementFlag::Monitor
        }
    }
}

impl From<EnforcementFlag> for u8 {
    fn from(value: EnforcementFlag) -> Self {
        value as u8
    }
}

impl From<u8> for EnforcementFlag {
    fn from(value: u8) -> Self {
        match value {
            1 => EnforcementFlag::Block,
            _ => EnforcementFlag::Monitor,
        }
    }
}

impl Display for EnforcementFlag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EnforcementFlag::Monitor => write!(f, "monitor"),
            EnforcementFlag::Block => write!(f, "BLOCK"),
        }
    }
}

/// Raw flow record as submitted by the engine.
///
/// Addresses are the untouched `saddr`/`daddr` words from the IPv4 header.
/// Ports are already converted to host order by the engine.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlowEvent {
    pub saddr: u32,
    pub daddr: u32,
    pub sport: u16,
    pub dport: u16,
    pub protocol: u8,
    pub blocked: u8,
    pub found_in_map: u8,
    pub block_flag_value: u8,
    pub saddr_lookup: u32,
}

impl FlowEvent {
    pub const LEN: usize = 20;

    /// Decodes a record serialized in little-endian order. Returns `None` if
    /// `buf` is shorter than `FlowEvent::LEN`; trailing bytes are ignored.
    pub fn from_le_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let u16_at = |i: usize| u16::from_le_bytes([buf[i], buf[i + 1]]);
        Some(FlowEvent {
            saddr: u32_at(0),
            daddr: u32_at(4),
            sport: u16_at(8),
            dport: u16_at(10),
            protocol: buf[12],
            blocked: buf[13],
            found_in_map: buf[14],
            block_flag_value: buf[15],
            saddr_lookup: u32_at(16),
        })
    }

    pub fn to_le_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.saddr.to_le_bytes());
        out[4..8].copy_from_slice(&self.daddr.to_le_bytes());
        out[8..10].copy_from_slice(&self.sport.to_le_bytes());
        out[10..12].copy_from_slice(&self.dport.to_le_bytes());
        out[12] = self.protocol;
        out[13] = self.blocked;
        out[14] = self.found_in_map;
        out[15] = self.block_flag_value;
        out[16..20].copy_from_slice(&self.saddr_lookup.to_le_bytes());
        out
    }
}
