//! Address encodings used at the two boundaries with the engine.
//!
//! These are two independent byte-order domains and must stay separate
//! functions: the table key follows the host's native layout, the event record
//! follows the engine's little-endian wire serialization.

use std::net::Ipv4Addr;

/// Key for the `blocked_pods` table.
///
/// The engine looks entries up with the raw `saddr` word of the IPv4 header,
/// so the key is the address octets reinterpreted in host byte order.
pub fn table_key(addr: Ipv4Addr) -> u32 {
    u32::from_ne_bytes(addr.octets())
}

/// Address carried in a flow record, already decoded from its little-endian
/// serialization. The lowest byte is the first octet.
pub fn wire_addr(raw: u32) -> Ipv4Addr {
    Ipv4Addr::from(raw.to_le_bytes())
}
