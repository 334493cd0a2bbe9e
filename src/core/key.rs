//! Direction-independent connection identity
//!
//! Both directions of a TCP conversation map to the same key: the
//! endpoint pair is normalized at construction so that `(a, b)` and
//! `(b, a)` hash and compare identically.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::packet::TcpPacket;

/// Identity of a TCP connection, independent of packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    lo: (IpAddr, u16),
    hi: (IpAddr, u16),
}

impl ConnectionKey {
    pub fn new(a: (IpAddr, u16), b: (IpAddr, u16)) -> Self {
        if a <= b {
            Self { lo: a, hi: b }
        } else {
            Self { lo: b, hi: a }
        }
    }

    pub fn from_packet(packet: &TcpPacket) -> Self {
        Self::new(packet.src(), packet.dst())
    }

    pub fn endpoints(&self) -> ((IpAddr, u16), (IpAddr, u16)) {
        (self.lo, self.hi)
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} <-> {}:{}",
            self.lo.0, self.lo.1, self.hi.0, self.hi.1
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(addr: &str, port: u16) -> (IpAddr, u16) {
        (addr.parse().unwrap(), port)
    }

    #[test]
    fn test_key_is_symmetric() {
        let a = ep("192.168.1.10", 45000);
        let b = ep("10.0.0.25", 25);
        assert_eq!(ConnectionKey::new(a, b), ConnectionKey::new(b, a));
    }

    #[test]
    fn test_key_distinguishes_ports() {
        let a = ep("192.168.1.10", 45000);
        let b = ep("10.0.0.25", 25);
        let c = ep("10.0.0.25", 587);
        assert_ne!(ConnectionKey::new(a, b), ConnectionKey::new(a, c));
    }

    #[test]
    fn test_key_hash_symmetric() {
        use std::collections::HashMap;

        let a = ep("192.168.1.10", 45000);
        let b = ep("10.0.0.25", 25);

        let mut map = HashMap::new();
        map.insert(ConnectionKey::new(a, b), 1);
        assert_eq!(map.get(&ConnectionKey::new(b, a)), Some(&1));
    }
}
