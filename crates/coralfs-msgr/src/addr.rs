//! Entity naming and addressing.
//!
//! An entity *name* identifies a logical role in the cluster (mon0, osd3,
//! client4021); an entity *address* identifies one concrete incarnation of a
//! process speaking for that role. Two addresses are equal only if ip, port,
//! nonce, and rank all match: the nonce disambiguates successive processes
//! that bind the same port.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// The role class of a cluster entity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    /// Cluster monitor.
    Mon,
    /// Metadata server.
    Mds,
    /// Object storage device.
    Osd,
    /// Client (mount or library user).
    Client,
    /// Administrative tool.
    Admin,
}

impl EntityKind {
    /// Wire representation of this kind.
    pub fn as_u8(self) -> u8 {
        match self {
            EntityKind::Mon => 1,
            EntityKind::Mds => 2,
            EntityKind::Osd => 3,
            EntityKind::Client => 4,
            EntityKind::Admin => 5,
        }
    }

    /// Decode a kind from its wire value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(EntityKind::Mon),
            2 => Some(EntityKind::Mds),
            3 => Some(EntityKind::Osd),
            4 => Some(EntityKind::Client),
            5 => Some(EntityKind::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Mon => write!(f, "mon"),
            EntityKind::Mds => write!(f, "mds"),
            EntityKind::Osd => write!(f, "osd"),
            EntityKind::Client => write!(f, "client"),
            EntityKind::Admin => write!(f, "admin"),
        }
    }
}

/// A typed logical identifier for a cluster entity, e.g. `osd3` or `client12`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityName {
    /// Role class.
    pub kind: EntityKind,
    /// Numeric id within the class; negative means "not yet assigned".
    pub num: i64,
}

impl EntityName {
    /// Name a monitor by rank.
    pub fn mon(num: i64) -> Self {
        EntityName { kind: EntityKind::Mon, num }
    }

    /// Name a metadata server by rank.
    pub fn mds(num: i64) -> Self {
        EntityName { kind: EntityKind::Mds, num }
    }

    /// Name an OSD by id.
    pub fn osd(num: i64) -> Self {
        EntityName { kind: EntityKind::Osd, num }
    }

    /// Name a client by id.
    pub fn client(num: i64) -> Self {
        EntityName { kind: EntityKind::Client, num }
    }

    /// Name an administrative tool.
    pub fn admin(num: i64) -> Self {
        EntityName { kind: EntityKind::Admin, num }
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.num < 0 {
            write!(f, "{}?", self.kind)
        } else {
            write!(f, "{}{}", self.kind, self.num)
        }
    }
}

/// The network address of one incarnation of an entity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityAddr {
    /// Instance rank, for entities that run several endpoints.
    pub erank: u32,
    /// Random per-process value distinguishing reincarnations on one port.
    pub nonce: u32,
    /// IP and port.
    pub addr: SocketAddr,
}

impl EntityAddr {
    /// An all-zero placeholder address.
    pub fn blank() -> Self {
        EntityAddr {
            erank: 0,
            nonce: 0,
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        }
    }

    /// Build an address with a fresh random nonce.
    pub fn with_nonce(addr: SocketAddr) -> Self {
        EntityAddr {
            erank: 0,
            nonce: rand::random::<u32>() | 1,
            addr,
        }
    }

    /// True if this is the unset placeholder.
    pub fn is_blank(&self) -> bool {
        self.nonce == 0 && self.addr.port() == 0
    }
}

impl fmt::Display for EntityAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.nonce)
    }
}

/// 128-bit cluster identifier, fixed for the lifetime of a cluster.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fsid {
    /// High 64 bits.
    pub major: u64,
    /// Low 64 bits.
    pub minor: u64,
}

impl Fsid {
    /// The zero fsid, meaning "any cluster" during bootstrap.
    pub const ZERO: Fsid = Fsid { major: 0, minor: 0 };

    /// Generate a fresh random fsid (cluster creation only).
    pub fn generate() -> Self {
        Fsid {
            major: rand::random(),
            minor: rand::random(),
        }
    }

    /// True if this fsid has not been assigned.
    pub fn is_zero(&self) -> bool {
        self.major == 0 && self.minor == 0
    }
}

impl fmt::Display for Fsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}.{:016x}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_roundtrip() {
        for kind in [
            EntityKind::Mon,
            EntityKind::Mds,
            EntityKind::Osd,
            EntityKind::Client,
            EntityKind::Admin,
        ] {
            assert_eq!(EntityKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(EntityKind::from_u8(0), None);
        assert_eq!(EntityKind::from_u8(99), None);
    }

    #[test]
    fn test_entity_name_display() {
        assert_eq!(EntityName::osd(3).to_string(), "osd3");
        assert_eq!(EntityName::client(4021).to_string(), "client4021");
        assert_eq!(EntityName::mon(-1).to_string(), "mon?");
    }

    #[test]
    fn test_entity_addr_equality_includes_nonce() {
        let sock: SocketAddr = "127.0.0.1:6789".parse().unwrap();
        let a = EntityAddr { erank: 0, nonce: 11, addr: sock };
        let b = EntityAddr { erank: 0, nonce: 12, addr: sock };
        assert_ne!(a, b);
        let c = EntityAddr { erank: 0, nonce: 11, addr: sock };
        assert_eq!(a, c);
    }

    #[test]
    fn test_entity_addr_blank() {
        assert!(EntityAddr::blank().is_blank());
        let sock: SocketAddr = "10.0.0.1:6800".parse().unwrap();
        assert!(!EntityAddr::with_nonce(sock).is_blank());
    }

    #[test]
    fn test_fsid_display_and_zero() {
        assert!(Fsid::ZERO.is_zero());
        let f = Fsid { major: 0xdead, minor: 0xbeef };
        assert_eq!(f.to_string(), "000000000000dead.000000000000beef");
        assert!(!f.is_zero());
    }

    #[test]
    fn test_fsid_generate_nonzero() {
        // Astronomically unlikely to collide with zero.
        assert!(!Fsid::generate().is_zero());
    }
}
