//! The monitor map: the ordered list of monitors and their addresses.

use serde::{Deserialize, Serialize};

use coralfs_msgr::{EntityAddr, EntityName, Fsid};

use crate::error::{MapError, Result};

const MONMAP_VERSION: u8 = 1;

/// Monitor cluster membership at one epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonMap {
    /// Cluster id.
    pub fsid: Fsid,
    /// Map epoch.
    pub epoch: u32,
    /// Monitors in rank order.
    pub mons: Vec<(EntityName, EntityAddr)>,
}

/// Monitor membership changes ship as whole maps; the incremental wrapper
/// only sequences them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonMapIncremental {
    /// Epoch this delta applies on top of.
    pub based_on: u32,
    /// The replacement map at `based_on + 1`.
    pub map: MonMap,
}

#[derive(Serialize, Deserialize)]
struct Wire {
    version: u8,
    map: MonMap,
}

impl MonMap {
    /// An empty bootstrap map.
    pub fn new(fsid: Fsid) -> Self {
        MonMap { fsid, epoch: 0, mons: Vec::new() }
    }

    /// Number of monitors.
    pub fn len(&self) -> usize {
        self.mons.len()
    }

    /// True when no monitors are known.
    pub fn is_empty(&self) -> bool {
        self.mons.is_empty()
    }

    /// Address of the monitor at `rank`.
    pub fn addr_of(&self, rank: usize) -> Option<EntityAddr> {
        self.mons.get(rank).map(|(_, a)| *a)
    }

    /// True if `addr` belongs to a member monitor.
    pub fn contains(&self, addr: &EntityAddr) -> bool {
        self.mons.iter().any(|(_, a)| a == addr)
    }

    /// Full versioned encoding.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(&Wire { version: MONMAP_VERSION, map: self.clone() })
            .map_err(|e| MapError::Corrupt { reason: e.to_string() })
    }

    /// Decode a full encoding, accepting any version up to the current one.
    pub fn decode(bytes: &[u8]) -> Result<MonMap> {
        let wire: Wire =
            bincode::deserialize(bytes).map_err(|e| MapError::Corrupt { reason: e.to_string() })?;
        if wire.version > MONMAP_VERSION {
            return Err(MapError::BadVersion { got: wire.version, supported: MONMAP_VERSION });
        }
        Ok(wire.map)
    }

    /// Advance by one epoch.
    pub fn apply(&self, incr: &MonMapIncremental) -> Result<MonMap> {
        if incr.based_on != self.epoch || incr.map.epoch != self.epoch + 1 {
            return Err(MapError::BadEpoch { have: self.epoch, incr: incr.map.epoch });
        }
        if incr.map.fsid != self.fsid && !self.fsid.is_zero() {
            return Err(MapError::FsidMismatch {
                map: incr.map.fsid.to_string(),
                cluster: self.fsid.to_string(),
            });
        }
        Ok(incr.map.clone())
    }
}
