//! The MDS map: per-rank metadata server states and addresses.

use serde::{Deserialize, Serialize};

use coralfs_msgr::{EntityAddr, Fsid};

use crate::error::{MapError, Result};

const MDSMAP_VERSION: u8 = 1;

/// Lifecycle state of one MDS rank.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MdsState {
    /// No daemon holds the rank.
    Down,
    /// Daemon waiting to take over a rank.
    Standby,
    /// Rank replaying its journal after a restart.
    Replay,
    /// Rank serving requests.
    Active,
    /// Rank exporting its subtrees before shutdown.
    Stopping,
}

/// One rank's entry in the map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MdsRankInfo {
    /// Current state.
    pub state: MdsState,
    /// Address of the daemon holding the rank, when one does.
    pub addr: Option<EntityAddr>,
    /// Incarnation counter: bumps every time the rank is re-assigned, so
    /// clients can tell a restart from a hiccup.
    pub incarnation: u32,
}

/// Metadata cluster state at one epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MdsMap {
    /// Cluster id.
    pub fsid: Fsid,
    /// Map epoch.
    pub epoch: u32,
    /// Ranks, indexed by rank number.
    pub ranks: Vec<MdsRankInfo>,
    /// Seconds without renewal before a session is stale.
    pub session_timeout: u32,
    /// Seconds without renewal before the MDS closes the session.
    pub session_autoclose: u32,
}

/// MDS membership changes ship as whole maps, sequenced by the wrapper.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MdsMapIncremental {
    /// Epoch this delta applies on top of.
    pub based_on: u32,
    /// The replacement map at `based_on + 1`.
    pub map: MdsMap,
}

#[derive(Serialize, Deserialize)]
struct Wire {
    version: u8,
    map: MdsMap,
}

impl MdsMap {
    /// An empty bootstrap map.
    pub fn new(fsid: Fsid) -> Self {
        MdsMap {
            fsid,
            epoch: 0,
            ranks: Vec::new(),
            session_timeout: 60,
            session_autoclose: 300,
        }
    }

    /// State of `rank`, `Down` when the rank is beyond the map.
    pub fn state_of(&self, rank: usize) -> MdsState {
        self.ranks.get(rank).map(|r| r.state).unwrap_or(MdsState::Down)
    }

    /// Address of `rank` if it is assigned.
    pub fn addr_of(&self, rank: usize) -> Option<EntityAddr> {
        self.ranks.get(rank).and_then(|r| r.addr)
    }

    /// Incarnation of `rank`, 0 when unassigned.
    pub fn incarnation_of(&self, rank: usize) -> u32 {
        self.ranks.get(rank).map(|r| r.incarnation).unwrap_or(0)
    }

    /// True when `rank` can serve requests.
    pub fn is_active(&self, rank: usize) -> bool {
        self.state_of(rank) == MdsState::Active
    }

    /// Ranks currently active.
    pub fn active_ranks(&self) -> Vec<usize> {
        self.ranks
            .iter()
            .enumerate()
            .filter(|(_, r)| r.state == MdsState::Active)
            .map(|(i, _)| i)
            .collect()
    }

    /// Full versioned encoding.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(&Wire { version: MDSMAP_VERSION, map: self.clone() })
            .map_err(|e| MapError::Corrupt { reason: e.to_string() })
    }

    /// Decode a full encoding, accepting any version up to the current one.
    pub fn decode(bytes: &[u8]) -> Result<MdsMap> {
        let wire: Wire =
            bincode::deserialize(bytes).map_err(|e| MapError::Corrupt { reason: e.to_string() })?;
        if wire.version > MDSMAP_VERSION {
            return Err(MapError::BadVersion { got: wire.version, supported: MDSMAP_VERSION });
        }
        Ok(wire.map)
    }

    /// Advance by one epoch.
    pub fn apply(&self, incr: &MdsMapIncremental) -> Result<MdsMap> {
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
