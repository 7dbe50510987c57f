#![warn(missing_docs)]

//! CoralFS cluster maps: typed, versioned snapshots of cluster state.
//!
//! Three map kinds describe the cluster: the monitor map (quorum membership),
//! the MDS map (metadata ranks), and the OSD map (devices, pools, and the
//! placement hierarchy). Maps are immutable once published, advance by
//! exactly one epoch per incremental, and are observed in non-decreasing
//! epoch order by every consumer.

pub mod error;
pub mod mdsmap;
pub mod monmap;
pub mod osdmap;
pub mod pg;
pub mod watch;

pub use error::{MapError, Result};
pub use mdsmap::{MdsMap, MdsMapIncremental, MdsRankInfo, MdsState};
pub use monmap::{MonMap, MonMapIncremental};
pub use osdmap::{
    OsdMap, OsdMapIncremental, PoolInfo, FLAG_FULL, FLAG_PAUSERD, FLAG_PAUSEWR,
};
pub use pg::{
    calc_bits_of, file_extents, FileLayout, ObjectExtent, ObjectName, PgId,
};
pub use watch::EpochWatch;
