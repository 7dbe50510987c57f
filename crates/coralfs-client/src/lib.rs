//! CoralFS client core.
//!
//! The client side of the cluster-coordination protocol: discovering the
//! monitor quorum and fetching cluster maps, dispatching object I/O to the
//! acting primary of each placement group, maintaining metadata sessions
//! with failover and forwarding, and coordinating cached state through the
//! capability and snap-realm machinery.
//!
//! Everything hangs off a [`Cluster`] handle; there is no process-global
//! state.

pub mod caps;
pub mod cluster;
pub mod error;
pub mod inode;
pub mod mdsc;
pub mod monc;
pub mod objecter;
pub mod persist;
pub mod proto;
pub mod sink;
pub mod snaps;

pub use caps::{CapSender, CapTask, CapsConfig, CapsEngine};
pub use cluster::{Cluster, ClusterConfig, ListCursor, Pool};
pub use error::{ClientError, Result};
pub use inode::{
    caps_for_mode, FileMode, InodeState, CAP_EXCL, CAP_LAZYIO, CAP_PIN, CAP_RD, CAP_RDCACHE,
    CAP_WR, CAP_WRBUFFER, CAP_WREXTEND,
};
pub use mdsc::{MdsClient, MdsClientConfig, SessionState, TargetMode};
pub use monc::{MonClient, MonClientConfig};
pub use objecter::{Completion, Objecter, ObjecterConfig};
pub use persist::{StateDir, Superblock};
pub use sink::{MessageSink, MessengerSink};
pub use snaps::{SnapContext, SnapRealmInfo, SnapRealmTree, NOSNAP, SNAPDIR};
