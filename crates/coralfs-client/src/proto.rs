//! Wire payload types for every message the client core exchanges.
//!
//! Payloads ride inside messenger frames as bincode; the frame header carries
//! type, routing, and the transaction id. Numeric result codes use the errno
//! family (see `error.rs`).

use serde::{Deserialize, Serialize};

use coralfs_maps::{FileLayout, ObjectName, PgId};
use coralfs_msgr::Fsid;

use crate::snaps::{SnapContext, SnapRealmInfo};

/// Wall-clock instant with nanosecond precision.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeSpec {
    /// Unix seconds.
    pub secs: u64,
    /// Nanoseconds within the second.
    pub nanos: u32,
}

impl TimeSpec {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let d = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        TimeSpec { secs: d.as_secs(), nanos: d.subsec_nanos() }
    }
}

// ---------------------------------------------------------------------------
// Monitor traffic
// ---------------------------------------------------------------------------

/// Ask a monitor for the MDS map at or above an epoch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonGetMdsMap {
    /// Cluster the request belongs to.
    pub fsid: Fsid,
    /// Smallest acceptable epoch.
    pub want: u32,
}

/// Ask a monitor for OSD map deltas starting at an epoch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonGetOsdMap {
    /// Cluster the request belongs to.
    pub fsid: Fsid,
    /// First epoch the client does not have.
    pub start: u32,
}

/// Monitor map delivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonMapPayload {
    /// Encoded full monitor map.
    pub map: Vec<u8>,
}

/// MDS map delivery (full encoding).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MdsMapPayload {
    /// Epoch of the enclosed map.
    pub epoch: u32,
    /// Encoded full MDS map.
    pub map: Vec<u8>,
}

/// OSD map delivery: a run of incrementals and/or full maps, ascending.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OsdMapPayload {
    /// Cluster the maps belong to.
    pub fsid: Fsid,
    /// Encoded incrementals in ascending epoch order.
    pub incrementals: Vec<Vec<u8>>,
    /// Encoded full maps in ascending epoch order.
    pub full_maps: Vec<Vec<u8>>,
}

/// Cluster free-space reply.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatfsReply {
    /// Total storage, kilobytes.
    pub total_kb: u64,
    /// Free storage, kilobytes.
    pub free_kb: u64,
    /// Storage available to clients, kilobytes.
    pub avail_kb: u64,
    /// Objects stored.
    pub num_objects: u64,
}

/// Pool administration operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PoolOpKind {
    /// Create a pool with a name and owner.
    Create {
        /// Pool name, unique in the cluster.
        name: String,
        /// Owning auid.
        auid: u64,
    },
    /// Delete a pool by id.
    Delete {
        /// Pool id.
        pool: u32,
    },
    /// Reassign pool ownership.
    ChangeAuid {
        /// Pool id.
        pool: u32,
        /// New owner.
        auid: u64,
    },
    /// Create a named pool snapshot.
    CreateSnap {
        /// Pool id.
        pool: u32,
        /// Snapshot name.
        name: String,
    },
    /// Delete a named pool snapshot.
    DeleteSnap {
        /// Pool id.
        pool: u32,
        /// Snapshot name.
        name: String,
    },
    /// Allocate a self-managed snapshot id.
    CreateUnmanagedSnap {
        /// Pool id.
        pool: u32,
    },
    /// Release a self-managed snapshot id.
    DeleteUnmanagedSnap {
        /// Pool id.
        pool: u32,
        /// Snapshot id to release.
        snap: u64,
    },
    /// Fetch usage statistics for a pool.
    Stats {
        /// Pool id.
        pool: u32,
    },
}

/// Usage statistics for one pool.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Bytes stored.
    pub num_bytes: u64,
    /// Kilobytes stored.
    pub num_kb: u64,
    /// Objects stored.
    pub num_objects: u64,
    /// Object clones (snapshots).
    pub num_clones: u64,
}

/// Pool administration request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolOpRequest {
    /// Cluster the request belongs to.
    pub fsid: Fsid,
    /// The operation.
    pub op: PoolOpKind,
}

/// Pool administration reply.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct PoolOpReply {
    /// Errno-family result; 0 on success.
    pub result: i32,
    /// Pool the reply concerns (new id for creates).
    pub pool: u32,
    /// Allocated snapshot id, for unmanaged snap creates.
    pub snapid: u64,
    /// OSD map epoch reflecting the change.
    pub osdmap_epoch: u32,
    /// Usage statistics, for `Stats` requests.
    pub stats: Option<PoolStats>,
}

// ---------------------------------------------------------------------------
// OSD traffic
// ---------------------------------------------------------------------------

/// Wants an in-memory acknowledgement.
pub const OSD_FLAG_ACK: u32 = 1 << 0;
/// Wants a durable (all-replica) acknowledgement.
pub const OSD_FLAG_ONDISK: u32 = 1 << 1;
/// Contains at least one read.
pub const OSD_FLAG_READ: u32 = 1 << 2;
/// Contains at least one mutation.
pub const OSD_FLAG_WRITE: u32 = 1 << 3;
/// Mutations must respect snapshot ordering.
pub const OSD_FLAG_ORDERSNAP: u32 = 1 << 4;

/// Object operation codes. Wire values are protocol constants.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum OsdOpCode {
    /// Read an extent.
    Read = 1,
    /// Object size and mtime.
    Stat = 2,
    /// Allocated-extent map for a range.
    MapExt = 3,
    /// Read only allocated extents of a range.
    SparseRead = 4,
    /// Post a notify to an object's watchers.
    Notify = 5,
    /// Acknowledge a received notify.
    NotifyAck = 6,
    /// Fail unless the object version matches.
    AssertVer = 7,
    /// Register a persistent watch.
    Watch = 8,
    /// Fetch an extended attribute.
    GetXattr = 32,
    /// List extended attributes.
    ListXattrs = 33,
    /// Write an extent.
    Write = 64,
    /// Replace all object data.
    WriteFull = 65,
    /// Truncate to a length.
    Truncate = 66,
    /// Zero an extent.
    Zero = 67,
    /// Remove the object.
    Delete = 68,
    /// Create the object (optionally exclusive).
    Create = 69,
    /// Roll the object back to a snapshot.
    Rollback = 70,
    /// Set an extended attribute.
    SetXattr = 71,
    /// Remove an extended attribute.
    RmXattr = 72,
    /// Read the ordered tagged map stored in the object.
    TmapGet = 80,
    /// Replace the ordered tagged map.
    TmapPut = 81,
    /// Apply a compare-and-swap update stream to the tagged map.
    TmapUp = 82,
    /// Invoke a server-side extension method.
    Call = 96,
    /// List objects within one placement group (pagination cursor in
    /// `value`).
    PgList = 112,
}

impl OsdOpCode {
    /// True for codes that modify object state.
    pub fn is_mutation(self) -> bool {
        (self as u16) >= 64 && (self as u16) < 112
    }
}

/// One mutation in a tagged-map update stream. The server applies the whole
/// stream atomically, compare-and-swap style, against the ordered map stored
/// in the object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TmapCmd {
    /// Replace the map header.
    SetHeader(Vec<u8>),
    /// Insert or replace one key.
    Set(String, Vec<u8>),
    /// Remove one key; fails the stream with NotFound if absent.
    Rm(String),
}

/// Decoded contents of an object's tagged map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmapContents {
    /// Opaque header.
    pub header: Vec<u8>,
    /// Ordered key/value pairs.
    pub entries: std::collections::BTreeMap<String, Vec<u8>>,
}

/// One operation within an object request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OsdOp {
    /// Operation code.
    pub code: Option<OsdOpCode>,
    /// Byte offset, for extent ops.
    pub offset: u64,
    /// Byte length, for extent ops.
    pub length: u64,
    /// Attribute name, class name, or snapshot target.
    pub name: String,
    /// Method name for `Call`.
    pub method: String,
    /// Snapshot id for `Rollback`.
    pub snapid: u64,
    /// Expected version for `AssertVer`; watch cookie for `Watch`.
    pub value: u64,
    /// Input bytes (write payload, xattr value, call input, tmap stream).
    pub indata: Vec<u8>,
}

impl OsdOp {
    /// A bare op with a code.
    pub fn new(code: OsdOpCode) -> Self {
        OsdOp { code: Some(code), ..Default::default() }
    }

    /// An extent op.
    pub fn extent(code: OsdOpCode, offset: u64, length: u64) -> Self {
        OsdOp { code: Some(code), offset, length, ..Default::default() }
    }
}

/// An object request, addressed to the acting primary of its group.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OsdOpRequest {
    /// Target placement group.
    pub pgid: PgId,
    /// Target object.
    pub object: ObjectName,
    /// Operation vector, applied atomically in order.
    pub ops: Vec<OsdOp>,
    /// Snapshot to read from (`NOSNAP` for head).
    pub snapid: u64,
    /// Snapshot context for mutations.
    pub snapc: SnapContext,
    /// ACK/ONDISK/READ/WRITE/ORDERSNAP flags.
    pub flags: u32,
    /// OSD map epoch the client addressed this request under.
    pub osdmap_epoch: u32,
    /// Resend counter, for server-side dup detection.
    pub attempt: u32,
}

/// Reply to an object request. ACK and ONDISK milestones may arrive as two
/// replies carrying the same tid.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OsdOpReply {
    /// Placement group the op executed in.
    pub pgid: PgId,
    /// Errno-family result; >= 0 is success (bytes for reads).
    pub result: i64,
    /// Which milestones this reply certifies (ACK and/or ONDISK).
    pub flags: u32,
    /// Object version after the op.
    pub version: u64,
    /// Read/stat/xattr/call output.
    pub outdata: Vec<u8>,
    /// The OSD's current map epoch, for gap detection.
    pub osdmap_epoch: u32,
}

/// A watch/notify event pushed from an OSD.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchNotifyPayload {
    /// Watch registration cookie.
    pub cookie: u64,
    /// Notify instance to acknowledge.
    pub notify_id: u64,
    /// Object version at notify time.
    pub version: u64,
    /// Application payload.
    pub payload: Vec<u8>,
}

/// Object stat result.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStat {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification.
    pub mtime: TimeSpec,
}

/// One allocated extent, for mapext/sparse-read replies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocExtent {
    /// Extent offset.
    pub offset: u64,
    /// Extent length.
    pub length: u64,
}

// ---------------------------------------------------------------------------
// MDS traffic
// ---------------------------------------------------------------------------

/// Session control operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOp {
    /// Client asks to open.
    RequestOpen,
    /// MDS confirms open.
    Open,
    /// Client asks to close.
    RequestClose,
    /// MDS confirms close.
    Close,
    /// Client renews its lease on the session.
    RequestRenew,
    /// MDS confirms renewal.
    Renew,
    /// MDS declares the session stale (missed renewals).
    Stale,
}

/// Session control payload.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct SessionPayload {
    /// Operation.
    pub op: SessionOp,
    /// Session sequence, echoed for ordering.
    pub seq: u64,
}

/// Metadata operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MdsOpcode {
    /// Resolve a name in a directory.
    Lookup,
    /// Fetch attributes.
    Getattr,
    /// Update attributes.
    Setattr,
    /// Create and open a regular file.
    Create,
    /// Create a special file.
    Mknod,
    /// Create a directory.
    Mkdir,
    /// Create a symlink.
    Symlink,
    /// Create a hard link.
    Link,
    /// Remove a file.
    Unlink,
    /// Remove a directory.
    Rmdir,
    /// Rename.
    Rename,
    /// Open an existing file.
    Open,
    /// List a directory fragment.
    Readdir,
    /// Set an extended attribute.
    SetXattr,
    /// Remove an extended attribute.
    RmXattr,
    /// List snapshots of a directory.
    LsSnap,
    /// Take a snapshot of a directory.
    MkSnap,
    /// Delete a snapshot of a directory.
    RmSnap,
}

/// A metadata request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MdsRequestPayload {
    /// Operation.
    pub op: MdsOpcode,
    /// Primary inode argument.
    pub ino1: u64,
    /// Path relative to `ino1`.
    pub path1: String,
    /// Secondary inode argument (link/rename).
    pub ino2: u64,
    /// Path relative to `ino2`.
    pub path2: String,
    /// Op-specific arguments, bincode-encoded.
    pub args: Vec<u8>,
    /// Resend counter.
    pub attempt: u32,
    /// Times this request has been forwarded between ranks.
    pub num_fwd: u32,
    /// Caps the client wants on the result.
    pub wanted_caps: u32,
}

/// Lease state attached to a trace entry.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseStat {
    /// What the lease covers.
    pub mask: u32,
    /// Validity from receipt, milliseconds.
    pub duration_ms: u32,
    /// Issue sequence within the session.
    pub seq: u32,
}

/// Inode attributes as the MDS reports them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InodeStat {
    /// Inode number.
    pub ino: u64,
    /// Snapshot this instance belongs to (`NOSNAP` for head).
    pub snapid: u64,
    /// Metadata version.
    pub version: u64,
    /// Mode and type bits.
    pub mode: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Link count.
    pub nlink: u32,
    /// Size in bytes.
    pub size: u64,
    /// Highest size the MDS authorizes the client to write to.
    pub max_size: u64,
    /// Truncation sequence.
    pub truncate_seq: u64,
    /// Timestamp ordering fence.
    pub time_warp_seq: u64,
    /// Change time.
    pub ctime: TimeSpec,
    /// Modification time.
    pub mtime: TimeSpec,
    /// Access time.
    pub atime: TimeSpec,
    /// File striping layout.
    pub layout: FileLayout,
    /// Symlink target, when a symlink.
    pub symlink: String,
    /// Raw xattr blob, parsed lazily.
    pub xattr_blob: Vec<u8>,
}

/// One hop of the dentry trace in a reply: inode plus how it was reached.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// The inode at this hop.
    pub inode: InodeStat,
    /// Name under the parent hop; empty at the root.
    pub dname: String,
    /// Lease on the dentry, if issued.
    pub dlease: Option<LeaseStat>,
    /// Lease on the inode, if issued.
    pub ilease: Option<LeaseStat>,
    /// Caps issued with this entry (open/create replies).
    pub cap: Option<CapGrant>,
}

/// Caps issued inline with a trace entry.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapGrant {
    /// Issued cap bits.
    pub caps: u32,
    /// Cap sequence.
    pub seq: u64,
    /// Migration sequence.
    pub mseq: u64,
}

/// One directory entry in a readdir reply.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name.
    pub name: String,
    /// Entry inode.
    pub inode: InodeStat,
    /// Lease on the dentry.
    pub dlease: Option<LeaseStat>,
}

/// A metadata reply.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MdsReplyPayload {
    /// Errno-family result; 0 on success.
    pub result: i32,
    /// Dentry trace from the root to the target, root first.
    pub trace: Vec<TraceEntry>,
    /// Directory contents, for readdir.
    pub dir_entries: Vec<DirEntry>,
    /// Snap realm trace accompanying the reply.
    pub snap_trace: Vec<SnapRealmInfo>,
    /// True when the listed fragment is the directory's last.
    pub dir_complete: bool,
}

/// Redirect: retry the request at another rank.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct MdsForwardPayload {
    /// Rank to retry at.
    pub dest_mds: u32,
    /// Forward count as the MDS sees it.
    pub num_fwd: u32,
    /// True if the client must resend (the MDS did not forward the body).
    pub client_must_resend: bool,
}

/// Capability message operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapOp {
    /// MDS grants or revokes (smaller mask) caps.
    Grant,
    /// MDS authoritatively truncated the file.
    Trunc,
    /// MDS is migrating the cap away.
    Export,
    /// MDS received the cap from a migration.
    Import,
    /// MDS confirms a release; client state can go.
    Released,
    /// MDS persisted a snapshot flush.
    FlushedSnap,
    /// Client acknowledges a revocation.
    Ack,
    /// Client returns caps it no longer wants.
    Release,
    /// Client flushes snapped state.
    FlushSnap,
    /// Client reports dirty metadata (size/mtime).
    Update,
}

/// Capability traffic payload, both directions.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CapMessage {
    /// Operation; `None` never appears on the wire.
    pub op: Option<CapOp>,
    /// Inode the caps cover.
    pub ino: u64,
    /// Cap sequence.
    pub seq: u64,
    /// Migration sequence.
    pub mseq: u64,
    /// Granted (MDS→client) or retained (client→MDS) cap bits.
    pub caps: u32,
    /// Bits the client wants.
    pub wanted: u32,
    /// File size.
    pub size: u64,
    /// Max authorized write offset.
    pub max_size: u64,
    /// Truncation sequence.
    pub truncate_seq: u64,
    /// Timestamp ordering fence.
    pub time_warp_seq: u64,
    /// Change time.
    pub ctime: TimeSpec,
    /// Modification time.
    pub mtime: TimeSpec,
    /// Access time.
    pub atime: TimeSpec,
    /// Snapshot seq this state follows (flush/flushed-snap).
    pub snap_follows: u64,
    /// Realm trace accompanying grants and imports.
    pub snap_trace: Vec<SnapRealmInfo>,
}

/// Snap trace operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapOp {
    /// Install or update realms.
    Update,
    /// A snapshot was destroyed.
    Destroy,
    /// A realm split off children.
    Split,
}

/// Snap realm trace payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapPayload {
    /// Operation.
    pub op: SnapOp,
    /// Realm that split, for `Split`.
    pub split_realm: u64,
    /// Inodes that moved into the new realm.
    pub split_inos: Vec<u64>,
    /// The realm trace.
    pub trace: Vec<SnapRealmInfo>,
}

/// Lease actions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseAction {
    /// MDS revokes the lease.
    Revoke,
    /// Client releases the lease.
    Release,
    /// MDS renews the lease.
    Renew,
}

/// Inode/dentry lease payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeasePayload {
    /// Action.
    pub action: LeaseAction,
    /// What the lease covers.
    pub mask: u32,
    /// Inode the lease (or its dentry) hangs off.
    pub ino: u64,
    /// Dentry name, empty for inode leases.
    pub dname: String,
    /// Issue sequence.
    pub seq: u32,
    /// Validity, milliseconds.
    pub duration_ms: u32,
}

/// One cap summarized in a reconnect.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectCap {
    /// Inode.
    pub ino: u64,
    /// Bits the client wants.
    pub wanted: u32,
    /// Bits the client holds.
    pub issued: u32,
    /// Realm the inode sits in.
    pub snaprealm: u64,
    /// Path hint for the MDS cache.
    pub path: String,
}

/// Session reestablishment payload after an MDS restart.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReconnectPayload {
    /// Every cap the client holds from this MDS.
    pub caps: Vec<ReconnectCap>,
    /// Realms the client knows.
    pub realms: Vec<u64>,
}
