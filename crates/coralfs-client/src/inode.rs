//! Client-side inode state: the cap set, reference counts, and the frozen
//! snapshot records that coordinate with the capability engine.

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use coralfs_maps::FileLayout;

use crate::proto::TimeSpec;
use crate::snaps::SnapContext;

/// Hold a reference on the inode's existence.
pub const CAP_PIN: u32 = 1;
/// May cache read data.
pub const CAP_RDCACHE: u32 = 2;
/// May read.
pub const CAP_RD: u32 = 4;
/// May write.
pub const CAP_WR: u32 = 8;
/// May buffer writes.
pub const CAP_WRBUFFER: u32 = 16;
/// May extend the file up to max_size.
pub const CAP_WREXTEND: u32 = 32;
/// Relaxed coherency for HPC workloads.
pub const CAP_LAZYIO: u32 = 64;
/// Sole client: may retain dirty metadata.
pub const CAP_EXCL: u32 = 128;

/// Open modes, indexing the per-mode open counts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileMode {
    /// Handle held, no data access.
    Pin = 0,
    /// Read-only.
    Rd = 1,
    /// Read-write.
    RdWr = 2,
    /// Write-only.
    Wr = 3,
}

/// Caps implied by an open mode.
pub fn caps_for_mode(mode: FileMode) -> u32 {
    match mode {
        FileMode::Pin => CAP_PIN,
        FileMode::Rd => CAP_RD | CAP_RDCACHE,
        FileMode::RdWr => CAP_RD | CAP_RDCACHE | CAP_WR | CAP_WRBUFFER,
        FileMode::Wr => CAP_WR | CAP_WRBUFFER,
    }
}

/// Render a cap mask for logs, e.g. `pRrWbE`.
pub fn cap_string(caps: u32) -> String {
    let mut s = String::new();
    for (bit, ch) in [
        (CAP_PIN, 'p'),
        (CAP_RDCACHE, 'c'),
        (CAP_RD, 'r'),
        (CAP_WR, 'w'),
        (CAP_WRBUFFER, 'b'),
        (CAP_WREXTEND, 'x'),
        (CAP_LAZYIO, 'l'),
        (CAP_EXCL, 'e'),
    ] {
        if caps & bit != 0 {
            s.push(ch);
        }
    }
    if s.is_empty() {
        s.push('-');
    }
    s
}

/// One capability issued by one MDS.
#[derive(Clone, Debug)]
pub struct Cap {
    /// Issuing MDS rank.
    pub mds: u32,
    /// Bits the MDS most recently granted.
    pub issued: u32,
    /// Bits the client has acted on; a superset of issued during revocation.
    pub implemented: u32,
    /// Grant sequence.
    pub seq: u64,
    /// Migration sequence.
    pub mseq: u64,
    /// Session generation the cap was issued under.
    pub gen: u32,
}

/// Per-session validity view used for staleness checks.
#[derive(Copy, Clone, Debug)]
pub struct SessionGen {
    /// Session generation; bumped on reset or staleness.
    pub gen: u32,
    /// Caps from this session are invalid after this instant.
    pub ttl: Instant,
}

/// Frozen inode state pending flush after a snapshot.
#[derive(Clone, Debug)]
pub struct CapSnap {
    /// Snapshot seq this state follows.
    pub follows: u64,
    /// Caps issued when the snapshot was taken.
    pub issued: u32,
    /// Size at snapshot time.
    pub size: u64,
    /// mtime at snapshot time.
    pub mtime: TimeSpec,
    /// atime at snapshot time.
    pub atime: TimeSpec,
    /// ctime at snapshot time.
    pub ctime: TimeSpec,
    /// Timestamp fence at snapshot time.
    pub time_warp_seq: u64,
    /// Context the dirty data belonged to.
    pub context: SnapContext,
    /// A synchronous write was still in flight at snapshot time.
    pub writing: bool,
    /// Dirty buffers still to write back under this context.
    pub dirty: u32,
    /// Flush message sent, awaiting the ack.
    pub flushing: bool,
}

impl CapSnap {
    /// Ready to flush: nothing in flight, nothing dirty, not yet sent.
    pub fn ready(&self) -> bool {
        !self.writing && self.dirty == 0 && !self.flushing
    }
}

/// All client state for one inode.
#[derive(Clone, Debug)]
pub struct InodeState {
    /// Inode number.
    pub ino: u64,
    /// Metadata version last seen.
    pub version: u64,
    /// Size in bytes.
    pub size: u64,
    /// Largest offset the MDS authorizes us to write.
    pub max_size: u64,
    /// Size last reported to the MDS.
    pub reported_size: u64,
    /// Max size we would like (writes near the cap).
    pub wanted_max_size: u64,
    /// Max size we last asked for.
    pub requested_max_size: u64,
    /// Truncation fence.
    pub truncate_seq: u64,
    /// Timestamp fence.
    pub time_warp_seq: u64,
    /// Change time.
    pub ctime: TimeSpec,
    /// Modification time.
    pub mtime: TimeSpec,
    /// Access time.
    pub atime: TimeSpec,
    /// Striping layout.
    pub layout: FileLayout,
    /// Caps by issuing MDS.
    pub caps: BTreeMap<u32, Cap>,
    /// Static cap bits for snapshotted (read-only) instances.
    pub snap_caps: u32,
    /// MDS a cap is migrating from, or -1.
    pub exporting_mds: i32,
    /// Migration seq of the pending export.
    pub exporting_mseq: u64,
    /// Bits covered by the pending export.
    pub exporting_issued: u32,
    /// Frozen snapshot states, oldest first.
    pub cap_snaps: VecDeque<CapSnap>,
    /// Context attached to current dirty buffers.
    pub head_snapc: Option<SnapContext>,
    /// Realm this inode belongs to.
    pub snap_realm: u64,
    /// Open-file counts by mode.
    pub nr_by_mode: [u32; 4],
    /// Outstanding read references.
    pub rd_ref: u32,
    /// Outstanding cached-read references.
    pub rdcache_ref: u32,
    /// Outstanding sync-write references.
    pub wr_ref: u32,
    /// Outstanding buffered-write references (all contexts).
    pub wrbuffer_ref: u32,
    /// Buffered-write references against the head context.
    pub wrbuffer_ref_head: u32,
    /// Bumped whenever cached pages may exist.
    pub rdcache_gen: u32,
    /// Generation being invalidated asynchronously, if any.
    pub rdcache_revoking: u32,
    /// Delay cap release until this instant.
    pub hold_caps_until: Option<Instant>,
    /// Deferred local truncation target.
    pub pending_truncate: Option<u64>,
}

impl InodeState {
    /// Fresh state for `ino`.
    pub fn new(ino: u64) -> Self {
        InodeState {
            ino,
            version: 0,
            size: 0,
            max_size: 0,
            reported_size: 0,
            wanted_max_size: 0,
            requested_max_size: 0,
            truncate_seq: 0,
            time_warp_seq: 0,
            ctime: TimeSpec::default(),
            mtime: TimeSpec::default(),
            atime: TimeSpec::default(),
            layout: FileLayout::default(),
            caps: BTreeMap::new(),
            snap_caps: 0,
            exporting_mds: -1,
            exporting_mseq: 0,
            exporting_issued: 0,
            cap_snaps: VecDeque::new(),
            head_snapc: None,
            snap_realm: 0,
            nr_by_mode: [0; 4],
            rd_ref: 0,
            rdcache_ref: 0,
            wr_ref: 0,
            wrbuffer_ref: 0,
            wrbuffer_ref_head: 0,
            rdcache_gen: 0,
            rdcache_revoking: 0,
            hold_caps_until: None,
            pending_truncate: None,
        }
    }

    /// Effective issued bits: the union over caps whose session is current,
    /// plus any snapshot-instance bits. Stale caps contribute nothing.
    pub fn issued(&self, gens: &dyn Fn(u32) -> Option<SessionGen>, now: Instant) -> u32 {
        let mut have = self.snap_caps;
        for cap in self.caps.values() {
            if let Some(sg) = gens(cap.mds) {
                if cap.gen < sg.gen || now >= sg.ttl {
                    continue;
                }
                have |= cap.issued;
            }
        }
        have
    }

    /// Union of implemented bits over non-stale caps.
    pub fn implemented(&self, gens: &dyn Fn(u32) -> Option<SessionGen>, now: Instant) -> u32 {
        let mut have = 0;
        for cap in self.caps.values() {
            if let Some(sg) = gens(cap.mds) {
                if cap.gen < sg.gen || now >= sg.ttl {
                    continue;
                }
                have |= cap.implemented;
            }
        }
        have
    }

    /// Bits currently pinned by references.
    pub fn used(&self) -> u32 {
        let mut used = 0;
        if self.rd_ref > 0 {
            used |= CAP_RD;
        }
        if self.rdcache_ref > 0 || self.rdcache_gen > 0 {
            used |= CAP_RDCACHE;
        }
        if self.wr_ref > 0 {
            used |= CAP_WR;
        }
        if self.wrbuffer_ref > 0 {
            used |= CAP_WRBUFFER;
        }
        used
    }

    /// Bits implied by open file modes alone.
    pub fn file_wanted(&self) -> u32 {
        let mut want = 0;
        for (mode, count) in self.nr_by_mode.iter().enumerate() {
            if *count > 0 {
                want |= caps_for_mode(match mode {
                    0 => FileMode::Pin,
                    1 => FileMode::Rd,
                    2 => FileMode::RdWr,
                    _ => FileMode::Wr,
                });
            }
        }
        want
    }

    /// Bits wanted overall: open modes plus in-use bits, with EXCL demanded
    /// whenever dirty buffers exist so writes cannot interleave elsewhere.
    pub fn wanted(&self) -> u32 {
        let mut w = self.file_wanted() | self.used();
        if w & CAP_WRBUFFER != 0 {
            w |= CAP_EXCL;
        }
        w
    }

    /// Take references on `got` bits.
    pub fn take_cap_refs(&mut self, got: u32) {
        if got & CAP_RD != 0 {
            self.rd_ref += 1;
        }
        if got & CAP_RDCACHE != 0 {
            self.rdcache_ref += 1;
            // Pages may now enter the cache; they outlive the reference and
            // keep RDCACHE in use until an invalidation pass clears them.
            self.rdcache_gen += 1;
        }
        if got & CAP_WR != 0 {
            self.wr_ref += 1;
        }
        if got & CAP_WRBUFFER != 0 {
            self.wrbuffer_ref += 1;
            self.wrbuffer_ref_head += 1;
        }
    }

    /// True if the newest cap-snap still awaits an in-flight write.
    pub fn has_pending_cap_snap(&self) -> bool {
        self.cap_snaps.back().map(|cs| cs.writing).unwrap_or(false)
    }

    /// Count an open by mode.
    pub fn get_fmode(&mut self, mode: FileMode) {
        self.nr_by_mode[mode as usize] += 1;
    }

    /// Release an open by mode.
    pub fn put_fmode(&mut self, mode: FileMode) {
        let slot = &mut self.nr_by_mode[mode as usize];
        if *slot > 0 {
            *slot -= 1;
        }
    }
}
