//! The capability engine.
//!
//! Caps are fine-grained permissions an MDS issues so a client may read,
//! cache, write, or buffer an inode. The engine tracks, per inode, what each
//! MDS has issued, what the client has acted on, and the reference counts
//! that pin bits in use. Revocations whose bits are still referenced are
//! acked only after the references drain; snapshot state frozen at snap time
//! flushes back strictly in order.
//!
//! Lock order everywhere: realm state, then session state, then one inode at
//! a time. The engine never holds two inode locks.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::inode::{
    cap_string, Cap, CapSnap, InodeState, SessionGen, CAP_EXCL, CAP_RD, CAP_RDCACHE, CAP_WR,
    CAP_WRBUFFER,
};
use crate::proto::{CapMessage, CapOp, ReconnectCap, TimeSpec};
use crate::snaps::SnapContext;

/// Outbound capability traffic leaves through this seam; the cluster wires
/// it to the MDS sessions, tests record it.
pub trait CapSender: Send + Sync {
    /// Queue a cap message toward an MDS rank.
    fn send_cap(&self, mds: u32, msg: CapMessage);
}

/// Work the engine cannot do inline (it runs on the dispatch path): handed
/// to the owner's worker loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CapTask {
    /// Write dirty buffers back so a revocation can complete.
    Writeback {
        /// Affected inode.
        ino: u64,
    },
    /// Drop cached read pages for a revoked RDCACHE.
    InvalidatePages {
        /// Affected inode.
        ino: u64,
    },
    /// Apply a deferred local truncation.
    Truncate {
        /// Affected inode.
        ino: u64,
        /// New size.
        size: u64,
    },
    /// Wake waiters parked on this inode's cap state.
    Wake {
        /// Affected inode.
        ino: u64,
    },
}

/// Engine tunables.
#[derive(Clone, Debug)]
pub struct CapsConfig {
    /// How long unwanted caps are held before release.
    pub release_hold: Duration,
    /// Session validity granted by each renewal.
    pub session_ttl: Duration,
}

impl Default for CapsConfig {
    fn default() -> Self {
        CapsConfig {
            release_hold: Duration::from_secs(5),
            session_ttl: Duration::from_secs(60),
        }
    }
}

pub struct CapsEngine {
    config: CapsConfig,
    inodes: Mutex<HashMap<u64, Arc<Mutex<InodeState>>>>,
    sessions: Mutex<HashMap<u32, SessionGen>>,
    /// Inodes whose unwanted caps are being held back, FIFO.
    delay: Mutex<VecDeque<u64>>,
    tasks: mpsc::UnboundedSender<CapTask>,
    sender: Arc<dyn CapSender>,
}

impl CapsEngine {
    /// Build an engine; the receiver drains [`CapTask`] work.
    pub fn new(
        sender: Arc<dyn CapSender>,
        config: CapsConfig,
    ) -> (Arc<CapsEngine>, mpsc::UnboundedReceiver<CapTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(CapsEngine {
                config,
                inodes: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                delay: Mutex::new(VecDeque::new()),
                tasks: tx,
                sender,
            }),
            rx,
        )
    }

    /// The shared state handle for `ino`, created on first touch.
    pub fn inode(&self, ino: u64) -> Arc<Mutex<InodeState>> {
        self.inodes
            .lock()
            .unwrap()
            .entry(ino)
            .or_insert_with(|| Arc::new(Mutex::new(InodeState::new(ino))))
            .clone()
    }

    /// Forget an inode with no caps (cache eviction).
    pub fn forget_inode(&self, ino: u64) {
        let mut map = self.inodes.lock().unwrap();
        if let Some(state) = map.get(&ino) {
            if state.lock().unwrap().caps.is_empty() {
                map.remove(&ino);
            }
        }
    }

    fn session_snapshot(&self) -> HashMap<u32, SessionGen> {
        self.sessions.lock().unwrap().clone()
    }

    fn session(&self, mds: u32) -> SessionGen {
        let ttl = Instant::now() + self.config.session_ttl;
        *self
            .sessions
            .lock()
            .unwrap()
            .entry(mds)
            .or_insert(SessionGen { gen: 1, ttl })
    }

    /// Current generation of the session toward `mds`. Leases share these
    /// generations: a bump invalidates both caps and leases.
    pub fn session_gen_of(&self, mds: u32) -> u32 {
        self.session(mds).gen
    }

    /// Extend a session's cap validity (renewal confirmed).
    pub fn renew_session(&self, mds: u32) {
        let ttl = Instant::now() + self.config.session_ttl;
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions.entry(mds).or_insert(SessionGen { gen: 1, ttl });
        entry.ttl = ttl;
    }

    /// Bump a session's generation: every cap issued under the old one is
    /// now stale. Used on session reset or a stale notice from the MDS.
    pub fn bump_session_gen(&self, mds: u32) {
        let ttl = Instant::now() + self.config.session_ttl;
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions.entry(mds).or_insert(SessionGen { gen: 0, ttl });
        entry.gen += 1;
        entry.ttl = ttl;
        debug!(mds, gen = entry.gen, "session generation bumped");
    }

    /// Effective issued bits for `ino` right now.
    pub fn issued(&self, ino: u64) -> u32 {
        let gens = self.session_snapshot();
        let state = self.inode(ino);
        let st = state.lock().unwrap();
        st.issued(&|m| gens.get(&m).copied(), Instant::now())
    }

    /// Install or extend a cap from `mds` (grant via trace, or import).
    /// Returns true if this was the inode's first cap (caller links the
    /// realm).
    pub fn add_cap(
        &self,
        ino: u64,
        mds: u32,
        issued: u32,
        seq: u64,
        mseq: u64,
        realm: u64,
    ) -> bool {
        let session = self.session(mds);
        let state = self.inode(ino);
        let mut st = state.lock().unwrap();
        let first = st.caps.is_empty();
        if st.exporting_mds == mds as i32 {
            // The migration this import resolves is complete.
            st.exporting_mds = -1;
            st.exporting_mseq = 0;
            st.exporting_issued = 0;
        }
        if first || st.snap_realm == 0 {
            st.snap_realm = realm;
        }
        let cap = st.caps.entry(mds).or_insert(Cap {
            mds,
            issued: 0,
            implemented: 0,
            seq,
            mseq,
            gen: session.gen,
        });
        cap.issued |= issued;
        cap.implemented |= issued;
        cap.seq = seq;
        cap.mseq = mseq;
        cap.gen = session.gen;
        debug!(ino, mds, caps = %cap_string(issued), "cap added");
        first
    }

    /// Remove the cap from `mds`. Returns true when it was the last cap
    /// (caller unlinks the realm).
    pub fn remove_cap(&self, ino: u64, mds: u32) -> bool {
        let state = self.inode(ino);
        let mut st = state.lock().unwrap();
        st.caps.remove(&mds);
        st.caps.is_empty()
    }

    // -- reference counting -------------------------------------------------

    /// Try to pin `need` (and opportunistically `want`) cap bits. Returns
    /// `Some(got)` on success, `None` when the caller must wait:
    /// insufficient caps, a revocation in progress, or a snapshot barrier.
    pub fn get_cap_refs(
        &self,
        ino: u64,
        need: u32,
        want: u32,
        endoff: u64,
    ) -> Option<u32> {
        let gens = self.session_snapshot();
        let now = Instant::now();
        let state = self.inode(ino);
        let mut st = state.lock().unwrap();

        if need & CAP_WR != 0 {
            if endoff > 0 && endoff > st.max_size {
                st.wanted_max_size = st.wanted_max_size.max(endoff);
                debug!(ino, endoff, max = st.max_size, "write past max_size, must ask");
                return None;
            }
            // A frozen snapshot must capture final size/mtime before any new
            // write begins.
            if st.has_pending_cap_snap() {
                return None;
            }
        }

        let have = st.issued(&|m| gens.get(&m).copied(), now);
        let implemented = st.implemented(&|m| gens.get(&m).copied(), now);
        if have & need == need {
            // Hold out on want-bits that are mid-revocation, so buffered data
            // flushes before a sync write re-enters.
            let not = want & !(have & need);
            let revoking = implemented & !have;
            if revoking & not == 0 {
                let got = need | (have & want);
                st.take_cap_refs(got);
                return Some(got);
            }
        }
        None
    }

    /// Release references taken with [`get_cap_refs`].
    pub fn put_cap_refs(&self, ino: u64, had: u32) {
        let state = self.inode(ino);
        let mut last = false;
        let mut flush_snaps = false;
        {
            let mut st = state.lock().unwrap();
            if had & CAP_RD != 0 {
                st.rd_ref = st.rd_ref.saturating_sub(1);
                last |= st.rd_ref == 0;
            }
            if had & CAP_RDCACHE != 0 {
                st.rdcache_ref = st.rdcache_ref.saturating_sub(1);
                last |= st.rdcache_ref == 0;
            }
            if had & CAP_WR != 0 {
                st.wr_ref = st.wr_ref.saturating_sub(1);
                if st.wr_ref == 0 {
                    last = true;
                    if let Some(snap) = st.cap_snaps.back_mut() {
                        if snap.writing {
                            // The in-flight write the snapshot was waiting on
                            // has completed; its state is final now.
                            snap.writing = false;
                            flush_snaps = true;
                        }
                    }
                }
            }
        }
        if flush_snaps {
            self.flush_snaps(ino);
            let _ = self.tasks.send(CapTask::Wake { ino });
        } else if last {
            self.check_caps(ino, false);
        }
    }

    /// Release `nr` buffered-write references against `snapc`. Head-context
    /// releases may complete a revocation; snap-context releases may make a
    /// frozen snapshot flushable.
    pub fn put_wrbuffer_cap_refs(&self, ino: u64, nr: u32, snapc: &SnapContext) {
        let state = self.inode(ino);
        let mut last = false;
        let mut last_snap = false;
        {
            let mut st = state.lock().unwrap();
            st.wrbuffer_ref = st.wrbuffer_ref.saturating_sub(nr);
            let is_head = st.head_snapc.as_ref().map(|c| c == snapc).unwrap_or(true)
                && !st.cap_snaps.iter().any(|cs| &cs.context == snapc);
            if is_head {
                st.wrbuffer_ref_head = st.wrbuffer_ref_head.saturating_sub(nr);
                last = st.wrbuffer_ref == 0;
            } else if let Some(snap) =
                st.cap_snaps.iter_mut().find(|cs| &cs.context == snapc)
            {
                snap.dirty = snap.dirty.saturating_sub(nr);
                last_snap = snap.dirty == 0;
            } else {
                warn!(ino, "wrbuffer release against unknown snap context");
            }
        }
        if last {
            self.check_caps(ino, false);
        } else if last_snap {
            self.flush_snaps(ino);
            let _ = self.tasks.send(CapTask::Wake { ino });
        }
    }

    // -- snapshots ----------------------------------------------------------

    /// A new snapshot was observed while this inode has dirty state: freeze
    /// size/times/caps under the outgoing context. `old_context` is the
    /// context the dirty data was written under.
    pub fn queue_cap_snap(&self, ino: u64, old_context: SnapContext) {
        let gens = self.session_snapshot();
        let state = self.inode(ino);
        let mut st = state.lock().unwrap();
        if st.wrbuffer_ref_head == 0 && st.wr_ref == 0 {
            return; // nothing dirty under the old context
        }
        if st.cap_snaps.iter().any(|cs| cs.follows == old_context.seq) {
            return; // already frozen for this snap
        }
        let issued = st.issued(&|m| gens.get(&m).copied(), Instant::now());
        let snap = CapSnap {
            follows: old_context.seq,
            issued,
            size: st.size,
            mtime: st.mtime,
            atime: st.atime,
            ctime: st.ctime,
            time_warp_seq: st.time_warp_seq,
            context: old_context,
            writing: st.wr_ref > 0,
            dirty: st.wrbuffer_ref_head,
            flushing: false,
        };
        debug!(ino, follows = snap.follows, dirty = snap.dirty, writing = snap.writing,
               "cap snap queued");
        // Dirty buffers now belong to the frozen context; the head restarts.
        st.wrbuffer_ref_head = 0;
        st.head_snapc = None;
        st.cap_snaps.push_back(snap);
    }

    /// Send the oldest flushable frozen snapshot, one at a time: the next is
    /// sent only after the MDS acknowledges the previous.
    pub fn flush_snaps(&self, ino: u64) {
        let state = self.inode(ino);
        let mut to_send: Option<(u32, CapMessage)> = None;
        {
            let mut st = state.lock().unwrap();
            let mds = st.caps.keys().next().copied();
            let mseq = mds.and_then(|m| st.caps.get(&m)).map(|c| c.mseq).unwrap_or(0);
            if let (Some(front), Some(mds)) = (st.cap_snaps.front_mut(), mds) {
                if front.flushing {
                    return; // strictly ordered: wait for the ack
                }
                if front.ready() {
                    front.flushing = true;
                    to_send = Some((
                        mds,
                        CapMessage {
                            op: Some(CapOp::FlushSnap),
                            ino,
                            mseq,
                            caps: front.issued,
                            size: front.size,
                            mtime: front.mtime,
                            atime: front.atime,
                            ctime: front.ctime,
                            time_warp_seq: front.time_warp_seq,
                            snap_follows: front.follows,
                            ..Default::default()
                        },
                    ));
                }
            }
        }
        if let Some((mds, msg)) = to_send {
            debug!(ino, mds, follows = msg.snap_follows, "flushing cap snap");
            self.sender.send_cap(mds, msg);
        }
    }

    /// The MDS persisted a snapshot flush: drop the frozen record and move
    /// on to the next.
    pub fn handle_flushedsnap(&self, ino: u64, msg: &CapMessage) {
        let state = self.inode(ino);
        {
            let mut st = state.lock().unwrap();
            let before = st.cap_snaps.len();
            st.cap_snaps
                .retain(|cs| !(cs.follows == msg.snap_follows && cs.flushing));
            if st.cap_snaps.len() == before {
                debug!(ino, follows = msg.snap_follows, "flushedsnap for unknown record");
            }
        }
        self.flush_snaps(ino);
    }

    // -- cap scan -----------------------------------------------------------

    /// Examine held versus wanted/used caps: complete revocations, request
    /// larger max_size, release what is no longer wanted (after the hold
    /// period), and flush frozen snapshots.
    pub fn check_caps(&self, ino: u64, is_delayed: bool) {
        self.flush_snaps(ino);

        let gens = self.session_snapshot();
        let now = Instant::now();
        let state = self.inode(ino);
        let mut to_send: Vec<(u32, CapMessage)> = Vec::new();
        let mut wake = false;
        {
            let mut st = state.lock().unwrap();
            let wanted = st.wanted();
            let used = st.used();
            let issued_all = st.issued(&|m| gens.get(&m).copied(), now);
            debug!(ino, wanted = %cap_string(wanted), used = %cap_string(used),
                   issued = %cap_string(issued_all), "check_caps");

            if !is_delayed {
                self.delay_requeue(&mut st, ino, now);
            }

            let hold_active = st
                .hold_caps_until
                .map(|until| now < until)
                .unwrap_or(false);

            let mds_ids: Vec<u32> = st.caps.keys().copied().collect();
            for mds in mds_ids {
                let (revoking, issued, seq, mseq) = {
                    let cap = st.caps.get(&mds).unwrap();
                    (cap.implemented & !cap.issued, cap.issued, cap.seq, cap.mseq)
                };

                let want_more_max = st.wanted_max_size > st.max_size
                    && st.wanted_max_size > st.requested_max_size;
                let near_max = issued & CAP_WR != 0
                    && st.size.saturating_mul(2) >= st.max_size
                    && st.reported_size.saturating_mul(2) < st.max_size
                    && st.max_size > 0;
                let revocation_done = revoking != 0 && revoking & used == 0;
                let extra = issued & !wanted;

                if !want_more_max && !near_max && !revocation_done {
                    if extra == 0 {
                        continue;
                    }
                    if hold_active {
                        debug!(ino, mds, "delaying cap release");
                        continue;
                    }
                }

                // Drop what we no longer want, note completed revocations.
                let cap = st.caps.get_mut(&mds).unwrap();
                cap.issued &= wanted;
                if revocation_done {
                    cap.implemented = cap.issued;
                    wake = true;
                }
                let keep = cap.issued;
                let op = if wanted == 0 { CapOp::Release } else { CapOp::Ack };
                st.reported_size = st.size;
                st.requested_max_size = st.wanted_max_size;
                to_send.push((
                    mds,
                    CapMessage {
                        op: Some(op),
                        ino,
                        seq,
                        mseq,
                        caps: keep,
                        wanted,
                        size: st.size,
                        max_size: st.wanted_max_size,
                        mtime: st.mtime,
                        atime: st.atime,
                        ctime: st.ctime,
                        time_warp_seq: st.time_warp_seq,
                        ..Default::default()
                    },
                ));
                let dropping = issued & !wanted;
                if dropping & CAP_RDCACHE != 0 {
                    st.rdcache_revoking = st.rdcache_gen;
                    let _ = self.tasks.send(CapTask::InvalidatePages { ino });
                }
            }
        }
        for (mds, msg) in to_send {
            self.sender.send_cap(mds, msg);
        }
        if wake {
            let _ = self.tasks.send(CapTask::Wake { ino });
        }
    }

    fn delay_requeue(&self, st: &mut InodeState, ino: u64, now: Instant) {
        st.hold_caps_until = Some(now + self.config.release_hold);
        let mut delay = self.delay.lock().unwrap();
        if let Some(pos) = delay.iter().position(|i| *i == ino) {
            delay.remove(pos);
        }
        delay.push_back(ino);
    }

    /// Process inodes whose release hold has expired. The delay queue lock
    /// is never held while an inode lock is taken.
    pub fn check_delayed_caps(&self) {
        let now = Instant::now();
        loop {
            let front = { self.delay.lock().unwrap().front().copied() };
            let Some(ino) = front else { break };
            let due = {
                let state = self.inode(ino);
                let st = state.lock().unwrap();
                st.hold_caps_until.map(|t| now >= t).unwrap_or(true)
            };
            if !due {
                break;
            }
            {
                let mut delay = self.delay.lock().unwrap();
                if delay.front() == Some(&ino) {
                    delay.pop_front();
                }
            }
            self.check_caps(ino, true);
        }
    }

    // -- message handlers ---------------------------------------------------

    /// Route an incoming cap message from `mds`.
    pub fn handle_cap_message(&self, mds: u32, msg: &CapMessage) {
        match msg.op {
            Some(CapOp::Grant) => self.handle_grant(mds, msg),
            Some(CapOp::Trunc) => self.handle_trunc(mds, msg),
            Some(CapOp::Export) => self.handle_export(mds, msg),
            Some(CapOp::Import) => self.handle_import(mds, msg),
            Some(CapOp::Released) => self.handle_released(mds, msg),
            Some(CapOp::FlushedSnap) => self.handle_flushedsnap(msg.ino, msg),
            other => warn!(mds, ?other, "unexpected cap op from server"),
        }
    }

    /// GRANT: merge new bits, or begin a revocation when the mask shrank.
    fn handle_grant(&self, mds: u32, msg: &CapMessage) {
        let session = self.session(mds);
        let gens = self.session_snapshot();
        let now = Instant::now();
        let ino = msg.ino;
        let state = self.inode(ino);

        let mut reply: Option<CapMessage> = None;
        let mut writeback = false;
        let mut invalidate = false;
        let mut wake = false;
        {
            let mut st = state.lock().unwrap();
            let Some(cap) = st.caps.get_mut(&mds) else {
                // Never reply to cap traffic out of turn; a cap we do not
                // hold is someone else's conversation.
                debug!(ino, mds, "grant for inode without a cap, ignoring");
                return;
            };
            cap.gen = session.gen;
            cap.seq = msg.seq;
            let oldcaps = cap.issued;
            let newcaps = msg.caps;

            // Only an actual page cache (nonzero generation) needs an async
            // invalidation pass before the revocation can be acked.
            let revoking_rdcache = oldcaps & !newcaps & CAP_RDCACHE != 0;
            if revoking_rdcache && st.wrbuffer_ref == 0 && st.rdcache_gen > 0 {
                invalidate = true;
                st.rdcache_revoking = st.rdcache_gen;
            }

            let issued = st.issued(&|m| gens.get(&m).copied(), now);
            fill_file_bits(
                &mut st,
                issued,
                msg.truncate_seq,
                msg.size,
                msg.time_warp_seq,
                msg.ctime,
                msg.mtime,
                msg.atime,
            );

            if msg.max_size != st.max_size {
                debug!(ino, old = st.max_size, new = msg.max_size, "max_size changed");
                st.max_size = msg.max_size;
                if msg.max_size >= st.wanted_max_size {
                    st.wanted_max_size = 0;
                    st.requested_max_size = 0;
                }
                wake = true;
            }

            let used = st.used();
            let cap = st.caps.get_mut(&mds).unwrap();
            if oldcaps & !newcaps != 0 {
                debug!(ino, mds, old = %cap_string(oldcaps), new = %cap_string(newcaps),
                       "revocation");
                if used & !newcaps & CAP_WRBUFFER != 0 {
                    // Buffered writes pin the revoked bit: flush first, ack
                    // when the references drain.
                    writeback = true;
                } else if !invalidate {
                    cap.implemented = newcaps;
                    let seq = cap.seq;
                    let mseq = cap.mseq;
                    cap.issued = newcaps;
                    reply = Some(CapMessage {
                        op: Some(CapOp::Ack),
                        ino,
                        seq,
                        mseq,
                        caps: newcaps,
                        wanted: st.wanted(),
                        size: st.size,
                        mtime: st.mtime,
                        atime: st.atime,
                        ctime: st.ctime,
                        time_warp_seq: st.time_warp_seq,
                        ..Default::default()
                    });
                    wake = true;
                }
                st.caps.get_mut(&mds).unwrap().issued = newcaps;
            } else if oldcaps == newcaps {
                debug!(ino, mds, caps = %cap_string(newcaps), "caps unchanged");
            } else {
                debug!(ino, mds, old = %cap_string(oldcaps), new = %cap_string(newcaps),
                       "grant");
                cap.issued = newcaps;
                // Add bits only; a pending revocation keeps its ground.
                cap.implemented |= newcaps;
                wake = true;
            }
        }

        if writeback {
            let _ = self.tasks.send(CapTask::Writeback { ino });
        }
        if invalidate {
            let _ = self.tasks.send(CapTask::InvalidatePages { ino });
        }
        if let Some(msg) = reply {
            self.sender.send_cap(mds, msg);
        }
        if wake {
            let _ = self.tasks.send(CapTask::Wake { ino });
        }
    }

    /// TRUNC: authoritative size change; local shrink work is deferred to a
    /// worker because it cannot run on the dispatch path.
    fn handle_trunc(&self, mds: u32, msg: &CapMessage) {
        let ino = msg.ino;
        let state = self.inode(ino);
        let mut task: Option<CapTask> = None;
        {
            let mut st = state.lock().unwrap();
            debug!(ino, mds, size = msg.size, "truncation from mds");
            if msg.size < st.size {
                let target = st.pending_truncate.map_or(msg.size, |t| t.min(msg.size));
                st.pending_truncate = Some(target);
                task = Some(CapTask::Truncate { ino, size: target });
            }
            st.size = msg.size;
            st.reported_size = msg.size;
            st.truncate_seq = msg.truncate_seq.max(st.truncate_seq);
        }
        if let Some(t) = task {
            let _ = self.tasks.send(t);
        }
    }

    /// EXPORT: the cap is migrating away from `mds`. Remember the migrating
    /// bits unless a newer migration has already been seen.
    fn handle_export(&self, mds: u32, msg: &CapMessage) {
        let ino = msg.ino;
        let state = self.inode(ino);
        let mut st = state.lock().unwrap();
        let newer_seen = st.caps.values().any(|c| c.mseq > msg.mseq);
        if let Some(cap) = st.caps.get(&mds) {
            let issued = cap.issued;
            if !newer_seen {
                st.exporting_mds = mds as i32;
                st.exporting_mseq = msg.mseq;
                st.exporting_issued = issued;
                debug!(ino, mds, mseq = msg.mseq, "cap exporting");
            }
            st.caps.remove(&mds);
        }
    }

    /// IMPORT: the migrated cap arrives at its new MDS. An import with a
    /// higher mseq clears the exporting note; a stale export is ignored.
    fn handle_import(&self, mds: u32, msg: &CapMessage) {
        let ino = msg.ino;
        {
            let state = self.inode(ino);
            let mut st = state.lock().unwrap();
            if st.exporting_mds >= 0 && st.exporting_mseq < msg.mseq {
                debug!(ino, mds, mseq = msg.mseq, from = st.exporting_mds,
                       "import resolves export");
                st.exporting_mds = -1;
                st.exporting_mseq = 0;
                st.exporting_issued = 0;
            }
        }
        let realm = self.inode(ino).lock().unwrap().snap_realm;
        self.add_cap(ino, mds, msg.caps, msg.seq, msg.mseq, realm);
        // We may owe the old authority a release.
        self.check_caps(ino, true);
    }

    /// The page-cache invalidation worker finished dropping cached reads
    /// for `ino`. If cached reads raced in while pages were being dropped
    /// (the generation moved), another invalidation pass is queued;
    /// otherwise the cache generation resets and any revocation that was
    /// waiting on it completes and acks.
    pub fn invalidate_complete(&self, ino: u64) {
        let state = self.inode(ino);
        let rerun = {
            let mut st = state.lock().unwrap();
            if st.rdcache_revoking != 0 && st.rdcache_gen != st.rdcache_revoking {
                st.rdcache_revoking = st.rdcache_gen;
                true
            } else {
                st.rdcache_gen = 0;
                st.rdcache_revoking = 0;
                false
            }
        };
        if rerun {
            debug!(ino, "cached reads raced the invalidation, running again");
            let _ = self.tasks.send(CapTask::InvalidatePages { ino });
        } else {
            self.check_caps(ino, true);
        }
    }

    /// Summarize every cap held from `mds` for a session reconnect.
    pub fn summarize_for_mds(&self, mds: u32) -> Vec<ReconnectCap> {
        let inodes = self.inodes.lock().unwrap();
        inodes
            .values()
            .filter_map(|state| {
                let st = state.lock().unwrap();
                st.caps.get(&mds).map(|cap| ReconnectCap {
                    ino: st.ino,
                    wanted: st.wanted(),
                    issued: cap.issued,
                    snaprealm: st.snap_realm,
                    path: String::new(),
                })
            })
            .collect()
    }

    /// RELEASED: the MDS flushed our release; the local cap record can go.
    fn handle_released(&self, mds: u32, msg: &CapMessage) {
        let last = self.remove_cap(msg.ino, mds);
        if last {
            let mut delay = self.delay.lock().unwrap();
            if let Some(pos) = delay.iter().position(|i| *i == msg.ino) {
                delay.remove(pos);
            }
        }
        debug!(ino = msg.ino, mds, last, "cap released");
    }
}

/// Apply server-reported size and times, honoring the truncation and
/// time-warp fences so stale values never regress newer local state.
#[allow(clippy::too_many_arguments)]
pub(crate) fn fill_file_bits(
    st: &mut InodeState,
    issued: u32,
    truncate_seq: u64,
    size: u64,
    time_warp_seq: u64,
    ctime: TimeSpec,
    mtime: TimeSpec,
    atime: TimeSpec,
) {
    let old_size = st.size;
    if truncate_seq > st.truncate_seq {
        st.truncate_seq = truncate_seq;
        st.size = size;
        st.reported_size = size;
        if size < old_size {
            st.pending_truncate = Some(size);
        }
    } else if truncate_seq == st.truncate_seq && size > st.size {
        st.size = size;
        st.reported_size = size;
    }
    if time_warp_seq > st.time_warp_seq {
        st.ctime = ctime;
        st.mtime = mtime;
        st.atime = atime;
        st.time_warp_seq = time_warp_seq;
    } else if time_warp_seq == st.time_warp_seq && issued & CAP_EXCL == 0 {
        // Without EXCL the server's clock is authoritative for ties.
        st.ctime = st.ctime.max(ctime);
        st.mtime = st.mtime.max(mtime);
        st.atime = st.atime.max(atime);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        msgs: Mutex<Vec<(u32, CapMessage)>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder { msgs: Mutex::new(Vec::new()) })
        }
        fn take(&self) -> Vec<(u32, CapMessage)> {
            std::mem::take(&mut self.msgs.lock().unwrap())
        }
    }

    impl CapSender for Recorder {
        fn send_cap(&self, mds: u32, msg: CapMessage) {
            self.msgs.lock().unwrap().push((mds, msg));
        }
    }

    fn engine_with(
        hold: Duration,
    ) -> (Arc<CapsEngine>, Arc<Recorder>, mpsc::UnboundedReceiver<CapTask>) {
        let rec = Recorder::new();
        let (engine, rx) = CapsEngine::new(
            rec.clone(),
            CapsConfig { release_hold: hold, session_ttl: Duration::from_secs(60) },
        );
        (engine, rec, rx)
    }

    fn grant(ino: u64, caps: u32, seq: u64) -> CapMessage {
        CapMessage { op: Some(CapOp::Grant), ino, caps, seq, ..Default::default() }
    }

    #[test]
    fn test_add_cap_and_issued() {
        let (engine, _rec, _rx) = engine_with(Duration::ZERO);
        assert!(engine.add_cap(1, 0, CAP_RD | CAP_RDCACHE, 1, 0, 10));
        assert!(!engine.add_cap(1, 1, CAP_WR, 1, 0, 10));
        assert_eq!(engine.issued(1), CAP_RD | CAP_RDCACHE | CAP_WR);
    }

    #[test]
    fn test_session_gen_bump_stales_caps() {
        let (engine, _rec, _rx) = engine_with(Duration::ZERO);
        engine.add_cap(1, 0, CAP_RD, 1, 0, 10);
        assert_eq!(engine.issued(1), CAP_RD);
        engine.bump_session_gen(0);
        assert_eq!(engine.issued(1), 0, "stale caps contribute nothing");
    }

    #[test]
    fn test_grant_without_cap_is_ignored() {
        let (engine, rec, _rx) = engine_with(Duration::ZERO);
        engine.handle_grant(0, &grant(99, CAP_RD, 1));
        assert!(rec.take().is_empty(), "never reply out of turn");
    }

    #[test]
    fn test_grant_merges_bits() {
        let (engine, rec, mut rx) = engine_with(Duration::ZERO);
        engine.add_cap(1, 0, CAP_RD, 1, 0, 10);
        engine.handle_grant(0, &grant(1, CAP_RD | CAP_RDCACHE | CAP_WR, 2));
        assert_eq!(engine.issued(1), CAP_RD | CAP_RDCACHE | CAP_WR);
        assert!(rec.take().is_empty(), "a pure grant needs no reply");
        assert_eq!(rx.try_recv().unwrap(), CapTask::Wake { ino: 1 });
    }

    #[test]
    fn test_unused_revocation_acks_immediately() {
        let (engine, rec, _rx) = engine_with(Duration::ZERO);
        engine.add_cap(1, 0, CAP_RD | CAP_RDCACHE | CAP_WR, 1, 0, 10);
        engine.handle_grant(0, &grant(1, CAP_RD, 2));
        let msgs = rec.take();
        assert_eq!(msgs.len(), 1);
        let (mds, ack) = &msgs[0];
        assert_eq!(*mds, 0);
        assert_eq!(ack.op, Some(CapOp::Ack));
        assert_eq!(ack.caps, CAP_RD);
        assert_eq!(engine.issued(1), CAP_RD);
    }

    // Scenario: revocation while buffered writes are outstanding. The ack is
    // deferred until the buffered references drain; the engine first queues
    // a writeback.
    #[test]
    fn test_revocation_with_buffered_writes_defers_ack() {
        let (engine, rec, mut rx) = engine_with(Duration::ZERO);
        let held = CAP_RD | CAP_RDCACHE | CAP_WR | CAP_WRBUFFER | CAP_EXCL;
        engine.add_cap(1, 0, held, 1, 0, 10);

        let got = engine.get_cap_refs(1, CAP_WR | CAP_WRBUFFER, 0, 0).unwrap();
        assert_eq!(got & (CAP_WR | CAP_WRBUFFER), CAP_WR | CAP_WRBUFFER);

        // MDS narrows to RD|WR: WRBUFFER is revoked while in use.
        engine.handle_grant(0, &grant(1, CAP_RD | CAP_WR, 2));
        assert!(rec.take().is_empty(), "ack deferred while buffers dirty");
        let task = rx.try_recv().unwrap();
        assert_eq!(task, CapTask::Writeback { ino: 1 });

        // Writeback completes, sync write ref released.
        engine.put_cap_refs(1, CAP_WR);
        engine.put_wrbuffer_cap_refs(1, 1, &SnapContext::empty());
        let msgs = rec.take();
        assert!(
            msgs.iter().any(|(_, m)| m.op == Some(CapOp::Ack) || m.op == Some(CapOp::Release)),
            "ack sent once wrbuffer refs drained: {:?}",
            msgs
        );
        // The revocation is fully implemented now.
        let state = engine.inode(1);
        let st = state.lock().unwrap();
        let cap = st.caps.get(&0).unwrap();
        assert_eq!(cap.implemented & CAP_WRBUFFER, 0);
    }

    // Scenario: RDCACHE is revoked while pages sit in the client cache.
    // The ack is deferred behind an invalidation pass; it goes out only
    // when the worker reports the pages gone.
    #[test]
    fn test_rdcache_revocation_waits_for_invalidation() {
        let (engine, rec, mut rx) = engine_with(Duration::from_secs(30));
        engine.add_cap(1, 0, CAP_RD | CAP_RDCACHE, 1, 0, 10);

        // A cached read faults pages in; they outlive the reference.
        let got = engine.get_cap_refs(1, CAP_RD | CAP_RDCACHE, 0, 0).unwrap();
        engine.put_cap_refs(1, got);
        assert!(engine.inode(1).lock().unwrap().rdcache_gen > 0);
        assert!(rec.take().is_empty(), "hold window delays any release");

        // MDS narrows to RD: RDCACHE is revoked with pages still cached.
        engine.handle_grant(0, &grant(1, CAP_RD, 2));
        assert!(rec.take().is_empty(), "ack deferred until pages are dropped");
        assert_eq!(rx.try_recv().unwrap(), CapTask::InvalidatePages { ino: 1 });

        // The invalidation worker reports completion; the ack follows.
        engine.invalidate_complete(1);
        let msgs = rec.take();
        assert!(
            msgs.iter()
                .any(|(_, m)| m.op == Some(CapOp::Ack) || m.op == Some(CapOp::Release)),
            "ack sent after invalidation: {:?}",
            msgs
        );
        let state = engine.inode(1);
        let st = state.lock().unwrap();
        assert_eq!(st.caps.get(&0).unwrap().implemented & CAP_RDCACHE, 0);
        assert_eq!(st.rdcache_gen, 0);
    }

    #[test]
    fn test_invalidation_race_runs_again() {
        let (engine, _rec, mut rx) = engine_with(Duration::from_secs(30));
        engine.add_cap(1, 0, CAP_RD | CAP_RDCACHE, 1, 0, 10);
        let got = engine.get_cap_refs(1, CAP_RD | CAP_RDCACHE, 0, 0).unwrap();
        engine.put_cap_refs(1, got);

        engine.handle_grant(0, &grant(1, CAP_RD, 2));
        assert_eq!(rx.try_recv().unwrap(), CapTask::InvalidatePages { ino: 1 });

        // More cached reads land while the worker is dropping pages.
        engine.inode(1).lock().unwrap().take_cap_refs(CAP_RDCACHE);

        engine.invalidate_complete(1);
        assert_eq!(
            rx.try_recv().unwrap(),
            CapTask::InvalidatePages { ino: 1 },
            "moved generation forces another pass"
        );
        assert_ne!(engine.inode(1).lock().unwrap().rdcache_gen, 0);
    }

    #[test]
    fn test_release_after_empty_grant() {
        let (engine, rec, _rx) = engine_with(Duration::ZERO);
        engine.add_cap(1, 0, CAP_RD, 1, 0, 10);
        // Nothing open, nothing used; an explicit scan releases the cap.
        engine.check_caps(1, true);
        let msgs = rec.take();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].1.op, Some(CapOp::Release));
        assert_eq!(msgs[0].1.caps, 0);
    }

    #[test]
    fn test_release_held_back_during_hold_window() {
        let (engine, rec, _rx) = engine_with(Duration::from_secs(30));
        engine.add_cap(1, 0, CAP_RD, 1, 0, 10);
        engine.check_caps(1, false); // requeues with a 30s hold
        assert!(rec.take().is_empty(), "release delayed");
        engine.check_delayed_caps();
        assert!(rec.take().is_empty(), "hold has not expired");
    }

    #[test]
    fn test_get_cap_refs_insufficient() {
        let (engine, _rec, _rx) = engine_with(Duration::ZERO);
        engine.add_cap(1, 0, CAP_RD, 1, 0, 10);
        assert!(engine.get_cap_refs(1, CAP_WR, 0, 0).is_none());
        assert!(engine.get_cap_refs(1, CAP_RD, 0, 0).is_some());
    }

    #[test]
    fn test_get_cap_refs_blocks_past_max_size() {
        let (engine, _rec, _rx) = engine_with(Duration::ZERO);
        engine.add_cap(1, 0, CAP_WR | CAP_WRBUFFER, 1, 0, 10);
        engine.inode(1).lock().unwrap().max_size = 100;
        assert!(engine.get_cap_refs(1, CAP_WR, 0, 200).is_none());
        let st = engine.inode(1);
        assert_eq!(st.lock().unwrap().wanted_max_size, 200);
        assert!(engine.get_cap_refs(1, CAP_WR, 0, 50).is_some());
    }

    // Scenario: two snapshots with dirty data flush strictly in order; the
    // second FLUSHSNAP goes out only after the first is acknowledged.
    #[test]
    fn test_snap_flush_ordering() {
        let (engine, rec, _rx) = engine_with(Duration::ZERO);
        engine.add_cap(1, 0, CAP_WR | CAP_WRBUFFER, 1, 0, 10);

        // Dirty data under context seq=5, then a snap freezes it.
        engine.get_cap_refs(1, CAP_WRBUFFER, 0, 0).unwrap();
        let c1 = SnapContext { seq: 5, snaps: vec![5] };
        engine.queue_cap_snap(1, c1.clone());

        // More dirty data under seq=6, then another snap.
        engine.get_cap_refs(1, CAP_WRBUFFER, 0, 0).unwrap();
        let c2 = SnapContext { seq: 6, snaps: vec![6, 5] };
        engine.queue_cap_snap(1, c2.clone());

        assert_eq!(engine.inode(1).lock().unwrap().cap_snaps.len(), 2);

        // First context's buffers flush: FLUSHSNAP(follows=5) goes out.
        engine.put_wrbuffer_cap_refs(1, 1, &c1);
        let msgs = rec.take();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].1.op, Some(CapOp::FlushSnap));
        assert_eq!(msgs[0].1.snap_follows, 5);

        // Second context drains too, but follows=6 must wait for the ack.
        engine.put_wrbuffer_cap_refs(1, 1, &c2);
        assert!(rec.take().is_empty(), "second flush held until first is acked");

        // Ack for 5 releases 6.
        engine.handle_flushedsnap(
            1,
            &CapMessage { op: Some(CapOp::FlushedSnap), ino: 1, snap_follows: 5, ..Default::default() },
        );
        let msgs = rec.take();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].1.snap_follows, 6);

        engine.handle_flushedsnap(
            1,
            &CapMessage { op: Some(CapOp::FlushedSnap), ino: 1, snap_follows: 6, ..Default::default() },
        );
        assert!(engine.inode(1).lock().unwrap().cap_snaps.is_empty());
    }

    #[test]
    fn test_pending_cap_snap_blocks_new_writes() {
        let (engine, _rec, _rx) = engine_with(Duration::ZERO);
        engine.add_cap(1, 0, CAP_WR | CAP_WRBUFFER, 1, 0, 10);
        // A sync write in flight when the snap arrives.
        engine.get_cap_refs(1, CAP_WR, 0, 0).unwrap();
        engine.queue_cap_snap(1, SnapContext { seq: 3, snaps: vec![3] });
        assert!(engine.inode(1).lock().unwrap().has_pending_cap_snap());
        assert!(
            engine.get_cap_refs(1, CAP_WR, 0, 0).is_none(),
            "new writes wait for the frozen state to finalize"
        );
        // The old write finishes; the snapshot state is final.
        engine.put_cap_refs(1, CAP_WR);
        assert!(!engine.inode(1).lock().unwrap().has_pending_cap_snap());
        assert!(engine.get_cap_refs(1, CAP_WR, 0, 0).is_some());
    }

    #[test]
    fn test_export_then_matching_import() {
        let (engine, _rec, _rx) = engine_with(Duration::ZERO);
        engine.add_cap(1, 0, CAP_RD | CAP_WR, 1, 3, 10);
        engine.handle_export(
            0,
            &CapMessage { op: Some(CapOp::Export), ino: 1, mseq: 4, ..Default::default() },
        );
        {
            let state = engine.inode(1);
            let st = state.lock().unwrap();
            assert!(st.caps.is_empty());
            assert_eq!(st.exporting_mds, 0);
            assert_eq!(st.exporting_issued, CAP_RD | CAP_WR);
        }
        engine.handle_import(
            1,
            &CapMessage {
                op: Some(CapOp::Import),
                ino: 1,
                caps: CAP_RD | CAP_WR,
                seq: 1,
                mseq: 5,
                ..Default::default()
            },
        );
        let state = engine.inode(1);
        let st = state.lock().unwrap();
        assert!(st.caps.contains_key(&1));
        assert_eq!(st.exporting_mds, -1, "import resolved the export");
    }

    #[test]
    fn test_stale_export_ignored_after_newer_import() {
        let (engine, _rec, _rx) = engine_with(Duration::ZERO);
        engine.add_cap(1, 2, CAP_RD, 1, 9, 10); // mseq 9 already seen
        engine.add_cap(1, 0, CAP_WR, 1, 3, 10);
        engine.handle_export(
            0,
            &CapMessage { op: Some(CapOp::Export), ino: 1, mseq: 4, ..Default::default() },
        );
        let state = engine.inode(1);
        let st = state.lock().unwrap();
        assert_eq!(st.exporting_mds, -1, "stale export leaves no note");
        assert!(!st.caps.contains_key(&0), "cap still removed");
    }

    #[test]
    fn test_trunc_defers_shrink_work() {
        let (engine, _rec, mut rx) = engine_with(Duration::ZERO);
        engine.add_cap(1, 0, CAP_RD, 1, 0, 10);
        engine.inode(1).lock().unwrap().size = 1000;
        engine.handle_trunc(
            0,
            &CapMessage { op: Some(CapOp::Trunc), ino: 1, size: 100, truncate_seq: 2, ..Default::default() },
        );
        assert_eq!(rx.try_recv().unwrap(), CapTask::Truncate { ino: 1, size: 100 });
        let state = engine.inode(1);
        let st = state.lock().unwrap();
        assert_eq!(st.size, 100);
        assert_eq!(st.pending_truncate, Some(100));
    }

    #[test]
    fn test_released_removes_cap() {
        let (engine, _rec, _rx) = engine_with(Duration::ZERO);
        engine.add_cap(1, 0, CAP_RD, 1, 0, 10);
        engine.handle_released(
            0,
            &CapMessage { op: Some(CapOp::Released), ino: 1, ..Default::default() },
        );
        assert_eq!(engine.issued(1), 0);
    }

    #[test]
    fn test_fill_file_bits_fences() {
        let mut st = InodeState::new(1);
        st.size = 500;
        st.truncate_seq = 2;
        st.time_warp_seq = 2;
        st.mtime = TimeSpec { secs: 100, nanos: 0 };

        // Older truncate_seq cannot regress size.
        fill_file_bits(&mut st, 0, 1, 100, 1, TimeSpec::default(), TimeSpec::default(), TimeSpec::default());
        assert_eq!(st.size, 500);

        // Same seq, larger size grows.
        fill_file_bits(&mut st, 0, 2, 600, 2, TimeSpec::default(), TimeSpec { secs: 50, nanos: 0 }, TimeSpec::default());
        assert_eq!(st.size, 600);
        assert_eq!(st.mtime.secs, 100, "tie keeps the max mtime");

        // Newer warp seq replaces times outright.
        fill_file_bits(&mut st, 0, 2, 600, 3, TimeSpec::default(), TimeSpec { secs: 50, nanos: 0 }, TimeSpec::default());
        assert_eq!(st.mtime.secs, 50);
        assert_eq!(st.time_warp_seq, 3);
    }
}
