//! The MDS client: per-rank session state machines, metadata request
//! dispatch with forwarding and failover, and the lease cache.
//!
//! Sessions ride lossless messenger links, so requests are not re-sent on a
//! timer; they replay when a session reestablishes after an MDS restart or a
//! messenger reset.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use coralfs_maps::{EpochWatch, MdsMap};
use coralfs_msgr::{EntityAddr, EntityName, Message, MsgType};

use crate::caps::CapsEngine;
use crate::error::{ClientError, Result};
use crate::monc::MonClient;
use crate::proto::{
    LeaseAction, LeasePayload, MdsForwardPayload, MdsMapPayload, MdsReplyPayload,
    MdsRequestPayload, ReconnectPayload, SessionOp, SessionPayload,
};
use crate::sink::MessageSink;

/// Session lifecycle per MDS rank.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Never contacted.
    New,
    /// Open request sent, waiting for the MDS.
    Opening,
    /// Usable.
    Open,
    /// Close requested.
    Closing,
    /// Closed by either side.
    Closed,
    /// Rank restarted; replaying state.
    Reconnecting,
}

#[derive(Clone, Debug)]
struct MdsSession {
    state: SessionState,
    /// Incoming message sequence within the session.
    seq: u64,
    /// Rank incarnation the session was built against.
    incarnation: u32,
}

/// How to pick the target rank for a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TargetMode {
    /// Any active rank, sticky once chosen.
    Any,
    /// A random active rank.
    Random,
    /// A specific rank (from cap ownership or auth hints).
    Rank(u32),
}

struct RequestRecord {
    payload: MdsRequestPayload,
    mds: u32,
    num_fwd: u32,
    completion: Option<oneshot::Sender<Result<MdsReplyPayload>>>,
}

/// Lease over an inode (empty name) or a dentry.
#[derive(Clone, Debug)]
pub struct LeaseRecord {
    /// What the lease covers.
    pub mask: u32,
    /// Issuing rank.
    pub mds: u32,
    /// Session generation at issue; resets invalidate.
    pub gen: u32,
    /// Wall-clock expiry.
    pub expires: Instant,
    /// Issue sequence, echoed on release.
    pub seq: u32,
}

/// MDS client tunables.
#[derive(Clone, Debug)]
pub struct MdsClientConfig {
    /// Per-request completion timeout (the mount timeout for the first).
    pub request_timeout: Duration,
    /// Session-open wait ceiling.
    pub session_timeout: Duration,
    /// Forward ceiling before a request fails as misconfigured.
    pub max_forwards: u32,
}

impl Default for MdsClientConfig {
    fn default() -> Self {
        MdsClientConfig {
            request_timeout: Duration::from_secs(60),
            session_timeout: Duration::from_secs(30),
            max_forwards: 16,
        }
    }
}

pub struct MdsClient {
    config: MdsClientConfig,
    mdsmap: Mutex<Arc<MdsMap>>,
    sessions: Mutex<HashMap<u32, MdsSession>>,
    session_changed: Notify,
    requests: Mutex<HashMap<u64, RequestRecord>>,
    last_tid: AtomicU64,
    leases: Mutex<HashMap<(u64, String), LeaseRecord>>,
    /// Observers of installed MDS map epochs.
    pub epoch_watch: Arc<EpochWatch>,
    caps: Arc<CapsEngine>,
    monc: Arc<MonClient>,
    sink: Arc<dyn MessageSink>,
}

impl MdsClient {
    /// Build an MDS client over an initial (possibly empty) map.
    pub fn new(
        mdsmap: MdsMap,
        caps: Arc<CapsEngine>,
        monc: Arc<MonClient>,
        sink: Arc<dyn MessageSink>,
        config: MdsClientConfig,
    ) -> Arc<MdsClient> {
        let epoch = mdsmap.epoch;
        Arc::new(MdsClient {
            config,
            mdsmap: Mutex::new(Arc::new(mdsmap)),
            sessions: Mutex::new(HashMap::new()),
            session_changed: Notify::new(),
            requests: Mutex::new(HashMap::new()),
            last_tid: AtomicU64::new(0),
            leases: Mutex::new(HashMap::new()),
            epoch_watch: Arc::new(EpochWatch::new(epoch)),
            caps,
            monc,
            sink,
        })
    }

    /// The current MDS map.
    pub fn mdsmap(&self) -> Arc<MdsMap> {
        self.mdsmap.lock().unwrap().clone()
    }

    /// State of the session toward `mds`.
    pub fn session_state(&self, mds: u32) -> SessionState {
        self.sessions
            .lock()
            .unwrap()
            .get(&mds)
            .map(|s| s.state)
            .unwrap_or(SessionState::New)
    }

    fn send_to_mds(&self, mds: u32, mut msg: Message) {
        let addr = self.mdsmap().addr_of(mds as usize);
        if let Some(addr) = addr {
            msg.header.dst = EntityName::mds(mds as i64);
            self.sink.send(msg, addr);
        } else {
            debug!(mds, "no address for rank, message dropped until map update");
        }
    }

    fn send_session_op(&self, mds: u32, op: SessionOp, seq: u64) {
        if let Ok(msg) = Message::new(MsgType::ClientSession, 0, &SessionPayload { op, seq }) {
            self.send_to_mds(mds, msg);
        }
    }

    // -- sessions -----------------------------------------------------------

    /// Wait until the session toward `mds` is open, opening it if needed.
    pub async fn ensure_session(&self, mds: u32) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.session_timeout;
        loop {
            let notified = self.session_changed.notified();
            // Lock order is mdsmap before sessions, everywhere.
            let incarnation = self.mdsmap().incarnation_of(mds as usize);
            {
                let mut sessions = self.sessions.lock().unwrap();
                let session = sessions.entry(mds).or_insert(MdsSession {
                    state: SessionState::New,
                    seq: 0,
                    incarnation,
                });
                match session.state {
                    SessionState::Open => return Ok(()),
                    SessionState::New | SessionState::Closed => {
                        session.state = SessionState::Opening;
                        debug!(mds, "opening session");
                        drop(sessions);
                        self.send_session_op(mds, SessionOp::RequestOpen, 0);
                    }
                    SessionState::Opening | SessionState::Reconnecting => {}
                    SessionState::Closing => return Err(ClientError::Disconnected),
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ClientError::Timeout {
                    seconds: self.config.session_timeout.as_secs(),
                });
            }
        }
    }

    /// Session control traffic from an MDS.
    pub fn handle_session(&self, mds: u32, msg: &Message) {
        let Ok(payload) = msg.body::<SessionPayload>() else {
            warn!(mds, "corrupt session message");
            return;
        };
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.entry(mds).or_insert(MdsSession {
            state: SessionState::New,
            seq: 0,
            incarnation: 0,
        });
        match payload.op {
            SessionOp::Open => {
                let was = session.state;
                session.state = SessionState::Open;
                session.seq = payload.seq;
                drop(sessions);
                self.caps.renew_session(mds);
                info!(mds, ?was, "session open");
                if was == SessionState::Reconnecting {
                    self.replay_requests(mds);
                }
                self.session_changed.notify_waiters();
            }
            SessionOp::Close => {
                session.state = SessionState::Closed;
                drop(sessions);
                self.caps.bump_session_gen(mds);
                self.session_changed.notify_waiters();
            }
            SessionOp::Renew => {
                drop(sessions);
                self.caps.renew_session(mds);
            }
            SessionOp::Stale => {
                // Renewals missed: every cap and lease from this session is
                // suspect until a renew round-trips.
                warn!(mds, "session stale");
                drop(sessions);
                self.caps.bump_session_gen(mds);
                self.send_session_op(mds, SessionOp::RequestRenew, 0);
            }
            SessionOp::RequestOpen | SessionOp::RequestClose | SessionOp::RequestRenew => {
                debug!(mds, op = ?payload.op, "client-side session op echoed, ignoring");
            }
        }
    }

    /// Ask every open session to renew (periodic keepalive).
    pub fn renew_sessions(&self) {
        let open: Vec<u32> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .iter()
                .filter(|(_, s)| s.state == SessionState::Open)
                .map(|(mds, _)| *mds)
                .collect()
        };
        for mds in open {
            self.send_session_op(mds, SessionOp::RequestRenew, 0);
        }
    }

    /// Close every session (unmount path).
    pub fn close_sessions(&self) {
        let closing: Vec<(u32, u64)> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions
                .iter_mut()
                .filter(|(_, s)| s.state == SessionState::Open)
                .map(|(mds, s)| {
                    s.state = SessionState::Closing;
                    (*mds, s.seq)
                })
                .collect()
        };
        for (mds, seq) in closing {
            self.send_session_op(mds, SessionOp::RequestClose, seq);
        }
    }

    /// The messenger lost the link to `peer`: if it was an MDS we have a
    /// session with, reconnect and replay.
    pub fn handle_peer_reset(&self, peer: EntityAddr) {
        let map = self.mdsmap();
        let rank = (0..map.ranks.len()).find(|r| map.addr_of(*r) == Some(peer));
        let Some(rank) = rank else { return };
        self.start_reconnect(rank as u32);
    }

    fn start_reconnect(&self, mds: u32) {
        let incarnation = self.mdsmap().incarnation_of(mds as usize);
        {
            let mut sessions = self.sessions.lock().unwrap();
            let Some(session) = sessions.get_mut(&mds) else { return };
            if session.state != SessionState::Open && session.state != SessionState::Opening {
                return;
            }
            session.state = SessionState::Reconnecting;
            session.incarnation = incarnation;
        }
        // The old session's caps and leases are invalid until re-issued.
        self.caps.bump_session_gen(mds);
        info!(mds, "session reconnecting");
        let payload = ReconnectPayload {
            caps: self.caps.summarize_for_mds(mds),
            realms: Vec::new(),
        };
        if let Ok(msg) = Message::new(MsgType::ClientReconnect, 0, &payload) {
            self.send_to_mds(mds, msg);
        }
    }

    /// Re-send every request that was outstanding toward `mds`.
    fn replay_requests(&self, mds: u32) {
        let to_replay: Vec<(u64, MdsRequestPayload)> = {
            let mut requests = self.requests.lock().unwrap();
            requests
                .iter_mut()
                .filter(|(_, r)| r.mds == mds)
                .map(|(tid, r)| {
                    r.payload.attempt += 1;
                    (*tid, r.payload.clone())
                })
                .collect()
        };
        if !to_replay.is_empty() {
            info!(mds, n = to_replay.len(), "replaying requests");
        }
        for (tid, payload) in to_replay {
            if let Ok(msg) = Message::new(MsgType::ClientRequest, tid, &payload) {
                self.send_to_mds(mds, msg);
            }
        }
    }

    // -- map handling -------------------------------------------------------

    /// A new MDS map arrived: install it and reconnect sessions whose rank
    /// restarted (incarnation advanced) or stopped being active.
    pub fn handle_mds_map(&self, msg: &Message) {
        let Ok(payload) = msg.body::<MdsMapPayload>() else {
            warn!("corrupt mds map message");
            return;
        };
        let map = match MdsMap::decode(&payload.map) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "mds map decode failed");
                return;
            }
        };
        let restarted: Vec<u32> = {
            let mut cur = self.mdsmap.lock().unwrap();
            if map.epoch <= cur.epoch {
                debug!(epoch = map.epoch, have = cur.epoch, "stale mdsmap ignored");
                return;
            }
            let sessions = self.sessions.lock().unwrap();
            let restarted = sessions
                .iter()
                .filter(|(mds, s)| {
                    s.state == SessionState::Open
                        && map.incarnation_of(**mds as usize) != s.incarnation
                        && map.is_active(**mds as usize)
                })
                .map(|(mds, _)| *mds)
                .collect();
            info!(epoch = map.epoch, "mdsmap installed");
            *cur = Arc::new(map);
            restarted
        };
        self.monc.got_mdsmap(self.mdsmap().epoch);
        self.epoch_watch.installed(self.mdsmap().epoch);
        for mds in restarted {
            self.start_reconnect(mds);
        }
        self.session_changed.notify_waiters();
    }

    // -- requests -----------------------------------------------------------

    fn pick_mds(&self, mode: TargetMode) -> Option<u32> {
        let map = self.mdsmap();
        let active = map.active_ranks();
        match mode {
            TargetMode::Rank(r) => Some(r),
            TargetMode::Any => active.first().map(|r| *r as u32),
            TargetMode::Random => {
                active.choose(&mut rand::thread_rng()).map(|r| *r as u32)
            }
        }
    }

    /// Submit a metadata request and wait for its reply. Forwards re-target
    /// transparently; an excessive forward chain fails the request.
    pub async fn do_request(
        self: &Arc<Self>,
        mut payload: MdsRequestPayload,
        mode: TargetMode,
    ) -> Result<MdsReplyPayload> {
        let mds = loop {
            if let Some(mds) = self.pick_mds(mode) {
                break mds;
            }
            // No active rank yet: ask the monitors for a newer map and wait.
            let epoch = self.mdsmap().epoch;
            self.monc.request_mdsmap(epoch + 1);
            self.epoch_watch.wait_for(epoch + 1).await;
        };
        self.ensure_session(mds).await?;

        let tid = self.last_tid.fetch_add(1, Ordering::SeqCst) + 1;
        payload.attempt = 0;
        payload.num_fwd = 0;
        let (tx, rx) = oneshot::channel();
        self.requests.lock().unwrap().insert(
            tid,
            RequestRecord { payload: payload.clone(), mds, num_fwd: 0, completion: Some(tx) },
        );
        debug!(tid, mds, op = ?payload.op, "mds request");
        let msg = Message::new(MsgType::ClientRequest, tid, &payload)?;
        self.send_to_mds(mds, msg);

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Abandoned),
            Err(_) => {
                // Abandon: drop the record so a late reply is discarded.
                self.requests.lock().unwrap().remove(&tid);
                Err(ClientError::Timeout { seconds: self.config.request_timeout.as_secs() })
            }
        }
    }

    /// A reply arrived: complete the request and absorb any leases riding
    /// the trace.
    pub fn handle_reply(&self, mds: u32, msg: &Message) {
        let tid = msg.header.tid;
        let Ok(reply) = msg.body::<MdsReplyPayload>() else {
            warn!(tid, "corrupt mds reply");
            return;
        };
        let record = self.requests.lock().unwrap().remove(&tid);
        let Some(mut record) = record else {
            debug!(tid, "reply for unknown tid (completed or abandoned)");
            return;
        };
        self.absorb_trace_inodes(mds, &reply);
        self.absorb_trace_leases(mds, &reply);
        let result = if reply.result < 0 {
            Err(ClientError::from_errno(reply.result))
        } else {
            Ok(reply)
        };
        if let Some(tx) = record.completion.take() {
            let _ = tx.send(result);
        }
    }

    /// A forward arrived: re-target the request at the named rank with the
    /// attempt and forward counters bumped.
    pub fn handle_forward(self: &Arc<Self>, msg: &Message) {
        let tid = msg.header.tid;
        let Ok(fwd) = msg.body::<MdsForwardPayload>() else {
            warn!(tid, "corrupt forward");
            return;
        };
        let payload = {
            let mut requests = self.requests.lock().unwrap();
            let Some(record) = requests.get_mut(&tid) else {
                debug!(tid, "forward for unknown tid");
                return;
            };
            record.num_fwd = record.num_fwd.max(fwd.num_fwd) + 1;
            if record.num_fwd > self.config.max_forwards {
                let forwards = record.num_fwd;
                let mut record = requests.remove(&tid).unwrap();
                warn!(tid, forwards, "request forwarded too many times");
                if let Some(tx) = record.completion.take() {
                    let _ = tx.send(Err(ClientError::TooManyForwards { forwards }));
                }
                return;
            }
            record.mds = fwd.dest_mds;
            record.payload.attempt += 1;
            record.payload.num_fwd = record.num_fwd;
            debug!(tid, dest = fwd.dest_mds, num_fwd = record.num_fwd, "request forwarded");
            record.payload.clone()
        };
        // The new rank may need a session first; do that off the dispatch
        // path.
        let mdsc = self.clone();
        let dest = fwd.dest_mds;
        tokio::spawn(async move {
            if mdsc.ensure_session(dest).await.is_ok() {
                if let Ok(msg) = Message::new(MsgType::ClientRequest, tid, &payload) {
                    mdsc.send_to_mds(dest, msg);
                }
            }
        });
    }

    /// Fold the reply's dentry trace into the inode cache: attributes under
    /// the usual fences, and any caps issued inline with the open/create.
    fn absorb_trace_inodes(&self, mds: u32, reply: &MdsReplyPayload) {
        for entry in &reply.trace {
            let ino = entry.inode.ino;
            if ino == 0 {
                continue;
            }
            {
                let state = self.caps.inode(ino);
                let mut st = state.lock().unwrap();
                crate::caps::fill_file_bits(
                    &mut st,
                    0,
                    entry.inode.truncate_seq,
                    entry.inode.size,
                    entry.inode.time_warp_seq,
                    entry.inode.ctime,
                    entry.inode.mtime,
                    entry.inode.atime,
                );
                st.version = st.version.max(entry.inode.version);
                st.max_size = st.max_size.max(entry.inode.max_size);
                if entry.inode.layout.is_valid() {
                    st.layout = entry.inode.layout;
                }
            }
            if let Some(grant) = &entry.cap {
                let realm = self.caps.inode(ino).lock().unwrap().snap_realm;
                self.caps.add_cap(ino, mds, grant.caps, grant.seq, grant.mseq, realm);
            }
        }
    }

    // -- leases -------------------------------------------------------------

    fn absorb_trace_leases(&self, mds: u32, reply: &MdsReplyPayload) {
        let gen = self.caps_session_gen(mds);
        let now = Instant::now();
        let mut leases = self.leases.lock().unwrap();
        for entry in &reply.trace {
            if let Some(lease) = &entry.ilease {
                leases.insert(
                    (entry.inode.ino, String::new()),
                    LeaseRecord {
                        mask: lease.mask,
                        mds,
                        gen,
                        expires: now + Duration::from_millis(lease.duration_ms as u64),
                        seq: lease.seq,
                    },
                );
            }
            if let Some(lease) = &entry.dlease {
                if !entry.dname.is_empty() {
                    leases.insert(
                        (entry.inode.ino, entry.dname.clone()),
                        LeaseRecord {
                            mask: lease.mask,
                            mds,
                            gen,
                            expires: now + Duration::from_millis(lease.duration_ms as u64),
                            seq: lease.seq,
                        },
                    );
                }
            }
        }
    }

    fn caps_session_gen(&self, mds: u32) -> u32 {
        // The caps engine owns session generations; leases share them.
        self.caps.renew_session(mds);
        self.caps.session_gen_of(mds)
    }

    /// True when a valid lease covers `mask` for (ino, dname).
    pub fn lease_valid(&self, ino: u64, dname: &str, mask: u32) -> bool {
        let leases = self.leases.lock().unwrap();
        let Some(lease) = leases.get(&(ino, dname.to_string())) else {
            return false;
        };
        lease.mask & mask == mask
            && lease.gen == self.caps.session_gen_of(lease.mds)
            && Instant::now() < lease.expires
    }

    /// Release a lease explicitly (cache eviction).
    pub fn lease_release(&self, ino: u64, dname: &str) {
        let record = self.leases.lock().unwrap().remove(&(ino, dname.to_string()));
        if let Some(lease) = record {
            let payload = LeasePayload {
                action: LeaseAction::Release,
                mask: lease.mask,
                ino,
                dname: dname.to_string(),
                seq: lease.seq,
                duration_ms: 0,
            };
            if let Ok(msg) = Message::new(MsgType::ClientLease, 0, &payload) {
                self.send_to_mds(lease.mds, msg);
            }
        }
    }

    /// Lease traffic from an MDS.
    pub fn handle_lease(&self, mds: u32, msg: &Message) {
        let Ok(payload) = msg.body::<LeasePayload>() else {
            warn!(mds, "corrupt lease message");
            return;
        };
        match payload.action {
            LeaseAction::Revoke => {
                self.leases
                    .lock()
                    .unwrap()
                    .remove(&(payload.ino, payload.dname.clone()));
                let release = LeasePayload {
                    action: LeaseAction::Release,
                    ..payload
                };
                if let Ok(msg) = Message::new(MsgType::ClientLease, 0, &release) {
                    self.send_to_mds(mds, msg);
                }
            }
            LeaseAction::Renew => {
                let mut leases = self.leases.lock().unwrap();
                if let Some(lease) = leases.get_mut(&(payload.ino, payload.dname.clone())) {
                    lease.expires =
                        Instant::now() + Duration::from_millis(payload.duration_ms as u64);
                    lease.seq = payload.seq;
                }
            }
            LeaseAction::Release => {
                debug!(mds, ino = payload.ino, "client-side lease op echoed, ignoring");
            }
        }
    }

    /// Requests still outstanding (diagnostics).
    pub fn outstanding_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

/// Build a default metadata request payload.
pub fn request(op: crate::proto::MdsOpcode, ino1: u64, path1: &str) -> MdsRequestPayload {
    MdsRequestPayload {
        op,
        ino1,
        path1: path1.to_string(),
        ino2: 0,
        path2: String::new(),
        args: Vec::new(),
        attempt: 0,
        num_fwd: 0,
        wanted_caps: 0,
    }
}
