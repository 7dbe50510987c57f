//! The objecter: translates object operations into messages addressed to the
//! acting primary of each placement group, tracks them in flight, and
//! re-targets them when the OSD map moves a group.
//!
//! Transaction ids are assigned once and never reused; replies are matched by
//! tid *and* by the OSD the op was last addressed to, so a late reply from a
//! superseded primary is dropped rather than double-completed.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use coralfs_maps::{EpochWatch, ObjectName, OsdMap, OsdMapIncremental, PgId};
use coralfs_msgr::{EntityAddr, EntityName, Message, MsgType};

use crate::error::{ClientError, Result};
use crate::monc::MonClient;
use crate::proto::{
    OsdOp, OsdOpReply, OsdOpRequest, OsdMapPayload, WatchNotifyPayload, OSD_FLAG_ACK,
    OSD_FLAG_ONDISK, OSD_FLAG_READ, OSD_FLAG_WRITE,
};
use crate::sink::MessageSink;
use crate::snaps::{SnapContext, NOSNAP};

/// Completion handle for an asynchronous object operation. ACK fires when
/// the primary has applied the op in memory; SAFE when it is durable on all
/// acting replicas. For reads the two coincide.
#[derive(Debug)]
pub struct Completion {
    state: Mutex<CompletionState>,
    notify: Notify,
}

#[derive(Default, Debug)]
struct CompletionState {
    acked: bool,
    safe: bool,
    result: Option<i64>,
    version: u64,
    outdata: Vec<u8>,
}

impl Completion {
    fn new() -> Arc<Completion> {
        Arc::new(Completion { state: Mutex::new(CompletionState::default()), notify: Notify::new() })
    }

    /// True once the primary acknowledged the op.
    pub fn is_ack(&self) -> bool {
        self.state.lock().unwrap().acked
    }

    /// True once the op is durable on all acting replicas.
    pub fn is_safe(&self) -> bool {
        self.state.lock().unwrap().safe
    }

    /// The op's result: negative errno, or byte count for reads.
    pub fn get_return_value(&self) -> i64 {
        self.state.lock().unwrap().result.unwrap_or(0)
    }

    /// Object version observed by the op.
    pub fn get_version(&self) -> u64 {
        self.state.lock().unwrap().version
    }

    /// Read/stat output bytes.
    pub fn take_outdata(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().unwrap().outdata)
    }

    /// Park until ACK.
    pub async fn wait_for_ack(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_ack() {
                return;
            }
            notified.await;
        }
    }

    /// Park until SAFE.
    pub async fn wait_for_safe(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_safe() {
                return;
            }
            notified.await;
        }
    }

    fn complete_ack(&self, result: i64, version: u64, outdata: Vec<u8>) {
        let mut st = self.state.lock().unwrap();
        if !st.acked {
            st.acked = true;
            st.result = Some(result);
            st.version = version;
            if !outdata.is_empty() {
                st.outdata = outdata;
            }
        }
        drop(st);
        self.notify.notify_waiters();
    }

    fn complete_safe(&self, result: i64, version: u64) {
        let mut st = self.state.lock().unwrap();
        st.safe = true;
        if !st.acked {
            st.acked = true;
            st.result = Some(result);
            st.version = version;
        }
        drop(st);
        self.notify.notify_waiters();
    }

    fn fail(&self, errno: i64) {
        let mut st = self.state.lock().unwrap();
        st.result = Some(errno);
        st.acked = true;
        st.safe = true;
        drop(st);
        self.notify.notify_waiters();
    }
}

struct OpRecord {
    request: OsdOpRequest,
    /// OSD the op was last sent to; replies from anyone else are stale.
    target_osd: Option<i32>,
    completion: Arc<Completion>,
    is_write: bool,
}

/// A persistent watch registration that survives map changes.
struct LingerRecord {
    pool: u32,
    object: ObjectName,
    cookie: u64,
    version: u64,
    events: mpsc::UnboundedSender<WatchNotifyPayload>,
}

/// Objecter tunables.
#[derive(Clone, Debug)]
pub struct ObjecterConfig {
    /// Per-op completion timeout used by the synchronous wrappers.
    pub op_timeout: std::time::Duration,
}

impl Default for ObjecterConfig {
    fn default() -> Self {
        ObjecterConfig { op_timeout: std::time::Duration::from_secs(30) }
    }
}

pub struct Objecter {
    config: ObjecterConfig,
    osdmap: Mutex<Arc<OsdMap>>,
    /// In-flight ops by tid; BTreeMap keeps resend scans in submission order.
    inflight: Mutex<BTreeMap<u64, OpRecord>>,
    lingers: Mutex<HashMap<u64, LingerRecord>>,
    last_tid: AtomicU64,
    last_cookie: AtomicU64,
    /// Observers of installed map epochs.
    pub epoch_watch: Arc<EpochWatch>,
    monc: Arc<MonClient>,
    sink: Arc<dyn MessageSink>,
}

impl Objecter {
    /// Build an objecter over an initial map.
    pub fn new(
        osdmap: OsdMap,
        monc: Arc<MonClient>,
        sink: Arc<dyn MessageSink>,
        config: ObjecterConfig,
    ) -> Arc<Objecter> {
        let epoch = osdmap.epoch;
        Arc::new(Objecter {
            config,
            osdmap: Mutex::new(Arc::new(osdmap)),
            inflight: Mutex::new(BTreeMap::new()),
            lingers: Mutex::new(HashMap::new()),
            last_tid: AtomicU64::new(0),
            last_cookie: AtomicU64::new(0),
            epoch_watch: Arc::new(EpochWatch::new(epoch)),
            monc,
            sink,
        })
    }

    /// Synchronous-wrapper timeout.
    pub fn op_timeout(&self) -> std::time::Duration {
        self.config.op_timeout
    }

    /// The current map.
    pub fn osdmap(&self) -> Arc<OsdMap> {
        self.osdmap.lock().unwrap().clone()
    }

    /// Number of ops in flight.
    pub fn inflight_ops(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    // -- submission ---------------------------------------------------------

    /// Submit an op vector against `object` in `pool`. Reads pass a snap id,
    /// mutations a snap context. Returns the completion handle; the tid is
    /// internal and never reassigned.
    pub fn submit(
        &self,
        pool: u32,
        object: ObjectName,
        ops: Vec<OsdOp>,
        snapid: u64,
        snapc: SnapContext,
        assert_version: u64,
    ) -> Result<Arc<Completion>> {
        let is_write = ops
            .iter()
            .any(|op| op.code.map(|c| c.is_mutation()).unwrap_or(false));
        if is_write && snapid != NOSNAP {
            // A mutation aimed at a snapshot instance can never succeed.
            return Err(ClientError::InvalidSnap);
        }

        let map = self.osdmap();
        if is_write && map.is_full() {
            return Err(ClientError::Full);
        }

        let mut flags = if is_write {
            OSD_FLAG_WRITE | OSD_FLAG_ACK | OSD_FLAG_ONDISK
        } else {
            OSD_FLAG_READ | OSD_FLAG_ACK
        };
        if is_write && !snapc.snaps.is_empty() {
            flags |= crate::proto::OSD_FLAG_ORDERSNAP;
        }

        let pgid = map.object_pg(pool, &object, -1);
        let mut request = OsdOpRequest {
            pgid,
            object,
            ops,
            snapid,
            snapc,
            flags,
            osdmap_epoch: map.epoch,
            attempt: 0,
        };
        if assert_version > 0 {
            request.ops.insert(0, OsdOp {
                code: Some(crate::proto::OsdOpCode::AssertVer),
                value: assert_version,
                ..Default::default()
            });
        }

        let tid = self.last_tid.fetch_add(1, Ordering::SeqCst) + 1;
        let completion = Completion::new();
        let record = OpRecord {
            request,
            target_osd: None,
            completion: completion.clone(),
            is_write,
        };
        self.inflight.lock().unwrap().insert(tid, record);
        self.kick_op(tid, &map);
        Ok(completion)
    }

    /// Submit a read-side op vector addressed at a placement group directly
    /// (group listing and other PG-scoped operations).
    pub fn submit_to_pg(&self, pgid: PgId, ops: Vec<OsdOp>) -> Result<Arc<Completion>> {
        let map = self.osdmap();
        let request = OsdOpRequest {
            pgid,
            object: ObjectName::Name(String::new()),
            ops,
            snapid: NOSNAP,
            snapc: SnapContext::empty(),
            flags: OSD_FLAG_READ | OSD_FLAG_ACK,
            osdmap_epoch: map.epoch,
            attempt: 0,
        };
        let tid = self.last_tid.fetch_add(1, Ordering::SeqCst) + 1;
        let completion = Completion::new();
        self.inflight.lock().unwrap().insert(
            tid,
            OpRecord {
                request,
                target_osd: None,
                completion: completion.clone(),
                is_write: false,
            },
        );
        self.kick_op(tid, &map);
        Ok(completion)
    }

    /// Address and send one in-flight op under `map`. Ops with no reachable
    /// primary (down, paused) stay queued until a new map arrives.
    fn kick_op(&self, tid: u64, map: &OsdMap) {
        let mut inflight = self.inflight.lock().unwrap();
        let Some(record) = inflight.get_mut(&tid) else { return };

        let paused = (record.is_write && map.is_pausewr())
            || (!record.is_write && map.is_pauserd());
        let target = if paused {
            None
        } else {
            map.pg_to_acting(record.request.pgid).ok().and_then(|(_, p)| p)
        };

        record.target_osd = target;
        record.request.osdmap_epoch = map.epoch;
        match target {
            Some(osd) => {
                let addr = map.osd_addr(osd);
                if let Some(addr) = addr {
                    let mut msg = match Message::new(MsgType::OsdOp, tid, &record.request) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(tid, error = %e, "op encode failed");
                            record.completion.fail(-5);
                            inflight.remove(&tid);
                            return;
                        }
                    };
                    msg.header.dst = EntityName::osd(osd as i64);
                    debug!(tid, osd, pg = %record.request.pgid,
                           attempt = record.request.attempt, "op sent");
                    record.request.attempt += 1;
                    drop(inflight);
                    self.sink.send(msg, addr);
                }
            }
            None => {
                debug!(tid, pg = %record.request.pgid, "op has no reachable primary, waiting");
                drop(inflight);
                self.monc.request_osdmap(map.epoch);
            }
        }
    }

    /// Cancel an op: it completes as abandoned, and any late reply is
    /// discarded by tid lookup.
    pub fn cancel_op_by_completion(&self, completion: &Arc<Completion>) {
        let mut inflight = self.inflight.lock().unwrap();
        let tid = inflight
            .iter()
            .find(|(_, r)| Arc::ptr_eq(&r.completion, completion))
            .map(|(t, _)| *t);
        if let Some(tid) = tid {
            let record = inflight.remove(&tid).unwrap();
            record.completion.fail(-110);
            debug!(tid, "op cancelled");
        }
    }

    // -- replies ------------------------------------------------------------

    /// An OSD_OPREPLY arrived.
    pub fn handle_op_reply(&self, msg: &Message) {
        let tid = msg.header.tid;
        let Ok(reply) = msg.body::<OsdOpReply>() else {
            warn!(tid, "corrupt op reply");
            return;
        };

        // Newer map on the server side: close the gap before anything else
        // routes wrong.
        let current_epoch = self.osdmap().epoch;
        if reply.osdmap_epoch > current_epoch {
            debug!(tid, server = reply.osdmap_epoch, have = current_epoch,
                   "reply from a newer epoch, fetching maps");
            self.monc.request_osdmap(current_epoch);
        }

        let mut inflight = self.inflight.lock().unwrap();
        let Some(record) = inflight.get_mut(&tid) else {
            debug!(tid, "reply for unknown tid (completed or cancelled)");
            return;
        };

        // A reply must come from the OSD the op was last addressed to;
        // anything else is a superseded primary talking past us.
        let src_osd = match msg.header.src.kind {
            coralfs_msgr::EntityKind::Osd => msg.header.src.num as i32,
            _ => -1,
        };
        if record.target_osd != Some(src_osd) {
            warn!(tid, src_osd, expected = ?record.target_osd, "stale reply dropped");
            return;
        }

        let safe = reply.flags & OSD_FLAG_ONDISK != 0;
        let acked = reply.flags & OSD_FLAG_ACK != 0 || safe;
        debug!(tid, result = reply.result, acked, safe, "op reply");

        if safe || !record.is_write {
            // Reads complete on ACK; writes complete on SAFE.
            let record = inflight.remove(&tid).unwrap();
            record.completion.complete_safe(reply.result, reply.version);
            if !record.is_write {
                record.completion.complete_ack(reply.result, reply.version, reply.outdata);
            }
        } else if acked {
            record.completion.complete_ack(reply.result, reply.version, reply.outdata);
        }
    }

    // -- map handling -------------------------------------------------------

    /// An OSD_MAP message arrived: apply incrementals in order, adopt newer
    /// full maps, then re-evaluate every in-flight op and linger.
    pub fn handle_osd_map(&self, msg: &Message) {
        let Ok(payload) = msg.body::<OsdMapPayload>() else {
            warn!("corrupt osd map message");
            return;
        };
        let mut installed = None;
        {
            let mut cur = self.osdmap.lock().unwrap();
            for bytes in &payload.incrementals {
                let incr = match OsdMapIncremental::decode(bytes) {
                    Ok(i) => i,
                    Err(e) => {
                        warn!(error = %e, "corrupt incremental, dropping batch");
                        break;
                    }
                };
                if incr.epoch <= cur.epoch {
                    continue; // already have it
                }
                if incr.based_on != cur.epoch {
                    debug!(have = cur.epoch, incr = incr.epoch, "gap in incrementals");
                    self.monc.request_osdmap(cur.epoch);
                    break;
                }
                match cur.apply(&incr) {
                    Ok(next) => {
                        info!(epoch = next.epoch, "osdmap advanced");
                        *cur = Arc::new(next);
                        installed = Some(cur.epoch);
                    }
                    Err(e) => {
                        warn!(error = %e, "incremental apply failed");
                        break;
                    }
                }
            }
            for bytes in &payload.full_maps {
                match OsdMap::decode(bytes) {
                    Ok(map) if map.epoch > cur.epoch => {
                        info!(epoch = map.epoch, "osdmap replaced");
                        *cur = Arc::new(map);
                        installed = Some(cur.epoch);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "corrupt full map"),
                }
            }
        }
        if let Some(epoch) = installed {
            self.monc.got_osdmap(epoch);
            self.epoch_watch.installed(epoch);
            self.scan_requests();
            self.rearm_lingers();
        }
    }

    /// Re-evaluate the target of every in-flight op after a map change.
    /// Ops whose primary moved are re-sent with their original tid, in
    /// submission order, so per-group mutation order survives the move.
    fn scan_requests(&self) {
        let map = self.osdmap();
        let tids: Vec<u64> = {
            let inflight = self.inflight.lock().unwrap();
            inflight
                .iter()
                .filter(|(_, r)| {
                    let new_target =
                        map.pg_to_acting(r.request.pgid).ok().and_then(|(_, p)| p);
                    new_target != r.target_osd || r.target_osd.is_none()
                })
                .map(|(tid, _)| *tid)
                .collect()
        };
        for tid in tids {
            debug!(tid, "re-targeting after map change");
            self.kick_op(tid, &map);
        }
    }

    /// The messenger lost the session to a peer: re-send every op addressed
    /// to that OSD (its queue may have been dropped).
    pub fn handle_peer_reset(&self, peer: EntityAddr) {
        let map = self.osdmap();
        let osd = (0..map.max_osd).find(|o| map.osd_addr(*o) == Some(peer));
        let Some(osd) = osd else { return };
        let tids: Vec<u64> = {
            let inflight = self.inflight.lock().unwrap();
            inflight
                .iter()
                .filter(|(_, r)| r.target_osd == Some(osd))
                .map(|(tid, _)| *tid)
                .collect()
        };
        if !tids.is_empty() {
            info!(osd, n = tids.len(), "re-sending ops after session reset");
        }
        for tid in tids {
            self.kick_op(tid, &map);
        }
    }

    // -- watch/notify -------------------------------------------------------

    /// Register a persistent watch on `object`. The registration is re-armed
    /// against the new primary after every map change. Notifies arrive on
    /// the returned channel.
    pub fn watch(
        &self,
        pool: u32,
        object: ObjectName,
        version: u64,
    ) -> Result<(u64, Arc<Completion>, mpsc::UnboundedReceiver<WatchNotifyPayload>)> {
        let cookie = self.last_cookie.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.lingers.lock().unwrap().insert(
            cookie,
            LingerRecord { pool, object: object.clone(), cookie, version, events: tx },
        );
        let completion = self.send_watch_op(pool, object, cookie, version, true)?;
        Ok((cookie, completion, rx))
    }

    /// Drop a watch registration.
    pub fn unwatch(&self, cookie: u64) -> Result<Arc<Completion>> {
        let record = self
            .lingers
            .lock()
            .unwrap()
            .remove(&cookie)
            .ok_or(ClientError::NotFound)?;
        self.send_watch_op(record.pool, record.object, cookie, record.version, false)
    }

    fn send_watch_op(
        &self,
        pool: u32,
        object: ObjectName,
        cookie: u64,
        version: u64,
        arm: bool,
    ) -> Result<Arc<Completion>> {
        let op = OsdOp {
            code: Some(crate::proto::OsdOpCode::Watch),
            value: cookie,
            length: arm as u64,
            snapid: version,
            ..Default::default()
        };
        self.submit(pool, object, vec![op], NOSNAP, SnapContext::empty(), 0)
    }

    /// Re-register every linger against the (possibly new) primary.
    fn rearm_lingers(&self) {
        let records: Vec<(u32, ObjectName, u64, u64)> = {
            let lingers = self.lingers.lock().unwrap();
            lingers
                .values()
                .map(|l| (l.pool, l.object.clone(), l.cookie, l.version))
                .collect()
        };
        for (pool, object, cookie, version) in records {
            debug!(cookie, "re-arming watch after map change");
            let _ = self.send_watch_op(pool, object, cookie, version, true);
        }
    }

    /// A WATCH_NOTIFY event arrived: route it to the registration and ack it
    /// through the same object.
    pub fn handle_watch_notify(&self, msg: &Message) {
        let Ok(event) = msg.body::<WatchNotifyPayload>() else {
            warn!("corrupt watch-notify");
            return;
        };
        let target = {
            let lingers = self.lingers.lock().unwrap();
            lingers.get(&event.cookie).map(|l| {
                (l.pool, l.object.clone(), l.events.clone())
            })
        };
        let Some((pool, object, events)) = target else {
            debug!(cookie = event.cookie, "notify for unknown watch");
            return;
        };
        let ack = OsdOp {
            code: Some(crate::proto::OsdOpCode::NotifyAck),
            value: event.notify_id,
            ..Default::default()
        };
        let _ = self.submit(pool, object, vec![ack], NOSNAP, SnapContext::empty(), 0);
        let _ = events.send(event);
    }
}
