//! The monitor client: map subscriptions, statfs, pool administration, and
//! the unmount handshake.
//!
//! Requests that wait on cluster state (wanted map epochs) are re-sent with
//! exponential backoff, 1s doubling to 30s, until a satisfying map arrives.
//! Each re-send goes to a pseudo-randomly chosen monitor, sticky to the last
//! one that answered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use coralfs_maps::MonMap;
use coralfs_msgr::{EntityName, Fsid, Message, MsgType};

use crate::error::{ClientError, Result};
use crate::proto::{
    MonGetMdsMap, MonGetOsdMap, MonMapPayload, PoolOpKind, PoolOpReply, PoolOpRequest,
    StatfsReply,
};
use crate::sink::MessageSink;

/// Monitor client tunables.
#[derive(Clone, Debug)]
pub struct MonClientConfig {
    /// Statfs / pool-op reply timeout before re-sending elsewhere.
    pub request_timeout: Duration,
    /// First map re-request delay.
    pub base_delay: Duration,
    /// Map re-request delay ceiling.
    pub max_delay: Duration,
}

impl Default for MonClientConfig {
    fn default() -> Self {
        MonClientConfig {
            request_timeout: Duration::from_secs(10),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

pub struct MonClient {
    config: MonClientConfig,
    monmap: Mutex<MonMap>,
    last_mon: Mutex<Option<usize>>,
    last_tid: AtomicU64,
    statfs_pending: Mutex<HashMap<u64, oneshot::Sender<StatfsReply>>>,
    poolop_pending: Mutex<HashMap<u64, oneshot::Sender<PoolOpReply>>>,
    /// MDS map epoch currently wanted; 0 when satisfied.
    want_mdsmap: AtomicU32,
    /// OSD map epoch we are requesting from (exclusive); 0 when idle.
    requesting_osdmap_from: AtomicU32,
    mds_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    osd_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    unmount_acked: Notify,
    sink: Arc<dyn MessageSink>,
}

impl MonClient {
    /// Build a monitor client over an initial (possibly bootstrap) map.
    pub fn new(
        monmap: MonMap,
        sink: Arc<dyn MessageSink>,
        config: MonClientConfig,
    ) -> Arc<MonClient> {
        Arc::new(MonClient {
            config,
            monmap: Mutex::new(monmap),
            last_mon: Mutex::new(None),
            last_tid: AtomicU64::new(0),
            statfs_pending: Mutex::new(HashMap::new()),
            poolop_pending: Mutex::new(HashMap::new()),
            want_mdsmap: AtomicU32::new(0),
            requesting_osdmap_from: AtomicU32::new(0),
            mds_task: Mutex::new(None),
            osd_task: Mutex::new(None),
            unmount_acked: Notify::new(),
            sink,
        })
    }

    /// The cluster id from the current monitor map.
    pub fn fsid(&self) -> Fsid {
        self.monmap.lock().unwrap().fsid
    }

    /// The current monitor map.
    pub fn monmap(&self) -> MonMap {
        self.monmap.lock().unwrap().clone()
    }

    /// Pick a monitor rank: sticky to the last responder, random otherwise.
    /// `avoid` forces a different choice after a timeout.
    pub fn pick_mon(&self, avoid: Option<usize>) -> Result<usize> {
        let map = self.monmap.lock().unwrap();
        if map.is_empty() {
            return Err(ClientError::NoMonitors);
        }
        let mut last = self.last_mon.lock().unwrap();
        if avoid.is_none() {
            if let Some(rank) = *last {
                if rank < map.len() {
                    return Ok(rank);
                }
            }
        }
        let mut rank = rand::thread_rng().gen_range(0..map.len());
        if let Some(bad) = avoid {
            if map.len() > 1 && rank == bad {
                rank = (rank + 1) % map.len();
            }
        }
        *last = Some(rank);
        Ok(rank)
    }

    fn send_to_mon(&self, rank: usize, mut msg: Message) {
        let addr = {
            let map = self.monmap.lock().unwrap();
            map.addr_of(rank)
        };
        if let Some(addr) = addr {
            msg.header.dst = EntityName::mon(rank as i64);
            self.sink.send(msg, addr);
        }
    }

    /// A monitor map arrived; install it if newer.
    pub fn handle_monmap(&self, msg: &Message) -> Result<()> {
        let payload: MonMapPayload = msg.body()?;
        let map = MonMap::decode(&payload.map)?;
        let mut cur = self.monmap.lock().unwrap();
        if map.epoch <= cur.epoch && !cur.is_empty() {
            debug!(epoch = map.epoch, have = cur.epoch, "stale monmap ignored");
            return Ok(());
        }
        if !cur.fsid.is_zero() && cur.fsid != map.fsid {
            return Err(ClientError::Map(coralfs_maps::MapError::FsidMismatch {
                map: map.fsid.to_string(),
                cluster: cur.fsid.to_string(),
            }));
        }
        info!(epoch = map.epoch, mons = map.len(), "monmap installed");
        *cur = map;
        Ok(())
    }

    // -- map subscriptions --------------------------------------------------

    /// Want the MDS map at epoch >= `want`; keeps asking until one arrives.
    pub fn request_mdsmap(self: &Arc<Self>, want: u32) {
        let prev = self.want_mdsmap.fetch_max(want, Ordering::SeqCst);
        if want <= prev {
            return; // already asking for at least this much
        }
        let monc = self.clone();
        let task = tokio::spawn(async move {
            let mut delay = monc.config.base_delay;
            loop {
                let want = monc.want_mdsmap.load(Ordering::SeqCst);
                if want == 0 {
                    return;
                }
                if let Ok(rank) = monc.pick_mon(None) {
                    debug!(rank, want, "requesting mdsmap");
                    let body = MonGetMdsMap { fsid: monc.fsid(), want };
                    if let Ok(msg) = Message::new(MsgType::MonGetMdsMap, 0, &body) {
                        monc.send_to_mon(rank, msg);
                    }
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(monc.config.max_delay);
            }
        });
        if let Some(old) = self.mds_task.lock().unwrap().replace(task) {
            old.abort();
        }
    }

    /// An MDS map at `got` arrived. Returns false when it does not satisfy
    /// the outstanding want (the request loop keeps going).
    pub fn got_mdsmap(&self, got: u32) -> bool {
        let want = self.want_mdsmap.load(Ordering::SeqCst);
        if want > 0 && got < want {
            debug!(got, want, "mdsmap below wanted epoch");
            return false;
        }
        self.want_mdsmap.store(0, Ordering::SeqCst);
        if let Some(task) = self.mds_task.lock().unwrap().take() {
            task.abort();
        }
        true
    }

    /// Ask for OSD map deltas after `have`; keeps asking until one arrives.
    pub fn request_osdmap(self: &Arc<Self>, have: u32) {
        self.requesting_osdmap_from.store(have + 1, Ordering::SeqCst);
        let monc = self.clone();
        let task = tokio::spawn(async move {
            let mut delay = monc.config.base_delay;
            loop {
                let start = monc.requesting_osdmap_from.load(Ordering::SeqCst);
                if start == 0 {
                    return;
                }
                if let Ok(rank) = monc.pick_mon(None) {
                    debug!(rank, start, "requesting osdmap");
                    let body = MonGetOsdMap { fsid: monc.fsid(), start };
                    if let Ok(msg) = Message::new(MsgType::MonGetOsdMap, 0, &body) {
                        monc.send_to_mon(rank, msg);
                    }
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(monc.config.max_delay);
            }
        });
        if let Some(old) = self.osd_task.lock().unwrap().replace(task) {
            old.abort();
        }
    }

    /// An OSD map at `got` arrived; cancel the request loop it satisfies.
    pub fn got_osdmap(&self, got: u32) -> bool {
        let start = self.requesting_osdmap_from.load(Ordering::SeqCst);
        if start > 0 && got + 1 <= start {
            debug!(got, start, "osdmap below requested epoch");
            return false;
        }
        self.requesting_osdmap_from.store(0, Ordering::SeqCst);
        if let Some(task) = self.osd_task.lock().unwrap().take() {
            task.abort();
        }
        true
    }

    // -- statfs -------------------------------------------------------------

    /// Cluster free-space query. One outstanding instance per tid; a timeout
    /// re-sends to a different monitor.
    pub async fn statfs(&self) -> Result<StatfsReply> {
        let tid = self.last_tid.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, mut rx) = oneshot::channel();
        self.statfs_pending.lock().unwrap().insert(tid, tx);

        let mut avoid = None;
        for attempt in 0..4 {
            let rank = self.pick_mon(avoid)?;
            debug!(tid, rank, attempt, "statfs");
            let msg = Message::from_bytes(MsgType::Statfs, tid, Vec::new());
            self.send_to_mon(rank, msg);
            match tokio::time::timeout(self.config.request_timeout, &mut rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(_)) => return Err(ClientError::Abandoned),
                Err(_) => {
                    warn!(tid, rank, "statfs timed out, trying another monitor");
                    avoid = Some(rank);
                }
            }
        }
        self.statfs_pending.lock().unwrap().remove(&tid);
        Err(ClientError::Timeout { seconds: self.config.request_timeout.as_secs() * 4 })
    }

    /// A statfs reply arrived.
    pub fn handle_statfs_reply(&self, msg: &Message) {
        let tid = msg.header.tid;
        let Ok(reply) = msg.body::<StatfsReply>() else {
            warn!(tid, "corrupt statfs reply");
            return;
        };
        if let Some(tx) = self.statfs_pending.lock().unwrap().remove(&tid) {
            let _ = tx.send(reply);
        } else {
            debug!(tid, "statfs reply for unknown tid");
        }
    }

    // -- pool administration ------------------------------------------------

    /// Run a pool administration op to completion.
    pub async fn pool_op(&self, op: PoolOpKind) -> Result<PoolOpReply> {
        let tid = self.last_tid.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, mut rx) = oneshot::channel();
        self.poolop_pending.lock().unwrap().insert(tid, tx);

        let body = PoolOpRequest { fsid: self.fsid(), op };
        let mut avoid = None;
        for _ in 0..4 {
            let rank = self.pick_mon(avoid)?;
            let msg = Message::new(MsgType::PoolOp, tid, &body)?;
            self.send_to_mon(rank, msg);
            match tokio::time::timeout(self.config.request_timeout, &mut rx).await {
                Ok(Ok(reply)) => {
                    if reply.result < 0 {
                        return Err(ClientError::from_errno(reply.result));
                    }
                    return Ok(reply);
                }
                Ok(Err(_)) => return Err(ClientError::Abandoned),
                Err(_) => avoid = Some(rank),
            }
        }
        self.poolop_pending.lock().unwrap().remove(&tid);
        Err(ClientError::Timeout { seconds: self.config.request_timeout.as_secs() * 4 })
    }

    /// A pool-op reply arrived.
    pub fn handle_poolop_reply(&self, msg: &Message) {
        let tid = msg.header.tid;
        let Ok(reply) = msg.body::<PoolOpReply>() else {
            warn!(tid, "corrupt pool-op reply");
            return;
        };
        if let Some(tx) = self.poolop_pending.lock().unwrap().remove(&tid) {
            let _ = tx.send(reply);
        }
    }

    // -- unmount ------------------------------------------------------------

    /// Tell the monitors the client is going away; retried until acked.
    pub async fn unmount(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = self.config.base_delay;
        loop {
            let rank = self.pick_mon(None)?;
            let msg = Message::from_bytes(MsgType::ClientUnmount, 0, Vec::new());
            self.send_to_mon(rank, msg);
            let wait = delay.min(deadline.saturating_duration_since(tokio::time::Instant::now()));
            if wait.is_zero() {
                return Err(ClientError::Timeout { seconds: timeout.as_secs() });
            }
            tokio::select! {
                _ = self.unmount_acked.notified() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
            delay = (delay * 2).min(self.config.max_delay);
        }
    }

    /// The monitor acknowledged the unmount.
    pub fn handle_unmount_ack(&self) {
        self.unmount_acked.notify_waiters();
    }

    /// Abort background request loops.
    pub fn stop(&self) {
        if let Some(t) = self.mds_task.lock().unwrap().take() {
            t.abort();
        }
        if let Some(t) = self.osd_task.lock().unwrap().take() {
            t.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::RecordingSink;
    use coralfs_msgr::EntityAddr;
    use std::net::SocketAddr;

    fn test_monmap(n: usize) -> MonMap {
        let mut map = MonMap::new(Fsid { major: 1, minor: 1 });
        map.epoch = 1;
        for i in 0..n {
            let sock: SocketAddr = format!("127.0.0.1:{}", 6789 + i).parse().unwrap();
            map.mons.push((
                EntityName::mon(i as i64),
                EntityAddr { erank: 0, nonce: i as u32 + 1, addr: sock },
            ));
        }
        map
    }

    fn quick_config() -> MonClientConfig {
        MonClientConfig {
            request_timeout: Duration::from_millis(50),
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        }
    }

    #[tokio::test]
    async fn test_pick_mon_sticky_and_avoid() {
        let sink = RecordingSink::new();
        let monc = MonClient::new(test_monmap(3), sink, quick_config());
        let first = monc.pick_mon(None).unwrap();
        assert_eq!(monc.pick_mon(None).unwrap(), first, "sticky");
        let other = monc.pick_mon(Some(first)).unwrap();
        assert_ne!(other, first, "avoid forces a different monitor");
    }

    #[tokio::test]
    async fn test_pick_mon_empty_map() {
        let sink = RecordingSink::new();
        let monc = MonClient::new(MonMap::new(Fsid::ZERO), sink, quick_config());
        assert!(matches!(monc.pick_mon(None), Err(ClientError::NoMonitors)));
    }

    #[tokio::test]
    async fn test_statfs_resends_on_timeout_then_completes() {
        let sink = RecordingSink::new();
        let monc = MonClient::new(test_monmap(3), sink.clone(), quick_config());

        let monc2 = monc.clone();
        let task = tokio::spawn(async move { monc2.statfs().await });

        // Let the first send time out once.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(sink.count() >= 2, "timed-out statfs was re-sent");

        // Answer whatever tid it used.
        let tid = sink.take()[0].0.header.tid;
        let reply = StatfsReply { total_kb: 10, free_kb: 5, avail_kb: 4, num_objects: 2 };
        let msg = Message::new(MsgType::StatfsReply, tid, &reply).unwrap();
        monc.handle_statfs_reply(&msg);

        let got = task.await.unwrap().unwrap();
        assert_eq!(got, reply);
    }

    #[tokio::test]
    async fn test_mdsmap_request_loop_retries_until_got() {
        let sink = RecordingSink::new();
        let monc = MonClient::new(test_monmap(1), sink.clone(), quick_config());
        monc.request_mdsmap(5);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(sink.count() >= 2, "request repeated with backoff");

        assert!(!monc.got_mdsmap(3), "epoch below want keeps asking");
        assert!(monc.got_mdsmap(5));
        sink.take();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sink.count(), 0, "loop cancelled after satisfaction");
    }

    #[tokio::test]
    async fn test_osdmap_request_start_epoch() {
        let sink = RecordingSink::new();
        let monc = MonClient::new(test_monmap(1), sink.clone(), quick_config());
        monc.request_osdmap(42);
        tokio::time::sleep(Duration::from_millis(25)).await;
        let sent = sink.take();
        assert!(!sent.is_empty());
        let body: MonGetOsdMap = sent[0].0.body().unwrap();
        assert_eq!(body.start, 43, "asks for the first missing epoch");
        assert!(monc.got_osdmap(50));
    }

    #[tokio::test]
    async fn test_handle_monmap_rejects_fsid_change() {
        let sink = RecordingSink::new();
        let monc = MonClient::new(test_monmap(1), sink, quick_config());
        let mut other = test_monmap(1);
        other.epoch = 9;
        other.fsid = Fsid { major: 7, minor: 7 };
        let payload = MonMapPayload { map: other.encode().unwrap() };
        let msg = Message::new(MsgType::MonMap, 0, &payload).unwrap();
        assert!(monc.handle_monmap(&msg).is_err());
    }

    #[tokio::test]
    async fn test_handle_monmap_installs_newer() {
        let sink = RecordingSink::new();
        let monc = MonClient::new(test_monmap(1), sink, quick_config());
        let mut newer = test_monmap(2);
        newer.epoch = 2;
        let payload = MonMapPayload { map: newer.encode().unwrap() };
        let msg = Message::new(MsgType::MonMap, 0, &payload).unwrap();
        monc.handle_monmap(&msg).unwrap();
        assert_eq!(monc.monmap().epoch, 2);
        assert_eq!(monc.monmap().len(), 2);
    }

    #[tokio::test]
    async fn test_pool_op_surfaces_server_error() {
        let sink = RecordingSink::new();
        let monc = MonClient::new(test_monmap(1), sink.clone(), quick_config());
        let monc2 = monc.clone();
        let task =
            tokio::spawn(async move { monc2.pool_op(PoolOpKind::Delete { pool: 9 }).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let tid = sink.take()[0].0.header.tid;
        let reply = PoolOpReply { result: -2, ..Default::default() };
        let msg = Message::new(MsgType::PoolOpReply, tid, &reply).unwrap();
        monc.handle_poolop_reply(&msg);
        assert!(matches!(task.await.unwrap(), Err(ClientError::NotFound)));
    }
}
