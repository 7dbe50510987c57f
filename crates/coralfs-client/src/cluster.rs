//! The cluster handle: the library surface binding messenger, monitor
//! client, objecter, MDS client, capability engine, and snap realms into one
//! explicitly-owned object. No process-wide state: everything hangs off the
//! handle the owner created.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use coralfs_maps::{MonMap, ObjectName, OsdMap, PgId};
use coralfs_msgr::{
    Dispatcher, EntityAddr, EntityKind, EntityName, Fsid, Message, Messenger, MessengerConfig,
    MsgType,
};

use crate::caps::{CapSender, CapTask, CapsConfig, CapsEngine};
use crate::error::{ClientError, Result};
use crate::mdsc::{MdsClient, MdsClientConfig};
use crate::monc::{MonClient, MonClientConfig};
use crate::objecter::{Completion, Objecter, ObjecterConfig};
use crate::proto::{
    AllocExtent, CapMessage, ObjectStat, OsdOp, OsdOpCode, PoolOpKind, PoolStats, SnapOp,
    SnapPayload, StatfsReply, TimeSpec, TmapCmd, TmapContents, WatchNotifyPayload,
};
use crate::sink::{MessageSink, MessengerSink};
use crate::snaps::{SnapContext, SnapRealmInfo, SnapRealmTree, NOSNAP};

/// Everything needed to reach a cluster.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Monitor addresses to bootstrap from.
    pub mon_addrs: Vec<SocketAddr>,
    /// Expected cluster id; zero accepts whatever the monitors report.
    pub fsid: Fsid,
    /// Client entity id; negative asks the cluster to assign one.
    pub client_id: i64,
    /// Mount ceiling: how long to wait for initial maps.
    pub mount_timeout: Duration,
    /// Monitor client tuning.
    pub monc: MonClientConfig,
    /// Objecter tuning.
    pub objecter: ObjecterConfig,
    /// MDS client tuning.
    pub mdsc: MdsClientConfig,
    /// Capability engine tuning.
    pub caps: CapsConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            mon_addrs: Vec::new(),
            fsid: Fsid::ZERO,
            client_id: -1,
            mount_timeout: Duration::from_secs(30),
            monc: MonClientConfig::default(),
            objecter: ObjecterConfig::default(),
            mdsc: MdsClientConfig::default(),
            caps: CapsConfig::default(),
        }
    }
}

/// A connected cluster.
pub struct Cluster {
    msgr: Arc<Messenger>,
    /// Monitor client.
    pub monc: Arc<MonClient>,
    /// OSD client.
    pub objecter: Arc<Objecter>,
    /// MDS client.
    pub mdsc: Arc<MdsClient>,
    /// Capability engine.
    pub caps: Arc<CapsEngine>,
    snaps: Mutex<SnapRealmTree>,
    watch_tasks: Mutex<HashMap<u64, tokio::task::JoinHandle<()>>>,
    cap_tasks: Mutex<Option<mpsc::UnboundedReceiver<CapTask>>>,
    mount_timeout: Duration,
}

struct CapsToMds {
    mdsc: Mutex<Option<Arc<MdsClient>>>,
    sink: Arc<dyn MessageSink>,
}

impl CapSender for CapsToMds {
    fn send_cap(&self, mds: u32, msg: CapMessage) {
        let addr = {
            let guard = self.mdsc.lock().unwrap();
            guard.as_ref().and_then(|m| m.mdsmap().addr_of(mds as usize))
        };
        let Some(addr) = addr else {
            warn!(mds, "no address for cap message");
            return;
        };
        if let Ok(mut wire) = Message::new(MsgType::ClientCaps, 0, &msg) {
            wire.header.dst = EntityName::mds(mds as i64);
            self.sink.send(wire, addr);
        }
    }
}

impl Cluster {
    /// Bind a messenger, wire the components together, and start dispatch.
    /// Initial maps are fetched lazily; `open_pool` and the mount path wait
    /// for them under `mount_timeout`.
    pub async fn connect(config: ClusterConfig) -> Result<Arc<Cluster>> {
        if config.mon_addrs.is_empty() {
            return Err(ClientError::NoMonitors);
        }
        let msgr = Messenger::bind(MessengerConfig::default(), None).await?;
        msgr.register_entity(EntityName::client(config.client_id));
        let sink = MessengerSink::new(msgr.clone());

        let mut monmap = MonMap::new(config.fsid);
        for (rank, addr) in config.mon_addrs.iter().enumerate() {
            monmap.mons.push((
                EntityName::mon(rank as i64),
                EntityAddr { erank: 0, nonce: 0, addr: *addr },
            ));
        }
        let monc = MonClient::new(monmap, sink.clone(), config.monc.clone());

        let cap_sender = Arc::new(CapsToMds { mdsc: Mutex::new(None), sink: sink.clone() });
        let (caps, cap_rx) = CapsEngine::new(cap_sender.clone(), config.caps.clone());

        let objecter = Objecter::new(
            OsdMap::new(config.fsid),
            monc.clone(),
            sink.clone(),
            config.objecter.clone(),
        );
        let mdsc = MdsClient::new(
            coralfs_maps::MdsMap::new(config.fsid),
            caps.clone(),
            monc.clone(),
            sink.clone(),
            config.mdsc.clone(),
        );
        *cap_sender.mdsc.lock().unwrap() = Some(mdsc.clone());

        let cluster = Arc::new(Cluster {
            msgr: msgr.clone(),
            monc: monc.clone(),
            objecter,
            mdsc,
            caps: caps.clone(),
            snaps: Mutex::new(SnapRealmTree::new()),
            watch_tasks: Mutex::new(HashMap::new()),
            cap_tasks: Mutex::new(Some(cap_rx)),
            mount_timeout: config.mount_timeout,
        });
        msgr.start(cluster.clone());

        // Ask for the first maps and start the periodic scans.
        monc.request_osdmap(0);
        monc.request_mdsmap(1);
        let tick = cluster.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                tick.caps.check_delayed_caps();
            }
        });
        let renew = cluster.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(20));
            loop {
                interval.tick().await;
                renew.mdsc.renew_sessions();
            }
        });

        info!(addr = %msgr.local_addr(), "cluster handle connected");
        Ok(cluster)
    }

    /// Take the capability work queue. The embedding filesystem drains it:
    /// writebacks, page invalidations, deferred truncates, wakeups. After
    /// handling an `InvalidatePages` task it must report back through
    /// [`CapsEngine::invalidate_complete`] so the pending revocation can
    /// ack.
    pub fn take_cap_tasks(&self) -> Option<mpsc::UnboundedReceiver<CapTask>> {
        self.cap_tasks.lock().unwrap().take()
    }

    /// Cluster free space.
    pub async fn statfs(&self) -> Result<StatfsReply> {
        self.monc.statfs().await
    }

    /// Open a pool by name, waiting for an OSD map if none has arrived yet.
    pub async fn open_pool(self: &Arc<Self>, name: &str) -> Result<Pool> {
        let deadline = tokio::time::Instant::now() + self.mount_timeout;
        loop {
            let map = self.objecter.osdmap();
            if map.epoch > 0 {
                if let Some((id, _)) = map.pools.iter().find(|(_, p)| p.name == name) {
                    return Ok(Pool {
                        cluster: self.clone(),
                        pool_id: *id,
                        snap_seq: NOSNAP,
                        snapc: SnapContext::empty(),
                    });
                }
                return Err(ClientError::PoolNotFound { name: name.to_string() });
            }
            let wait = self.objecter.epoch_watch.wait_for(1);
            if tokio::time::timeout_at(deadline, wait).await.is_err() {
                return Err(ClientError::Timeout {
                    seconds: self.mount_timeout.as_secs(),
                });
            }
        }
    }

    // -- pool administration -----------------------------------------------

    /// Create a pool.
    pub async fn pool_create(&self, name: &str, auid: u64) -> Result<u32> {
        let reply = self
            .monc
            .pool_op(PoolOpKind::Create { name: name.to_string(), auid })
            .await?;
        Ok(reply.pool)
    }

    /// Delete a pool by id.
    pub async fn pool_delete(&self, pool: u32) -> Result<()> {
        self.monc.pool_op(PoolOpKind::Delete { pool }).await?;
        Ok(())
    }

    /// Reassign pool ownership.
    pub async fn pool_change_auid(&self, pool: u32, auid: u64) -> Result<()> {
        self.monc.pool_op(PoolOpKind::ChangeAuid { pool, auid }).await?;
        Ok(())
    }

    /// Names of every pool in the current map.
    pub fn list_pools(&self) -> Vec<(u32, String)> {
        self.objecter
            .osdmap()
            .pools
            .iter()
            .map(|(id, p)| (*id, p.name.clone()))
            .collect()
    }

    /// Usage statistics for a pool.
    pub async fn get_pool_stats(&self, pool: u32) -> Result<PoolStats> {
        let reply = self.monc.pool_op(PoolOpKind::Stats { pool }).await?;
        Ok(reply.stats.unwrap_or_default())
    }

    // -- snap trace plumbing -------------------------------------------------

    /// Apply a realm trace: realms whose snapshot seq advanced freeze the
    /// dirty state of every cap-holding inode under the *old* context.
    fn apply_snap_trace(&self, trace: &[SnapRealmInfo]) {
        let mut frozen: Vec<(u64, SnapContext)> = Vec::new();
        {
            let mut snaps = self.snaps.lock().unwrap();
            // Old contexts first: the freeze must capture pre-update state.
            let old_contexts: HashMap<u64, SnapContext> = trace
                .iter()
                .map(|info| (info.ino, snaps.context(info.ino)))
                .collect();
            let advanced = snaps.update_trace(trace);
            for realm_ino in advanced {
                let old_ctx = old_contexts.get(&realm_ino).cloned().unwrap_or_default();
                if let Some(realm) = snaps.get(realm_ino) {
                    for ino in &realm.inodes_with_caps {
                        frozen.push((*ino, old_ctx.clone()));
                    }
                }
            }
        }
        for (ino, ctx) in frozen {
            self.caps.queue_cap_snap(ino, ctx);
            self.caps.flush_snaps(ino);
        }
    }

    /// Attach an inode's caps to a realm (first cap installed).
    pub fn link_inode_to_realm(&self, realm: u64, ino: u64) {
        self.snaps.lock().unwrap().link_inode(realm, ino);
    }

    /// The snap context a new write against `ino` must carry.
    pub fn write_context(&self, ino: u64) -> SnapContext {
        let realm = self.caps.inode(ino).lock().unwrap().snap_realm;
        self.snaps.lock().unwrap().context(realm)
    }

    // -- teardown ------------------------------------------------------------

    /// Flush state and leave the cluster: close MDS sessions, notify the
    /// monitors, and drain the messenger.
    pub async fn shutdown(&self, timeout: Duration) {
        self.mdsc.close_sessions();
        if let Err(e) = self.monc.unmount(timeout).await {
            warn!(error = %e, "unmount incomplete");
        }
        self.monc.stop();
        for (_, task) in self.watch_tasks.lock().unwrap().drain() {
            task.abort();
        }
        self.msgr.shutdown().await;
    }
}

impl Dispatcher for Cluster {
    fn dispatch(&self, msg: Message) {
        let src = msg.header.src;
        debug!(msg_type = ?msg.msg_type(), %src, tid = msg.header.tid, "dispatch");
        match msg.msg_type() {
            MsgType::MonMap => {
                if let Err(e) = self.monc.handle_monmap(&msg) {
                    warn!(error = %e, "monmap rejected");
                }
            }
            MsgType::StatfsReply => self.monc.handle_statfs_reply(&msg),
            MsgType::PoolOpReply => self.monc.handle_poolop_reply(&msg),
            MsgType::ClientUnmount => self.monc.handle_unmount_ack(),
            MsgType::MdsMap => self.mdsc.handle_mds_map(&msg),
            MsgType::ClientSession => {
                if src.kind == EntityKind::Mds && src.num >= 0 {
                    self.mdsc.handle_session(src.num as u32, &msg);
                }
            }
            MsgType::ClientReply => {
                if src.kind == EntityKind::Mds && src.num >= 0 {
                    self.mdsc.handle_reply(src.num as u32, &msg);
                }
            }
            MsgType::ClientRequestForward => self.mdsc.handle_forward(&msg),
            MsgType::ClientCaps => {
                if src.kind == EntityKind::Mds && src.num >= 0 {
                    if let Ok(cap_msg) = msg.body::<CapMessage>() {
                        if !cap_msg.snap_trace.is_empty() {
                            self.apply_snap_trace(&cap_msg.snap_trace);
                        }
                        self.caps.handle_cap_message(src.num as u32, &cap_msg);
                    } else {
                        warn!("corrupt cap message");
                    }
                }
            }
            MsgType::ClientSnap => {
                if let Ok(snap) = msg.body::<SnapPayload>() {
                    match snap.op {
                        SnapOp::Update => self.apply_snap_trace(&snap.trace),
                        SnapOp::Split => {
                            if let Some(new_realm) = snap.trace.first().map(|t| t.ino) {
                                let moved = self.snaps.lock().unwrap().split_inodes(
                                    snap.split_realm,
                                    new_realm,
                                    &snap.split_inos,
                                );
                                for ino in moved {
                                    let state = self.caps.inode(ino);
                                    state.lock().unwrap().snap_realm = new_realm;
                                }
                            }
                            self.apply_snap_trace(&snap.trace);
                        }
                        SnapOp::Destroy => {
                            let mut snaps = self.snaps.lock().unwrap();
                            for info in &snap.trace {
                                snaps.remove(info.ino);
                            }
                        }
                    }
                }
            }
            MsgType::ClientLease => {
                if src.kind == EntityKind::Mds && src.num >= 0 {
                    self.mdsc.handle_lease(src.num as u32, &msg);
                }
            }
            MsgType::OsdMap => self.objecter.handle_osd_map(&msg),
            MsgType::OsdOpReply => self.objecter.handle_op_reply(&msg),
            MsgType::WatchNotify => self.objecter.handle_watch_notify(&msg),
            other => debug!(?other, "unhandled message type"),
        }
    }

    fn peer_reset(&self, peer: EntityAddr) {
        info!(%peer, "peer session reset");
        self.objecter.handle_peer_reset(peer);
        self.mdsc.handle_peer_reset(peer);
    }
}

/// A handle on one pool, carrying the read snapshot and write snap context
/// the caller selected.
pub struct Pool {
    cluster: Arc<Cluster>,
    /// Pool id in the OSD map.
    pub pool_id: u32,
    /// Snapshot reads are served from; `NOSNAP` reads the head.
    snap_seq: u64,
    /// Context mutations carry (self-managed snapshots).
    snapc: SnapContext,
}

impl Pool {
    fn oid(name: &str) -> ObjectName {
        ObjectName::Name(name.to_string())
    }

    fn write_snapc(&self) -> SnapContext {
        if self.snapc.snaps.is_empty() && self.snapc.seq == 0 {
            // Default to the pool's published snapshot state.
            let map = self.cluster.objecter.osdmap();
            if let Some(pool) = map.pools.get(&self.pool_id) {
                return SnapContext {
                    seq: pool.snap_seq,
                    snaps: pool.snaps.keys().rev().copied().collect(),
                };
            }
        }
        self.snapc.clone()
    }

    async fn wait(&self, completion: Arc<Completion>, safe: bool) -> Result<Arc<Completion>> {
        let timeout = self.cluster.objecter.op_timeout();
        let waited = if safe {
            tokio::time::timeout(timeout, completion.wait_for_safe()).await
        } else {
            tokio::time::timeout(timeout, completion.wait_for_ack()).await
        };
        if waited.is_err() {
            self.cluster.objecter.cancel_op_by_completion(&completion);
            return Err(ClientError::Timeout { seconds: timeout.as_secs() });
        }
        let rv = completion.get_return_value();
        if rv < 0 {
            return Err(ClientError::from_errno(rv as i32));
        }
        Ok(completion)
    }

    // -- selection ----------------------------------------------------------

    /// Serve subsequent reads from snapshot `snap` (`NOSNAP` for the head).
    pub fn set_snap(&mut self, snap: u64) {
        self.snap_seq = snap;
    }

    /// Carry a self-managed snap context on subsequent writes.
    pub fn set_snap_context(&mut self, seq: u64, snaps: Vec<u64>) -> Result<()> {
        let ctx = SnapContext { seq, snaps };
        if !ctx.is_valid() {
            return Err(ClientError::InvalidSnap);
        }
        self.snapc = ctx;
        Ok(())
    }

    // -- asynchronous object i/o ---------------------------------------------

    /// Start a write; completion fires ACK then SAFE.
    pub fn aio_write(&self, oid: &str, off: u64, data: Vec<u8>) -> Result<Arc<Completion>> {
        let mut op = OsdOp::extent(OsdOpCode::Write, off, data.len() as u64);
        op.indata = data;
        self.cluster.objecter.submit(
            self.pool_id,
            Self::oid(oid),
            vec![op],
            NOSNAP,
            self.write_snapc(),
            0,
        )
    }

    /// Start a full-object replacement.
    pub fn aio_write_full(&self, oid: &str, data: Vec<u8>) -> Result<Arc<Completion>> {
        let mut op = OsdOp::extent(OsdOpCode::WriteFull, 0, data.len() as u64);
        op.indata = data;
        self.cluster.objecter.submit(
            self.pool_id,
            Self::oid(oid),
            vec![op],
            NOSNAP,
            self.write_snapc(),
            0,
        )
    }

    /// Start a read at the pool's read snapshot.
    pub fn aio_read(&self, oid: &str, off: u64, len: u64) -> Result<Arc<Completion>> {
        self.cluster.objecter.submit(
            self.pool_id,
            Self::oid(oid),
            vec![OsdOp::extent(OsdOpCode::Read, off, len)],
            self.snap_seq,
            SnapContext::empty(),
            0,
        )
    }

    // -- synchronous object i/o ----------------------------------------------

    /// Create an object; `exclusive` fails with Exists if it already does.
    pub async fn create(&self, oid: &str, exclusive: bool) -> Result<()> {
        let mut op = OsdOp::new(OsdOpCode::Create);
        op.value = exclusive as u64;
        let c = self.cluster.objecter.submit(
            self.pool_id,
            Self::oid(oid),
            vec![op],
            NOSNAP,
            self.write_snapc(),
            0,
        )?;
        self.wait(c, true).await.map(|_| ())
    }

    /// Write and wait for durability.
    pub async fn write(&self, oid: &str, off: u64, data: Vec<u8>) -> Result<()> {
        let c = self.aio_write(oid, off, data)?;
        self.wait(c, true).await.map(|_| ())
    }

    /// Replace all object data and wait for durability.
    pub async fn write_full(&self, oid: &str, data: Vec<u8>) -> Result<()> {
        let c = self.aio_write_full(oid, data)?;
        self.wait(c, true).await.map(|_| ())
    }

    /// Read up to `len` bytes at `off`.
    pub async fn read(&self, oid: &str, off: u64, len: u64) -> Result<Vec<u8>> {
        let c = self.aio_read(oid, off, len)?;
        let c = self.wait(c, false).await?;
        Ok(c.take_outdata())
    }

    /// Truncate to `size`.
    pub async fn trunc(&self, oid: &str, size: u64) -> Result<()> {
        let c = self.cluster.objecter.submit(
            self.pool_id,
            Self::oid(oid),
            vec![OsdOp::extent(OsdOpCode::Truncate, size, 0)],
            NOSNAP,
            self.write_snapc(),
            0,
        )?;
        self.wait(c, true).await.map(|_| ())
    }

    /// Remove the object.
    pub async fn remove(&self, oid: &str) -> Result<()> {
        let c = self.cluster.objecter.submit(
            self.pool_id,
            Self::oid(oid),
            vec![OsdOp::new(OsdOpCode::Delete)],
            NOSNAP,
            self.write_snapc(),
            0,
        )?;
        self.wait(c, true).await.map(|_| ())
    }

    /// Object size and mtime.
    pub async fn stat(&self, oid: &str) -> Result<ObjectStat> {
        let c = self.cluster.objecter.submit(
            self.pool_id,
            Self::oid(oid),
            vec![OsdOp::new(OsdOpCode::Stat)],
            self.snap_seq,
            SnapContext::empty(),
            0,
        )?;
        let c = self.wait(c, false).await?;
        coralfs_msgr::decode_payload(&c.take_outdata()).map_err(ClientError::from)
    }

    /// Allocated-extent map for a range.
    pub async fn mapext(&self, oid: &str, off: u64, len: u64) -> Result<Vec<AllocExtent>> {
        let c = self.cluster.objecter.submit(
            self.pool_id,
            Self::oid(oid),
            vec![OsdOp::extent(OsdOpCode::MapExt, off, len)],
            self.snap_seq,
            SnapContext::empty(),
            0,
        )?;
        let c = self.wait(c, false).await?;
        coralfs_msgr::decode_payload(&c.take_outdata()).map_err(ClientError::from)
    }

    /// Read only the allocated extents of a range: ordered (extent, bytes)
    /// segments.
    pub async fn sparse_read(
        &self,
        oid: &str,
        off: u64,
        len: u64,
    ) -> Result<Vec<(AllocExtent, Vec<u8>)>> {
        let c = self.cluster.objecter.submit(
            self.pool_id,
            Self::oid(oid),
            vec![OsdOp::extent(OsdOpCode::SparseRead, off, len)],
            self.snap_seq,
            SnapContext::empty(),
            0,
        )?;
        let c = self.wait(c, false).await?;
        coralfs_msgr::decode_payload(&c.take_outdata()).map_err(ClientError::from)
    }

    // -- xattrs ---------------------------------------------------------------

    /// Fetch one extended attribute.
    pub async fn getxattr(&self, oid: &str, name: &str) -> Result<Vec<u8>> {
        let mut op = OsdOp::new(OsdOpCode::GetXattr);
        op.name = name.to_string();
        let c = self.cluster.objecter.submit(
            self.pool_id,
            Self::oid(oid),
            vec![op],
            self.snap_seq,
            SnapContext::empty(),
            0,
        )?;
        let c = self.wait(c, false).await?;
        Ok(c.take_outdata())
    }

    /// Set one extended attribute.
    pub async fn setxattr(&self, oid: &str, name: &str, value: Vec<u8>) -> Result<()> {
        let mut op = OsdOp::new(OsdOpCode::SetXattr);
        op.name = name.to_string();
        op.indata = value;
        let c = self.cluster.objecter.submit(
            self.pool_id,
            Self::oid(oid),
            vec![op],
            NOSNAP,
            self.write_snapc(),
            0,
        )?;
        self.wait(c, true).await.map(|_| ())
    }

    /// Remove one extended attribute.
    pub async fn rmxattr(&self, oid: &str, name: &str) -> Result<()> {
        let mut op = OsdOp::new(OsdOpCode::RmXattr);
        op.name = name.to_string();
        let c = self.cluster.objecter.submit(
            self.pool_id,
            Self::oid(oid),
            vec![op],
            NOSNAP,
            self.write_snapc(),
            0,
        )?;
        self.wait(c, true).await.map(|_| ())
    }

    /// List extended attributes: (name, value) pairs.
    pub async fn listxattrs(&self, oid: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let c = self.cluster.objecter.submit(
            self.pool_id,
            Self::oid(oid),
            vec![OsdOp::new(OsdOpCode::ListXattrs)],
            self.snap_seq,
            SnapContext::empty(),
            0,
        )?;
        let c = self.wait(c, false).await?;
        coralfs_msgr::decode_payload(&c.take_outdata()).map_err(ClientError::from)
    }

    // -- tagged maps and extensions -------------------------------------------

    /// Apply a compare-and-swap update stream to the object's tagged map.
    pub async fn tmap_update(&self, oid: &str, cmds: Vec<TmapCmd>) -> Result<()> {
        let mut op = OsdOp::new(OsdOpCode::TmapUp);
        op.indata = coralfs_msgr::encode_payload(&cmds)?;
        let c = self.cluster.objecter.submit(
            self.pool_id,
            Self::oid(oid),
            vec![op],
            NOSNAP,
            self.write_snapc(),
            0,
        )?;
        self.wait(c, true).await.map(|_| ())
    }

    /// Read the object's tagged map.
    pub async fn tmap_get(&self, oid: &str) -> Result<TmapContents> {
        let c = self.cluster.objecter.submit(
            self.pool_id,
            Self::oid(oid),
            vec![OsdOp::new(OsdOpCode::TmapGet)],
            self.snap_seq,
            SnapContext::empty(),
            0,
        )?;
        let c = self.wait(c, false).await?;
        coralfs_msgr::decode_payload(&c.take_outdata()).map_err(ClientError::from)
    }

    /// Invoke a server-side extension method on the object.
    pub async fn exec(
        &self,
        oid: &str,
        class: &str,
        method: &str,
        input: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let mut op = OsdOp::new(OsdOpCode::Call);
        op.name = class.to_string();
        op.method = method.to_string();
        op.indata = input;
        let c = self.cluster.objecter.submit(
            self.pool_id,
            Self::oid(oid),
            vec![op],
            NOSNAP,
            self.write_snapc(),
            0,
        )?;
        let c = self.wait(c, true).await?;
        Ok(c.take_outdata())
    }

    // -- object listing -------------------------------------------------------

    /// List objects in the pool, paging group by group. Returns names plus
    /// the cursor for the next call; `None` when exhausted.
    pub async fn list_objects(
        &self,
        cursor: Option<ListCursor>,
        max: usize,
    ) -> Result<(Vec<String>, Option<ListCursor>)> {
        let map = self.cluster.objecter.osdmap();
        let pg_num = map.pg_num;
        let mut cursor = cursor.unwrap_or_default();
        let mut names = Vec::new();
        while names.len() < max && cursor.ps < pg_num {
            let mut op = OsdOp::new(OsdOpCode::PgList);
            op.value = cursor.cookie;
            op.length = (max - names.len()) as u64;
            let pgid = PgId::new(self.pool_id, cursor.ps);
            let c = self.cluster.objecter.submit_to_pg(pgid, vec![op])?;
            let c = self.wait(c, false).await?;
            let page: PgListReply = coralfs_msgr::decode_payload(&c.take_outdata())?;
            names.extend(page.entries);
            if page.next_cookie == 0 {
                cursor.ps += 1;
                cursor.cookie = 0;
            } else {
                cursor.cookie = page.next_cookie;
            }
        }
        if cursor.ps >= pg_num {
            Ok((names, None))
        } else {
            Ok((names, Some(cursor)))
        }
    }

    // -- watch/notify ---------------------------------------------------------

    /// Watch the object: `cb` fires for every notify until `unwatch`.
    pub fn watch(
        &self,
        oid: &str,
        version: u64,
        cb: impl Fn(WatchNotifyPayload) + Send + 'static,
    ) -> Result<u64> {
        let (cookie, _completion, mut rx) =
            self.cluster.objecter.watch(self.pool_id, Self::oid(oid), version)?;
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                cb(event);
            }
        });
        self.cluster.watch_tasks.lock().unwrap().insert(cookie, task);
        Ok(cookie)
    }

    /// Drop a watch registration.
    pub async fn unwatch(&self, cookie: u64) -> Result<()> {
        let c = self.cluster.objecter.unwatch(cookie)?;
        if let Some(task) = self.cluster.watch_tasks.lock().unwrap().remove(&cookie) {
            task.abort();
        }
        self.wait(c, false).await.map(|_| ())
    }

    /// Post a notify to the object's watchers.
    pub async fn notify(&self, oid: &str, version: u64) -> Result<()> {
        let mut op = OsdOp::new(OsdOpCode::Notify);
        op.value = version;
        let c = self.cluster.objecter.submit(
            self.pool_id,
            Self::oid(oid),
            vec![op],
            NOSNAP,
            SnapContext::empty(),
            0,
        )?;
        self.wait(c, false).await.map(|_| ())
    }

    // -- snapshots ------------------------------------------------------------

    /// Create a named pool snapshot.
    pub async fn snap_create(&self, name: &str) -> Result<()> {
        self.cluster
            .monc
            .pool_op(PoolOpKind::CreateSnap { pool: self.pool_id, name: name.to_string() })
            .await?;
        Ok(())
    }

    /// Remove a named pool snapshot.
    pub async fn snap_remove(&self, name: &str) -> Result<()> {
        self.cluster
            .monc
            .pool_op(PoolOpKind::DeleteSnap { pool: self.pool_id, name: name.to_string() })
            .await?;
        Ok(())
    }

    /// Named snapshots of this pool, from the current map.
    pub fn snap_list(&self) -> Vec<(u64, String)> {
        let map = self.cluster.objecter.osdmap();
        map.pools
            .get(&self.pool_id)
            .map(|p| p.snaps.iter().map(|(id, n)| (*id, n.clone())).collect())
            .unwrap_or_default()
    }

    /// Look up a pool snapshot id by name.
    pub fn snap_lookup(&self, name: &str) -> Option<u64> {
        self.snap_list().into_iter().find(|(_, n)| n == name).map(|(id, _)| id)
    }

    /// Roll an object back to a named pool snapshot.
    pub async fn snap_rollback_object(&self, oid: &str, snap_name: &str) -> Result<()> {
        let snapid = self.snap_lookup(snap_name).ok_or(ClientError::NotFound)?;
        self.rollback(oid, snapid).await
    }

    /// Allocate a self-managed snapshot id.
    pub async fn selfmanaged_snap_create(&self) -> Result<u64> {
        let reply = self
            .cluster
            .monc
            .pool_op(PoolOpKind::CreateUnmanagedSnap { pool: self.pool_id })
            .await?;
        Ok(reply.snapid)
    }

    /// Release a self-managed snapshot id.
    pub async fn selfmanaged_snap_remove(&self, snap: u64) -> Result<()> {
        self.cluster
            .monc
            .pool_op(PoolOpKind::DeleteUnmanagedSnap { pool: self.pool_id, snap })
            .await?;
        Ok(())
    }

    /// Roll an object back to a snapshot id.
    pub async fn rollback(&self, oid: &str, snapid: u64) -> Result<()> {
        let mut op = OsdOp::new(OsdOpCode::Rollback);
        op.snapid = snapid;
        let c = self.cluster.objecter.submit(
            self.pool_id,
            Self::oid(oid),
            vec![op],
            NOSNAP,
            self.write_snapc(),
            0,
        )?;
        self.wait(c, true).await.map(|_| ())
    }

    /// Pool free-space view derived from cluster statfs (coarse).
    pub async fn stat_pool(&self) -> Result<PoolStats> {
        self.cluster.get_pool_stats(self.pool_id).await
    }
}

/// Pagination cursor for [`Pool::list_objects`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ListCursor {
    /// Group currently being listed.
    pub ps: u32,
    /// Opaque continuation cookie within the group.
    pub cookie: u64,
}

/// One page of a group listing.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct PgListReply {
    /// Object names in this page.
    pub entries: Vec<String>,
    /// Continuation cookie; 0 when the group is exhausted.
    pub next_cookie: u64,
}

/// A stat result helper for tests and embedders.
pub fn object_stat(size: u64, mtime: TimeSpec) -> ObjectStat {
    ObjectStat { size, mtime }
}
