//! The messenger: reliable ordered point-to-point message exchange.
//!
//! One messenger serves one process. It binds a listen socket with a fresh
//! incarnation nonce, registers a logical entity name, and moves messages to
//! peers through per-peer connections governed by the policy table. All
//! received traffic funnels through a single dispatch task so owner state
//! stays single-threaded.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::addr::{EntityAddr, EntityName};
use crate::connection::{
    pump, read_frame, write_frame, ConnectPayload, Connection, DispatchEvent, LocalIdent,
    SessionState,
};
use crate::error::{MsgrError, Result};
use crate::frame::{Message, MsgType, PRIO_HIGH};
use crate::policy::{BackoffConfig, PolicyTable};

/// Receives everything a messenger observes, in per-peer arrival order.
pub trait Dispatcher: Send + Sync + 'static {
    /// A message arrived.
    fn dispatch(&self, msg: Message);
    /// The session to `peer` was reset and (per policy) queued messages may
    /// have been lost; the owner decides whether to reconcile or discard.
    fn peer_reset(&self, peer: EntityAddr);
}

/// Messenger tunables.
#[derive(Clone, Debug, Default)]
pub struct MessengerConfig {
    /// Per-peer-kind failure policy.
    pub policy: PolicyTable,
    /// Reconnect schedule for policies that retry.
    pub backoff: BackoffConfig,
}

/// A bound messenger endpoint.
pub struct Messenger {
    local_addr: EntityAddr,
    entity: std::sync::Mutex<Option<EntityName>>,
    config: MessengerConfig,
    conns: Mutex<HashMap<EntityAddr, Connection>>,
    dispatch_tx: mpsc::UnboundedSender<DispatchEvent>,
    dispatch_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<DispatchEvent>>>,
    accept_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: std::sync::atomic::AtomicBool,
}

impl Messenger {
    /// Bind a listen socket (any free port when `addr` is `None`), allocate
    /// the incarnation nonce, and start accepting peers.
    pub async fn bind(config: MessengerConfig, addr: Option<SocketAddr>) -> Result<Arc<Messenger>> {
        let want = addr.unwrap_or_else(|| "127.0.0.1:0".parse().unwrap());
        let listener = TcpListener::bind(want).await?;
        let local = EntityAddr::with_nonce(listener.local_addr()?);
        let (tx, rx) = mpsc::unbounded_channel();

        let msgr = Arc::new(Messenger {
            local_addr: local,
            entity: std::sync::Mutex::new(None),
            config,
            conns: Mutex::new(HashMap::new()),
            dispatch_tx: tx,
            dispatch_rx: std::sync::Mutex::new(Some(rx)),
            accept_task: std::sync::Mutex::new(None),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        });

        let accept_msgr = msgr.clone();
        let task = tokio::spawn(async move {
            accept_loop(accept_msgr, listener).await;
        });
        *msgr.accept_task.lock().unwrap() = Some(task);

        info!(addr = %local, "messenger bound");
        Ok(msgr)
    }

    /// The address peers should dial, including our nonce.
    pub fn local_addr(&self) -> EntityAddr {
        self.local_addr
    }

    /// Attach a logical entity name; messages we send carry it as source.
    pub fn register_entity(&self, name: EntityName) -> EntityName {
        *self.entity.lock().unwrap() = Some(name);
        name
    }

    /// The registered entity name, if any.
    pub fn entity(&self) -> Option<EntityName> {
        *self.entity.lock().unwrap()
    }

    /// Start delivering events to `dispatcher`. Call exactly once.
    pub fn start(&self, dispatcher: Arc<dyn Dispatcher>) {
        let rx = self
            .dispatch_rx
            .lock()
            .unwrap()
            .take()
            .expect("messenger already started");
        tokio::spawn(dispatch_loop(rx, dispatcher));
    }

    /// Queue `msg` for `dest`. Returns immediately; delivery failure is
    /// reported through the dispatcher's reset callback, never here.
    pub async fn send(&self, mut msg: Message, dest: EntityAddr) -> Result<()> {
        if self.shutdown.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(MsgrError::Shutdown);
        }
        let entity = self.entity().ok_or(MsgrError::NoEntity)?;
        msg.header.src = entity;

        // Local delivery short-circuits the network entirely.
        if dest == self.local_addr {
            let _ = self.dispatch_tx.send(DispatchEvent::Message(msg));
            return Ok(());
        }

        let mut conns = self.conns.lock().await;
        let stale = conns.get(&dest).map(|c| c.is_closed()).unwrap_or(false);
        if stale {
            conns.remove(&dest);
        }
        let conn = conns.entry(dest).or_insert_with(|| {
            let policy = self.config.policy.policy_for(dest_kind(&msg, dest));
            debug!(peer = %dest, ?policy, "opening connection");
            Connection::open(
                LocalIdent { addr: self.local_addr, entity },
                dest,
                policy,
                self.config.backoff.clone(),
                self.dispatch_tx.clone(),
            )
        });
        conn.send(msg)
    }

    /// Tear down the connection to `peer` immediately, dropping its queue.
    pub async fn mark_down(&self, peer: EntityAddr) {
        if let Some(conn) = self.conns.lock().await.remove(&peer) {
            conn.mark_down().await;
            debug!(peer = %peer, "marked down");
        }
    }

    /// Drain outbound queues (bounded wait per peer), then close everything.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        let conns: Vec<Connection> = {
            let mut map = self.conns.lock().await;
            map.drain().map(|(_, c)| c).collect()
        };
        for conn in &conns {
            let session = conn.session();
            for _ in 0..50 {
                if session.lock().await.unacked() == 0 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            conn.mark_down().await;
        }
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        info!(addr = %self.local_addr, "messenger shut down");
    }
}

/// The destination kind drives the policy; the header's dst is authoritative,
/// falling back to Osd semantics for unnamed peers.
fn dest_kind(msg: &Message, _dest: EntityAddr) -> crate::addr::EntityKind {
    msg.header.dst.kind
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<DispatchEvent>,
    dispatcher: Arc<dyn Dispatcher>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            DispatchEvent::Message(msg) => dispatcher.dispatch(msg),
            DispatchEvent::PeerReset(peer) => dispatcher.peer_reset(peer),
        }
    }
}

async fn accept_loop(msgr: Arc<Messenger>, listener: TcpListener) {
    loop {
        let (stream, sock) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        debug!(peer = %sock, "accepted socket");
        let msgr = msgr.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_accepted(msgr, stream).await {
                debug!(error = %e, "accepted connection ended");
            }
        });
    }
}

/// Accept-side handshake and frame pump. The claimed peer address (with its
/// nonce) keys remote-reset detection: a new nonce for a known peer means the
/// old session is gone.
async fn serve_accepted(msgr: Arc<Messenger>, mut stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let hello_msg = read_frame(&mut stream).await?;
    if hello_msg.msg_type() != MsgType::SessionConnect {
        return Err(MsgrError::InvalidFrame {
            reason: format!("expected connect, got {:?}", hello_msg.msg_type()),
        });
    }
    let hello: ConnectPayload = hello_msg.body()?;

    let entity = msgr.entity().unwrap_or(EntityName::admin(-1));
    let accept = ConnectPayload {
        addr: msgr.local_addr,
        entity,
        connect_seq: hello.connect_seq,
        last_in_seq: 0,
    };
    let mut reply = Message::new(MsgType::SessionAccept, 0, &accept)?;
    reply.header.src = entity;
    reply.header.priority = PRIO_HIGH;
    write_frame(&mut stream, &reply).await?;

    // A reincarnated peer at a known address means its previous session (and
    // anything we had queued on it) is dead: tell the owner.
    {
        let mut conns = msgr.conns.lock().await;
        let prior: Vec<EntityAddr> = conns
            .keys()
            .filter(|a| a.addr == hello.addr.addr && a.nonce != hello.addr.nonce)
            .copied()
            .collect();
        for old in prior {
            if let Some(conn) = conns.remove(&old) {
                conn.mark_down().await;
            }
            warn!(peer = %old, "remote peer reincarnated");
            let _ = msgr.dispatch_tx.send(DispatchEvent::PeerReset(old));
        }
    }

    let state = Arc::new(Mutex::new(SessionState::new()));
    state.lock().await.observe_peer_nonce(hello.addr.nonce);

    // Accepted connections carry their own (currently reply-less) outbound
    // queue; the sender half must outlive the pump or recv() ends the session.
    let (_tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let local = LocalIdent { addr: msgr.local_addr, entity };
    pump(&local, &hello.addr, stream, &state, &mut rx, &msgr.dispatch_tx)
        .await
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MsgType;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        msgs: StdMutex<Vec<Message>>,
        resets: StdMutex<Vec<EntityAddr>>,
        notify: tokio::sync::Notify,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder {
                msgs: StdMutex::new(Vec::new()),
                resets: StdMutex::new(Vec::new()),
                notify: tokio::sync::Notify::new(),
            })
        }
    }

    impl Dispatcher for Recorder {
        fn dispatch(&self, msg: Message) {
            self.msgs.lock().unwrap().push(msg);
            self.notify.notify_waiters();
        }
        fn peer_reset(&self, peer: EntityAddr) {
            self.resets.lock().unwrap().push(peer);
            self.notify.notify_waiters();
        }
    }

    #[tokio::test]
    async fn test_bind_allocates_addr_and_nonce() {
        let msgr = Messenger::bind(MessengerConfig::default(), None).await.unwrap();
        let addr = msgr.local_addr();
        assert_ne!(addr.addr.port(), 0);
        assert_ne!(addr.nonce, 0);
        msgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_requires_entity() {
        let msgr = Messenger::bind(MessengerConfig::default(), None).await.unwrap();
        let msg = Message::from_bytes(MsgType::OsdOp, 1, vec![]);
        let err = msgr.send(msg, msgr.local_addr()).await.unwrap_err();
        assert!(matches!(err, MsgrError::NoEntity));
        msgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_loopback_delivery() {
        let msgr = Messenger::bind(MessengerConfig::default(), None).await.unwrap();
        msgr.register_entity(EntityName::client(1));
        let rec = Recorder::new();
        msgr.start(rec.clone());

        let msg = Message::from_bytes(MsgType::Statfs, 77, b"ping".to_vec());
        msgr.send(msg, msgr.local_addr()).await.unwrap();

        for _ in 0..100 {
            if !rec.msgs.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let msgs = rec.msgs.lock().unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].header.tid, 77);
        assert_eq!(msgs[0].header.src, EntityName::client(1));
        msgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_messengers_exchange_in_order() {
        let a = Messenger::bind(MessengerConfig::default(), None).await.unwrap();
        a.register_entity(EntityName::client(1));
        let a_rec = Recorder::new();
        a.start(a_rec.clone());

        let b = Messenger::bind(MessengerConfig::default(), None).await.unwrap();
        b.register_entity(EntityName::mds(0));
        let b_rec = Recorder::new();
        b.start(b_rec.clone());

        for tid in 1..=8u64 {
            let mut msg = Message::from_bytes(MsgType::ClientRequest, tid, vec![tid as u8]);
            msg.header.dst = EntityName::mds(0);
            a.send(msg, b.local_addr()).await.unwrap();
        }

        for _ in 0..100 {
            if b_rec.msgs.lock().unwrap().len() == 8 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let msgs = b_rec.msgs.lock().unwrap();
        assert_eq!(msgs.len(), 8, "all messages delivered");
        let tids: Vec<u64> = msgs.iter().map(|m| m.header.tid).collect();
        assert_eq!(tids, (1..=8).collect::<Vec<_>>(), "FIFO per peer");
        drop(msgs);
        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_lossy_peer_reports_reset_when_unreachable() {
        let a = Messenger::bind(MessengerConfig::default(), None).await.unwrap();
        a.register_entity(EntityName::client(1));
        let rec = Recorder::new();
        a.start(rec.clone());

        // A dead port with an OSD policy: fast-fail should surface a reset.
        let dead = EntityAddr {
            erank: 0,
            nonce: 9,
            addr: "127.0.0.1:1".parse().unwrap(),
        };
        let mut msg = Message::from_bytes(MsgType::OsdOp, 5, vec![]);
        msg.header.dst = EntityName::osd(0);
        a.send(msg, dead).await.unwrap();

        for _ in 0..100 {
            if !rec.resets.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(rec.resets.lock().unwrap().as_slice(), &[dead]);
        a.shutdown().await;
    }
}
