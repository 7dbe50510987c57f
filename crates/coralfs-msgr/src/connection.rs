//! Per-peer connection state and the socket driver.
//!
//! The session bookkeeping (sequence numbers, replay queue, reset detection)
//! is kept in a plain struct so it can be exercised without sockets; the async
//! driver owns the TCP stream and applies the peer's policy when the stream
//! fails.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::addr::{EntityAddr, EntityName};
use crate::error::{MsgrError, Result};
use crate::frame::{Message, MessageHeader, MsgType, HEADER_SIZE, MAX_PAYLOAD_SIZE, PRIO_HIGH};
use crate::policy::{BackoffConfig, Policy};

/// Connection lifecycle states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Dialing or handshaking.
    Opening,
    /// Session established, traffic flowing.
    Open,
    /// Idle with no socket; session state retained for resume.
    Standby,
    /// Shutdown requested, draining.
    Closing,
    /// Terminal.
    Closed,
}

/// Events handed to the messenger's dispatch loop.
#[derive(Debug)]
pub enum DispatchEvent {
    /// A message arrived from a peer.
    Message(Message),
    /// The session to this peer was lost under a reset-reporting policy, or
    /// the peer told us it lost our session state.
    PeerReset(EntityAddr),
}

/// Handshake body sent as the first frame on every new socket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectPayload {
    /// Opener's address, including its incarnation nonce.
    pub addr: EntityAddr,
    /// Opener's logical name.
    pub entity: EntityName,
    /// Number of sessions the opener believes it has established with us.
    pub connect_seq: u32,
    /// Highest delivery seq the opener has seen from us, for replay trim.
    pub last_in_seq: u64,
}

/// What to do with a received data frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Incoming {
    /// New message, deliver to the owner.
    Deliver,
    /// Already delivered in this session, drop silently.
    Duplicate,
}

/// Sequence and replay bookkeeping for one peer session.
///
/// All methods are synchronous; the driver calls them under its own lock.
#[derive(Debug)]
pub struct SessionState {
    /// Lifecycle state.
    pub state: ConnState,
    /// Last sequence assigned to an outgoing data frame.
    pub out_seq: u64,
    /// Last sequence delivered from the peer.
    pub in_seq: u64,
    /// Outgoing seq the peer has acknowledged through.
    pub acked_seq: u64,
    /// Sessions successfully established with this peer.
    pub connect_seq: u32,
    /// Peer incarnation nonce last seen; zero before first contact.
    pub peer_nonce: u32,
    /// Sent but unacknowledged messages, oldest first.
    sent: VecDeque<Message>,
}

impl SessionState {
    /// Fresh session toward a peer.
    pub fn new() -> Self {
        SessionState {
            state: ConnState::Opening,
            out_seq: 0,
            in_seq: 0,
            acked_seq: 0,
            connect_seq: 0,
            peer_nonce: 0,
            sent: VecDeque::new(),
        }
    }

    /// Assign the next outgoing sequence to `msg` and retain it for replay.
    pub fn stamp_outgoing(&mut self, mut msg: Message) -> Message {
        self.out_seq += 1;
        msg.header.seq = self.out_seq;
        self.sent.push_back(msg.clone());
        msg
    }

    /// Peer acknowledged everything through `seq`; drop it from the replay
    /// queue.
    pub fn record_ack(&mut self, seq: u64) {
        if seq > self.acked_seq {
            self.acked_seq = seq;
        }
        while let Some(front) = self.sent.front() {
            if front.header.seq <= seq {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Classify a received data frame by its sequence number.
    pub fn accept_incoming(&mut self, seq: u64) -> Incoming {
        if seq <= self.in_seq {
            return Incoming::Duplicate;
        }
        self.in_seq = seq;
        Incoming::Deliver
    }

    /// Messages to resend after a reconnect, trimmed to what the peer has
    /// not seen (`peer_last_in` comes from its handshake).
    pub fn replay_from(&mut self, peer_last_in: u64) -> Vec<Message> {
        self.record_ack(peer_last_in);
        self.sent.iter().cloned().collect()
    }

    /// Note the peer incarnation seen during a handshake. Returns true if
    /// this is a *different* incarnation than the session was built with,
    /// i.e. the remote has lost our session state.
    pub fn observe_peer_nonce(&mut self, nonce: u32) -> bool {
        let reset = self.peer_nonce != 0 && self.peer_nonce != nonce;
        self.peer_nonce = nonce;
        if reset {
            self.in_seq = 0;
        }
        reset
    }

    /// Drop all queued state (lossy reset or shutdown).
    pub fn discard_queue(&mut self) -> usize {
        let n = self.sent.len();
        self.sent.clear();
        n
    }

    /// Number of unacknowledged messages.
    pub fn unacked(&self) -> usize {
        self.sent.len()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(w: &mut W, msg: &Message) -> Result<()> {
    w.write_all(&msg.header.encode()).await?;
    w.write_all(&msg.payload).await?;
    w.flush().await?;
    Ok(())
}

/// Read one frame from the stream, verifying length and checksum.
pub async fn read_frame<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Message> {
    let mut hbuf = [0u8; HEADER_SIZE];
    r.read_exact(&mut hbuf).await?;
    let header = MessageHeader::decode(&hbuf)?;
    if header.payload_len > MAX_PAYLOAD_SIZE {
        return Err(MsgrError::PayloadTooLarge { size: header.payload_len, max: MAX_PAYLOAD_SIZE });
    }
    let mut payload = vec![0u8; header.payload_len as usize];
    r.read_exact(&mut payload).await?;
    let msg = Message { header, payload };
    msg.verify_crc()?;
    Ok(msg)
}

/// Identity of the local messenger, shared by all connections.
#[derive(Clone, Debug)]
pub struct LocalIdent {
    /// Our bound address (with nonce).
    pub addr: EntityAddr,
    /// Our registered entity name.
    pub entity: EntityName,
}

/// Handle for one outgoing peer connection.
///
/// Messages go through an unbounded queue to the driver task; the driver
/// applies policy on socket failure.
pub struct Connection {
    /// Address of the peer this connection serves.
    pub peer: EntityAddr,
    tx: mpsc::UnboundedSender<Message>,
    state: Arc<Mutex<SessionState>>,
    driver: tokio::task::JoinHandle<()>,
}

impl Connection {
    /// Open a connection toward `peer` and spawn its driver.
    pub fn open(
        local: LocalIdent,
        peer: EntityAddr,
        policy: Policy,
        backoff: BackoffConfig,
        dispatch: mpsc::UnboundedSender<DispatchEvent>,
    ) -> Connection {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(SessionState::new()));
        let driver_state = state.clone();
        let driver = tokio::spawn(async move {
            drive(local, peer, policy, backoff, driver_state, rx, dispatch).await;
        });
        Connection { peer, tx, state, driver }
    }

    /// Queue a message for delivery. Fails only after the driver has exited.
    pub fn send(&self, msg: Message) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| MsgrError::ConnectionReset { addr: self.peer.to_string() })
    }

    /// True once the driver has given up (lossy reset or shutdown).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Session state, for inspection.
    pub fn session(&self) -> Arc<Mutex<SessionState>> {
        self.state.clone()
    }

    /// Abort the driver and discard queued messages.
    pub async fn mark_down(&self) {
        self.driver.abort();
        let mut st = self.state.lock().await;
        let dropped = st.discard_queue();
        st.state = ConnState::Closed;
        if dropped > 0 {
            debug!(peer = %self.peer, dropped, "mark_down dropped queued messages");
        }
    }
}

/// Connection driver: dial, handshake, replay, then pump frames until the
/// socket fails; policy decides whether to retry or report a reset.
async fn drive(
    local: LocalIdent,
    peer: EntityAddr,
    policy: Policy,
    backoff: BackoffConfig,
    state: Arc<Mutex<SessionState>>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    dispatch: mpsc::UnboundedSender<DispatchEvent>,
) {
    let mut attempt: u32 = 0;
    loop {
        match establish(&local, &peer, &state).await {
            Ok(stream) => {
                attempt = 0;
                {
                    let mut st = state.lock().await;
                    st.state = ConnState::Open;
                    st.connect_seq += 1;
                }
                let res = pump(&local, &peer, stream, &state, &mut rx, &dispatch).await;
                {
                    let mut st = state.lock().await;
                    st.state = ConnState::Standby;
                }
                match res {
                    Ok(PumpEnd::LocalClosed) => {
                        state.lock().await.state = ConnState::Closed;
                        return;
                    }
                    Ok(PumpEnd::PeerClosed) => {}
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "connection pump ended");
                    }
                }
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, attempt, "connect failed");
            }
        }

        if !policy.replays() {
            let mut st = state.lock().await;
            let dropped = st.discard_queue();
            st.state = ConnState::Closed;
            warn!(peer = %peer, dropped, "lossy connection reset, notifying owner");
            let _ = dispatch.send(DispatchEvent::PeerReset(peer));
            return;
        }

        if let Some(max) = policy.max_attempts() {
            if attempt >= max {
                warn!(peer = %peer, attempt, "reconnect attempts exhausted");
                let _ = dispatch.send(DispatchEvent::PeerReset(peer));
                state.lock().await.state = ConnState::Closed;
                return;
            }
        }
        tokio::time::sleep(backoff.delay_for(attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}

/// Dial and run the handshake: send our ConnectPayload, read the accept,
/// detect a remote reset via the peer's nonce.
async fn establish(
    local: &LocalIdent,
    peer: &EntityAddr,
    state: &Arc<Mutex<SessionState>>,
) -> Result<TcpStream> {
    let timeout = std::time::Duration::from_secs(5);
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(peer.addr))
        .await
        .map_err(|_| MsgrError::ConnectTimeout { addr: peer.to_string(), timeout_ms: 5000 })??;
    stream.set_nodelay(true)?;

    let (connect_seq, last_in) = {
        let st = state.lock().await;
        (st.connect_seq, st.in_seq)
    };
    let hello = ConnectPayload {
        addr: local.addr,
        entity: local.entity,
        connect_seq,
        last_in_seq: last_in,
    };
    let mut msg = Message::new(MsgType::SessionConnect, 0, &hello)?;
    msg.header.src = local.entity;
    msg.header.priority = PRIO_HIGH;
    write_frame(&mut stream, &msg).await?;

    let reply = read_frame(&mut stream).await?;
    if reply.msg_type() != MsgType::SessionAccept {
        return Err(MsgrError::InvalidFrame {
            reason: format!("expected accept, got {:?}", reply.msg_type()),
        });
    }
    let accept: ConnectPayload = reply.body()?;
    let mut st = state.lock().await;
    if st.observe_peer_nonce(accept.addr.nonce) {
        debug!(peer = %peer, "peer reincarnated, session state reset");
    }
    Ok(stream)
}

/// Outcome of a [`pump`] run that ended without a stream error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PumpEnd {
    /// Our side is done with this connection (queue or dispatch gone).
    LocalClosed,
    /// The peer closed or broke the stream in a way already handled.
    PeerClosed,
}

/// Steady-state loop: replay unacked, then interleave outgoing queue and
/// incoming frames. Returns when the socket errors.
pub(crate) async fn pump(
    local: &LocalIdent,
    peer: &EntityAddr,
    stream: TcpStream,
    state: &Arc<Mutex<SessionState>>,
    rx: &mut mpsc::UnboundedReceiver<Message>,
    dispatch: &mpsc::UnboundedSender<DispatchEvent>,
) -> Result<PumpEnd> {
    let (mut rhalf, mut whalf) = stream.into_split();

    // Replay whatever the peer has not acknowledged, in order.
    let replay = {
        let mut st = state.lock().await;
        let last_in = st.acked_seq;
        st.replay_from(last_in)
    };
    for msg in &replay {
        write_frame(&mut whalf, msg).await?;
    }
    if !replay.is_empty() {
        debug!(peer = %peer, n = replay.len(), "replayed unacked messages");
    }

    // Reads run in their own task: a partially read frame must never be
    // dropped by select cancellation. Acks are routed back to the writer.
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<u64>();
    let reader_state = state.clone();
    let reader_dispatch = dispatch.clone();
    let peer_str = peer.to_string();
    let mut reader = tokio::spawn(async move {
        loop {
            let msg = read_frame(&mut rhalf).await?;
            match msg.msg_type() {
                MsgType::SessionAck => {
                    reader_state.lock().await.record_ack(msg.header.tid);
                }
                t if t.is_control() => {
                    // Handshake frames mid-session mean the peer restarted
                    // its side; surface as a stream error to re-establish.
                    return Err(MsgrError::ConnectionReset { addr: peer_str });
                }
                _ => {
                    let disposition = {
                        let mut st = reader_state.lock().await;
                        st.accept_incoming(msg.header.seq)
                    };
                    if disposition == Incoming::Deliver {
                        if ack_tx.send(msg.header.seq).is_err() {
                            return Ok(());
                        }
                        if reader_dispatch.send(DispatchEvent::Message(msg)).is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    });

    let result = loop {
        tokio::select! {
            joined = &mut reader => {
                let inner = joined.unwrap_or(Ok(()));
                break inner.map(|()| PumpEnd::PeerClosed);
            }
            acked = ack_rx.recv() => {
                let Some(seq) = acked else { break Ok(PumpEnd::PeerClosed) };
                let ack = Message::from_bytes(MsgType::SessionAck, seq, Vec::new());
                if let Err(e) = write_frame(&mut whalf, &ack).await {
                    break Err(e);
                }
            }
            queued = rx.recv() => {
                let Some(mut msg) = queued else {
                    break Ok(PumpEnd::LocalClosed);  // messenger dropped us
                };
                msg.header.src = local.entity;
                let stamped = {
                    let mut st = state.lock().await;
                    st.stamp_outgoing(msg)
                };
                if let Err(e) = write_frame(&mut whalf, &stamped).await {
                    break Err(e);
                }
            }
        }
    };
    reader.abort();
    result
}
