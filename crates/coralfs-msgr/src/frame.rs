//! Wire framing.
//!
//! Every message travels as a fixed-size little-endian header followed by a
//! bincode payload. The header carries routing (source and destination entity
//! names), the owner's transaction id, the per-connection sequence number, and
//! a CRC32 of the payload.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::addr::{EntityKind, EntityName};
use crate::error::{MsgrError, Result};

/// Frame magic number.
pub const MAGIC: u32 = 0xC04A_1F50;

/// Frame format version.
pub const FRAME_VERSION: u8 = 1;

/// Encoded header size in bytes.
pub const HEADER_SIZE: usize = 52;

/// Largest payload a peer will accept.
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Default message priority.
pub const PRIO_DEFAULT: u16 = 127;

/// Priority for map and session-control traffic.
pub const PRIO_HIGH: u16 = 196;

/// Typed message identifiers. Values are wire protocol constants.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    /// Session handshake: opener announces nonce and connect_seq.
    SessionConnect = 0x0001,
    /// Session handshake acceptance.
    SessionAccept = 0x0002,
    /// Delivery acknowledgement for a peer's sequence numbers.
    SessionAck = 0x0003,
    /// Monitor map (full).
    MonMap = 0x0101,
    /// Request the MDS map at or above a wanted epoch.
    MonGetMdsMap = 0x0102,
    /// Request OSD map incrementals starting at an epoch.
    MonGetOsdMap = 0x0103,
    /// Cluster free-space query.
    Statfs = 0x0104,
    /// Cluster free-space reply.
    StatfsReply = 0x0105,
    /// Pool administration request.
    PoolOp = 0x0106,
    /// Pool administration reply.
    PoolOpReply = 0x0107,
    /// Client unmount notification (monitor acks with the same type).
    ClientUnmount = 0x0108,
    /// MDS map (full or incremental batch).
    MdsMap = 0x0201,
    /// MDS session open/close/renew.
    ClientSession = 0x0202,
    /// Session reestablishment after an MDS restart.
    ClientReconnect = 0x0203,
    /// Metadata request.
    ClientRequest = 0x0204,
    /// Metadata reply.
    ClientReply = 0x0205,
    /// Redirect to another MDS rank.
    ClientRequestForward = 0x0206,
    /// Capability grant/revoke/flush traffic.
    ClientCaps = 0x0207,
    /// Snap realm trace updates.
    ClientSnap = 0x0208,
    /// Inode/dentry lease grant and release.
    ClientLease = 0x0209,
    /// OSD map (full or incremental batch).
    OsdMap = 0x0301,
    /// Object operation.
    OsdOp = 0x0302,
    /// Object operation reply.
    OsdOpReply = 0x0303,
    /// Watch/notify event callback.
    WatchNotify = 0x0304,
}

impl MsgType {
    /// Wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Decode a wire value.
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0001 => Some(MsgType::SessionConnect),
            0x0002 => Some(MsgType::SessionAccept),
            0x0003 => Some(MsgType::SessionAck),
            0x0101 => Some(MsgType::MonMap),
            0x0102 => Some(MsgType::MonGetMdsMap),
            0x0103 => Some(MsgType::MonGetOsdMap),
            0x0104 => Some(MsgType::Statfs),
            0x0105 => Some(MsgType::StatfsReply),
            0x0106 => Some(MsgType::PoolOp),
            0x0107 => Some(MsgType::PoolOpReply),
            0x0108 => Some(MsgType::ClientUnmount),
            0x0201 => Some(MsgType::MdsMap),
            0x0202 => Some(MsgType::ClientSession),
            0x0203 => Some(MsgType::ClientReconnect),
            0x0204 => Some(MsgType::ClientRequest),
            0x0205 => Some(MsgType::ClientReply),
            0x0206 => Some(MsgType::ClientRequestForward),
            0x0207 => Some(MsgType::ClientCaps),
            0x0208 => Some(MsgType::ClientSnap),
            0x0209 => Some(MsgType::ClientLease),
            0x0301 => Some(MsgType::OsdMap),
            0x0302 => Some(MsgType::OsdOp),
            0x0303 => Some(MsgType::OsdOpReply),
            0x0304 => Some(MsgType::WatchNotify),
            _ => None,
        }
    }

    /// True for messenger-internal session control frames, which are not
    /// dispatched to the owner and carry no delivery sequence.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            MsgType::SessionConnect | MsgType::SessionAccept | MsgType::SessionAck
        )
    }
}

/// Fixed message header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message type.
    pub msg_type: MsgType,
    /// Logical sender.
    pub src: EntityName,
    /// Logical recipient.
    pub dst: EntityName,
    /// Owner transaction id; 0 when unused.
    pub tid: u64,
    /// Per-connection delivery sequence, assigned by the messenger.
    pub seq: u64,
    /// Scheduling priority.
    pub priority: u16,
    /// Payload length in bytes.
    pub payload_len: u32,
    /// CRC32 of the payload.
    pub crc: u32,
}

fn put_name(buf: &mut Vec<u8>, name: EntityName) {
    buf.push(name.kind.as_u8());
    buf.extend_from_slice(&name.num.to_le_bytes());
}

fn get_name(buf: &[u8]) -> Result<EntityName> {
    let kind = EntityKind::from_u8(buf[0]).ok_or_else(|| MsgrError::InvalidFrame {
        reason: format!("bad entity kind {}", buf[0]),
    })?;
    let num = i64::from_le_bytes(buf[1..9].try_into().unwrap());
    Ok(EntityName { kind, num })
}

impl MessageHeader {
    /// Encode into the fixed wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.push(FRAME_VERSION);
        buf.push(0); // flags, reserved
        buf.extend_from_slice(&self.msg_type.as_u16().to_le_bytes());
        put_name(&mut buf, self.src);
        put_name(&mut buf, self.dst);
        buf.extend_from_slice(&self.tid.to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.priority.to_le_bytes());
        buf.extend_from_slice(&self.payload_len.to_le_bytes());
        buf.extend_from_slice(&self.crc.to_le_bytes());
        debug_assert_eq!(buf.len(), HEADER_SIZE);
        buf
    }

    /// Decode from the fixed wire layout.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(MsgrError::BadMagic { expected: MAGIC, got: magic });
        }
        if buf[4] != FRAME_VERSION {
            return Err(MsgrError::VersionMismatch { expected: FRAME_VERSION, got: buf[4] });
        }
        let raw_type = u16::from_le_bytes(buf[6..8].try_into().unwrap());
        let msg_type = MsgType::from_u16(raw_type).ok_or(MsgrError::UnknownMessageType(raw_type))?;
        let src = get_name(&buf[8..17])?;
        let dst = get_name(&buf[17..26])?;
        let tid = u64::from_le_bytes(buf[26..34].try_into().unwrap());
        let seq = u64::from_le_bytes(buf[34..42].try_into().unwrap());
        let priority = u16::from_le_bytes(buf[42..44].try_into().unwrap());
        let payload_len = u32::from_le_bytes(buf[44..48].try_into().unwrap());
        let crc = u32::from_le_bytes(buf[48..52].try_into().unwrap());
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(MsgrError::PayloadTooLarge { size: payload_len, max: MAX_PAYLOAD_SIZE });
        }
        Ok(MessageHeader { msg_type, src, dst, tid, seq, priority, payload_len, crc })
    }
}

/// A complete message: header plus opaque payload bytes.
///
/// Payloads are typed by the consumer; the messenger only checks length and
/// checksum. Use [`encode_payload`]/[`decode_payload`] at the edges.
#[derive(Clone, Debug)]
pub struct Message {
    /// Fixed header.
    pub header: MessageHeader,
    /// Bincode-encoded payload.
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a message with a pre-encoded payload.
    pub fn from_bytes(msg_type: MsgType, tid: u64, payload: Vec<u8>) -> Self {
        let crc = crc32fast::hash(&payload);
        Message {
            header: MessageHeader {
                msg_type,
                src: EntityName::client(-1),
                dst: EntityName::client(-1),
                tid,
                seq: 0,
                priority: PRIO_DEFAULT,
                payload_len: payload.len() as u32,
                crc,
            },
            payload,
        }
    }

    /// Build a message by bincode-encoding `body`.
    pub fn new<T: Serialize>(msg_type: MsgType, tid: u64, body: &T) -> Result<Self> {
        Ok(Message::from_bytes(msg_type, tid, encode_payload(body)?))
    }

    /// Message type shorthand.
    pub fn msg_type(&self) -> MsgType {
        self.header.msg_type
    }

    /// Decode the payload as `T`.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        decode_payload(&self.payload)
    }

    /// Verify the payload checksum against the header.
    pub fn verify_crc(&self) -> Result<()> {
        let computed = crc32fast::hash(&self.payload);
        if computed != self.header.crc {
            return Err(MsgrError::ChecksumMismatch { expected: self.header.crc, computed });
        }
        Ok(())
    }
}

/// Serialize a payload body with bincode (little-endian, fixed layout).
pub fn encode_payload<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    bincode::serialize(body).map_err(|e| MsgrError::Serialization(e.to_string()))
}

/// Deserialize a payload body with bincode.
pub fn decode_payload<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| MsgrError::Serialization(e.to_string()))
}
