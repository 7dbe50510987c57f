use thiserror::Error;

#[derive(Debug, Error)]
pub enum MsgrError {
    #[error("connect timeout after {timeout_ms}ms to {addr}")]
    ConnectTimeout { addr: String, timeout_ms: u64 },

    #[error("connection to {addr} was reset")]
    ConnectionReset { addr: String },

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("bad magic: expected 0x{expected:08X}, got 0x{got:08X}")]
    BadMagic { expected: u32, got: u32 },

    #[error("frame version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("payload checksum mismatch: header 0x{expected:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u32, max: u32 },

    #[error("unknown message type 0x{0:04X}")]
    UnknownMessageType(u16),

    #[error("messenger is not bound to a local address")]
    NotBound,

    #[error("no entity registered with this messenger")]
    NoEntity,

    #[error("messenger is shut down")]
    Shutdown,

    #[error("payload encode/decode failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MsgrError>;
