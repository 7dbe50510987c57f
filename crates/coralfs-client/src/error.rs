use thiserror::Error;

/// Client-visible failures. Kinds that cross the wire carry errno-compatible
/// numeric codes; the assignments are protocol constants.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    Exists,

    #[error("version assertion failed (server at {server_version})")]
    BadVersion { server_version: u64 },

    #[error("write to a read-only snapshot")]
    InvalidSnap,

    #[error("offset or length outside allowed extent")]
    Range,

    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("cluster is full")]
    Full,

    #[error("out of memory")]
    NoMem,

    #[error("corrupt message: {reason}")]
    Corrupt { reason: String },

    #[error("session lost and not recoverable")]
    Disconnected,

    #[error("request forwarded too many times ({forwards})")]
    TooManyForwards { forwards: u32 },

    #[error("pool {name} does not exist")]
    PoolNotFound { name: String },

    #[error("no monitors configured")]
    NoMonitors,

    #[error("operation was cancelled")]
    Abandoned,

    #[error("server error {code}")]
    Server { code: i32 },

    #[error(transparent)]
    Map(#[from] coralfs_maps::MapError),

    #[error(transparent)]
    Msgr(#[from] coralfs_msgr::MsgrError),
}

impl ClientError {
    /// Wire errno for this error (negative, errno family).
    pub fn errno(&self) -> i32 {
        match self {
            ClientError::NotFound => -2,
            ClientError::NoMem => -12,
            ClientError::Exists => -17,
            ClientError::Full => -28,
            ClientError::InvalidSnap => -30,
            ClientError::Range => -34,
            ClientError::BadVersion { .. } => -75,
            ClientError::Disconnected => -108,
            ClientError::Timeout { .. } => -110,
            ClientError::Corrupt { .. } => -5,
            ClientError::Server { code } => *code,
            _ => -5,
        }
    }

    /// Map a wire errno onto an error kind. Zero and positive values are not
    /// errors and must be handled by the caller first.
    pub fn from_errno(code: i32) -> ClientError {
        match code {
            -2 => ClientError::NotFound,
            -12 => ClientError::NoMem,
            -17 => ClientError::Exists,
            -28 => ClientError::Full,
            -30 => ClientError::InvalidSnap,
            -34 => ClientError::Range,
            -75 => ClientError::BadVersion { server_version: 0 },
            -108 => ClientError::Disconnected,
            -110 => ClientError::Timeout { seconds: 0 },
            -5 => ClientError::Corrupt { reason: "remote decode failure".into() },
            other => ClientError::Server { code: other },
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
