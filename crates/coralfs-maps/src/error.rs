use thiserror::Error;

#[derive(Debug, Error)]
pub enum MapError {
    #[error("incremental for epoch {incr} does not follow current epoch {have}")]
    BadEpoch { have: u32, incr: u32 },

    #[error("map decode failed: {reason}")]
    Corrupt { reason: String },

    #[error("fsid mismatch: map {map}, cluster {cluster}")]
    FsidMismatch { map: String, cluster: String },

    #[error("unsupported map encoding version {got} (max {supported})")]
    BadVersion { got: u8, supported: u8 },

    #[error("pool {pool} is not in the map")]
    UnknownPool { pool: u32 },

    #[error(transparent)]
    Placement(#[from] coralfs_crush::CrushError),
}

pub type Result<T> = std::result::Result<T, MapError>;
