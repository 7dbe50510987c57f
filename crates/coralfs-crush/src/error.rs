use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CrushError {
    #[error("no rule at id {ruleno}")]
    RuleNotFound { ruleno: usize },

    #[error("forced device {device} does not exist in the hierarchy")]
    BadForceTarget { device: i32 },

    #[error("malformed map: {reason}")]
    BadMap { reason: String },
}

pub type Result<T> = std::result::Result<T, CrushError>;
