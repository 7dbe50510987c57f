//! CoralFS placement engine.
//!
//! A deterministic pseudo-random function mapping an input value onto an
//! ordered set of storage devices across a weighted hierarchy of failure
//! domains, with minimal remapping when the hierarchy changes. The mapping is
//! part of the wire protocol: every participant computes placement locally
//! and must agree bit-for-bit.

pub mod error;
pub mod hash;
pub mod map;
pub mod mapper;

pub use error::{CrushError, Result};
pub use map::{Bucket, BucketAlg, BucketData, CrushMap, Rule, RuleMask, RuleStep, WEIGHT_ONE};
pub use mapper::is_out;
