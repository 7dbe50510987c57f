#![warn(missing_docs)]

//! CoralFS messenger: reliable, ordered, session-aware transport between
//! cluster entities.
//!
//! This crate provides:
//! - Entity naming and addressing primitives shared by the whole stack
//! - A length-prefixed little-endian wire format with typed messages
//! - Per-peer connections with sequence tracking, replay, and reset detection
//! - A policy table controlling failure semantics per remote entity kind

pub mod addr;
pub mod connection;
pub mod error;
pub mod frame;
pub mod messenger;
pub mod policy;

pub use addr::{EntityAddr, EntityKind, EntityName, Fsid};
pub use connection::{ConnState, DispatchEvent, Incoming, SessionState};
pub use error::{MsgrError, Result};
pub use frame::{decode_payload, encode_payload, Message, MessageHeader, MsgType};
pub use messenger::{Dispatcher, Messenger, MessengerConfig};
pub use policy::{BackoffConfig, Policy, PolicyTable};
