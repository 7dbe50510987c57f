//! Per-peer failure policy.
//!
//! What happens to queued and in-flight messages when a connection drops is a
//! property of the *remote entity's role*, not of the individual connection. A
//! client talking to a monitor or MDS wants transparent reconnect and replay;
//! a client talking to an OSD wants fast failure so the objecter can re-target
//! by the current map instead.

use std::time::Duration;

use crate::addr::EntityKind;

/// Failure semantics toward one peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Policy {
    /// Reconnect automatically, replay unacked messages in order, and never
    /// report a reset to the owner short of shutdown.
    Lossless,
    /// Drop the queue on disconnect and report a reset; do not re-dial until
    /// the owner sends again.
    LossyFastFail,
    /// Lossless delivery with unbounded backoff between attempts.
    RetryForever,
}

impl Policy {
    /// Whether unacked messages are replayed after reconnect.
    pub fn replays(self) -> bool {
        !matches!(self, Policy::LossyFastFail)
    }

    /// Whether the owner sees a reset callback on disconnect.
    pub fn reports_reset(self) -> bool {
        matches!(self, Policy::LossyFastFail)
    }

    /// Maximum reconnect attempts before giving up; `None` is unbounded.
    /// Both lossless flavors reconnect forever: a reset is never reported
    /// to the owner short of shutdown.
    pub fn max_attempts(self) -> Option<u32> {
        match self {
            Policy::Lossless => None,
            Policy::LossyFastFail => Some(0),
            Policy::RetryForever => None,
        }
    }
}

/// Policy table keyed by remote entity kind.
#[derive(Clone, Debug)]
pub struct PolicyTable {
    mon: Policy,
    mds: Policy,
    osd: Policy,
    client: Policy,
    admin: Policy,
}

impl PolicyTable {
    /// The table a client-side messenger uses.
    pub fn client_default() -> Self {
        PolicyTable {
            mon: Policy::RetryForever,
            mds: Policy::Lossless,
            osd: Policy::LossyFastFail,
            client: Policy::LossyFastFail,
            admin: Policy::LossyFastFail,
        }
    }

    /// Look up the policy for a peer kind.
    pub fn policy_for(&self, kind: EntityKind) -> Policy {
        match kind {
            EntityKind::Mon => self.mon,
            EntityKind::Mds => self.mds,
            EntityKind::Osd => self.osd,
            EntityKind::Client => self.client,
            EntityKind::Admin => self.admin,
        }
    }

    /// Override the policy for one peer kind.
    pub fn set(&mut self, kind: EntityKind, policy: Policy) {
        match kind {
            EntityKind::Mon => self.mon = policy,
            EntityKind::Mds => self.mds = policy,
            EntityKind::Osd => self.osd = policy,
            EntityKind::Client => self.client = policy,
            EntityKind::Admin => self.admin = policy,
        }
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::client_default()
    }
}

/// Reconnect backoff schedule.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// First delay.
    pub initial: Duration,
    /// Ceiling.
    pub max: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(15),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = self.initial.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis((ms as u64).min(self.max.as_millis() as u64).max(1))
    }
}
