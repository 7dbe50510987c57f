//! The outbound seam between client components and the messenger.
//!
//! Components address peers and fire messages without blocking on delivery;
//! failures come back through the dispatcher's reset path. Tests substitute a
//! recording sink.

use std::sync::Arc;

use coralfs_msgr::{EntityAddr, Message, Messenger};
use tracing::warn;

/// Fire-and-forget message submission.
pub trait MessageSink: Send + Sync {
    /// Queue `msg` toward `to`.
    fn send(&self, msg: Message, to: EntityAddr);
}

/// The production sink: hands messages to the messenger on a task so callers
/// never block on connection setup.
pub struct MessengerSink {
    msgr: Arc<Messenger>,
}

impl MessengerSink {
    /// Wrap a messenger.
    pub fn new(msgr: Arc<Messenger>) -> Arc<Self> {
        Arc::new(MessengerSink { msgr })
    }
}

impl MessageSink for MessengerSink {
    fn send(&self, msg: Message, to: EntityAddr) {
        let msgr = self.msgr.clone();
        tokio::spawn(async move {
            if let Err(e) = msgr.send(msg, to).await {
                warn!(peer = %to, error = %e, "send failed");
            }
        });
    }
}
