//! Wanted-epoch registration: consumers park until a map at or above their
//! wanted epoch is installed.

use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;

/// Tracks the newest installed epoch for one map kind and wakes waiters when
/// it advances. Observed epochs never decrease.
pub struct EpochWatch {
    inner: Mutex<Inner>,
}

struct Inner {
    current: u32,
    waiters: Vec<(u32, oneshot::Sender<u32>)>,
}

impl EpochWatch {
    /// Start at `epoch`.
    pub fn new(epoch: u32) -> Self {
        EpochWatch {
            inner: Mutex::new(Inner { current: epoch, waiters: Vec::new() }),
        }
    }

    /// Newest installed epoch.
    pub fn current(&self) -> u32 {
        self.inner.lock().unwrap().current
    }

    /// Record an installed map. Stale installs are ignored; new ones wake
    /// every waiter whose wanted epoch is now satisfied.
    pub fn installed(&self, epoch: u32) {
        let mut inner = self.inner.lock().unwrap();
        if epoch <= inner.current {
            return;
        }
        inner.current = epoch;
        let mut still_waiting = Vec::new();
        for (wanted, tx) in inner.waiters.drain(..) {
            if wanted <= epoch {
                let _ = tx.send(epoch);
            } else {
                still_waiting.push((wanted, tx));
            }
        }
        inner.waiters = still_waiting;
        debug!(epoch, "map installed, waiters woken");
    }

    /// Wait until a map with epoch >= `wanted` is installed. Resolves
    /// immediately if one already is.
    pub async fn wait_for(&self, wanted: u32) -> u32 {
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.current >= wanted {
                return inner.current;
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push((wanted, tx));
            rx
        };
        rx.await.unwrap_or(wanted)
    }

    /// Number of parked waiters.
    pub fn waiting(&self) -> usize {
        self.inner.lock().unwrap().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_satisfied_immediately() {
        let w = EpochWatch::new(10);
        assert_eq!(w.wait_for(5).await, 10);
        assert_eq!(w.wait_for(10).await, 10);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_install() {
        let w = Arc::new(EpochWatch::new(1));
        let waiter = {
            let w = w.clone();
            tokio::spawn(async move { w.wait_for(3).await })
        };
        // Let the waiter park.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(w.waiting(), 1);
        w.installed(2);
        assert_eq!(w.waiting(), 1, "epoch 2 does not satisfy wanted 3");
        w.installed(3);
        assert_eq!(waiter.await.unwrap(), 3);
        assert_eq!(w.waiting(), 0);
    }

    #[tokio::test]
    async fn test_installed_never_regresses() {
        let w = EpochWatch::new(5);
        w.installed(4);
        assert_eq!(w.current(), 5);
        w.installed(9);
        assert_eq!(w.current(), 9);
    }
}
