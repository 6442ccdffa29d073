//! Task liveness monitoring.
//!
//! Models the distinction the protocol relies on between *linked* and
//! *monitored* peers: a [`LivenessGuard`] is held by the running task and
//! dropped on any exit, return or panic alike; every [`Monitor`] clone
//! observes that drop as a discrete down event. Monitoring a task never
//! affects its lifetime.

use tokio::sync::watch;

/// Create a guard/monitor pair for one task.
#[must_use]
pub fn monitor() -> (LivenessGuard, Monitor) {
    let (tx, rx) = watch::channel(());
    (LivenessGuard { _tx: tx }, Monitor { rx })
}

/// Held by the monitored task; dropping it marks the task down.
#[derive(Debug)]
pub struct LivenessGuard {
    _tx: watch::Sender<()>,
}

/// Observes the liveness of one task.
#[derive(Debug, Clone)]
pub struct Monitor {
    rx: watch::Receiver<()>,
}

impl Monitor {
    /// Resolves once the monitored task is down. Idempotent: resolves
    /// immediately for a task that is already down.
    pub async fn down(&mut self) {
        while self.rx.changed().await.is_ok() {}
    }

    /// Whether the task is already down, e.g. it was never started.
    #[must_use]
    pub fn is_down(&self) -> bool {
        self.rx.has_changed().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_drop_resolves_monitor() {
        let (guard, mut mon) = monitor();
        assert!(!mon.is_down());

        drop(guard);
        mon.down().await;
        assert!(mon.is_down());

        // resolving again is fine
        mon.down().await;
    }

    #[tokio::test]
    async fn clones_observe_the_same_task() {
        let (guard, mon) = monitor();
        let mut a = mon.clone();
        let mut b = mon;

        drop(guard);
        a.down().await;
        b.down().await;
    }
}
