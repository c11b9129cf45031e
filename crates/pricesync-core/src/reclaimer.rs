//! Periodic sweep that fails locks abandoned in `processing` by a crashed run.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::Result;
use crate::lock::LockManager;

#[derive(Clone)]
pub struct StaleLockReclaimer {
    locks: LockManager,
    threshold: Duration,
}

impl StaleLockReclaimer {
    pub fn new(locks: LockManager, threshold: Duration) -> Self {
        Self { locks, threshold }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// One sweep with an explicit threshold. Returns the number of locks failed.
    pub async fn sweep(&self, threshold: Duration) -> Result<usize> {
        let count = self.locks.reclaim_stale(threshold).await?;
        if count > 0 {
            info!(count, threshold_secs = threshold.as_secs(), "stale locks reclaimed");
        }
        Ok(count)
    }

    /// Sweep every `interval` with the configured threshold until the task is
    /// aborted. Sweep errors are logged and the loop continues.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep(self.threshold).await {
                    error!(error = %e, "stale lock sweep failed");
                }
            }
        })
    }
}
