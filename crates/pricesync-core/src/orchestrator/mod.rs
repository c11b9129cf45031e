//! Sync orchestrator: the per-line state machine.
//!
//! ```text
//! Idle ──► LockPending ──► Running ──► Finalizing ──► Idle
//!              │                           ▲
//!              └──── contention ───────────┘ (no lock taken, nothing released)
//! ```
//!
//! A run holds the line's lock for its whole duration and always gives it
//! back in `Finalizing`, whether the batch completed, failed before it
//! started, or panicked. A panic mid-batch keeps the counts of the items
//! already written. Items are processed sequentially with a fixed
//! delay; a failing item never aborts the batch.

mod request;
mod result;

pub use request::{new_correlation_id, LineIdentifier, SyncRequest, WebhookNotification};
pub use result::{RunOutcome, SyncRunResult};

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::catalog;
use crate::config::SyncConfig;
use crate::db::Db;
use crate::error::{Result, SyncError};
use crate::lock::LockManager;
use crate::notify::{notify_run, Notifier};
use crate::reconcile::ItemReconciler;
use crate::remote::{CatalogFetcher, FetchOutcome};
use crate::types::{CatalogItem, LockKey};

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    LockPending,
    Running,
    Finalizing,
}

/// An in-flight run as seen by diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPhaseEntry {
    pub correlation_id: String,
    pub line_id: i64,
    pub phase: RunPhase,
    pub since: DateTime<Utc>,
}

type PhaseTable = Arc<Mutex<HashMap<String, RunPhaseEntry>>>;

/// Tracks one run's phase; the entry disappears (back to `Idle`) on drop,
/// including during unwinding.
struct PhaseGuard {
    table: PhaseTable,
    correlation_id: String,
}

impl PhaseGuard {
    fn enter(table: PhaseTable, req: &SyncRequest) -> Self {
        let guard = Self {
            table,
            correlation_id: req.correlation_id.clone(),
        };
        if let Ok(mut t) = guard.table.lock() {
            t.insert(
                req.correlation_id.clone(),
                RunPhaseEntry {
                    correlation_id: req.correlation_id.clone(),
                    line_id: req.line_id,
                    phase: RunPhase::LockPending,
                    since: Utc::now(),
                },
            );
        }
        guard
    }

    fn set(&self, phase: RunPhase) {
        if let Ok(mut t) = self.table.lock() {
            if let Some(entry) = t.get_mut(&self.correlation_id) {
                entry.phase = phase;
                entry.since = Utc::now();
            }
        }
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        if let Ok(mut t) = self.table.lock() {
            t.remove(&self.correlation_id);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// SyncOrchestrator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SyncOrchestrator {
    db: Db,
    locks: LockManager,
    fetcher: CatalogFetcher,
    reconciler: ItemReconciler,
    notifier: Arc<dyn Notifier>,
    settings: SyncConfig,
    phases: PhaseTable,
}

impl SyncOrchestrator {
    pub fn new(
        db: Db,
        locks: LockManager,
        fetcher: CatalogFetcher,
        reconciler: ItemReconciler,
        notifier: Arc<dyn Notifier>,
        settings: SyncConfig,
    ) -> Self {
        Self {
            db,
            locks,
            fetcher,
            reconciler,
            notifier,
            settings,
            phases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &SyncConfig {
        &self.settings
    }

    /// Runs currently past `Idle`, oldest first.
    pub fn phases(&self) -> Vec<RunPhaseEntry> {
        let mut entries: Vec<_> = self
            .phases
            .lock()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.since.cmp(&b.since));
        entries
    }

    /// Phase of the most advanced run for `line_id` in this process.
    pub fn phase_of(&self, line_id: i64) -> RunPhase {
        self.phases()
            .into_iter()
            .filter(|e| e.line_id == line_id)
            .map(|e| e.phase)
            .max_by_key(|p| match p {
                RunPhase::Idle => 0,
                RunPhase::LockPending => 1,
                RunPhase::Running => 2,
                RunPhase::Finalizing => 3,
            })
            .unwrap_or(RunPhase::Idle)
    }

    /// Start a run on the runtime and return immediately.
    pub fn spawn_run(&self, req: SyncRequest) -> JoinHandle<SyncRunResult> {
        let this = self.clone();
        tokio::spawn(async move { this.run(req).await })
    }

    /// Execute one run to completion. Never fails: every outcome, including
    /// contention and fatal errors, is described by the returned result.
    pub async fn run(&self, req: SyncRequest) -> SyncRunResult {
        let span = tracing::info_span!(
            "sync_run",
            line = req.line_id,
            correlation_id = %req.correlation_id
        );
        self.run_inner(req).instrument(span).await
    }

    async fn run_inner(&self, req: SyncRequest) -> SyncRunResult {
        let started = Instant::now();
        let mut result = SyncRunResult::new(&req.correlation_id, req.line_id, Utc::now());
        let phase = PhaseGuard::enter(self.phases.clone(), &req);

        let key = LockKey::pricing(req.line_id);
        let token = Uuid::new_v4().to_string();
        match self.locks.try_acquire(&key, &token, self.settings.lock_ttl()).await {
            Ok(true) => debug!(lock = %key, "lock acquired"),
            Ok(false) => {
                info!(lock = %key, event = %req.event_kind, "line already syncing; run skipped");
                let mut result =
                    SyncRunResult::contention(&req.correlation_id, req.line_id, result.started_at);
                result.finish(started.elapsed());
                return result;
            }
            Err(e) => {
                // No lock was taken, so there is nothing to release.
                error!(lock = %key, error = %e, "lock acquisition failed");
                let mut result = result.into_fatal(format!("lock acquisition failed: {e}"));
                result.finish(started.elapsed());
                notify_run(self.notifier.as_ref(), &result).await;
                return result;
            }
        }

        phase.set(RunPhase::Running);
        let processed = AssertUnwindSafe(self.process(&req, &mut result))
            .catch_unwind()
            .await;

        phase.set(RunPhase::Finalizing);
        let released = match processed {
            Ok(Ok(())) => self.locks.release(&key, &token).await,
            Ok(Err(e)) => {
                error!(error = %e, "run aborted before processing the batch");
                let message = e.to_string();
                result = result.into_fatal(message.clone());
                self.locks.release_with_error(&key, &token, &message).await
            }
            Err(panic) => {
                let message = format!("run panicked: {}", panic_message(panic.as_ref()));
                error!(error = %message, attempted = result.attempted, "run aborted");
                if result.attempted == 0 {
                    result = result.into_fatal(message.clone());
                } else {
                    result.interrupt(message.clone());
                }
                self.locks.release_with_error(&key, &token, &message).await
            }
        };
        if let Err(e) = released {
            // The TTL and the reclaimer free the lock eventually.
            error!(lock = %key, error = %e, "lock release failed");
        }

        result.finish(started.elapsed());
        info!(summary = %result.summary(), "sync run finished");
        notify_run(self.notifier.as_ref(), &result).await;
        drop(phase);
        result
    }

    async fn process(&self, req: &SyncRequest, result: &mut SyncRunResult) -> Result<()> {
        let line_id = req.line_id;
        let tuning = self.settings.for_line(line_id);
        let today = Utc::now().date_naive();
        let cap = tuning.eligibility_cap;

        let (line, items, total) = self
            .db
            .call(move |conn| {
                let line = catalog::get_line(conn, line_id)?.ok_or(SyncError::LineNotFound(line_id))?;
                let items = catalog::eligible_items(conn, line_id, today, cap)?;
                let total = catalog::count_eligible(conn, line_id, today)?;
                Ok((line, items, total))
            })
            .await?;

        result.eligible_total = total;
        result.discovered = items.len();
        if total > cap {
            warn!(eligible = total, cap, "eligible items exceed the cap; remainder left for later runs");
        }

        let batch = &items[..items.len().min(tuning.batch_size)];
        result.deferred = total.saturating_sub(batch.len());
        info!(
            discovered = items.len(),
            batch = batch.len(),
            deferred = result.deferred,
            "processing batch"
        );

        for (i, item) in batch.iter().enumerate() {
            if i > 0 && !tuning.item_delay.is_zero() {
                tokio::time::sleep(tuning.item_delay).await;
            }
            result.attempted += 1;

            match self.fetcher.fetch(&line, item).await {
                Ok(FetchOutcome::NotFound { path }) => {
                    debug!(item = %item.code, path = %path, "no remote file; skipped");
                    result.skipped += 1;
                }
                Ok(FetchOutcome::Found(bytes)) => {
                    let outcome = self
                        .reconciler
                        .reconcile(item, &bytes, req.currency.as_deref())
                        .await;
                    if outcome.is_success() {
                        result.succeeded += 1;
                    } else {
                        result.failed += 1;
                        let message = outcome
                            .error
                            .unwrap_or_else(|| format!("item {}: reconcile failed", item.code));
                        warn!(item = %item.code, error = %message, "item failed");
                        result.errors.push(message);
                    }
                }
                Err(e) => {
                    warn!(item = %item.code, error = %e, "fetch failed");
                    result.failed += 1;
                    result.errors.push(format!("item {}: {e}", item.code));
                }
            }

            self.stamp_attempt(item).await;
        }
        Ok(())
    }

    async fn stamp_attempt(&self, item: &CatalogItem) {
        let item_id = item.id;
        let stamped = self
            .db
            .call(move |conn| catalog::record_attempt(conn, item_id, Utc::now()))
            .await;
        if let Err(e) = stamped {
            warn!(item = %item.code, error = %e, "failed to record attempt time");
        }
    }
}
