use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The batch was processed (individual items may still have failed).
    Completed,
    /// Another run held the line's lock; nothing was attempted.
    Contention,
    /// A pre-batch failure aborted the run.
    Fatal,
    /// The batch started but stopped early; counts cover the items handled
    /// before the interruption.
    Interrupted,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Contention => "contention",
            RunOutcome::Fatal => "fatal",
            RunOutcome::Interrupted => "interrupted",
        }
    }
}

/// Aggregate of one orchestrator invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunResult {
    pub correlation_id: String,
    pub line_id: i64,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    /// Eligible items in the store, ignoring the cap.
    pub eligible_total: usize,
    /// Items read for this run (≤ eligibility cap).
    pub discovered: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Eligible but left for a later run.
    pub deferred: usize,
    pub elapsed_ms: u64,
    pub errors: Vec<String>,
}

impl SyncRunResult {
    pub(crate) fn new(correlation_id: &str, line_id: i64, started_at: DateTime<Utc>) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            line_id,
            outcome: RunOutcome::Completed,
            started_at,
            eligible_total: 0,
            discovered: 0,
            attempted: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            deferred: 0,
            elapsed_ms: 0,
            errors: Vec::new(),
        }
    }

    pub(crate) fn contention(correlation_id: &str, line_id: i64, started_at: DateTime<Utc>) -> Self {
        Self {
            outcome: RunOutcome::Contention,
            ..Self::new(correlation_id, line_id, started_at)
        }
    }

    /// Collapse to a single-error result with nothing attempted.
    pub(crate) fn into_fatal(mut self, message: impl Into<String>) -> Self {
        self.outcome = RunOutcome::Fatal;
        self.attempted = 0;
        self.succeeded = 0;
        self.skipped = 0;
        self.failed = 0;
        self.errors = vec![message.into()];
        self
    }

    /// Stop a started batch early. The in-flight item counts as failed and
    /// the untouched rest of the batch as deferred; finished items keep their
    /// counts because their writes are already committed.
    pub(crate) fn interrupt(&mut self, message: impl Into<String>) {
        self.outcome = RunOutcome::Interrupted;
        let settled = self.succeeded + self.skipped + self.failed;
        self.failed += self.attempted.saturating_sub(settled);
        self.deferred = self.eligible_total.saturating_sub(self.attempted);
        self.errors.push(message.into());
    }

    pub(crate) fn finish(&mut self, elapsed: Duration) {
        self.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    /// Succeeded over attempted, in percent. 0 when nothing was attempted.
    pub fn success_rate(&self) -> f64 {
        if self.attempted == 0 {
            return 0.0;
        }
        self.succeeded as f64 * 100.0 / self.attempted as f64
    }

    /// One-line `key=value` summary used in logs and notifications.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "line={} outcome={} attempted={} succeeded={} skipped={} failed={} deferred={} \
             discovered={} eligible={} elapsed={}ms",
            self.line_id,
            self.outcome.as_str(),
            self.attempted,
            self.succeeded,
            self.skipped,
            self.failed,
            self.deferred,
            self.discovered,
            self.eligible_total,
            self.elapsed_ms
        );
        if let Some(first) = self.errors.first() {
            let _ = write!(out, " first_error=\"{first}\"");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_reports_counts() {
        let mut r = SyncRunResult::new("c-1", 22, Utc::now());
        r.attempted = 5;
        r.succeeded = 4;
        r.failed = 1;
        r.deferred = 2;
        r.errors.push("item 7: boom".into());
        let s = r.summary();
        assert!(s.contains("line=22"));
        assert!(s.contains("attempted=5"));
        assert!(s.contains("deferred=2"));
        assert!(s.contains("first_error=\"item 7: boom\""));
        assert_eq!(r.success_rate(), 80.0);
    }

    #[test]
    fn fatal_drops_item_counts() {
        let mut r = SyncRunResult::new("c-1", 22, Utc::now());
        r.attempted = 3;
        r.errors.push("partial".into());
        let r = r.into_fatal("supplier line not found: 22");
        assert_eq!(r.outcome, RunOutcome::Fatal);
        assert_eq!(r.attempted, 0);
        assert_eq!(r.errors, vec!["supplier line not found: 22".to_string()]);
        assert_eq!(r.success_rate(), 0.0);
    }

    #[test]
    fn interrupt_keeps_finished_items() {
        let mut r = SyncRunResult::new("c-1", 22, Utc::now());
        r.eligible_total = 7;
        r.deferred = 2;
        r.attempted = 2;
        r.succeeded = 1;
        r.interrupt("run panicked: boom");
        assert_eq!(r.outcome, RunOutcome::Interrupted);
        assert_eq!(r.attempted, 2);
        assert_eq!(r.succeeded, 1);
        assert_eq!(r.failed, 1);
        assert_eq!(r.deferred, 5);
        assert_eq!(r.errors, vec!["run panicked: boom".to_string()]);
        assert!(r.summary().contains("outcome=interrupted"));
    }
}
