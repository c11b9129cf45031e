//! End-to-end runs of the orchestrator against a scripted remote.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tempfile::TempDir;

use pricesync_core::cache::NoopCache;
use pricesync_core::catalog;
use pricesync_core::config::SyncConfig;
use pricesync_core::db::Db;
use pricesync_core::lock::LockManager;
use pricesync_core::notify::LogNotifier;
use pricesync_core::orchestrator::{RunOutcome, RunPhase, SyncOrchestrator, SyncRequest};
use pricesync_core::pool::{ConnectionPool, Connector, RemoteConnection};
use pricesync_core::reconcile::ItemReconciler;
use pricesync_core::remote::{remote_path, CatalogFetcher, TransferError};
use pricesync_core::types::{CabinClass, LockKey, LockStatus, NewCatalogItem, SupplierLine};

const PRICES: &[u8] = br#"{"prices":{"interior":100,"oceanview":150,"balcony":200,"suite":400}}"#;

#[derive(Clone)]
enum Reply {
    Found(Vec<u8>),
    Fail,
    Slow(Duration),
    Panic,
}

type Script = Arc<Mutex<HashMap<String, Reply>>>;
type Hits = Arc<Mutex<Vec<tokio::time::Instant>>>;

struct ScriptedConn {
    script: Script,
    hits: Hits,
}

#[async_trait]
impl RemoteConnection for ScriptedConn {
    async fn retrieve(&mut self, path: &str) -> Result<Option<Vec<u8>>, TransferError> {
        self.hits.lock().unwrap().push(tokio::time::Instant::now());
        let reply = self.script.lock().unwrap().get(path).cloned();
        match reply {
            None => Ok(None),
            Some(Reply::Found(bytes)) => Ok(Some(bytes)),
            Some(Reply::Fail) => Err(TransferError::Io("connection reset by peer".into())),
            Some(Reply::Slow(d)) => {
                tokio::time::sleep(d).await;
                Ok(Some(PRICES.to_vec()))
            }
            Some(Reply::Panic) => panic!("remote exploded"),
        }
    }

    fn is_alive(&self) -> bool {
        true
    }
}

struct ScriptedConnector {
    script: Script,
    hits: Hits,
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn RemoteConnection>, TransferError> {
        Ok(Box::new(ScriptedConn {
            script: self.script.clone(),
            hits: self.hits.clone(),
        }))
    }

    fn kind(&self) -> &'static str {
        "scripted"
    }
}

struct Harness {
    _dir: TempDir,
    db: Db,
    locks: LockManager,
    script: Script,
    /// When each retrieve reached the remote, in call order.
    hits: Hits,
    orchestrator: SyncOrchestrator,
    /// (item id, remote path) in insertion order.
    items: Vec<(i64, String)>,
}

impl Harness {
    fn new(line_id: i64, item_count: usize) -> Self {
        Self::with_settings(
            line_id,
            item_count,
            SyncConfig {
                item_delay_ms: 0,
                ..SyncConfig::default()
            },
        )
    }

    fn with_settings(line_id: i64, item_count: usize, settings: SyncConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let db = Db::open(&dir.path().join("pricesync.db")).unwrap();
        let line = SupplierLine {
            id: line_id,
            name: format!("Line {line_id}"),
            remote_code: line_id.to_string(),
        };
        let today = Utc::now().date_naive();
        let items = db
            .with_conn(|conn| {
                catalog::upsert_line(conn, &line)?;
                let mut out = Vec::new();
                for i in 0..item_count {
                    let sailing = today + chrono::Duration::days(30 + i as i64);
                    let code = format!("{line_id}{i:04}");
                    let id = catalog::insert_item(
                        conn,
                        &NewCatalogItem {
                            code: code.clone(),
                            line_id,
                            ship_code: "180".into(),
                            sailing_date: sailing,
                        },
                    )?;
                    out.push((id, remote_path(&line.remote_code, "180", &code, sailing)));
                }
                Ok(out)
            })
            .unwrap();

        let script: Script = Arc::new(Mutex::new(HashMap::new()));
        let hits: Hits = Arc::new(Mutex::new(Vec::new()));
        let pool = ConnectionPool::new(
            Arc::new(ScriptedConnector {
                script: script.clone(),
                hits: hits.clone(),
            }),
            3,
            Duration::from_secs(5),
        );
        let locks = LockManager::new(db.clone());
        let orchestrator = SyncOrchestrator::new(
            db.clone(),
            locks.clone(),
            CatalogFetcher::new(pool, Duration::from_secs(5)),
            ItemReconciler::new(db.clone(), Arc::new(NoopCache)),
            Arc::new(LogNotifier),
            settings,
        );

        Self {
            _dir: dir,
            db,
            locks,
            script,
            hits,
            orchestrator,
            items,
        }
    }

    fn reply_all(&self, reply: Reply) {
        let mut script = self.script.lock().unwrap();
        for (_, path) in &self.items {
            script.insert(path.clone(), reply.clone());
        }
    }

    fn reply(&self, index: usize, reply: Reply) {
        self.script
            .lock()
            .unwrap()
            .insert(self.items[index].1.clone(), reply);
    }
}

#[tokio::test]
async fn seven_eligible_batch_of_five_defers_two() {
    let h = Harness::new(22, 7);
    h.reply_all(Reply::Found(PRICES.to_vec()));

    let result = h.orchestrator.run(SyncRequest::manual(22)).await;
    assert_eq!(result.outcome, RunOutcome::Completed);
    assert_eq!(result.eligible_total, 7);
    assert_eq!(result.discovered, 7);
    assert_eq!(result.attempted, 5);
    assert_eq!(result.succeeded, 5);
    assert_eq!(result.deferred, 2);
    assert!(result.summary().contains("attempted=5"));

    let lock = h.locks.get(&LockKey::pricing(22)).await.unwrap().unwrap();
    assert_eq!(lock.status, LockStatus::Completed);
    assert!(!h.locks.is_held(&LockKey::pricing(22)).await.unwrap());

    let item = h
        .db
        .with_conn(|c| catalog::get_item(c, h.items[0].0))
        .unwrap()
        .unwrap();
    let cheapest = item.cheapest.unwrap();
    assert_eq!(cheapest.price, 100.0);
    assert_eq!(cheapest.class, CabinClass::Interior);
    assert_eq!(h.orchestrator.phase_of(22), RunPhase::Idle);
}

#[tokio::test]
async fn next_run_starts_with_deferred_items() {
    let h = Harness::new(22, 7);
    h.reply_all(Reply::Found(PRICES.to_vec()));
    h.orchestrator.run(SyncRequest::manual(22)).await;

    let untouched: Vec<i64> = h.items[5..].iter().map(|(id, _)| *id).collect();
    let second = h.orchestrator.run(SyncRequest::manual(22)).await;
    assert_eq!(second.attempted, 5);

    for id in untouched {
        let item = h.db.with_conn(|c| catalog::get_item(c, id)).unwrap().unwrap();
        assert!(item.last_synced_at.is_some(), "deferred item {id} was not picked up");
    }
}

#[tokio::test]
async fn missing_files_are_skipped_not_failed() {
    let h = Harness::new(5, 3);
    h.reply(1, Reply::Found(PRICES.to_vec()));

    let result = h.orchestrator.run(SyncRequest::manual(5)).await;
    assert_eq!(result.outcome, RunOutcome::Completed);
    assert_eq!(result.attempted, 3);
    assert_eq!(result.skipped, 2);
    assert_eq!(result.succeeded, 1);
    assert_eq!(result.failed, 0);
    assert!(result.errors.is_empty());

    // Skipped items still count as attempted.
    let item = h
        .db
        .with_conn(|c| catalog::get_item(c, h.items[0].0))
        .unwrap()
        .unwrap();
    assert!(item.last_attempted_at.is_some());
    assert!(item.last_synced_at.is_none());
}

#[tokio::test]
async fn transfer_error_does_not_stop_later_items() {
    let h = Harness::new(5, 4);
    h.reply_all(Reply::Found(PRICES.to_vec()));
    h.reply(0, Reply::Fail);
    h.reply(2, Reply::Found(b"{broken".to_vec()));

    let result = h.orchestrator.run(SyncRequest::manual(5)).await;
    assert_eq!(result.outcome, RunOutcome::Completed);
    assert_eq!(result.attempted, 4);
    assert_eq!(result.succeeded, 2);
    assert_eq!(result.failed, 2);
    assert_eq!(result.errors.len(), 2);
    assert!(result.errors[0].contains("connection reset"));
    assert!(result.errors[1].contains("bytes"));
    assert_eq!(
        h.locks.get(&LockKey::pricing(5)).await.unwrap().unwrap().status,
        LockStatus::Completed
    );
}

#[tokio::test]
async fn concurrent_runs_for_one_line_yield_contention() {
    let h = Harness::new(22, 2);
    h.reply_all(Reply::Slow(Duration::from_millis(300)));

    let first = h.orchestrator.spawn_run(SyncRequest::manual(22));
    // Let the first run take the lock.
    for _ in 0..100 {
        if h.locks.is_held(&LockKey::pricing(22)).await.unwrap() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_ne!(h.orchestrator.phase_of(22), RunPhase::Idle);

    let second = h.orchestrator.run(SyncRequest::manual(22)).await;
    assert_eq!(second.outcome, RunOutcome::Contention);
    assert_eq!(second.attempted, 0);

    let first = first.await.unwrap();
    assert_eq!(first.outcome, RunOutcome::Completed);
    assert_eq!(first.attempted, 2);
}

#[tokio::test]
async fn unknown_line_is_fatal_and_releases_lock() {
    let h = Harness::new(22, 1);

    let result = h.orchestrator.run(SyncRequest::manual(99)).await;
    assert_eq!(result.outcome, RunOutcome::Fatal);
    assert_eq!(result.attempted, 0);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("99"));

    let lock = h.locks.get(&LockKey::pricing(99)).await.unwrap().unwrap();
    assert_eq!(lock.status, LockStatus::Failed);
    assert!(lock.last_error.unwrap().contains("not found"));
}

#[tokio::test]
async fn panic_during_batch_still_releases_lock() {
    let h = Harness::new(22, 3);
    h.reply_all(Reply::Found(PRICES.to_vec()));
    h.reply(1, Reply::Panic);

    let result = h.orchestrator.run(SyncRequest::manual(22)).await;
    assert_eq!(result.outcome, RunOutcome::Interrupted);
    // The first item was written before the panic and stays counted.
    assert_eq!(result.attempted, 2);
    assert_eq!(result.succeeded, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(result.deferred, 1);
    assert!(result.errors.last().unwrap().contains("remote exploded"));
    let first = h
        .db
        .with_conn(|c| catalog::get_item(c, h.items[0].0))
        .unwrap()
        .unwrap();
    assert!(first.last_synced_at.is_some());

    assert!(!h.locks.is_held(&LockKey::pricing(22)).await.unwrap());
    let lock = h.locks.get(&LockKey::pricing(22)).await.unwrap().unwrap();
    assert_eq!(lock.status, LockStatus::Failed);
    assert!(lock.last_error.unwrap().contains("remote exploded"));

    // The line can be synced again straight away.
    h.reply(1, Reply::Found(PRICES.to_vec()));
    let again = h.orchestrator.run(SyncRequest::manual(22)).await;
    assert_eq!(again.outcome, RunOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn items_are_spaced_by_the_fixed_delay() {
    let delay = Duration::from_secs(3);
    let h = Harness::with_settings(
        22,
        3,
        SyncConfig {
            item_delay_ms: 3000,
            ..SyncConfig::default()
        },
    );
    h.reply_all(Reply::Found(PRICES.to_vec()));

    let started = tokio::time::Instant::now();
    let result = h.orchestrator.run(SyncRequest::manual(22)).await;
    assert_eq!(result.succeeded, 3);

    let hits = h.hits.lock().unwrap().clone();
    assert_eq!(hits.len(), 3);
    // No wait before the first item.
    assert!(hits[0] - started < delay);
    for pair in hits.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= delay, "gap {gap:?} shorter than {delay:?}");
        assert!(gap < delay * 2, "gap {gap:?} longer than one delay");
    }
    assert!(started.elapsed() >= delay * 2);
}

#[tokio::test]
async fn past_and_inactive_items_are_not_eligible() {
    let h = Harness::new(22, 2);
    h.reply_all(Reply::Found(PRICES.to_vec()));
    h.db
        .with_conn(|conn| {
            catalog::set_active(conn, h.items[0].0, false)?;
            catalog::insert_item(
                conn,
                &NewCatalogItem {
                    code: "sailed".into(),
                    line_id: 22,
                    ship_code: "180".into(),
                    sailing_date: NaiveDate::from_ymd_opt(2001, 1, 1).unwrap(),
                },
            )?;
            Ok(())
        })
        .unwrap();

    let result = h.orchestrator.run(SyncRequest::manual(22)).await;
    assert_eq!(result.eligible_total, 1);
    assert_eq!(result.attempted, 1);
}
