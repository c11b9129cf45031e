//! Explicit construction of every pipeline dependency from [`Config`].
//!
//! The server and the CLI build one [`Services`] at startup and own it for
//! the life of the process; nothing in the pipeline reaches for globals.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::cache::{pending_invalidations, CacheInvalidator, OutboxCache, OutboxDrainer, RedbCache};
use crate::config::{Config, RemoteKind};
use crate::db::Db;
use crate::error::{Result, SyncError};
use crate::lock::LockManager;
use crate::notify::{LogNotifier, Notifier, SlackNotifier};
use crate::orchestrator::{RunPhaseEntry, SyncOrchestrator};
use crate::pool::{ConnectionPool, Connector, PoolStats};
use crate::reclaimer::StaleLockReclaimer;
use crate::reconcile::ItemReconciler;
use crate::remote::{CatalogFetcher, HttpConnector, MirrorConnector};

/// Build the connector selected by `remote.kind`.
pub fn connector_for(config: &Config) -> Result<Arc<dyn Connector>> {
    let remote = &config.remote;
    match remote.kind {
        RemoteKind::Http => {
            let base = remote
                .base_url
                .as_deref()
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| SyncError::InvalidConfig("remote.base_url is not set".into()))?;
            Ok(Arc::new(
                HttpConnector::new(base)
                    .with_credentials(remote.username.clone(), remote.password.clone()),
            ))
        }
        RemoteKind::Mirror => {
            let root = remote
                .mirror_root
                .clone()
                .ok_or_else(|| SyncError::InvalidConfig("remote.mirror_root is not set".into()))?;
            Ok(Arc::new(MirrorConnector::new(root)))
        }
    }
}

fn notifier_for(config: &Config) -> Arc<dyn Notifier> {
    match config.notify.slack_webhook_url.as_deref() {
        Some(url) if !url.trim().is_empty() => Arc::new(SlackNotifier::new(
            url,
            config.notify.channel_label.clone(),
        )),
        _ => Arc::new(LogNotifier),
    }
}

/// The cache file is single-writer. The process that opens it also drains the
/// outbox; any other process queues its invalidations there instead.
fn cache_for(config: &Config, db: &Db) -> (Arc<dyn CacheInvalidator>, Option<OutboxDrainer>) {
    match RedbCache::open(&config.cache_path) {
        Ok(cache) => {
            let cache = Arc::new(cache);
            let drainer = OutboxDrainer::new(db.clone(), cache.clone());
            (cache, Some(drainer))
        }
        Err(e) => {
            warn!(
                path = %config.cache_path.display(),
                error = %e,
                "cache held by another process; invalidations will be queued for it"
            );
            (Arc::new(OutboxCache::new(db.clone())), None)
        }
    }
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Snapshot for the admin status endpoint and `config show`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub remote_kind: &'static str,
    pub remote_configured: bool,
    pub pool: PoolStats,
    pub notifier: &'static str,
    pub cache: &'static str,
    pub pending_invalidations: usize,
    pub runs: Vec<RunPhaseEntry>,
}

#[derive(Clone)]
pub struct Services {
    pub config: Config,
    pub db: Db,
    pub locks: LockManager,
    pub pool: ConnectionPool,
    pub orchestrator: SyncOrchestrator,
    pub reclaimer: StaleLockReclaimer,
    pub cache: Arc<dyn CacheInvalidator>,
    /// Present only in the process that owns the cache file.
    pub drainer: Option<OutboxDrainer>,
    notifier_kind: &'static str,
    cache_kind: &'static str,
}

impl Services {
    pub fn from_config(config: &Config) -> Result<Self> {
        let db = Db::open(&config.database_path)?;
        let (cache, drainer) = cache_for(config, &db);
        if let Some(drainer) = &drainer {
            // Apply whatever other processes queued while no owner was running.
            match drainer.drain() {
                Ok(0) => {}
                Ok(n) => info!(applied = n, "queued cache invalidations applied"),
                Err(e) => warn!(error = %e, "cache outbox drain failed at startup"),
            }
        }
        let mut services = Self::with_db(config, db, cache)?;
        services.drainer = drainer;
        Ok(services)
    }

    /// Wire everything around an already opened database and cache.
    pub fn with_db(config: &Config, db: Db, cache: Arc<dyn CacheInvalidator>) -> Result<Self> {
        let connector = connector_for(config)?;
        let pool = ConnectionPool::new(
            connector,
            config.remote.pool_size,
            config.remote.acquire_timeout(),
        );
        let fetcher = CatalogFetcher::new(pool.clone(), config.remote.fetch_timeout());
        let notifier = notifier_for(config);
        let locks = LockManager::new(db.clone());
        let cache_kind = cache.kind();
        let reconciler = ItemReconciler::new(db.clone(), cache.clone());
        let notifier_kind = notifier.kind();

        let orchestrator = SyncOrchestrator::new(
            db.clone(),
            locks.clone(),
            fetcher,
            reconciler,
            notifier,
            config.sync.clone(),
        );
        let reclaimer = StaleLockReclaimer::new(locks.clone(), config.sync.stale_after());

        info!(
            remote = pool.connector_kind(),
            pool_size = pool.size(),
            notifier = notifier_kind,
            cache = cache_kind,
            "pipeline services ready"
        );

        Ok(Self {
            config: config.clone(),
            db,
            locks,
            pool,
            orchestrator,
            reclaimer,
            cache,
            drainer: None,
            notifier_kind,
            cache_kind,
        })
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            remote_kind: self.pool.connector_kind(),
            remote_configured: self.config.remote.is_configured(),
            pool: self.pool.stats(),
            notifier: self.notifier_kind,
            cache: self.cache_kind,
            pending_invalidations: self.db.with_conn(|c| pending_invalidations(c)).unwrap_or_default(),
            runs: self.orchestrator.phases(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mirror_config(dir: &TempDir) -> Config {
        let mut cfg = Config::default();
        cfg.database_path = dir.path().join("db/pricesync.db");
        cfg.cache_path = dir.path().join("db/cache.redb");
        cfg.remote.kind = RemoteKind::Mirror;
        cfg.remote.mirror_root = Some(dir.path().join("mirror"));
        cfg
    }

    #[test]
    fn builds_from_mirror_config() {
        let dir = TempDir::new().unwrap();
        let services = Services::from_config(&mirror_config(&dir)).unwrap();
        let status = services.status();
        assert_eq!(status.remote_kind, "mirror");
        assert_eq!(status.notifier, "log");
        assert_eq!(status.cache, "redb");
        assert!(services.drainer.is_some());
        assert_eq!(status.pending_invalidations, 0);
        assert_eq!(status.pool.size, 3);
        assert!(status.runs.is_empty());
    }

    #[test]
    fn second_process_queues_invalidations_for_the_cache_owner() {
        let dir = TempDir::new().unwrap();
        let cfg = mirror_config(&dir);
        let owner = Services::from_config(&cfg).unwrap();
        let other = Services::from_config(&cfg).unwrap();
        assert_eq!(owner.status().cache, "redb");
        assert_eq!(other.status().cache, "outbox");
        assert!(other.drainer.is_none());

        let drainer = owner.drainer.clone().unwrap();
        let cache = drainer.cache();
        cache.put("item:42:detail", b"x").unwrap();
        cache.put("pricing:42:GBP", b"y").unwrap();
        cache.put("pricing:43:GBP", b"z").unwrap();

        assert_eq!(other.cache.invalidate_item(42).unwrap(), 0);
        assert_eq!(owner.status().pending_invalidations, 1);

        assert_eq!(drainer.drain().unwrap(), 1);
        assert_eq!(cache.get("item:42:detail").unwrap(), None);
        assert_eq!(cache.get("pricing:42:GBP").unwrap(), None);
        assert_eq!(cache.get("pricing:43:GBP").unwrap(), Some(b"z".to_vec()));
        assert_eq!(other.status().pending_invalidations, 0);
    }

    #[test]
    fn http_without_base_url_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut cfg = mirror_config(&dir);
        cfg.remote.kind = RemoteKind::Http;
        assert!(matches!(
            Services::from_config(&cfg).err(),
            Some(SyncError::InvalidConfig(_))
        ));
    }

    #[test]
    fn slack_url_selects_slack_notifier() {
        let dir = TempDir::new().unwrap();
        let mut cfg = mirror_config(&dir);
        cfg.notify.slack_webhook_url = Some("https://hooks.slack.com/services/T/B/X".into());
        let services = Services::from_config(&cfg).unwrap();
        assert_eq!(services.status().notifier, "slack");
    }
}
