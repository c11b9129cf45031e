use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name looked up by the CLI.
pub const CONFIG_FILE: &str = "pricesync.yaml";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// RemoteConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKind {
    /// File-addressed retrieval over HTTP(S).
    Http,
    /// A local directory laid out like the remote tree.
    Mirror,
}

impl RemoteKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RemoteKind::Http => "http",
            RemoteKind::Mirror => "mirror",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_kind")]
    pub kind: RemoteKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub mirror_root: Option<PathBuf>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Hard cap on live connections. Protects the remote server; raising it
    /// does not make a single run faster.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

fn default_remote_kind() -> RemoteKind {
    RemoteKind::Http
}

fn default_pool_size() -> usize {
    3
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_fetch_timeout() -> u64 {
    60
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            kind: default_remote_kind(),
            base_url: None,
            mirror_root: None,
            username: None,
            password: None,
            pool_size: default_pool_size(),
            acquire_timeout_secs: default_acquire_timeout(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

impl RemoteConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Whether the selected transport has a location to talk to.
    pub fn is_configured(&self) -> bool {
        match self.kind {
            RemoteKind::Http => self.base_url.as_deref().is_some_and(|u| !u.trim().is_empty()),
            RemoteKind::Mirror => self.mirror_root.is_some(),
        }
    }
}

// ---------------------------------------------------------------------------
// SyncConfig
// ---------------------------------------------------------------------------

/// Per-line overrides of the batching caps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LineOverride {
    #[serde(default)]
    pub eligibility_cap: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum eligible items read per run.
    #[serde(default = "default_eligibility_cap")]
    pub eligibility_cap: usize,
    /// Items actually processed per run; the rest wait for the next trigger.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_item_delay_ms")]
    pub item_delay_ms: u64,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default = "default_reclaim_interval")]
    pub reclaim_interval_secs: u64,
    /// How often the cache-owning process applies invalidations queued by
    /// other processes.
    #[serde(default = "default_cache_drain_interval")]
    pub cache_drain_interval_secs: u64,
    #[serde(default)]
    pub lines: BTreeMap<i64, LineOverride>,
}

fn default_eligibility_cap() -> usize {
    20
}

fn default_batch_size() -> usize {
    5
}

fn default_item_delay_ms() -> u64 {
    1000
}

fn default_lock_ttl() -> u64 {
    900
}

fn default_stale_after() -> u64 {
    600
}

fn default_reclaim_interval() -> u64 {
    60
}

fn default_cache_drain_interval() -> u64 {
    5
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            eligibility_cap: default_eligibility_cap(),
            batch_size: default_batch_size(),
            item_delay_ms: default_item_delay_ms(),
            lock_ttl_secs: default_lock_ttl(),
            stale_after_secs: default_stale_after(),
            reclaim_interval_secs: default_reclaim_interval(),
            cache_drain_interval_secs: default_cache_drain_interval(),
            lines: BTreeMap::new(),
        }
    }
}

/// Effective caps for one line after applying overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTuning {
    pub eligibility_cap: usize,
    pub batch_size: usize,
    pub item_delay: Duration,
}

impl SyncConfig {
    pub fn for_line(&self, line_id: i64) -> LineTuning {
        let over = self.lines.get(&line_id);
        LineTuning {
            eligibility_cap: over
                .and_then(|o| o.eligibility_cap)
                .unwrap_or(self.eligibility_cap),
            batch_size: over.and_then(|o| o.batch_size).unwrap_or(self.batch_size),
            item_delay: Duration::from_millis(self.item_delay_ms),
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }

    pub fn cache_drain_interval(&self) -> Duration {
        Duration::from_secs(self.cache_drain_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// NotifyConfig / ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Slack incoming-webhook URL. Run summaries are only logged when unset.
    #[serde(default, skip_serializing)]
    pub slack_webhook_url: Option<String>,
    #[serde(default)]
    pub channel_label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared token guarding `/api/admin/*`. Open when unset.
    #[serde(default, skip_serializing)]
    pub admin_token: Option<String>,
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            admin_token: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/pricesync.db")
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("data/cache.redb")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            cache_path: default_cache_path(),
            remote: RemoteConfig::default(),
            sync: SyncConfig::default(),
            notify: NotifyConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `path`, falling back to defaults when the file does
    /// not exist, then apply `PRICESYNC_*` environment overrides.
    ///
    /// Relative storage paths are resolved against the config file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_yaml::from_str::<Config>(&data)?
        } else {
            Config::default()
        };
        cfg.apply_env_from(|key| std::env::var(key).ok());
        if let Some(base) = path.parent() {
            cfg.resolve_paths(base);
        }
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_yaml::to_string(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Apply environment overrides using `lookup` as the variable source.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("PRICESYNC_DATABASE") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = non_empty("PRICESYNC_REMOTE_URL") {
            self.remote.base_url = Some(v);
        }
        if let Some(v) = non_empty("PRICESYNC_REMOTE_USER") {
            self.remote.username = Some(v);
        }
        if let Some(v) = non_empty("PRICESYNC_REMOTE_PASSWORD") {
            self.remote.password = Some(v);
        }
        if let Some(v) = non_empty("PRICESYNC_SLACK_WEBHOOK") {
            self.notify.slack_webhook_url = Some(v);
        }
        if let Some(v) = non_empty("PRICESYNC_ADMIN_TOKEN") {
            self.server.admin_token = Some(v);
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        if self.database_path.is_relative() {
            self.database_path = base.join(&self.database_path);
        }
        if self.cache_path.is_relative() {
            self.cache_path = base.join(&self.cache_path);
        }
        if let Some(root) = &self.remote.mirror_root {
            if root.is_relative() {
                self.remote.mirror_root = Some(base.join(root));
            }
        }
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut push = |level: WarnLevel, message: String| {
            warnings.push(ConfigWarning { level, message });
        };

        if self.remote.pool_size == 0 {
            push(
                WarnLevel::Error,
                "remote.pool_size must be at least 1".to_string(),
            );
        } else if self.remote.pool_size > 5 {
            push(
                WarnLevel::Warning,
                format!(
                    "remote.pool_size={} is above the recommended maximum of 5",
                    self.remote.pool_size
                ),
            );
        }

        if !self.remote.is_configured() {
            push(
                WarnLevel::Error,
                format!(
                    "remote.kind is '{}' but no {} is set",
                    self.remote.kind.as_str(),
                    match self.remote.kind {
                        RemoteKind::Http => "base_url",
                        RemoteKind::Mirror => "mirror_root",
                    }
                ),
            );
        }

        if self.remote.kind == RemoteKind::Http
            && (self.remote.username.is_none() || self.remote.password.is_none())
        {
            push(
                WarnLevel::Warning,
                "remote credentials are not set (PRICESYNC_REMOTE_USER / PRICESYNC_REMOTE_PASSWORD)"
                    .to_string(),
            );
        }

        if self.sync.batch_size == 0 {
            push(
                WarnLevel::Error,
                "sync.batch_size must be at least 1".to_string(),
            );
        }

        let mut scopes = vec![(
            "sync".to_string(),
            self.sync.batch_size,
            self.sync.eligibility_cap,
        )];
        for (line, over) in &self.sync.lines {
            if over.batch_size == Some(0) {
                push(
                    WarnLevel::Error,
                    format!("sync.lines.{line}.batch_size must be at least 1"),
                );
            }
            let tuning = self.sync.for_line(*line);
            scopes.push((
                format!("line {line}"),
                tuning.batch_size,
                tuning.eligibility_cap,
            ));
        }
        for (scope, batch_size, cap) in scopes {
            if batch_size > cap {
                push(
                    WarnLevel::Warning,
                    format!("{scope}: batch_size {batch_size} exceeds eligibility_cap {cap}"),
                );
            }
        }

        if self.sync.lock_ttl_secs < self.sync.stale_after_secs {
            push(
                WarnLevel::Warning,
                format!(
                    "sync.lock_ttl_secs ({}) is shorter than sync.stale_after_secs ({}); \
                     locks will expire before the reclaimer sees them",
                    self.sync.lock_ttl_secs, self.sync.stale_after_secs
                ),
            );
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
