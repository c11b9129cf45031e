use crate::output::{fmt_time, print_json, print_table};
use anyhow::Context;
use chrono::Utc;
use clap::Subcommand;
use pricesync_core::config::Config;
use pricesync_core::db::Db;
use pricesync_core::lock;
use pricesync_core::types::{LockKey, PRICING_SYNC};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum LocksSubcommand {
    /// List every lock row
    List,

    /// Force a lock back to idle, whatever state it is in
    Clear {
        /// Supplier line id
        line: i64,
        /// Lock purpose
        #[arg(long, default_value = PRICING_SYNC)]
        purpose: String,
    },

    /// Fail processing locks held longer than the threshold
    Reclaim {
        /// Threshold in seconds (default: sync.stale_after_secs)
        #[arg(long)]
        older_than_secs: Option<u64>,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(config_path: &Path, subcmd: LocksSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(config_path).context("failed to load config")?;
    let db = Db::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;

    match subcmd {
        LocksSubcommand::List => list(&db, json),
        LocksSubcommand::Clear { line, purpose } => clear(&db, LockKey::new(line, purpose), json),
        LocksSubcommand::Reclaim { older_than_secs } => {
            let threshold = match older_than_secs {
                Some(0) => anyhow::bail!("--older-than-secs must be at least 1"),
                Some(secs) => Duration::from_secs(secs),
                None => config.sync.stale_after(),
            };
            reclaim(&db, threshold, json)
        }
    }
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

fn list(db: &Db, json: bool) -> anyhow::Result<()> {
    let locks = db.with_conn(|conn| lock::list(conn))?;

    if json {
        return print_json(&locks);
    }
    if locks.is_empty() {
        println!("No locks.");
        return Ok(());
    }

    let rows = locks
        .iter()
        .map(|l| {
            vec![
                l.key.line_id.to_string(),
                l.key.purpose.clone(),
                l.status.to_string(),
                fmt_time(l.acquired_at),
                fmt_time(l.expires_at),
                l.last_error.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(
        &["LINE", "PURPOSE", "STATUS", "ACQUIRED", "EXPIRES", "LAST ERROR"],
        rows,
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// clear
// ---------------------------------------------------------------------------

fn clear(db: &Db, key: LockKey, json: bool) -> anyhow::Result<()> {
    let cleared = db.with_conn(|conn| lock::force_clear(conn, &key, Utc::now()))?;
    if !cleared {
        anyhow::bail!("no lock found for {key}");
    }

    if json {
        print_json(&serde_json::json!({
            "lineId": key.line_id,
            "purpose": key.purpose,
            "cleared": true,
        }))?;
    } else {
        println!("Cleared lock {key}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// reclaim
// ---------------------------------------------------------------------------

fn reclaim(db: &Db, threshold: Duration, json: bool) -> anyhow::Result<()> {
    let keys = db.with_conn(|conn| lock::reclaim_stale(conn, threshold, Utc::now()))?;

    if json {
        print_json(&serde_json::json!({
            "reclaimed": keys.len(),
            "thresholdSecs": threshold.as_secs(),
            "locks": keys,
        }))?;
    } else if keys.is_empty() {
        println!("No stale locks older than {}s.", threshold.as_secs());
    } else {
        for key in &keys {
            println!("Reclaimed {key}");
        }
        println!("{} lock(s) marked failed.", keys.len());
    }
    Ok(())
}
