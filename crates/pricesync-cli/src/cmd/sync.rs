use crate::output::print_json;
use anyhow::Context;
use pricesync_core::config::Config;
use pricesync_core::orchestrator::{RunOutcome, SyncRequest};
use pricesync_core::service::Services;
use std::path::Path;

pub fn run(config_path: &Path, line_id: i64, currency: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = Config::load(config_path).context("failed to load config")?;

    let mut req = SyncRequest::manual(line_id);
    req.currency = currency.map(|c| c.trim().to_ascii_uppercase());

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let services = Services::from_config(&config).context("failed to start services")?;
        anyhow::Ok(services.orchestrator.run(req).await)
    })?;

    if json {
        print_json(&result)?;
    } else {
        println!("{}", result.summary());
        for err in &result.errors {
            println!("  - {err}");
        }
    }

    match result.outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Contention => {
            anyhow::bail!("line {line_id} is already being synced by another run")
        }
        RunOutcome::Interrupted => anyhow::bail!(
            "sync for line {line_id} stopped after {} of its items: {}",
            result.attempted,
            result.errors.last().map(String::as_str).unwrap_or("unknown error")
        ),
        RunOutcome::Fatal => anyhow::bail!(
            "sync for line {line_id} failed: {}",
            result.errors.first().map(String::as_str).unwrap_or("unknown error")
        ),
    }
}
