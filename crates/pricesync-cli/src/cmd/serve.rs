use anyhow::Context;
use pricesync_core::config::Config;
use pricesync_core::service::Services;
use std::path::Path;

pub fn run(config_path: &Path, port: Option<u16>) -> anyhow::Result<()> {
    let config = Config::load(config_path).context("failed to load config")?;
    let port = port.unwrap_or(config.server.port);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let services = Services::from_config(&config).context("failed to start services")?;
        pricesync_server::serve(services, port).await
    })
}
