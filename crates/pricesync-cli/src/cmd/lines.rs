use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use pricesync_core::catalog;
use pricesync_core::config::Config;
use pricesync_core::db::Db;
use pricesync_core::types::SupplierLine;
use std::path::Path;

#[derive(Subcommand)]
pub enum LinesSubcommand {
    /// Add or update a supplier line
    Add {
        /// Line id
        id: i64,
        /// Display name
        name: String,
        /// Directory code on the remote store (default: the line id)
        #[arg(long)]
        remote_code: Option<String>,
    },

    /// List supplier lines
    List,
}

pub fn run(config_path: &Path, subcmd: LinesSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(config_path).context("failed to load config")?;
    let db = Db::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;

    match subcmd {
        LinesSubcommand::Add {
            id,
            name,
            remote_code,
        } => {
            if id <= 0 {
                anyhow::bail!("line id must be positive, got {id}");
            }
            let line = SupplierLine {
                id,
                name,
                remote_code: remote_code.unwrap_or_else(|| id.to_string()),
            };
            db.with_conn(|conn| catalog::upsert_line(conn, &line))?;
            if json {
                print_json(&line)?;
            } else {
                println!("Saved line {} ({})", line.id, line.name);
            }
            Ok(())
        }
        LinesSubcommand::List => {
            let lines = db.with_conn(|conn| catalog::list_lines(conn))?;
            if json {
                return print_json(&lines);
            }
            if lines.is_empty() {
                println!("No lines.");
                return Ok(());
            }
            let rows = lines
                .into_iter()
                .map(|l| vec![l.id.to_string(), l.name, l.remote_code])
                .collect();
            print_table(&["ID", "NAME", "REMOTE CODE"], rows);
            Ok(())
        }
    }
}
