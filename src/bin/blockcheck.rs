//! Standalone blockcheck

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use zapret_manager::{
    app::{self, BlockcheckArgs},
    config::Settings,
    logging,
};

#[derive(Debug, Parser)]
#[command(name = "blockcheck", version, about = "🔍 Find winws/nfqws strategies that get past DPI")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    base_dir: Option<PathBuf>,

    #[arg(long, action)]
    json: bool,

    #[command(flatten)]
    blockcheck: BlockcheckArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("info", false);

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    if let Some(base) = cli.base_dir {
        settings.paths.base_dir = base;
    }

    let report = app::run_blockcheck(&settings, &cli.blockcheck, cli.json).await?;
    info!(
        "🏁 Done in {:.1}s",
        (report.finished_at - report.started_at).num_milliseconds() as f64 / 1000.0
    );
    Ok(())
}
