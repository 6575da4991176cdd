use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use decp_sync::{report_markdown, SyncConfig, SyncPipeline};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "decp-cli")]
#[command(about = "DECP contract resolution pipeline")]
struct Cli {
    /// Output root; each run writes into `<dist-dir>/<run date>/`.
    #[arg(long, global = true)]
    dist_dir: Option<PathBuf>,

    /// Source registry (YAML).
    #[arg(long, global = true)]
    sources: Option<PathBuf>,

    /// Run date (YYYY-MM-DD); defaults to today.
    #[arg(long, global = true)]
    date: Option<NaiveDate>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, resolve and publish every enabled source.
    Run,
    /// Download or refresh the cached sources only.
    Fetch,
    /// Run on the configured cron until interrupted.
    Schedule,
    /// Print a digest of the latest runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

impl Cli {
    fn config(&self) -> SyncConfig {
        let mut config = SyncConfig::from_env();
        if let Some(dir) = &self.dist_dir {
            config.dist_dir = dir.clone();
        }
        if let Some(path) = &self.sources {
            config.sources_path = path.clone();
        }
        config.run_date = self.date;
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = SyncPipeline::new(config)?.run_once().await?;
            println!(
                "run complete: run_id={} date={} sources={} rows={} contracts={} duplicates_removed={} warnings={} dir={}",
                summary.run_id,
                summary.run_date,
                summary.sources,
                summary.rows,
                summary.contracts,
                summary.duplicates_removed,
                summary.warnings,
                summary.run_dir
            );
        }
        Commands::Fetch => {
            let cached = SyncPipeline::new(config)?.fetch_sources().await?;
            for source in cached {
                println!(
                    "{} {} bytes sha256={} downloaded={} path={}",
                    source.file_name,
                    source.byte_size,
                    source.sha256,
                    source.downloaded,
                    source.path.display()
                );
            }
        }
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let cron = config.sync_cron.clone();
            let pipeline = SyncPipeline::new(config)?;
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            println!("{}", report_markdown(runs, &config.dist_dir)?);
        }
    }

    Ok(())
}
