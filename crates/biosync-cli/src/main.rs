use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "biosync-cli")]
#[command(about = "Occurrence warehouse to PostGIS synchronizer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one synchronization and exit.
    Sync,
    /// Run synchronizations on BIOSYNC_SYNC_CRON until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = biosync_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} processed={} failed={} total_rows={} reports={}",
                summary.run_id,
                summary.processed,
                summary.failed,
                summary.total_rows,
                summary.reports_dir.as_deref().unwrap_or("-")
            );
        }
        Commands::Schedule => {
            let config = biosync_sync::SyncConfig::from_env();
            let Some(mut sched) = biosync_sync::maybe_build_scheduler(&config).await? else {
                bail!("scheduler disabled; set BIOSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
