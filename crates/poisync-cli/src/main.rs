use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use poisync_core::IdentityStrategy;
use poisync_storage::{DocumentStore, PgDocumentStore};
use poisync_sync::SyncConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "poisync")]
#[command(about = "Synchronize a points-of-interest snapshot into the stores collection")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass.
    Sync(SyncArgs),
    /// Apply pending database migrations.
    Migrate,
    /// Show document count and the most recent update time.
    Status,
}

#[derive(Debug, Default, clap::Args)]
struct SyncArgs {
    /// Read an already extracted snapshot directory.
    #[arg(long, conflicts_with = "archive")]
    snapshot_dir: Option<PathBuf>,
    /// Read a local snapshot zip archive.
    #[arg(long)]
    archive: Option<PathBuf>,
    /// Download the snapshot from this URL.
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    batch_size: Option<usize>,
    /// `external-id` or `composite`.
    #[arg(long, value_parser = parse_identity)]
    identity: Option<IdentityStrategy>,
    /// Look up existing documents one record at a time.
    #[arg(long)]
    no_prefetch: bool,
}

fn parse_identity(value: &str) -> Result<IdentityStrategy, String> {
    IdentityStrategy::parse(value)
        .ok_or_else(|| format!("unknown identity strategy {value:?}, expected external-id or composite"))
}

impl SyncArgs {
    fn apply(self, config: &mut SyncConfig) {
        if let Some(dir) = self.snapshot_dir {
            config.snapshot_dir = Some(dir);
            config.snapshot_archive = None;
        }
        if let Some(archive) = self.archive {
            config.snapshot_archive = Some(archive);
            config.snapshot_dir = None;
        }
        if let Some(url) = self.url {
            config.snapshot_url = url;
        }
        if let Some(size) = self.batch_size.filter(|&s| s > 0) {
            config.batch_size = size;
        }
        if let Some(identity) = self.identity {
            config.identity = identity;
        }
        if self.no_prefetch {
            config.prefetch_existing = false;
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            args.apply(&mut config);
            let summary = poisync_sync::run_sync_once(&config).await?;
            println!(
                "sync complete: run_id={} mode={} read={} inserts={} updates={} stale={} invalid={} failed_writes={}",
                summary.run_id,
                summary.mode.as_str(),
                summary.rows_read,
                summary.inserts,
                summary.updates,
                summary.discarded_stale,
                summary.discarded_invalid,
                summary.failed_writes
            );
        }
        Commands::Migrate => {
            let store = PgDocumentStore::connect(&config.database_url)
                .await
                .context("connecting to destination store")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Status => {
            let store = PgDocumentStore::connect(&config.database_url)
                .await
                .context("connecting to destination store")?;
            let count = store.count().await?;
            let latest = store.latest_updated_at().await?;
            println!(
                "documents={} latest_updated_at={}",
                count,
                latest.map(|ts| ts.to_rfc3339()).unwrap_or_else(|| "none".to_string())
            );
        }
    }

    Ok(())
}
