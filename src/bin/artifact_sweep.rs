//! Remove artifact blobs no plan references.
//!
//! Dry run by default; pass `--apply` to delete.
//!
//! Usage: artifact-sweep [--apply]

use std::sync::Arc;

use anyhow::{bail, Context};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trip_planner::artifact::{ArtifactGuard, FsBlobStore, TextPdfRenderer};
use trip_planner::clock::SystemClock;
use trip_planner::config::Config;
use trip_planner::store::SqliteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut apply = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--apply" => apply = true,
            "--dry-run" => apply = false,
            "-h" | "--help" => {
                println!("Usage: artifact-sweep [--apply | --dry-run]");
                return Ok(());
            }
            other => bail!("Unknown argument: {}", other),
        }
    }

    let config = Config::from_env().context("Failed to load configuration")?;
    let store = Arc::new(
        SqliteStore::open(&config.database_path).context("Failed to open database")?,
    );
    let guard = ArtifactGuard::new(
        store,
        Arc::new(FsBlobStore::new(&config.artifact_dir)),
        Arc::new(TextPdfRenderer),
        Arc::new(SystemClock),
    );

    let report = guard
        .sweep_orphans(!apply)
        .await
        .context("Artifact sweep failed")?;

    println!(
        "Scanned {} blobs, {} referenced by plans, {} orphaned",
        report.scanned,
        report.referenced,
        report.orphans.len()
    );
    for orphan in &report.orphans {
        println!("  {}", orphan);
    }
    if apply {
        println!("Deleted {} orphaned blobs", report.deleted);
    } else if !report.orphans.is_empty() {
        println!("Dry run; re-run with --apply to delete");
    }
    Ok(())
}
