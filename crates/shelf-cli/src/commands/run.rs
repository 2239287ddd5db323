//! `shelf run`

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use shelf_core::{RetryPolicy, ShelfConfig, SourceFeed};
use shelf_graph::{GraphClient, Neo4jGraphStore};
use shelf_redis::RedisDocumentStore;
use shelf_sync::SyncEngine;
use tracing::{info, warn};

use crate::{feed, output};

#[derive(Args)]
pub struct RunArgs {
    /// Directory holding `<collection>.json` extracts
    #[arg(short, long)]
    pub source: PathBuf,

    /// Write the run report as JSON to this path
    #[arg(long)]
    pub report: Option<PathBuf>,
}

pub async fn execute(args: RunArgs, config: &ShelfConfig) -> Result<ExitCode> {
    let feeds: Vec<Box<dyn SourceFeed>> = feed::discover(&args.source)
        .into_iter()
        .map(|feed| Box::new(feed) as Box<dyn SourceFeed>)
        .collect();
    if feeds.is_empty() {
        bail!("No collection extracts found in {}", args.source.display());
    }
    info!(source = %args.source.display(), collections = feeds.len(), "Source extracts found");

    let pool = shelf_redis::init_pool(&config.redis.url)
        .await
        .context("Failed to connect to Redis")?;
    let documents = Arc::new(RedisDocumentStore::new(pool, config.redis.namespace.as_str()));
    let client = GraphClient::connect(&config.neo4j)
        .await
        .context("Failed to connect to Neo4j")?;
    let graph = Arc::new(Neo4jGraphStore::new(client));

    let engine = SyncEngine::new(
        documents,
        graph,
        config.sync.clone(),
        RetryPolicy::from_config(&config.retry),
    );

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current batch");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let report = engine.run(&feeds, &cancel).await;
    output::print_report(&report);

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }

    Ok(ExitCode::from(u8::try_from(report.exit_code()).unwrap_or(1)))
}
