//! `shelf status`

use anyhow::{Context, Result};
use colored::Colorize;
use shelf_core::{DocumentStore, GraphStore, ShelfConfig};
use shelf_graph::{GraphClient, Neo4jGraphStore};
use shelf_redis::RedisDocumentStore;

use crate::output;

pub async fn execute(config: &ShelfConfig) -> Result<()> {
    let pool = shelf_redis::init_pool(&config.redis.url)
        .await
        .context("Failed to connect to Redis")?;
    let documents = RedisDocumentStore::new(pool, config.redis.namespace.as_str());
    let counts = documents
        .counts()
        .await
        .context("Failed to read document counts")?;
    output::print_document_counts(&counts);

    println!();
    match GraphClient::connect(&config.neo4j).await {
        Ok(client) => {
            let counts = Neo4jGraphStore::new(client)
                .counts()
                .await
                .context("Failed to read graph counts")?;
            output::print_graph_counts(&counts);
        }
        Err(e) => {
            println!("{} {}", "Graph:".bold(), "unreachable".red());
            println!("  {}", format!("{:#}", e).dimmed());
        }
    }
    Ok(())
}
