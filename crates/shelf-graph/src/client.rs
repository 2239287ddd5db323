//! Bolt connection pool and the few query shapes the store needs.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use neo4rs::{ConfigBuilder, Graph, Query, Row};
use serde::de::DeserializeOwned;
use shelf_core::Neo4jConfig;
use tracing::debug;

/// Rows fetched per round trip.
const FETCH_SIZE: usize = 200;

#[derive(Clone)]
pub struct GraphClient {
    graph: Graph,
}

fn bolt_config(config: &Neo4jConfig) -> Result<neo4rs::Config> {
    ConfigBuilder::default()
        .uri(&config.uri)
        .user(&config.user)
        .password(&config.password)
        .db(config.database.as_str())
        .max_connections(config.max_connections)
        .fetch_size(FETCH_SIZE)
        .build()
        .with_context(|| format!("Invalid Neo4j settings for {}", config.uri))
}

impl GraphClient {
    /// Open the pool and prove the server answers.
    ///
    /// neo4rs opens connections lazily, so without the ping an unreachable
    /// server would only surface on the first merge.
    pub async fn connect(config: &Neo4jConfig) -> Result<Self> {
        let graph = Graph::connect(bolt_config(config)?)
            .await
            .with_context(|| format!("Failed to open Neo4j pool for {}", config.uri))?;
        let client = Self { graph };
        client.ping().await?;
        debug!(uri = %config.uri, database = %config.database, "Connected to Neo4j");
        Ok(client)
    }

    pub async fn ping(&self) -> Result<()> {
        self.run(Query::new("RETURN 1".to_string()), "ping").await
    }

    /// Run a write statement, discarding any result. `operation` names the
    /// statement in the error chain.
    pub async fn run(&self, query: Query, operation: &str) -> Result<()> {
        self.graph
            .run(query)
            .await
            .with_context(|| format!("Neo4j {} failed", operation))
    }

    pub async fn rows(&self, query: Query, operation: &str) -> Result<Vec<Row>> {
        let mut stream = self
            .graph
            .execute(query)
            .await
            .with_context(|| format!("Neo4j {} failed", operation))?;
        let mut rows = Vec::new();
        while let Some(row) = stream
            .next()
            .await
            .with_context(|| format!("Neo4j {} result stream broke", operation))?
        {
            rows.push(row);
        }
        Ok(rows)
    }

    /// `field` of the first row, or `None` when the statement matched nothing.
    pub async fn scalar<T: DeserializeOwned>(&self, query: Query, field: &str, operation: &str) -> Result<Option<T>> {
        self.rows(query, operation)
            .await?
            .into_iter()
            .next()
            .map(|row| {
                row.get::<T>(field)
                    .map_err(|e| anyhow!("Neo4j {} returned no '{}': {:?}", operation, field, e))
            })
            .transpose()
    }

    /// Name/count pairs from a statement returning `name_field` and `count`.
    /// Rows missing either column are skipped.
    pub async fn tally(&self, statement: &str, name_field: &str) -> Result<BTreeMap<String, usize>> {
        let rows = self.rows(Query::new(statement.to_string()), "count").await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let name: String = row.get(name_field).ok()?;
                let count: i64 = row.get("count").ok()?;
                Some((name, usize::try_from(count).unwrap_or(0)))
            })
            .collect())
    }
}
