//! [`GraphStore`] backed by Neo4j.

use std::collections::BTreeMap;

use async_trait::async_trait;
use neo4rs::{BoltMap, BoltString, BoltType, Query};
use shelf_core::{
    FieldValue, GraphCounts, GraphNode, GraphRelationship, GraphStore, NodeKey, NodeLabel,
    RelationshipKey, StoreError, StoreResult,
};
use tracing::debug;

use crate::client::GraphClient;
use crate::schema;

pub struct Neo4jGraphStore {
    client: GraphClient,
}

impl Neo4jGraphStore {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }
}

fn bolt_value(value: &FieldValue) -> BoltType {
    match value {
        FieldValue::Integer(n) => BoltType::from(*n),
        FieldValue::Text(s) => BoltType::from(s.as_str()),
        FieldValue::List(items) => BoltType::from(items.clone()),
    }
}

fn bolt_properties(properties: &BTreeMap<String, FieldValue>) -> BoltType {
    let mut map = BoltMap::new();
    for (name, value) in properties {
        map.put(BoltString::from(name.as_str()), bolt_value(value));
    }
    BoltType::Map(map)
}

/// Map a driver failure onto the retry taxonomy.
///
/// neo4rs reports server failures by status code inside the message, so
/// everything past the I/O check is a match on the rendered chain.
pub fn classify(err: &anyhow::Error) -> StoreError {
    let message = format!("{:#}", err);
    if err.chain().any(|cause| cause.is::<std::io::Error>()) {
        return StoreError::Connection(message);
    }
    if message.contains("TransientError") {
        StoreError::Unavailable(message)
    } else if message.contains("Security")
        || message.contains("Unauthorized")
        || message.contains("authentication")
    {
        StoreError::Auth(message)
    } else if message.contains("ConstraintValidation") || message.contains("Schema.") {
        StoreError::Constraint(message)
    } else if message.contains("Statement.") {
        StoreError::Invalid(message)
    } else if message.contains("timed out") {
        StoreError::Timeout(message)
    } else if message.contains("connection") || message.contains("pool") {
        StoreError::Connection(message)
    } else {
        StoreError::Other(message)
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn ensure_constraint(&self, label: NodeLabel, property: &str) -> StoreResult<()> {
        let statement = schema::constraint_statement(label, property).ok_or_else(|| {
            StoreError::Invalid(format!("'{}' is not a valid property name", property))
        })?;
        self.client
            .run(Query::new(statement), "ensure_constraint")
            .await
            .map_err(|e| classify(&e))?;
        debug!(%label, property, "Constraint ensured");
        Ok(())
    }

    async fn merge_node(&self, node: &GraphNode) -> StoreResult<()> {
        let query = Query::new(schema::merge_node_statement(node.key.label, node.owned))
            .param("key", node.key.key.as_str())
            .param("props", bolt_properties(&node.properties));
        self.client.run(query, "merge_node").await.map_err(|e| classify(&e))
    }

    async fn merge_relationship(&self, rel: &GraphRelationship) -> StoreResult<()> {
        let key = &rel.key;
        let query = Query::new(schema::merge_relationship_statement(
            key.from.label,
            key.rel_type,
            key.to.label,
        ))
        .param("from", key.from.key.as_str())
        .param("to", key.to.key.as_str())
        .param("props", bolt_properties(&rel.properties));

        let merged: Option<i64> = self
            .client
            .scalar(query, "merged", "merge_relationship")
            .await
            .map_err(|e| classify(&e))?;
        match merged {
            Some(n) if n > 0 => Ok(()),
            _ => Err(StoreError::MissingEndpoint(key.to_string())),
        }
    }

    async fn delete_relationship(&self, key: &RelationshipKey) -> StoreResult<()> {
        let query = Query::new(schema::delete_relationship_statement(
            key.from.label,
            key.rel_type,
            key.to.label,
        ))
        .param("from", key.from.key.as_str())
        .param("to", key.to.key.as_str());
        self.client
            .run(query, "delete_relationship")
            .await
            .map_err(|e| classify(&e))
    }

    async fn delete_node(&self, key: &NodeKey) -> StoreResult<()> {
        let query =
            Query::new(schema::delete_node_statement(key.label)).param("key", key.key.as_str());
        self.client.run(query, "delete_node").await.map_err(|e| classify(&e))
    }

    async fn counts(&self) -> StoreResult<GraphCounts> {
        let nodes = self
            .client
            .tally(schema::NODE_COUNTS, "label")
            .await
            .map_err(|e| classify(&e))?;
        let relationships = self
            .client
            .tally(schema::RELATIONSHIP_COUNTS, "type")
            .await
            .map_err(|e| classify(&e))?;
        Ok(GraphCounts {
            nodes,
            relationships,
        })
    }
}
