//! Production document store on Redis.
//!
//! Layout, all under the configured namespace:
//!
//! | Key | Type | Holds |
//! |-----|------|-------|
//! | `{ns}:doc:{collection}:{key}` | hash | `data`, `fingerprint`, `revision`, `active`, `refs`, `footprint` |
//! | `{ns}:docs:{collection}` | set | every natural key ever written |
//! | `{ns}:active:{collection}` | set | natural keys of active documents |
//! | `{ns}:refs:{graph_key}` | set | ids of active documents supporting a graph key |
//! | `{ns}:pending` | set | ids of documents the graph is behind on |
//!
//! Writes run as Lua scripts so content, fingerprint, liveness, reverse index
//! and pending mark change together. The scripts touch `refs` keys that are
//! not declared up front, which ties this store to a non-clustered Redis.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::{AsyncCommands, Script};
use shelf_core::store::StoreResult;
use shelf_core::{
    Collection, DocumentCounts, DocumentId, DocumentStore, Fingerprint, GraphFootprint,
    PersistedDocument, WriteOutcome,
};
use tracing::{debug, warn};

use crate::client::{RedisError, RedisPool, RedisResult};

const PUT_SCRIPT: &str = r#"
local current = tonumber(redis.call('HGET', KEYS[1], 'revision') or '0')
if current ~= tonumber(ARGV[1]) then
  return -1
end
local old = redis.call('HGET', KEYS[1], 'refs')
if old then
  for _, ref in ipairs(cjson.decode(old)) do
    redis.call('SREM', ARGV[8] .. ref, ARGV[7])
  end
end
for _, ref in ipairs(cjson.decode(ARGV[5])) do
  redis.call('SADD', ARGV[8] .. ref, ARGV[7])
end
local revision = current + 1
redis.call('HSET', KEYS[1], 'data', ARGV[2], 'fingerprint', ARGV[3], 'revision', revision, 'active', ARGV[4], 'refs', ARGV[5])
if ARGV[4] == '1' then
  redis.call('SADD', KEYS[2], ARGV[6])
else
  redis.call('SREM', KEYS[2], ARGV[6])
end
redis.call('SADD', KEYS[3], ARGV[6])
redis.call('SADD', KEYS[4], ARGV[7])
return revision
"#;

const FOOTPRINT_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'fingerprint') ~= ARGV[1] then
  return 0
end
if redis.call('HGET', KEYS[1], 'active') ~= ARGV[2] then
  return 0
end
redis.call('HSET', KEYS[1], 'footprint', ARGV[3])
redis.call('SREM', KEYS[2], ARGV[4])
return 1
"#;

/// Fingerprint lookups are pipelined in chunks of this many keys.
const PIPELINE_CHUNK: usize = 500;

/// [`DocumentStore`] backed by Redis hashes and sets.
#[derive(Clone)]
pub struct RedisDocumentStore {
    pool: RedisPool,
    namespace: String,
    put_script: Script,
    footprint_script: Script,
}

impl RedisDocumentStore {
    pub fn new(pool: RedisPool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            put_script: Script::new(PUT_SCRIPT),
            footprint_script: Script::new(FOOTPRINT_SCRIPT),
        }
    }

    fn doc_key(&self, collection: Collection, key: &str) -> String {
        format!("{}:doc:{}:{}", self.namespace, collection, key)
    }

    fn all_key(&self, collection: Collection) -> String {
        format!("{}:docs:{}", self.namespace, collection)
    }

    fn active_key(&self, collection: Collection) -> String {
        format!("{}:active:{}", self.namespace, collection)
    }

    fn refs_prefix(&self) -> String {
        format!("{}:refs:", self.namespace)
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.namespace)
    }

    async fn load(&self, id: &DocumentId) -> RedisResult<Option<PersistedDocument>> {
        let mut conn = self.pool.clone();
        let key = self.doc_key(id.collection, &id.key);
        let fields: HashMap<String, String> = conn.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode(&key, fields).map(Some)
    }

    async fn put_raw(&self, doc: &PersistedDocument, expected_revision: u64) -> RedisResult<WriteOutcome> {
        let id = doc.id();
        let data = PersistedDocument {
            footprint: None,
            ..doc.clone()
        };
        let mut invocation = self.put_script.prepare_invoke();
        invocation
            .key(self.doc_key(doc.collection, &doc.key))
            .key(self.active_key(doc.collection))
            .key(self.all_key(doc.collection))
            .key(self.pending_key())
            .arg(expected_revision)
            .arg(serde_json::to_string(&data)?)
            .arg(doc.fingerprint.as_str())
            .arg(if doc.active { "1" } else { "0" })
            .arg(serde_json::to_string(&doc.refs)?)
            .arg(&doc.key)
            .arg(id.to_string())
            .arg(self.refs_prefix());

        let mut conn = self.pool.clone();
        let revision: i64 = invocation.invoke_async(&mut conn).await?;
        if revision < 0 {
            debug!(id = %id, expected_revision, "Revision moved, write refused");
            return Ok(WriteOutcome::Conflict);
        }
        Ok(WriteOutcome::Written {
            revision: revision as u64,
        })
    }

    async fn record_footprint_raw(&self, id: &DocumentId, footprint: &GraphFootprint) -> RedisResult<bool> {
        let mut invocation = self.footprint_script.prepare_invoke();
        invocation
            .key(self.doc_key(id.collection, &id.key))
            .key(self.pending_key())
            .arg(footprint.fingerprint.as_str())
            .arg(if footprint.active { "1" } else { "0" })
            .arg(serde_json::to_string(footprint)?)
            .arg(id.to_string());

        let mut conn = self.pool.clone();
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }

    async fn fingerprints_raw(&self, collection: Collection) -> RedisResult<HashMap<String, Fingerprint>> {
        let mut conn = self.pool.clone();
        let keys: Vec<String> = conn.smembers(self.active_key(collection)).await?;

        let mut fingerprints = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(PIPELINE_CHUNK) {
            let mut pipe = redis::pipe();
            for key in chunk {
                pipe.hget(self.doc_key(collection, key), "fingerprint");
            }
            let values: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
            for (key, value) in chunk.iter().zip(values) {
                match value.as_deref().and_then(Fingerprint::from_hex) {
                    Some(fp) => {
                        fingerprints.insert(key.clone(), fp);
                    }
                    None => {
                        return Err(RedisError::Corrupt {
                            key: self.doc_key(collection, key),
                            reason: "active document without a valid fingerprint".to_string(),
                        })
                    }
                }
            }
        }
        Ok(fingerprints)
    }

    async fn pending_raw(&self) -> RedisResult<Vec<DocumentId>> {
        let mut conn = self.pool.clone();
        let members: Vec<String> = conn.smembers(self.pending_key()).await?;
        let mut ids: Vec<DocumentId> = members
            .iter()
            .filter_map(|m| match m.parse::<DocumentId>() {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(member = %m, error = %e, "Ignoring malformed pending entry");
                    None
                }
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn supporters_raw(&self, graph_key: &str, excluding: &DocumentId) -> RedisResult<Vec<DocumentId>> {
        let mut conn = self.pool.clone();
        let members: Vec<String> = conn.smembers(format!("{}{}", self.refs_prefix(), graph_key)).await?;
        let mut ids: Vec<DocumentId> = members
            .iter()
            .filter_map(|m| match m.parse::<DocumentId>() {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(graph_key, member = %m, error = %e, "Ignoring malformed ref entry");
                    None
                }
            })
            .filter(|id| id != excluding)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn counts_raw(&self) -> RedisResult<DocumentCounts> {
        let mut conn = self.pool.clone();
        let mut counts = DocumentCounts::default();
        for collection in Collection::ALL {
            let all: usize = conn.scard(self.all_key(collection)).await?;
            let active: usize = conn.scard(self.active_key(collection)).await?;
            counts.active.insert(collection, active);
            counts.inactive.insert(collection, all.saturating_sub(active));
        }
        counts.pending = conn.scard(self.pending_key()).await?;
        Ok(counts)
    }
}

fn decode(key: &str, mut fields: HashMap<String, String>) -> RedisResult<PersistedDocument> {
    let corrupt = |reason: &str| RedisError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let data = fields.remove("data").ok_or_else(|| corrupt("missing data"))?;
    let mut doc: PersistedDocument = serde_json::from_str(&data)?;
    doc.revision = fields
        .get("revision")
        .and_then(|r| r.parse().ok())
        .ok_or_else(|| corrupt("missing revision"))?;
    doc.footprint = match fields.get("footprint") {
        Some(raw) => Some(serde_json::from_str(raw)?),
        None => None,
    };
    Ok(doc)
}

#[async_trait]
impl DocumentStore for RedisDocumentStore {
    async fn get(&self, id: &DocumentId) -> StoreResult<Option<PersistedDocument>> {
        Ok(self.load(id).await?)
    }

    async fn fingerprints(&self, collection: Collection) -> StoreResult<HashMap<String, Fingerprint>> {
        Ok(self.fingerprints_raw(collection).await?)
    }

    async fn put(&self, doc: &PersistedDocument, expected_revision: u64) -> StoreResult<WriteOutcome> {
        Ok(self.put_raw(doc, expected_revision).await?)
    }

    async fn record_footprint(&self, id: &DocumentId, footprint: &GraphFootprint) -> StoreResult<bool> {
        Ok(self.record_footprint_raw(id, footprint).await?)
    }

    async fn pending(&self) -> StoreResult<Vec<DocumentId>> {
        Ok(self.pending_raw().await?)
    }

    async fn supporters(&self, graph_key: &str, excluding: &DocumentId) -> StoreResult<Vec<DocumentId>> {
        Ok(self.supporters_raw(graph_key, excluding).await?)
    }

    async fn counts(&self) -> StoreResult<DocumentCounts> {
        Ok(self.counts_raw().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(footprint: Option<&str>) -> HashMap<String, String> {
        let doc = serde_json::json!({
            "collection": "memberships",
            "key": "ms1",
            "content": {"member_id": "m1", "club_id": "c1", "rating": 4},
            "fingerprint": "a".repeat(64),
            "active": true,
            "revision": 0,
            "refs": ["Member:m1"],
            "synced_at": "2025-10-10T10:00:00Z"
        });
        let mut fields = HashMap::from([
            ("data".to_string(), doc.to_string()),
            ("revision".to_string(), "3".to_string()),
            ("fingerprint".to_string(), "a".repeat(64)),
        ]);
        if let Some(fp) = footprint {
            fields.insert("footprint".to_string(), fp.to_string());
        }
        fields
    }

    #[test]
    fn decode_takes_revision_from_the_hash() {
        let doc = decode("shelf:doc:memberships:ms1", stored(None)).unwrap();
        assert_eq!(doc.revision, 3);
        assert_eq!(doc.key, "ms1");
        assert_eq!(doc.content.get("rating").and_then(|v| v.as_integer()), Some(4));
        assert!(doc.footprint.is_none());
        assert!(doc.is_pending());
    }

    #[test]
    fn decode_reads_footprint() {
        let footprint = serde_json::json!({
            "fingerprint": "a".repeat(64),
            "active": true,
            "nodes": [{"label": "Member", "key": "m1"}],
            "relationships": []
        });
        let doc = decode("k", stored(Some(&footprint.to_string()))).unwrap();
        let fp = doc.footprint.as_ref().unwrap();
        assert_eq!(fp.nodes.len(), 1);
        assert!(!doc.is_pending());
    }

    #[test]
    fn decode_rejects_missing_data() {
        let err = decode("k", HashMap::from([("revision".to_string(), "1".to_string())])).unwrap_err();
        assert!(matches!(err, RedisError::Corrupt { .. }));
    }
}
