//! Best-effort image copy into the blob store.

use std::sync::Arc;

use shelf_core::record::schema::schema_for;
use shelf_core::{BlobStore, ExternalSystem, PersistedDocument, RetryPolicy, SyncResult};
use tracing::debug;

pub struct AssetSync {
    blobs: Arc<dyn BlobStore>,
    policy: RetryPolicy,
}

impl AssetSync {
    pub fn new(blobs: Arc<dyn BlobStore>, policy: RetryPolicy) -> Self {
        Self { blobs, policy }
    }

    /// Copy the document's image, if its collection has one and it is set.
    ///
    /// Returns the stored reference URL.
    pub async fn sync(&self, doc: &PersistedDocument) -> SyncResult<Option<String>> {
        let Some(field) = schema_for(doc.collection).image_field() else {
            return Ok(None);
        };
        let Some(source) = doc.content.get(field).and_then(|v| v.as_text()) else {
            return Ok(None);
        };

        let destination = destination(doc, source);
        let blobs = self.blobs.clone();
        let reference = self
            .policy
            .call(ExternalSystem::BlobStore, "put_from_url", || {
                let blobs = blobs.clone();
                let source = source.to_string();
                let destination = destination.clone();
                async move { blobs.put_from_url(&source, &destination).await }
            })
            .await?;
        debug!(collection = %doc.collection, key = %doc.key, reference = %reference, "Asset stored");
        Ok(Some(reference))
    }
}

/// `{collection}/{key}{.ext}`, the extension taken from the source URL path.
fn destination(doc: &PersistedDocument, source: &str) -> String {
    let path = source.split(['?', '#']).next().unwrap_or_default();
    let file = path.rsplit('/').next().unwrap_or_default();
    let extension = file
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| (1..=5).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    match extension {
        Some(ext) => format!("{}/{}.{}", doc.collection, doc.key, ext),
        None => format!("{}/{}", doc.collection, doc.key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_core::store::memory::MemoryBlobStore;
    use shelf_core::{normalize, Collection, SourceRecord, StagedRecord, StoreError, SyncError};

    fn doc(value: serde_json::Value) -> PersistedDocument {
        let record = SourceRecord::from_json(value).unwrap();
        let staged = StagedRecord::new(normalize(Collection::Members, &record).unwrap());
        PersistedDocument::from_staged(&staged)
    }

    #[test]
    fn destination_keeps_a_sane_extension() {
        let member = doc(serde_json::json!({"member_id": "m1", "handle": "ada"}));
        assert_eq!(
            destination(&member, "https://cdn.example.com/a/b/Photo.PNG?size=2"),
            "members/m1.png"
        );
        assert_eq!(destination(&member, "https://cdn.example.com/avatar"), "members/m1");
        assert_eq!(destination(&member, "https://x.io/a.b/c"), "members/m1");
    }

    #[tokio::test]
    async fn copies_image_field_only_when_present() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let assets = AssetSync::new(blobs.clone(), RetryPolicy::immediate(2));

        let plain = doc(serde_json::json!({"member_id": "m1", "handle": "ada"}));
        assert_eq!(assets.sync(&plain).await.unwrap(), None);

        let pictured = doc(serde_json::json!({
            "member_id": "m2",
            "handle": "bob",
            "avatar_url": "https://cdn.example.com/bob.jpg",
        }));
        let reference = assets.sync(&pictured).await.unwrap();
        assert_eq!(reference.as_deref(), Some("memory://members/m2.jpg"));
        assert_eq!(
            blobs.objects().get("members/m2.jpg").map(String::as_str),
            Some("https://cdn.example.com/bob.jpg")
        );
    }

    #[tokio::test]
    async fn failures_are_reported_to_the_caller() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs
            .faults()
            .fail_next("put_from_url", StoreError::Auth("expired token".into()));
        let assets = AssetSync::new(blobs.clone(), RetryPolicy::immediate(2));
        let pictured = doc(serde_json::json!({
            "member_id": "m2",
            "handle": "bob",
            "avatar_url": "https://cdn.example.com/bob.jpg",
        }));
        let err = assets.sync(&pictured).await.unwrap_err();
        assert!(matches!(err, SyncError::ExternalSystemRejected { system: ExternalSystem::BlobStore, .. }));
        assert!(blobs.objects().is_empty());
    }
}
