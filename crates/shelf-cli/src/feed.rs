//! Source feeds read from a directory of JSON extracts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use shelf_core::{Collection, SourceFeed, SourceRecord, StoreError, StoreResult};

/// One `<collection>.json` file holding an array of row objects.
#[derive(Debug, Clone)]
pub struct JsonFileFeed {
    collection: Collection,
    path: PathBuf,
}

impl JsonFileFeed {
    pub fn new(collection: Collection, path: impl Into<PathBuf>) -> Self {
        Self {
            collection,
            path: path.into(),
        }
    }

    async fn rows(&self) -> StoreResult<Vec<serde_json::Value>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            let message = format!("{}: {}", self.path.display(), e);
            match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    StoreError::Invalid(message)
                }
                _ => StoreError::Connection(message),
            }
        })?;
        match serde_json::from_str::<serde_json::Value>(&content)? {
            serde_json::Value::Array(rows) => Ok(rows),
            _ => Err(StoreError::Serialization(format!(
                "{}: expected a JSON array of rows",
                self.path.display()
            ))),
        }
    }
}

#[async_trait]
impl SourceFeed for JsonFileFeed {
    fn collection(&self) -> Collection {
        self.collection
    }

    /// Every element counts, so non-object rows surface as a short feed.
    async fn total_count(&self) -> StoreResult<usize> {
        Ok(self.rows().await?.len())
    }

    async fn fetch(&self) -> StoreResult<Vec<SourceRecord>> {
        Ok(self
            .rows()
            .await?
            .into_iter()
            .filter_map(SourceRecord::from_json)
            .collect())
    }
}

/// Feeds for every collection with an extract in `dir`, in collection order.
pub fn discover(dir: &Path) -> Vec<JsonFileFeed> {
    Collection::ALL
        .into_iter()
        .map(|collection| JsonFileFeed::new(collection, dir.join(format!("{}.json", collection))))
        .filter(|feed| feed.path.is_file())
        .collect()
}
