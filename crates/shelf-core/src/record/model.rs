//! Source and canonical record models.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A source sheet, and the document-store collection it lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Members,
    Clubs,
    Books,
    Memberships,
    Reads,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Self::Members,
        Self::Clubs,
        Self::Books,
        Self::Memberships,
        Self::Reads,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Members => "members",
            Self::Clubs => "clubs",
            Self::Books => "books",
            Self::Memberships => "memberships",
            Self::Reads => "reads",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| format!("unknown collection '{}'", s))
    }
}

/// Identity of a document: collection plus natural key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId {
    pub collection: Collection,
    pub key: String,
}

impl DocumentId {
    pub fn new(collection: Collection, key: impl Into<String>) -> Self {
        Self {
            collection,
            key: key.into(),
        }
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.collection, self.key)
    }
}

impl FromStr for DocumentId {
    type Err = String;

    /// Parses `collection:key`; the key may itself contain colons.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (collection, key) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed document id '{}'", s))?;
        if key.is_empty() {
            return Err(format!("malformed document id '{}'", s));
        }
        Ok(Self::new(collection.parse()?, key))
    }
}

/// A raw row as produced by the source feed. No schema is enforced here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRecord {
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl SourceRecord {
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field)
    }

    /// Build a record from a JSON object; any other JSON value yields `None`.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }
}

/// A typed content value after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

/// Normalized form of a [`SourceRecord`].
///
/// `content` holds exactly the schema's content fields in sorted order;
/// `volatile` holds metadata such as `fetched_at` that never takes part in
/// fingerprinting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalDocument {
    pub collection: Collection,
    pub key: String,
    pub content: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub volatile: BTreeMap<String, FieldValue>,
}

impl CanonicalDocument {
    pub fn id(&self) -> DocumentId {
        DocumentId::new(self.collection, self.key.clone())
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.content.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(FieldValue::as_text)
    }
}
