//! Record Normalizer.
//!
//! The single point where untyped source rows become [`CanonicalDocument`]s.
//! Everything downstream works on the typed form only.

mod coerce;
pub mod model;
pub mod schema;

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{SyncError, SyncResult};
use model::{CanonicalDocument, Collection, FieldValue, SourceRecord};
use schema::{schema_for, Presence};

/// Natural key of a source row, if it can be read at all.
pub fn natural_key(collection: Collection, record: &SourceRecord) -> Option<String> {
    let schema = schema_for(collection);
    record
        .get(schema.key_field)
        .and_then(|raw| coerce::text(raw).ok().flatten())
}

/// Normalize a source row against its collection schema.
///
/// Absent optional fields are omitted, defaulted fields are filled in and
/// unknown columns are dropped. Fails with [`SyncError::SchemaViolation`] when
/// the key is missing, a required field is absent, or a value cannot be coerced.
pub fn normalize(collection: Collection, record: &SourceRecord) -> SyncResult<CanonicalDocument> {
    let schema = schema_for(collection);

    let key = natural_key(collection, record).ok_or_else(|| SyncError::SchemaViolation {
        collection,
        key: None,
        field: schema.key_field.to_string(),
        reason: "is required".to_string(),
    })?;

    let violation = |field: &str, reason: String| SyncError::SchemaViolation {
        collection,
        key: Some(key.clone()),
        field: field.to_string(),
        reason,
    };

    let mut content = BTreeMap::new();
    for spec in schema.fields {
        let raw = record.get(spec.name).unwrap_or(&serde_json::Value::Null);
        let value = coerce::coerce(spec.kind, raw).map_err(|reason| violation(spec.name, reason))?;

        let value = match (value, spec.presence) {
            (Some(value), _) => value,
            (None, Presence::Optional) => continue,
            (None, Presence::Required) => {
                return Err(violation(spec.name, "is required".to_string()))
            }
            (None, Presence::Default(default)) => {
                coerce::coerce(spec.kind, &serde_json::Value::from(default))
                    .ok()
                    .flatten()
                    .ok_or_else(|| violation(spec.name, format!("bad default '{}'", default)))?
            }
        };
        content.insert(spec.name.to_string(), value);
    }

    let mut volatile = BTreeMap::new();
    for name in schema.volatile {
        if let Some(value) = record.get(name).and_then(|raw| coerce::text(raw).ok().flatten()) {
            volatile.insert((*name).to_string(), FieldValue::Text(value));
        }
    }

    for name in record.fields.keys().filter(|name| !schema.knows(name)) {
        debug!(collection = %collection, key = %key, field = %name, "Dropping unknown field");
    }

    Ok(CanonicalDocument {
        collection,
        key,
        content,
        volatile,
    })
}
