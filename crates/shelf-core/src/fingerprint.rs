//! Content Hasher.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::record::model::{CanonicalDocument, FieldValue};

const ENCODING_VERSION: &[u8] = b"shelf-fp-v1";

/// SHA-256 digest of a document's content fields, as 64 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint the content subset of a document.
    ///
    /// The natural key and volatile fields never enter the digest. Content is
    /// walked in key order and every element is length-prefixed, so no two
    /// distinct contents share an encoding.
    pub fn of(doc: &CanonicalDocument) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(ENCODING_VERSION);
        for (name, value) in &doc.content {
            write_bytes(&mut hasher, name.as_bytes());
            match value {
                FieldValue::Integer(n) => {
                    hasher.update([b'i']);
                    hasher.update(n.to_le_bytes());
                }
                FieldValue::Text(s) => {
                    hasher.update([b't']);
                    write_bytes(&mut hasher, s.as_bytes());
                }
                FieldValue::List(items) => {
                    hasher.update([b'l']);
                    hasher.update((items.len() as u64).to_le_bytes());
                    for item in items {
                        write_bytes(&mut hasher, item.as_bytes());
                    }
                }
            }
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a stored fingerprint.
    pub fn from_hex(s: &str) -> Option<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};

    use super::*;
    use crate::record::model::Collection;

    fn doc(key: &str, fields: &[(&str, FieldValue)]) -> CanonicalDocument {
        CanonicalDocument {
            collection: Collection::Memberships,
            key: key.to_string(),
            content: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            volatile: BTreeMap::new(),
        }
    }

    #[test]
    fn identical_content_hashes_identically_regardless_of_insertion_order() {
        let a = doc("m1", &[("club_id", "c1".into()), ("rating", FieldValue::Integer(4))]);
        let b = doc("m1", &[("rating", FieldValue::Integer(4)), ("club_id", "c1".into())]);
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
        assert_eq!(Fingerprint::of(&a).as_str().len(), 64);
    }

    #[test]
    fn every_mutation_changes_the_fingerprint() {
        let base = doc(
            "m1",
            &[
                ("club_id", "c1".into()),
                ("rating", FieldValue::Integer(4)),
                ("tags", FieldValue::List(vec!["a".into(), "b".into()])),
            ],
        );
        let mut seen = HashSet::new();
        seen.insert(Fingerprint::of(&base));

        let mut variants = Vec::new();
        for rating in -50i64..50 {
            if rating != 4 {
                let mut d = base.clone();
                d.content.insert("rating".into(), rating.into());
                variants.push(d);
            }
        }
        for i in 0..100 {
            let mut d = base.clone();
            d.content.insert("club_id".into(), format!("c{}", i + 2).as_str().into());
            variants.push(d);
        }
        let mut d = base.clone();
        d.content.insert("rating".into(), "4".into());
        variants.push(d);
        let mut d = base.clone();
        d.content.insert("tags".into(), FieldValue::List(vec!["ab".into()]));
        variants.push(d);
        let mut d = base.clone();
        d.content.insert("tags".into(), FieldValue::List(vec!["b".into(), "a".into()]));
        variants.push(d);
        let mut d = base.clone();
        d.content.remove("tags");
        variants.push(d);
        let mut d = base.clone();
        d.content.insert("note".into(), "".into());
        variants.push(d);

        let expected = variants.len() + 1;
        for v in &variants {
            seen.insert(Fingerprint::of(v));
        }
        assert_eq!(seen.len(), expected);
    }

    #[test]
    fn volatile_fields_and_key_are_excluded() {
        let a = doc("m1", &[("rating", FieldValue::Integer(4))]);
        let mut b = doc("m2", &[("rating", FieldValue::Integer(4))]);
        b.volatile.insert("fetched_at".into(), "2025-10-10T10:00:00".into());
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn from_hex_validates() {
        let fp = Fingerprint::of(&doc("m1", &[]));
        assert_eq!(Fingerprint::from_hex(fp.as_str()), Some(fp));
        assert!(Fingerprint::from_hex("abc").is_none());
        assert!(Fingerprint::from_hex(&"Z".repeat(64)).is_none());
    }
}
