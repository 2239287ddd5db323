//! Declarative document-to-graph mapping.
//!
//! Each collection lists the nodes and relationships its documents imply.
//! Adding a relationship type is a table edit; [`derive_graph`] never
//! branches on the collection.

use std::collections::BTreeMap;

use crate::record::model::{CanonicalDocument, Collection, FieldValue};

use super::model::{DerivedGraph, NodeKey, NodeLabel, RelType, RelationshipKey};

/// Where an endpoint's natural key comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// The document's own natural key.
    NaturalKey,
    /// A text field holding another entity's key.
    Field(&'static str),
    /// One endpoint per entry of a list field.
    EachOf(&'static str),
}

impl KeySource {
    fn resolve(&self, doc: &CanonicalDocument) -> Vec<String> {
        match self {
            Self::NaturalKey => vec![doc.key.clone()],
            Self::Field(name) => doc.text(name).map(str::to_string).into_iter().collect(),
            Self::EachOf(name) => doc
                .get(name)
                .and_then(FieldValue::as_list)
                .map(<[String]>::to_vec)
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EndpointRule {
    pub label: NodeLabel,
    pub key: KeySource,
}

#[derive(Debug, Clone, Copy)]
pub struct NodeRule {
    pub label: NodeLabel,
    pub key: KeySource,
    /// Content fields copied onto the node.
    pub properties: &'static [&'static str],
}

#[derive(Debug, Clone, Copy)]
pub struct RelationshipRule {
    pub rel_type: RelType,
    pub from: EndpointRule,
    pub to: EndpointRule,
    /// Content fields copied onto the relationship.
    pub properties: &'static [&'static str],
}

#[derive(Debug)]
pub struct CollectionMapping {
    pub collection: Collection,
    pub nodes: &'static [NodeRule],
    pub relationships: &'static [RelationshipRule],
}

const fn own(label: NodeLabel) -> EndpointRule {
    EndpointRule {
        label,
        key: KeySource::NaturalKey,
    }
}

const fn genres(field: &'static str) -> EndpointRule {
    EndpointRule {
        label: NodeLabel::Genre,
        key: KeySource::EachOf(field),
    }
}

pub static GRAPH_MAPPINGS: &[CollectionMapping] = &[
    CollectionMapping {
        collection: Collection::Members,
        nodes: &[NodeRule {
            label: NodeLabel::Member,
            key: KeySource::NaturalKey,
            properties: &["handle", "country"],
        }],
        relationships: &[RelationshipRule {
            rel_type: RelType::PrefersGenre,
            from: own(NodeLabel::Member),
            to: genres("preferred_genres"),
            properties: &[],
        }],
    },
    CollectionMapping {
        collection: Collection::Clubs,
        nodes: &[NodeRule {
            label: NodeLabel::Club,
            key: KeySource::NaturalKey,
            properties: &["name"],
        }],
        relationships: &[RelationshipRule {
            rel_type: RelType::PrefersGenre,
            from: own(NodeLabel::Club),
            to: genres("preferred_genres"),
            properties: &[],
        }],
    },
    CollectionMapping {
        collection: Collection::Books,
        nodes: &[NodeRule {
            label: NodeLabel::Book,
            key: KeySource::NaturalKey,
            properties: &["title", "series", "published_year"],
        }],
        relationships: &[
            RelationshipRule {
                rel_type: RelType::HasGenre,
                from: own(NodeLabel::Book),
                to: genres("genres"),
                properties: &[],
            },
            RelationshipRule {
                rel_type: RelType::AuthoredBy,
                from: own(NodeLabel::Book),
                to: EndpointRule {
                    label: NodeLabel::Creator,
                    key: KeySource::EachOf("authors"),
                },
                properties: &[],
            },
        ],
    },
    CollectionMapping {
        collection: Collection::Memberships,
        nodes: &[],
        relationships: &[RelationshipRule {
            rel_type: RelType::MemberOfClub,
            from: EndpointRule {
                label: NodeLabel::Member,
                key: KeySource::Field("member_id"),
            },
            to: EndpointRule {
                label: NodeLabel::Club,
                key: KeySource::Field("club_id"),
            },
            properties: &["rating", "joined_on"],
        }],
    },
    CollectionMapping {
        collection: Collection::Reads,
        nodes: &[],
        relationships: &[RelationshipRule {
            rel_type: RelType::UserRead,
            from: EndpointRule {
                label: NodeLabel::Member,
                key: KeySource::Field("member_id"),
            },
            to: EndpointRule {
                label: NodeLabel::Book,
                key: KeySource::Field("book_id"),
            },
            properties: &["status", "date_read", "rating"],
        }],
    },
];

/// Mapping rules for a collection.
pub fn mapping_for(collection: Collection) -> Option<&'static CollectionMapping> {
    GRAPH_MAPPINGS.iter().find(|m| m.collection == collection)
}

fn pick(doc: &CanonicalDocument, fields: &[&str]) -> BTreeMap<String, FieldValue> {
    fields
        .iter()
        .filter_map(|&f| doc.get(f).map(|v| (f.to_string(), v.clone())))
        .collect()
}

/// Evaluate the mapping table for one document.
///
/// Every relationship endpoint is added as a node, so the result is
/// referentially closed. Relationships with an unresolvable endpoint are
/// not derived.
pub fn derive_graph(doc: &CanonicalDocument) -> DerivedGraph {
    let mut graph = DerivedGraph::default();
    let Some(mapping) = mapping_for(doc.collection) else {
        return graph;
    };

    for rule in mapping.nodes {
        for key in rule.key.resolve(doc) {
            graph.add_node(NodeKey::new(rule.label, key), pick(doc, rule.properties));
        }
    }

    for rule in mapping.relationships {
        let sources = rule.from.key.resolve(doc);
        let targets = rule.to.key.resolve(doc);
        for from in &sources {
            for to in &targets {
                let key = RelationshipKey {
                    from: NodeKey::new(rule.from.label, from.clone()),
                    rel_type: rule.rel_type,
                    to: NodeKey::new(rule.to.label, to.clone()),
                };
                graph.add_relationship(key, pick(doc, rule.properties));
            }
        }
    }

    graph
}
