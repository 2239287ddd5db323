//! Derived graph models.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::record::model::FieldValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeLabel {
    Member,
    Club,
    Book,
    Genre,
    Creator,
}

impl NodeLabel {
    pub const ALL: [NodeLabel; 5] = [
        Self::Member,
        Self::Club,
        Self::Book,
        Self::Genre,
        Self::Creator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "Member",
            Self::Club => "Club",
            Self::Book => "Book",
            Self::Genre => "Genre",
            Self::Creator => "Creator",
        }
    }
}

impl fmt::Display for NodeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| format!("unknown node label '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelType {
    MemberOfClub,
    UserRead,
    PrefersGenre,
    HasGenre,
    AuthoredBy,
}

impl RelType {
    pub const ALL: [RelType; 5] = [
        Self::MemberOfClub,
        Self::UserRead,
        Self::PrefersGenre,
        Self::HasGenre,
        Self::AuthoredBy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MemberOfClub => "MEMBER_OF_CLUB",
            Self::UserRead => "USER_READ",
            Self::PrefersGenre => "PREFERS_GENRE",
            Self::HasGenre => "HAS_GENRE",
            Self::AuthoredBy => "AUTHORED_BY",
        }
    }
}

impl fmt::Display for RelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown relationship type '{}'", s))
    }
}

/// Identity of a graph node: label plus the natural key it derives from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    pub label: NodeLabel,
    pub key: String,
}

impl NodeKey {
    pub fn new(label: NodeLabel, key: impl Into<String>) -> Self {
        Self {
            label,
            key: key.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.label, self.key)
    }
}

/// Identity of a relationship: both endpoints plus the type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationshipKey {
    pub from: NodeKey,
    pub rel_type: RelType,
    pub to: NodeKey,
}

impl fmt::Display for RelationshipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-[{}]->{}", self.from, self.rel_type, self.to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub key: NodeKey,
    pub properties: BTreeMap<String, FieldValue>,
    /// Set when the deriving document is the entity itself. An owned merge
    /// replaces the node's properties; an endpoint merge only ensures the
    /// node exists.
    #[serde(default)]
    pub owned: bool,
}

impl GraphNode {
    /// The node an entity document owns, carrying exactly `properties`.
    pub fn owned(key: NodeKey, properties: BTreeMap<String, FieldValue>) -> Self {
        Self {
            key,
            properties,
            owned: true,
        }
    }

    pub fn endpoint(key: NodeKey) -> Self {
        Self {
            key,
            properties: BTreeMap::new(),
            owned: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphRelationship {
    pub key: RelationshipKey,
    pub properties: BTreeMap<String, FieldValue>,
}

/// Every node and relationship one document implies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedGraph {
    pub nodes: BTreeMap<NodeKey, GraphNode>,
    pub relationships: BTreeMap<RelationshipKey, GraphRelationship>,
}

impl DerivedGraph {
    /// Add the node this document owns, merging properties when the key is
    /// already present.
    pub fn add_node(&mut self, key: NodeKey, properties: BTreeMap<String, FieldValue>) {
        let node = self
            .nodes
            .entry(key.clone())
            .or_insert_with(|| GraphNode::endpoint(key));
        node.owned = true;
        node.properties.extend(properties);
    }

    fn add_endpoint(&mut self, key: NodeKey) {
        self.nodes
            .entry(key.clone())
            .or_insert_with(|| GraphNode::endpoint(key));
    }

    pub fn add_relationship(
        &mut self,
        key: RelationshipKey,
        properties: BTreeMap<String, FieldValue>,
    ) {
        self.add_endpoint(key.from.clone());
        self.add_endpoint(key.to.clone());
        self.relationships
            .insert(key.clone(), GraphRelationship { key, properties });
    }

    pub fn node_keys(&self) -> BTreeSet<NodeKey> {
        self.nodes.keys().cloned().collect()
    }

    /// Keys of the nodes this document owns.
    pub fn owned_node_keys(&self) -> BTreeSet<NodeKey> {
        self.nodes
            .values()
            .filter(|n| n.owned)
            .map(|n| n.key.clone())
            .collect()
    }

    pub fn relationship_keys(&self) -> BTreeSet<RelationshipKey> {
        self.relationships.keys().cloned().collect()
    }

    /// Graph keys this document supports, for the store's reverse index.
    pub fn refs(&self) -> Vec<String> {
        self.nodes
            .keys()
            .map(NodeKey::to_string)
            .chain(self.relationships.keys().map(RelationshipKey::to_string))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.relationships.is_empty()
    }
}

/// What was last materialized for a document, and for which content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphFootprint {
    pub fingerprint: Fingerprint,
    /// Liveness of the document when this was recorded.
    pub active: bool,
    pub nodes: BTreeSet<NodeKey>,
    pub relationships: BTreeSet<RelationshipKey>,
}

impl GraphFootprint {
    pub fn of(fingerprint: Fingerprint, active: bool, graph: &DerivedGraph) -> Self {
        Self {
            fingerprint,
            active,
            nodes: graph.node_keys(),
            relationships: graph.relationship_keys(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.relationships.is_empty()
    }
}
