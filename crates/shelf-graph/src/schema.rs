//! Cypher statements.
//!
//! Labels, relationship types and property names cannot be query
//! parameters, so they are spliced in. Labels and types come from closed
//! enums; property names are checked by [`is_identifier`].

use shelf_core::{NodeLabel, RelType};

/// Property every node is merged on.
pub const KEY_PROPERTY: &str = "key";

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Idempotent uniqueness constraint for `label.property`.
pub fn constraint_statement(label: NodeLabel, property: &str) -> Option<String> {
    if !is_identifier(property) {
        return None;
    }
    Some(format!(
        "CREATE CONSTRAINT {}_{} IF NOT EXISTS FOR (n:{}) REQUIRE n.{} IS UNIQUE",
        label.as_str().to_lowercase(),
        property,
        label,
        property
    ))
}

/// Owned merges replace every property but the key; endpoint merges only
/// add.
pub fn merge_node_statement(label: NodeLabel, owned: bool) -> String {
    if owned {
        format!("MERGE (n:{} {{key: $key}}) SET n = $props, n.key = $key", label)
    } else {
        format!("MERGE (n:{} {{key: $key}}) SET n += $props", label)
    }
}

/// Returns one row when both endpoints exist and none otherwise.
pub fn merge_relationship_statement(from: NodeLabel, rel_type: RelType, to: NodeLabel) -> String {
    format!(
        "MATCH (a:{} {{key: $from}}) MATCH (b:{} {{key: $to}}) \
         MERGE (a)-[r:{}]->(b) SET r = $props RETURN count(r) AS merged",
        from, to, rel_type
    )
}

pub fn delete_relationship_statement(from: NodeLabel, rel_type: RelType, to: NodeLabel) -> String {
    format!(
        "MATCH (a:{} {{key: $from}})-[r:{}]->(b:{} {{key: $to}}) DELETE r",
        from, rel_type, to
    )
}

pub fn delete_node_statement(label: NodeLabel) -> String {
    format!("MATCH (n:{} {{key: $key}}) DETACH DELETE n", label)
}

pub const NODE_COUNTS: &str = "MATCH (n) UNWIND labels(n) AS label RETURN label, count(*) AS count";

pub const RELATIONSHIP_COUNTS: &str = "MATCH ()-[r]->() RETURN type(r) AS type, count(r) AS count";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_names_follow_label_and_property() {
        assert_eq!(
            constraint_statement(NodeLabel::Member, KEY_PROPERTY).unwrap(),
            "CREATE CONSTRAINT member_key IF NOT EXISTS FOR (n:Member) REQUIRE n.key IS UNIQUE"
        );
        assert!(constraint_statement(NodeLabel::Book, "key) DETACH DELETE n //").is_none());
    }

    #[test]
    fn owned_node_merge_replaces_properties() {
        assert_eq!(
            merge_node_statement(NodeLabel::Member, true),
            "MERGE (n:Member {key: $key}) SET n = $props, n.key = $key"
        );
        assert_eq!(
            merge_node_statement(NodeLabel::Genre, false),
            "MERGE (n:Genre {key: $key}) SET n += $props"
        );
    }

    #[test]
    fn relationship_statements_splice_type_and_labels() {
        let merge = merge_relationship_statement(NodeLabel::Member, RelType::UserRead, NodeLabel::Book);
        assert!(merge.contains("(a:Member {key: $from})"));
        assert!(merge.contains("[r:USER_READ]"));
        assert!(merge.contains("SET r = $props"));

        let delete = delete_relationship_statement(NodeLabel::Member, RelType::MemberOfClub, NodeLabel::Club);
        assert_eq!(
            delete,
            "MATCH (a:Member {key: $from})-[r:MEMBER_OF_CLUB]->(b:Club {key: $to}) DELETE r"
        );
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("key"));
        assert!(is_identifier("_id2"));
        assert!(!is_identifier("2id"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("a-b"));
    }
}
