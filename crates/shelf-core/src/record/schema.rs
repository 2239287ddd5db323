//! Static schemas for every source collection.

use super::model::Collection;

/// How a raw value is coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer { min: i64, max: i64 },
    /// ISO date, or date-time when the source carries a time.
    Date,
    /// Ordered list of strings.
    TextList,
    /// Sorted, de-duplicated list of strings.
    TextSet,
}

/// What happens when a field is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Required,
    Optional,
    Default(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub presence: Presence,
    /// Carries a source image URL for the asset store.
    pub image: bool,
}

impl FieldSpec {
    const fn new(name: &'static str, kind: FieldKind, presence: Presence) -> Self {
        Self {
            name,
            kind,
            presence,
            image: false,
        }
    }

    const fn image(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Text,
            presence: Presence::Optional,
            image: true,
        }
    }
}

#[derive(Debug)]
pub struct RecordSchema {
    pub collection: Collection,
    pub key_field: &'static str,
    pub fields: &'static [FieldSpec],
    pub volatile: &'static [&'static str],
}

impl RecordSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn image_field(&self) -> Option<&'static str> {
        self.fields.iter().find(|f| f.image).map(|f| f.name)
    }

    /// Whether a source column is known to this schema at all.
    pub fn knows(&self, name: &str) -> bool {
        name == self.key_field || self.field(name).is_some() || self.volatile.contains(&name)
    }
}

const RATING: FieldKind = FieldKind::Integer { min: 0, max: 5 };
const YEAR: FieldKind = FieldKind::Integer { min: 0, max: 9999 };
const VOLATILE: &[&str] = &["fetched_at", "updated_at"];

static MEMBERS: RecordSchema = RecordSchema {
    collection: Collection::Members,
    key_field: "member_id",
    fields: &[
        FieldSpec::new("handle", FieldKind::Text, Presence::Required),
        FieldSpec::new("country", FieldKind::Text, Presence::Optional),
        FieldSpec::new("preferred_genres", FieldKind::TextSet, Presence::Optional),
        FieldSpec::image("avatar_url"),
    ],
    volatile: VOLATILE,
};

static CLUBS: RecordSchema = RecordSchema {
    collection: Collection::Clubs,
    key_field: "club_id",
    fields: &[
        FieldSpec::new("name", FieldKind::Text, Presence::Required),
        FieldSpec::new("preferred_genres", FieldKind::TextSet, Presence::Optional),
        FieldSpec::image("logo_url"),
    ],
    volatile: VOLATILE,
};

static BOOKS: RecordSchema = RecordSchema {
    collection: Collection::Books,
    key_field: "book_id",
    fields: &[
        FieldSpec::new("title", FieldKind::Text, Presence::Required),
        FieldSpec::new("authors", FieldKind::TextList, Presence::Optional),
        FieldSpec::new("genres", FieldKind::TextSet, Presence::Optional),
        FieldSpec::new("series", FieldKind::Text, Presence::Optional),
        FieldSpec::new("published_year", YEAR, Presence::Optional),
        FieldSpec::image("cover_url"),
    ],
    volatile: VOLATILE,
};

static MEMBERSHIPS: RecordSchema = RecordSchema {
    collection: Collection::Memberships,
    key_field: "membership_id",
    fields: &[
        FieldSpec::new("member_id", FieldKind::Text, Presence::Required),
        FieldSpec::new("club_id", FieldKind::Text, Presence::Required),
        FieldSpec::new("rating", RATING, Presence::Optional),
        FieldSpec::new("joined_on", FieldKind::Date, Presence::Optional),
    ],
    volatile: VOLATILE,
};

static READS: RecordSchema = RecordSchema {
    collection: Collection::Reads,
    key_field: "read_id",
    fields: &[
        FieldSpec::new("member_id", FieldKind::Text, Presence::Required),
        FieldSpec::new("book_id", FieldKind::Text, Presence::Required),
        FieldSpec::new("status", FieldKind::Text, Presence::Default("read")),
        FieldSpec::new("date_read", FieldKind::Date, Presence::Optional),
        FieldSpec::new("rating", RATING, Presence::Optional),
        FieldSpec::new("review", FieldKind::Text, Presence::Optional),
    ],
    volatile: VOLATILE,
};

/// Schema for a collection.
pub fn schema_for(collection: Collection) -> &'static RecordSchema {
    match collection {
        Collection::Members => &MEMBERS,
        Collection::Clubs => &CLUBS,
        Collection::Books => &BOOKS,
        Collection::Memberships => &MEMBERSHIPS,
        Collection::Reads => &READS,
    }
}
