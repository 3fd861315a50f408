// catalogtool/src/import/entities.rs
//! Per-entity schema: table, natural key, accepted fields, external aliases and
//! parent relations. Everything entity-specific lives here so the importer and
//! the validator stay generic.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::models::display_value;
use crate::store::{EntityRecord, KeyField, ParentRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text { max_len: usize },
    Email,
    Url,
    Integer,
    Boolean,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentSpec {
    pub relation: &'static str,
    pub table: &'static str,
    pub column: &'static str,
    pub case_insensitive: bool,
    /// Column of the child that receives the parent's id.
    pub assign_to: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
    /// Written to the table as-is. Parent-name fields are resolved instead.
    pub column: bool,
    pub parent: Option<ParentSpec>,
}

impl FieldSpec {
    const fn optional(name: &'static str, ty: FieldType) -> Self {
        Self { name, ty, required: false, column: true, parent: None }
    }

    const fn required(name: &'static str, ty: FieldType) -> Self {
        Self { name, ty, required: true, column: true, parent: None }
    }

    const fn resolves(self, parent: ParentSpec) -> Self {
        Self { parent: Some(parent), ..self }
    }

    const fn lookup_only(self) -> Self {
        Self { column: false, ..self }
    }
}

const fn text(max_len: usize) -> FieldType {
    FieldType::Text { max_len }
}

const AUTHOR_BY_NAME: ParentSpec = ParentSpec {
    relation: "author",
    table: "authors",
    column: "name",
    case_insensitive: true,
    assign_to: Some("author_id"),
};

const REFERENCE_BY_TITLE: ParentSpec = ParentSpec {
    relation: "reference",
    table: "references",
    column: "title",
    case_insensitive: true,
    assign_to: Some("reference_id"),
};

const QUOTE_BY_ID: ParentSpec = ParentSpec {
    relation: "quote",
    table: "quotes",
    column: "id",
    case_insensitive: false,
    assign_to: None,
};

const AUTHOR_FIELDS: &[FieldSpec] = &[
    FieldSpec::optional("id", FieldType::Integer),
    FieldSpec::required("name", text(255)),
    FieldSpec::optional("description", text(5000)),
    FieldSpec::optional("image_url", FieldType::Url),
];

const REFERENCE_FIELDS: &[FieldSpec] = &[
    FieldSpec::optional("id", FieldType::Integer),
    FieldSpec::required("title", text(255)),
    FieldSpec::optional("type", text(50)),
    FieldSpec::optional("description", text(5000)),
    FieldSpec::optional("url", FieldType::Url),
];

const COLLECTION_FIELDS: &[FieldSpec] = &[
    FieldSpec::optional("id", FieldType::Integer),
    FieldSpec::required("name", text(255)),
    FieldSpec::optional("description", text(2000)),
    FieldSpec::optional("is_public", FieldType::Boolean),
];

const QUOTE_FIELDS: &[FieldSpec] = &[
    FieldSpec::optional("id", FieldType::Integer),
    FieldSpec::required("text", text(5000)),
    FieldSpec::optional("author", text(255)).resolves(AUTHOR_BY_NAME).lookup_only(),
    FieldSpec::optional("reference", text(255)).resolves(REFERENCE_BY_TITLE).lookup_only(),
    FieldSpec::optional("language", text(10)),
    FieldSpec::optional("created_at", FieldType::Timestamp),
];

const TAG_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("quote_id", FieldType::Integer).resolves(QUOTE_BY_ID),
    FieldSpec::required("tag", text(100)),
];

const LIKE_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("quote_id", FieldType::Integer).resolves(QUOTE_BY_ID),
    FieldSpec::required("user_id", text(255)),
    FieldSpec::optional("created_at", FieldType::Timestamp),
];

const VIEW_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("quote_id", FieldType::Integer).resolves(QUOTE_BY_ID),
    FieldSpec::optional("session_id", text(255)),
    FieldSpec::required("viewed_at", FieldType::Timestamp),
];

const SESSION_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("id", text(255)),
    FieldSpec::optional("user_agent", text(1000)),
    FieldSpec::optional("ip_address", text(64)),
    FieldSpec::optional("created_at", FieldType::Timestamp),
    FieldSpec::optional("last_seen_at", FieldType::Timestamp),
];

const MESSAGE_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("email", FieldType::Email),
    FieldSpec::required("body", text(5000)),
    FieldSpec::optional("name", text(255)),
    FieldSpec::optional("created_at", FieldType::Timestamp),
];

const AUTHORS_KEY: &[KeyField] = &[KeyField::folded("name")];
const REFERENCES_KEY: &[KeyField] = &[KeyField::folded("title")];
const COLLECTIONS_KEY: &[KeyField] = &[KeyField::exact("name")];
const QUOTES_KEY: &[KeyField] = &[KeyField::exact("text")];
const TAGS_KEY: &[KeyField] = &[KeyField::exact("quote_id"), KeyField::folded("tag")];
const LIKES_KEY: &[KeyField] = &[KeyField::exact("quote_id"), KeyField::exact("user_id")];
const VIEWS_KEY: &[KeyField] = &[
    KeyField::exact("quote_id"),
    KeyField::exact("session_id"),
    KeyField::exact("viewed_at"),
];
const SESSIONS_KEY: &[KeyField] = &[KeyField::exact("id")];
const MESSAGES_KEY: &[KeyField] = &[KeyField::folded("email"), KeyField::exact("body")];

/// Importable entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Authors,
    References,
    Collections,
    Quotes,
    Tags,
    Likes,
    Views,
    Sessions,
    Messages,
}

impl EntityKind {
    /// Parents before children before link/activity tables.
    pub const ORDERED: [EntityKind; 9] = [
        EntityKind::Authors,
        EntityKind::References,
        EntityKind::Collections,
        EntityKind::Quotes,
        EntityKind::Tags,
        EntityKind::Likes,
        EntityKind::Views,
        EntityKind::Sessions,
        EntityKind::Messages,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Authors => "authors",
            EntityKind::References => "references",
            EntityKind::Collections => "collections",
            EntityKind::Quotes => "quotes",
            EntityKind::Tags => "tags",
            EntityKind::Likes => "likes",
            EntityKind::Views => "views",
            EntityKind::Sessions => "sessions",
            EntityKind::Messages => "messages",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Tags => "quote_tags",
            other => other.as_str(),
        }
    }

    pub fn natural_key(&self) -> &'static [KeyField] {
        match self {
            EntityKind::Authors => AUTHORS_KEY,
            EntityKind::References => REFERENCES_KEY,
            EntityKind::Collections => COLLECTIONS_KEY,
            EntityKind::Quotes => QUOTES_KEY,
            EntityKind::Tags => TAGS_KEY,
            EntityKind::Likes => LIKES_KEY,
            EntityKind::Views => VIEWS_KEY,
            EntityKind::Sessions => SESSIONS_KEY,
            EntityKind::Messages => MESSAGES_KEY,
        }
    }

    pub fn fields(&self) -> &'static [FieldSpec] {
        match self {
            EntityKind::Authors => AUTHOR_FIELDS,
            EntityKind::References => REFERENCE_FIELDS,
            EntityKind::Collections => COLLECTION_FIELDS,
            EntityKind::Quotes => QUOTE_FIELDS,
            EntityKind::Tags => TAG_FIELDS,
            EntityKind::Likes => LIKE_FIELDS,
            EntityKind::Views => VIEW_FIELDS,
            EntityKind::Sessions => SESSION_FIELDS,
            EntityKind::Messages => MESSAGE_FIELDS,
        }
    }

    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields().iter().find(|f| f.name == name)
    }

    /// External field name → internal field name.
    fn aliases(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            EntityKind::Authors => &[
                ("author", "name"),
                ("author_name", "name"),
                ("bio", "description"),
                ("image", "image_url"),
            ],
            EntityKind::References => &[
                ("name", "title"),
                ("reference", "title"),
                ("source", "title"),
                ("reference_type", "type"),
                ("link", "url"),
            ],
            EntityKind::Collections => &[
                ("title", "name"),
                ("public", "is_public"),
            ],
            EntityKind::Quotes => &[
                ("quote", "text"),
                ("content", "text"),
                ("author_name", "author"),
                ("source", "reference"),
                ("reference_title", "reference"),
                ("lang", "language"),
            ],
            EntityKind::Tags => &[("quote", "quote_id"), ("name", "tag")],
            EntityKind::Likes => &[
                ("quote", "quote_id"),
                ("user", "user_id"),
                ("liked_at", "created_at"),
            ],
            EntityKind::Views => &[
                ("quote", "quote_id"),
                ("session", "session_id"),
                ("timestamp", "viewed_at"),
            ],
            EntityKind::Sessions => &[
                ("session_id", "id"),
                ("ip", "ip_address"),
            ],
            EntityKind::Messages => &[
                ("message", "body"),
                ("content", "body"),
                ("sender_email", "email"),
            ],
        }
    }

    /// Renames aliased fields, trims strings, coerces numeric/boolean strings
    /// (CSV cells arrive as text) and drops empty values. Canonical names win
    /// over aliases. Non-object values are returned untouched.
    pub fn normalize(&self, raw: &Value) -> Value {
        let Value::Object(source) = raw else {
            return raw.clone();
        };

        let mut out = Map::new();
        let mut aliased = Vec::new();
        for (key, value) in source {
            let key = key.trim().to_lowercase();
            let Some(value) = clean(value) else { continue };
            match self.aliases().iter().find(|(alias, _)| *alias == key) {
                Some((_, internal)) if self.field(&key).is_none() => aliased.push((*internal, value)),
                _ => {
                    out.insert(key, value);
                }
            }
        }
        for (internal, value) in aliased {
            out.entry(internal.to_string()).or_insert(value);
        }

        for (name, value) in out.iter_mut() {
            if let Some(spec) = self.field(name) {
                coerce(spec.ty, value);
            }
        }
        Value::Object(out)
    }

    /// Builds the insertable record from a normalized, validated row.
    pub fn to_record(&self, row: &Map<String, Value>) -> EntityRecord {
        let mut columns = Map::new();
        let mut parents = Vec::new();
        for spec in self.fields() {
            let Some(value) = row.get(spec.name).filter(|v| !v.is_null()) else {
                continue;
            };
            if spec.column {
                columns.insert(spec.name.to_string(), value.clone());
            }
            if let Some(parent) = spec.parent {
                parents.push(ParentRef {
                    relation: parent.relation,
                    table: parent.table,
                    column: parent.column,
                    value: display_value(value),
                    case_insensitive: parent.case_insensitive,
                    assign_to: parent.assign_to,
                });
            }
        }
        EntityRecord {
            table: self.table(),
            key: self.natural_key(),
            columns,
            parents,
        }
    }
}

fn clean(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(Value::String(trimmed.to_string()))
            }
        }
        other => Some(other.clone()),
    }
}

fn coerce(ty: FieldType, value: &mut Value) {
    let Value::String(s) = value else { return };
    match ty {
        FieldType::Integer => {
            if let Ok(n) = s.parse::<i64>() {
                *value = Value::from(n);
            }
        }
        FieldType::Boolean => match s.to_lowercase().as_str() {
            "true" | "yes" | "1" => *value = Value::Bool(true),
            "false" | "no" | "0" => *value = Value::Bool(false),
            _ => {}
        },
        _ => {}
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "authors" | "author" => Ok(EntityKind::Authors),
            "references" | "reference" => Ok(EntityKind::References),
            "collections" | "collection" => Ok(EntityKind::Collections),
            "quotes" | "quote" => Ok(EntityKind::Quotes),
            "tags" | "tag" | "quote_tags" => Ok(EntityKind::Tags),
            "likes" | "like" => Ok(EntityKind::Likes),
            "views" | "view" => Ok(EntityKind::Views),
            "sessions" | "session" => Ok(EntityKind::Sessions),
            "messages" | "message" => Ok(EntityKind::Messages),
            _ => Err(format!("unknown entity kind '{}'", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_order_puts_parents_first() {
        let position = |k: EntityKind| EntityKind::ORDERED.iter().position(|x| *x == k);
        assert!(position(EntityKind::Authors) < position(EntityKind::Quotes));
        assert!(position(EntityKind::References) < position(EntityKind::Quotes));
        assert!(position(EntityKind::Quotes) < position(EntityKind::Tags));
        assert!(position(EntityKind::Quotes) < position(EntityKind::Views));
    }

    #[test]
    fn test_normalize_applies_aliases_and_canonical_wins() {
        let row = json!({ "Quote": "  Know thyself ", "author_name": "Socrates", "content": "ignored" , "text": "Know thyself" });
        let normalized = EntityKind::Quotes.normalize(&row);
        assert_eq!(normalized["text"], json!("Know thyself"));
        assert_eq!(normalized["author"], json!("Socrates"));
        assert!(normalized.get("quote").is_none());
    }

    #[test]
    fn test_normalize_coerces_csv_strings() {
        let row = json!({ "quote_id": "12", "tag": "stoic", "extra": "" });
        let normalized = EntityKind::Tags.normalize(&row);
        assert_eq!(normalized["quote_id"], json!(12));
        assert!(normalized.get("extra").is_none());

        let collection = EntityKind::Collections.normalize(&json!({ "name": "Favs", "public": "yes" }));
        assert_eq!(collection["is_public"], json!(true));
    }

    #[test]
    fn test_to_record_resolves_parents_instead_of_writing_names() {
        let row = json!({ "text": "Hello", "author": "Ada", "language": "en" });
        let record = EntityKind::Quotes.to_record(row.as_object().unwrap());

        assert_eq!(record.table, "quotes");
        assert!(record.columns.get("author").is_none());
        assert_eq!(record.columns["language"], json!("en"));
        assert_eq!(record.parents.len(), 1);
        assert_eq!(record.parents[0].relation, "author");
        assert_eq!(record.parents[0].assign_to, Some("author_id"));
    }

    #[test]
    fn test_tag_keeps_quote_id_column_and_checks_parent() {
        let row = json!({ "quote_id": 3, "tag": "Wisdom" });
        let record = EntityKind::Tags.to_record(row.as_object().unwrap());
        assert_eq!(record.table, "quote_tags");
        assert_eq!(record.columns["quote_id"], json!(3));
        assert_eq!(record.parents[0].value, "3");
        assert_eq!(record.parents[0].assign_to, None);
    }

    #[test]
    fn test_every_kind_has_a_key_made_of_known_fields() {
        for kind in EntityKind::ORDERED {
            let key = kind.natural_key();
            assert!(!key.is_empty(), "{} has no natural key", kind);
            assert!(key.iter().all(|f| kind.field(f.column).is_some()));
            assert_eq!(kind.to_record(&Map::new()).key, key);
        }
        assert!(EntityKind::Authors.natural_key()[0].case_insensitive);
    }

    #[test]
    fn test_kind_parsing_accepts_singular() {
        assert_eq!("quote".parse::<EntityKind>(), Ok(EntityKind::Quotes));
        assert_eq!("quote_tags".parse::<EntityKind>(), Ok(EntityKind::Tags));
        assert!("planets".parse::<EntityKind>().is_err());
    }
}
