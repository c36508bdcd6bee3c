//! Store data model
//!
//! Field values are schema-flexible in the store: the same logical field can
//! come back as text, a number, a date range, a person list or a formula
//! depending on how the collection was set up. [`FieldValue`] is the tagged
//! union over those shapes; the `as_*` accessors fail with a typed
//! [`FieldTypeError`] instead of guessing a default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub type CollectionId = String;
pub type ItemId = String;

/// Field values keyed by stored field name
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Actor behind a person reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    /// Human user (also assumed when the store omits the type)
    #[default]
    Person,
    /// Integration, bot or other service actor
    Bot,
}

/// Reference to a user of the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRef {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub kind: ActorKind,
}

impl PersonRef {
    pub fn person(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
            kind: ActorKind::Person,
        }
    }

    pub fn bot(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
            kind: ActorKind::Bot,
        }
    }

    pub fn is_human(&self) -> bool {
        self.kind == ActorKind::Person
    }
}

/// Date value; `end` is only present for ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn at(ts: DateTime<Utc>) -> Self {
        Self { start: ts, end: None }
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }
}

/// Column type of a store field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Title,
    Text,
    Number,
    Date,
    People,
    Checkbox,
    Formula,
    /// Any store type the engine does not read
    Other(String),
}

impl FieldKind {
    pub fn as_str(&self) -> &str {
        match self {
            FieldKind::Title => "title",
            FieldKind::Text => "rich_text",
            FieldKind::Number => "number",
            FieldKind::Date => "date",
            FieldKind::People => "people",
            FieldKind::Checkbox => "checkbox",
            FieldKind::Formula => "formula",
            FieldKind::Other(name) => name,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "title" => FieldKind::Title,
            "rich_text" => FieldKind::Text,
            "number" => FieldKind::Number,
            "date" => FieldKind::Date,
            "people" => FieldKind::People,
            "checkbox" => FieldKind::Checkbox,
            "formula" => FieldKind::Formula,
            other => FieldKind::Other(other.to_string()),
        }
    }

    /// The value an unset field of this kind reads as
    pub fn empty_value(&self) -> FieldValue {
        match self {
            FieldKind::Title => FieldValue::Title(String::new()),
            FieldKind::Text => FieldValue::Text(String::new()),
            FieldKind::Number => FieldValue::Number(None),
            FieldKind::Date => FieldValue::Date(None),
            FieldKind::People => FieldValue::People(Vec::new()),
            FieldKind::Checkbox => FieldValue::Checkbox(false),
            FieldKind::Formula => FieldValue::Formula(None),
            FieldKind::Other(name) => FieldValue::Unsupported(name.clone()),
        }
    }
}

/// Typed field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Title(String),
    Text(String),
    Number(Option<f64>),
    Date(Option<DateRange>),
    People(Vec<PersonRef>),
    Checkbox(bool),
    /// Formula result; only numeric formulas are read
    Formula(Option<f64>),
    Unsupported(String),
}

/// A field held a different type than the caller asked for
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("field type mismatch: expected {expected}, found {found}")]
pub struct FieldTypeError {
    pub expected: &'static str,
    pub found: String,
}

impl FieldValue {
    pub fn kind_name(&self) -> String {
        match self {
            FieldValue::Title(_) => "title".to_string(),
            FieldValue::Text(_) => "rich_text".to_string(),
            FieldValue::Number(_) => "number".to_string(),
            FieldValue::Date(_) => "date".to_string(),
            FieldValue::People(_) => "people".to_string(),
            FieldValue::Checkbox(_) => "checkbox".to_string(),
            FieldValue::Formula(_) => "formula".to_string(),
            FieldValue::Unsupported(kind) => kind.clone(),
        }
    }

    fn mismatch(&self, expected: &'static str) -> FieldTypeError {
        FieldTypeError {
            expected,
            found: self.kind_name(),
        }
    }

    /// Title or text content; blank text reads as `None`
    pub fn as_text(&self) -> Result<Option<&str>, FieldTypeError> {
        match self {
            FieldValue::Title(s) | FieldValue::Text(s) => {
                let trimmed = s.trim();
                Ok((!trimmed.is_empty()).then_some(trimmed))
            }
            other => Err(other.mismatch("text")),
        }
    }

    /// Number or numeric formula result
    pub fn as_number(&self) -> Result<Option<f64>, FieldTypeError> {
        match self {
            FieldValue::Number(n) | FieldValue::Formula(n) => Ok(*n),
            other => Err(other.mismatch("number")),
        }
    }

    pub fn as_date_range(&self) -> Result<Option<&DateRange>, FieldTypeError> {
        match self {
            FieldValue::Date(d) => Ok(d.as_ref()),
            other => Err(other.mismatch("date")),
        }
    }

    pub fn as_people(&self) -> Result<&[PersonRef], FieldTypeError> {
        match self {
            FieldValue::People(p) => Ok(p),
            other => Err(other.mismatch("people")),
        }
    }

    pub fn as_bool(&self) -> Result<bool, FieldTypeError> {
        match self {
            FieldValue::Checkbox(b) => Ok(*b),
            other => Err(other.mismatch("checkbox")),
        }
    }
}

/// Field as described by the collection schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub id: String,
    pub name: String,
    pub kind: FieldKind,
}

/// Field definition used when creating a collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Collection definition for `create_collection`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSchema {
    pub title: String,
    pub description: String,
    pub parent_id: String,
    pub fields: Vec<FieldSpec>,
}

/// One row of a collection
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: ItemId,
    pub collection_id: CollectionId,
    pub fields: FieldMap,
}

impl Item {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

/// Query filter; field references are stored field names
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    TitleEquals { field: String, value: String },
    TextEquals { field: String, value: String },
    CheckboxEquals { field: String, value: bool },
    And(Vec<Filter>),
}

impl Filter {
    pub fn title_equals(field: &str, value: &str) -> Self {
        Filter::TitleEquals {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub fn checkbox_equals(field: &str, value: bool) -> Self {
        Filter::CheckboxEquals {
            field: field.to_string(),
            value,
        }
    }

    /// Evaluate against an item (used by stores without server-side filtering)
    pub fn matches(&self, item: &Item) -> bool {
        match self {
            Filter::TitleEquals { field, value } => {
                matches!(item.field(field), Some(FieldValue::Title(s)) if s == value)
            }
            Filter::TextEquals { field, value } => {
                matches!(item.field(field), Some(FieldValue::Text(s)) if s == value)
            }
            Filter::CheckboxEquals { field, value } => match item.field(field) {
                Some(FieldValue::Checkbox(b)) => b == value,
                None => !*value,
                _ => false,
            },
            Filter::And(filters) => filters.iter().all(|f| f.matches(item)),
        }
    }
}

/// One page of query results
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Item>,
    pub next_cursor: Option<String>,
}
