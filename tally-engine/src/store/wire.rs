//! JSON mapping between the hosted store API and [`super::types`]

use super::types::{
    ActorKind, CollectionSchema, DateRange, FieldKind, FieldSchema, FieldValue, Filter, Item,
    PersonRef,
};
use super::StoreError;
use serde_json::{json, Map, Value};
use tally_common::time::{format_store_date, parse_store_date};

fn plain_text(rich: &Value) -> String {
    rich.as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| {
                    p.get("plain_text")
                        .or_else(|| p.get("text").and_then(|t| t.get("content")))
                        .and_then(Value::as_str)
                })
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn person(user: &Value) -> Option<PersonRef> {
    let id = user.get("id")?.as_str()?.to_string();
    let kind = match user.get("type").and_then(Value::as_str) {
        Some("bot") => ActorKind::Bot,
        _ => ActorKind::Person,
    };
    Some(PersonRef {
        id,
        name: user.get("name").and_then(Value::as_str).map(str::to_string),
        kind,
    })
}

fn date(value: &Value) -> Option<DateRange> {
    let start = parse_store_date(value.get("start")?.as_str()?)?;
    let end = value
        .get("end")
        .and_then(Value::as_str)
        .and_then(parse_store_date);
    Some(DateRange { start, end })
}

/// Convert a property object (`{"type": "...", "<type>": ...}`) into a value
pub(crate) fn property_to_value(prop: &Value) -> FieldValue {
    let kind = prop.get("type").and_then(Value::as_str).unwrap_or("");
    let body = prop.get(kind).unwrap_or(&Value::Null);

    match kind {
        "title" => FieldValue::Title(plain_text(body)),
        "rich_text" => FieldValue::Text(plain_text(body)),
        "number" => FieldValue::Number(body.as_f64()),
        "date" => FieldValue::Date(date(body)),
        "people" => FieldValue::People(
            body.as_array()
                .map(|users| users.iter().filter_map(person).collect())
                .unwrap_or_default(),
        ),
        "checkbox" => FieldValue::Checkbox(body.as_bool().unwrap_or(false)),
        "formula" => match body.get("type").and_then(Value::as_str) {
            Some("number") => FieldValue::Formula(body.get("number").and_then(Value::as_f64)),
            _ => FieldValue::Formula(None),
        },
        other => FieldValue::Unsupported(other.to_string()),
    }
}

/// Combine the results of a paginated property-item listing
///
/// Title, text and people properties are returned one element per item.
pub(crate) fn property_items_to_value(kind: &str, results: &[Value]) -> FieldValue {
    match kind {
        "title" | "rich_text" => {
            let text: String = results
                .iter()
                .map(|r| plain_text(&Value::Array(vec![r.get(kind).cloned().unwrap_or(Value::Null)])))
                .collect();
            if kind == "title" {
                FieldValue::Title(text)
            } else {
                FieldValue::Text(text)
            }
        }
        "people" => FieldValue::People(
            results
                .iter()
                .filter_map(|r| r.get("people").and_then(person))
                .collect(),
        ),
        _ => results
            .first()
            .map(property_to_value)
            .unwrap_or_else(|| FieldKind::parse(kind).empty_value()),
    }
}

/// Encode a value for a create/update request body
pub(crate) fn value_to_property(value: &FieldValue) -> Value {
    match value {
        FieldValue::Title(s) => json!({ "title": [{ "text": { "content": s } }] }),
        FieldValue::Text(s) => json!({ "rich_text": [{ "text": { "content": s } }] }),
        FieldValue::Number(n) => json!({ "number": n }),
        FieldValue::Date(None) => json!({ "date": null }),
        FieldValue::Date(Some(range)) => json!({
            "date": {
                "start": format_store_date(&range.start),
                "end": range.end.as_ref().map(format_store_date),
            }
        }),
        FieldValue::People(people) => json!({
            "people": people
                .iter()
                .map(|p| json!({ "object": "user", "id": p.id }))
                .collect::<Vec<_>>()
        }),
        FieldValue::Checkbox(b) => json!({ "checkbox": b }),
        // Read-only kinds; the API rejects writes to them
        FieldValue::Formula(_) | FieldValue::Unsupported(_) => Value::Null,
    }
}

pub(crate) fn fields_to_properties<'a>(
    fields: impl IntoIterator<Item = (&'a String, &'a FieldValue)>,
) -> Value {
    let mut properties = Map::new();
    for (name, value) in fields {
        let encoded = value_to_property(value);
        if !encoded.is_null() {
            properties.insert(name.clone(), encoded);
        }
    }
    Value::Object(properties)
}

pub(crate) fn filter_to_json(filter: &Filter) -> Value {
    match filter {
        Filter::TitleEquals { field, value } => {
            json!({ "property": field, "title": { "equals": value } })
        }
        Filter::TextEquals { field, value } => {
            json!({ "property": field, "rich_text": { "equals": value } })
        }
        Filter::CheckboxEquals { field, value } => {
            json!({ "property": field, "checkbox": { "equals": value } })
        }
        Filter::And(filters) => {
            json!({ "and": filters.iter().map(filter_to_json).collect::<Vec<_>>() })
        }
    }
}

pub(crate) fn schema_to_json(schema: &CollectionSchema) -> Value {
    let mut properties = Map::new();
    for field in &schema.fields {
        let config = match field.kind {
            FieldKind::Number => json!({ "format": "number" }),
            _ => json!({}),
        };
        let kind = field.kind.as_str().to_string();
        let mut property = Map::new();
        property.insert("type".to_string(), Value::String(kind.clone()));
        property.insert(kind, config);
        properties.insert(field.name.clone(), Value::Object(property));
    }

    json!({
        "parent": { "type": "page_id", "page_id": schema.parent_id },
        "title": [{ "text": { "content": schema.title } }],
        "description": [{ "text": { "content": schema.description } }],
        "properties": properties,
    })
}

pub(crate) fn page_to_item(page: &Value) -> Result<Item, StoreError> {
    let id = page
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Parse("page without id".into()))?
        .to_string();
    let collection_id = page
        .get("parent")
        .and_then(|p| p.get("database_id"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let fields = page
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| {
            props
                .iter()
                .map(|(name, prop)| (name.clone(), property_to_value(prop)))
                .collect()
        })
        .unwrap_or_default();

    Ok(Item {
        id,
        collection_id,
        fields,
    })
}

pub(crate) fn database_fields(database: &Value) -> Result<Vec<FieldSchema>, StoreError> {
    let props = database
        .get("properties")
        .and_then(Value::as_object)
        .ok_or_else(|| StoreError::Parse("database without properties".into()))?;

    Ok(props
        .iter()
        .map(|(key, prop)| FieldSchema {
            id: prop
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or(key)
                .to_string(),
            name: prop
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(key)
                .to_string(),
            kind: FieldKind::parse(prop.get("type").and_then(Value::as_str).unwrap_or("")),
        })
        .collect())
}
