//! Entity extraction from accepted items.
//!
//! Default extraction yields `{name, type}` pairs only; the rich form with
//! open-key attributes and relationships sits behind a config flag because
//! several providers' strict structured-output modes reject open-key
//! objects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::integrations::Item;
use crate::llm::{FieldKind, FieldSpec, JsonSchema};

/// Entity classification vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Organization,
    Program,
    Location,
    Event,
    Concept,
}

const ENTITY_TYPE_NAMES: &[&str] = &[
    "person",
    "organization",
    "program",
    "location",
    "event",
    "concept",
];

/// A directed relationship in the rich entity form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRelationship {
    pub target: String,
    pub relation: String,
}

/// An extracted entity. `attributes` and `relationships` are only
/// populated when rich extraction is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<EntityRelationship>,
}

impl Entity {
    pub fn new(name: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            name: name.into(),
            entity_type,
            attributes: Map::new(),
            relationships: Vec::new(),
        }
    }
}

/// Schema for the extraction call. The rich form allows attributes and
/// relationships; the default form is strictly `{name, entity_type}`.
pub fn entity_schema(rich: bool) -> JsonSchema {
    let mut fields = vec![
        FieldSpec::string("name"),
        FieldSpec::enumeration("entity_type", ENTITY_TYPE_NAMES.iter().copied()),
    ];
    if rich {
        fields.push(FieldSpec::new("attributes", FieldKind::AnyObject).optional());
        fields.push(
            FieldSpec::object_array(
                "relationships",
                vec![FieldSpec::string("target"), FieldSpec::string("relation")],
            )
            .optional(),
        );
    }
    JsonSchema::object("entities", vec![FieldSpec::object_array("entities", fields)])
}

/// Decode a validated extraction payload into entities. Unknown or
/// malformed entries are skipped rather than failing the set.
pub fn decode_entities(value: &Value) -> Vec<Entity> {
    value
        .get("entities")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Merge newly extracted entities into a roster, deduplicating by
/// case-insensitive name + type. First occurrence wins.
pub fn merge_entities(roster: &mut Vec<Entity>, new: Vec<Entity>) {
    for entity in new {
        let duplicate = roster.iter().any(|existing| {
            existing.entity_type == entity.entity_type
                && existing.name.eq_ignore_ascii_case(&entity.name)
        });
        if !duplicate {
            roster.push(entity);
        }
    }
}

/// Bound the items fed to extraction so prompt size stays controlled:
/// at most `max_items`, descriptions truncated to `max_desc` characters.
pub fn sample_items(items: &[Item], max_items: usize, max_desc: usize) -> Value {
    let sampled: Vec<Value> = items
        .iter()
        .take(max_items)
        .map(|item| {
            serde_json::json!({
                "title": item.title,
                "url": item.url,
                "description": item.description.chars().take(max_desc).collect::<String>(),
            })
        })
        .collect();
    Value::Array(sampled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_schema_rejects_attributes() {
        let schema = entity_schema(false);
        assert!(schema
            .validate(&json!({"entities": [{"name": "JSOC", "entity_type": "organization"}]}))
            .is_ok());
        assert!(schema
            .validate(&json!({"entities": [{
                "name": "JSOC",
                "entity_type": "organization",
                "attributes": {"branch": "military"},
            }]}))
            .is_err());
    }

    #[test]
    fn test_rich_schema_allows_attributes_and_relationships() {
        let schema = entity_schema(true);
        assert!(schema
            .validate(&json!({"entities": [{
                "name": "JSOC",
                "entity_type": "organization",
                "attributes": {"branch": "military"},
                "relationships": [{"target": "SOCOM", "relation": "component_of"}],
            }]}))
            .is_ok());
    }

    #[test]
    fn test_decode_skips_malformed_entries() {
        let entities = decode_entities(&json!({"entities": [
            {"name": "Lockheed Martin", "entity_type": "organization"},
            {"name": "broken", "entity_type": "starship"},
        ]}));
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].entity_type, EntityType::Organization);
    }

    #[test]
    fn test_merge_deduplicates_case_insensitively() {
        let mut roster = vec![Entity::new("JSOC", EntityType::Organization)];
        merge_entities(
            &mut roster,
            vec![
                Entity::new("jsoc", EntityType::Organization),
                Entity::new("JSOC", EntityType::Concept),
                Entity::new("Syria", EntityType::Location),
            ],
        );
        assert_eq!(roster.len(), 3);
    }

    #[test]
    fn test_sample_items_bounds_size() {
        let items: Vec<Item> = (0..50)
            .map(|i| {
                Item::new(format!("t{i}"), format!("https://x/{i}"))
                    .with_description("d".repeat(500))
            })
            .collect();
        let sampled = sample_items(&items, 40, 240);
        let array = sampled.as_array().unwrap();
        assert_eq!(array.len(), 40);
        assert_eq!(array[0]["description"].as_str().unwrap().len(), 240);
    }
}
