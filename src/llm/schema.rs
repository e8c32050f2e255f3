//! Data-driven JSON schemas for structured LLM output.
//!
//! Schemas are defined as values, rendered into prompt instructions, and
//! used to validate parsed responses at the gateway boundary. Everything
//! past the gateway works with typed records, never raw model text.

use serde_json::Value;

/// The shape of a single schema field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    /// Integer with optional inclusive bounds.
    Integer {
        min: Option<i64>,
        max: Option<i64>,
    },
    Number,
    Boolean,
    /// One of a fixed set of strings.
    Enumeration(Vec<String>),
    StringArray,
    /// Array of objects, each validated against nested fields.
    ObjectArray(Vec<FieldSpec>),
    /// Any JSON object; keys are not constrained. Providers with strict
    /// structured-output modes handle this poorly, which is why callers
    /// keep open-key fields behind feature flags.
    AnyObject,
}

impl FieldKind {
    fn describe(&self) -> String {
        match self {
            Self::String => "string".to_string(),
            Self::Integer {
                min: Some(min),
                max: Some(max),
            } => format!("integer {min}-{max}"),
            Self::Integer { .. } => "integer".to_string(),
            Self::Number => "number".to_string(),
            Self::Boolean => "boolean".to_string(),
            Self::Enumeration(options) => format!("one of [{}]", options.join(", ")),
            Self::StringArray => "array of strings".to_string(),
            Self::ObjectArray(fields) => {
                let inner: Vec<String> = fields.iter().map(FieldSpec::describe).collect();
                format!("array of objects {{{}}}", inner.join(", "))
            }
            Self::AnyObject => "object".to_string(),
        }
    }
}

/// One named field in a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::String)
    }

    pub fn integer(name: impl Into<String>, min: i64, max: i64) -> Self {
        Self::new(
            name,
            FieldKind::Integer {
                min: Some(min),
                max: Some(max),
            },
        )
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn enumeration<S: Into<String>>(
        name: impl Into<String>,
        options: impl IntoIterator<Item = S>,
    ) -> Self {
        Self::new(
            name,
            FieldKind::Enumeration(options.into_iter().map(Into::into).collect()),
        )
    }

    pub fn string_array(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::StringArray)
    }

    pub fn object_array(name: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self::new(name, FieldKind::ObjectArray(fields))
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    fn describe(&self) -> String {
        let requirement = if self.required { "" } else { ", optional" };
        format!("\"{}\": {}{}", self.name, self.kind.describe(), requirement)
    }

    fn validate(&self, value: &Value, path: &str, errors: &mut Vec<String>) {
        match (&self.kind, value) {
            (FieldKind::String, Value::String(_)) => {}
            (FieldKind::Boolean, Value::Bool(_)) => {}
            (FieldKind::Number, Value::Number(_)) => {}
            (FieldKind::Integer { min, max }, Value::Number(n)) => match n.as_i64() {
                Some(i) => {
                    if min.is_some_and(|m| i < m) || max.is_some_and(|m| i > m) {
                        errors.push(format!("{path}: {i} outside allowed range"));
                    }
                }
                None => errors.push(format!("{path}: expected an integer")),
            },
            (FieldKind::Enumeration(options), Value::String(s)) => {
                if !options.iter().any(|o| o == s) {
                    errors.push(format!("{path}: '{s}' not one of [{}]", options.join(", ")));
                }
            }
            (FieldKind::StringArray, Value::Array(items)) => {
                for (i, item) in items.iter().enumerate() {
                    if !item.is_string() {
                        errors.push(format!("{path}[{i}]: expected a string"));
                    }
                }
            }
            (FieldKind::ObjectArray(fields), Value::Array(items)) => {
                for (i, item) in items.iter().enumerate() {
                    validate_object(fields, true, item, &format!("{path}[{i}]"), errors);
                }
            }
            (FieldKind::AnyObject, Value::Object(_)) => {}
            (_, Value::Null) if !self.required => {}
            (kind, _) => errors.push(format!("{path}: expected {}", kind.describe())),
        }
    }
}

/// A strict object schema: required fields must be present, and unknown
/// keys are rejected so a model cannot smuggle unvalidated structure past
/// the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonSchema {
    pub name: String,
    pub fields: Vec<FieldSpec>,
    pub strict: bool,
}

impl JsonSchema {
    pub fn object(name: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.into(),
            fields,
            strict: true,
        }
    }

    /// Allow keys beyond the declared fields.
    pub fn open(mut self) -> Self {
        self.strict = false;
        self
    }

    /// Validate a parsed value; returns all problems, not just the first.
    pub fn validate(&self, value: &Value) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        validate_object(&self.fields, self.strict, value, &self.name, &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Instruction block appended to prompts that require this schema.
    pub fn to_prompt_block(&self) -> String {
        let fields: Vec<String> = self.fields.iter().map(|f| format!("  {}", f.describe())).collect();
        format!(
            "Respond with a single JSON object and nothing else. Fields:\n{{\n{}\n}}\nDo not include any key not listed above.",
            fields.join(",\n")
        )
    }
}

fn validate_object(
    fields: &[FieldSpec],
    strict: bool,
    value: &Value,
    path: &str,
    errors: &mut Vec<String>,
) {
    let Some(object) = value.as_object() else {
        errors.push(format!("{path}: expected an object"));
        return;
    };

    for field in fields {
        match object.get(&field.name) {
            Some(field_value) => {
                field.validate(field_value, &format!("{path}.{}", field.name), errors)
            }
            None if field.required => {
                errors.push(format!("{path}.{}: missing required field", field.name))
            }
            None => {}
        }
    }

    if strict {
        for key in object.keys() {
            if !fields.iter().any(|f| &f.name == key) {
                errors.push(format!("{path}.{key}: unexpected field"));
            }
        }
    }
}

/// Pull a JSON object out of model text: direct parse first, then fenced
/// blocks, then the outermost brace span. Models wrap JSON in prose often
/// enough that this pass runs before every validation.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(after[..end].trim()) {
                return Some(value);
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        serde_json::from_str(&trimmed[start..=end]).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn verdict_schema() -> JsonSchema {
        JsonSchema::object(
            "verdict",
            vec![
                FieldSpec::integer("score", 0, 10),
                FieldSpec::string("rationale"),
            ],
        )
    }

    #[test]
    fn test_validate_accepts_conforming_object() {
        let schema = verdict_schema();
        assert!(schema
            .validate(&json!({"score": 7, "rationale": "on topic"}))
            .is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_and_missing() {
        let schema = verdict_schema();
        let errors = schema.validate(&json!({"score": 11})).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("outside allowed range"));
        assert!(errors[1].contains("missing required field"));
    }

    #[test]
    fn test_strict_rejects_unknown_keys() {
        let schema = verdict_schema();
        let errors = schema
            .validate(&json!({"score": 5, "rationale": "x", "extra": 1}))
            .unwrap_err();
        assert!(errors[0].contains("unexpected field"));

        let open = verdict_schema().open();
        assert!(open
            .validate(&json!({"score": 5, "rationale": "x", "extra": 1}))
            .is_ok());
    }

    #[test]
    fn test_optional_fields_and_null() {
        let schema = JsonSchema::object(
            "q",
            vec![
                FieldSpec::string("keyword"),
                FieldSpec::string("location").optional(),
            ],
        );
        assert!(schema.validate(&json!({"keyword": "cyber"})).is_ok());
        assert!(schema
            .validate(&json!({"keyword": "cyber", "location": null}))
            .is_ok());
    }

    #[test]
    fn test_object_array_validation() {
        let schema = JsonSchema::object(
            "decomposition",
            vec![FieldSpec::object_array(
                "subtasks",
                vec![
                    FieldSpec::string("description"),
                    FieldSpec::string("source_hint").optional(),
                ],
            )],
        );
        assert!(schema
            .validate(&json!({"subtasks": [{"description": "a"}, {"description": "b", "source_hint": "web-search"}]}))
            .is_ok());
        let errors = schema
            .validate(&json!({"subtasks": [{"source_hint": "web-search"}]}))
            .unwrap_err();
        assert!(errors[0].contains("subtasks[0].description"));
    }

    #[test]
    fn test_enumeration() {
        let schema = JsonSchema::object(
            "entity",
            vec![FieldSpec::enumeration(
                "entity_type",
                ["person", "organization"],
            )],
        );
        assert!(schema.validate(&json!({"entity_type": "person"})).is_ok());
        assert!(schema.validate(&json!({"entity_type": "starship"})).is_err());
    }

    #[test]
    fn test_extract_json_variants() {
        let direct = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(direct["a"], 1);

        let fenced = extract_json("Here you go:\n```json\n{\"a\": 2}\n```\nDone.").unwrap();
        assert_eq!(fenced["a"], 2);

        let embedded = extract_json("The answer is {\"a\": 3} as requested.").unwrap();
        assert_eq!(embedded["a"], 3);

        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn test_prompt_block_lists_fields() {
        let block = verdict_schema().to_prompt_block();
        assert!(block.contains("\"score\": integer 0-10"));
        assert!(block.contains("\"rationale\": string"));
        assert!(block.contains("single JSON object"));
    }
}
