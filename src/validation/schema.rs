//! Payload Schemas
//!
//! A JSON-schema-like subset used to validate workflow input and final
//! output. Validation never stops at the first problem: every violation is
//! collected and reported as `<path>: <reason>`.
//!
//! ```yaml
//! type: object
//! required: [load]
//! properties:
//!   load: { type: number, minimum: 0 }
//!   grade: { type: string, enum: [S235, S355] }
//! additionalProperties: false
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Compiled `pattern` expressions, shared by every schema.
static PATTERNS: Lazy<RwLock<HashMap<String, Regex>>> = Lazy::new(Default::default);

fn compiled(pattern: &str) -> Result<Regex, regex::Error> {
    if let Ok(patterns) = PATTERNS.read() {
        if let Some(re) = patterns.get(pattern) {
            return Ok(re.clone());
        }
    }
    let re = Regex::new(pattern)?;
    if let Ok(mut patterns) = PATTERNS.write() {
        patterns.insert(pattern.to_string(), re.clone());
    }
    Ok(re)
}

/// JSON value types a schema can require.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Null,
}

impl SchemaType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            SchemaType::String => value.is_string(),
            SchemaType::Number => value.is_number(),
            SchemaType::Integer => value
                .as_f64()
                .map(|f| value.is_i64() || value.is_u64() || f.fract() == 0.0)
                .unwrap_or(false),
            SchemaType::Boolean => value.is_boolean(),
            SchemaType::Array => value.is_array(),
            SchemaType::Object => value.is_object(),
            SchemaType::Null => value.is_null(),
        }
    }
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchemaType::String => "string",
            SchemaType::Number => "number",
            SchemaType::Integer => "integer",
            SchemaType::Boolean => "boolean",
            SchemaType::Array => "array",
            SchemaType::Object => "object",
            SchemaType::Null => "null",
        };
        f.write_str(s)
    }
}

/// A schema node.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SchemaType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_items: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,

    #[serde(default)]
    pub unique_items: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Schema>,

    /// `false` rejects keys not listed in `properties`. Defaults to allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,

    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
}

/// One schema violation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: String,
    pub reason: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

impl Schema {
    /// Creates a schema requiring a type.
    pub fn of_type(kind: SchemaType) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// Sets the numeric minimum.
    pub fn with_minimum(mut self, minimum: f64) -> Self {
        self.minimum = Some(minimum);
        self
    }

    /// Sets the numeric maximum.
    pub fn with_maximum(mut self, maximum: f64) -> Self {
        self.maximum = Some(maximum);
        self
    }

    /// Adds a property schema.
    pub fn with_property(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    /// Marks a property as required.
    pub fn require(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    /// Validates a value, returning every violation found.
    pub fn validate(&self, value: &Value) -> Result<(), Vec<Violation>> {
        let violations = self.violations(value);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// Collects every violation for a value.
    pub fn violations(&self, value: &Value) -> Vec<Violation> {
        let mut out = Vec::new();
        self.check(value, "", &mut out);
        out
    }

    /// Reports problems in the schema itself (currently: bad patterns).
    pub fn lint(&self) -> Vec<String> {
        let mut problems = Vec::new();
        self.lint_into("", &mut problems);
        problems
    }

    fn lint_into(&self, path: &str, problems: &mut Vec<String>) {
        if let Some(pattern) = &self.pattern {
            if let Err(e) = compiled(pattern) {
                problems.push(format!("{}: invalid pattern '{}': {}", display_path(path), pattern, e));
            }
        }
        if let Some(items) = &self.items {
            items.lint_into(&format!("{}[]", path), problems);
        }
        for (name, prop) in &self.properties {
            prop.lint_into(&child_path(path, name), problems);
        }
    }

    fn check(&self, value: &Value, path: &str, out: &mut Vec<Violation>) {
        let mut violate = |reason: String| {
            out.push(Violation {
                path: display_path(path),
                reason,
            })
        };

        if let Some(kind) = self.kind {
            if !kind.matches(value) {
                violate(format!("expected {}, found {}", kind, type_name(value)));
                return;
            }
        }

        if let Some(allowed) = &self.enum_values {
            if !allowed.iter().any(|a| same_value(a, value)) {
                let listed: Vec<String> = allowed.iter().map(|a| a.to_string()).collect();
                violate(format!("value {} is not one of [{}]", value, listed.join(", ")));
            }
        }

        match value {
            Value::Number(n) => {
                let Some(v) = n.as_f64() else { return };
                if let Some(min) = self.minimum {
                    if v < min {
                        violate(format!("value {} is below minimum {}", value, format_number(min)));
                    }
                }
                if let Some(max) = self.maximum {
                    if v > max {
                        violate(format!("value {} is above maximum {}", value, format_number(max)));
                    }
                }
            }
            Value::String(s) => {
                let len = s.chars().count();
                if let Some(min) = self.min_length {
                    if len < min {
                        violate(format!("length {} is shorter than minimum {}", len, min));
                    }
                }
                if let Some(max) = self.max_length {
                    if len > max {
                        violate(format!("length {} exceeds maximum {}", len, max));
                    }
                }
                if let Some(pattern) = &self.pattern {
                    match compiled(pattern) {
                        Ok(re) if !re.is_match(s) => {
                            violate(format!("value \"{}\" does not match pattern {}", s, pattern))
                        }
                        Ok(_) => {}
                        Err(e) => violate(format!("invalid pattern '{}': {}", pattern, e)),
                    }
                }
            }
            Value::Array(items) => {
                if let Some(min) = self.min_items {
                    if items.len() < min {
                        violate(format!("has {} items, fewer than minimum {}", items.len(), min));
                    }
                }
                if let Some(max) = self.max_items {
                    if items.len() > max {
                        violate(format!("has {} items, more than maximum {}", items.len(), max));
                    }
                }
                if self.unique_items {
                    if let Some(dup) = first_duplicate(items) {
                        violate(format!("items are not unique (duplicate at index {})", dup));
                    }
                }
                if let Some(item_schema) = &self.items {
                    for (i, item) in items.iter().enumerate() {
                        item_schema.check(item, &format!("{}[{}]", path, i), out);
                    }
                }
            }
            Value::Object(map) => {
                for key in &self.required {
                    if !map.contains_key(key) {
                        out.push(Violation {
                            path: display_path(&child_path(path, key)),
                            reason: "required field is missing".to_string(),
                        });
                    }
                }
                for (key, field) in map {
                    let field_path = child_path(path, key);
                    match self.properties.get(key) {
                        Some(prop) => prop.check(field, &field_path, out),
                        None if self.additional_properties == Some(false) => out.push(Violation {
                            path: display_path(&field_path),
                            reason: "additional property is not allowed".to_string(),
                        }),
                        None => {}
                    }
                }
            }
            _ => {}
        }
    }
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        path.to_string()
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn first_duplicate(items: &[Value]) -> Option<usize> {
    (1..items.len()).find(|&i| items[..i].iter().any(|earlier| same_value(earlier, &items[i])))
}

/// Formats a bound without a trailing `.0` for whole numbers.
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn load_schema() -> Schema {
        Schema::of_type(SchemaType::Object)
            .require("load")
            .with_property("load", Schema::of_type(SchemaType::Number).with_minimum(0.0))
    }

    #[test]
    fn test_negative_load_is_rejected() {
        let violations = load_schema().violations(&json!({"load": -5}));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].to_string(), "load: value -5 is below minimum 0");
    }

    #[test]
    fn test_valid_payload() {
        assert!(load_schema().validate(&json!({"load": 12.5})).is_ok());
    }

    #[test]
    fn test_missing_required_and_wrong_type() {
        let schema = load_schema().require("grade");
        let violations = schema.violations(&json!({"load": "heavy"}));
        let messages: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
        assert_eq!(messages.len(), 2);
        assert!(messages.contains(&"grade: required field is missing".to_string()));
        assert!(messages.contains(&"load: expected number, found string".to_string()));
    }

    #[test]
    fn test_collects_all_violations() {
        let schema = Schema {
            kind: Some(SchemaType::Object),
            additional_properties: Some(false),
            properties: BTreeMap::from([
                ("name".to_string(), Schema {
                    kind: Some(SchemaType::String),
                    min_length: Some(3),
                    pattern: Some("^[a-z]+$".to_string()),
                    ..Schema::default()
                }),
                ("tags".to_string(), Schema {
                    kind: Some(SchemaType::Array),
                    max_items: Some(2),
                    unique_items: true,
                    items: Some(Box::new(Schema::of_type(SchemaType::String))),
                    ..Schema::default()
                }),
            ]),
            ..Schema::default()
        };

        let violations = schema.violations(&json!({
            "name": "A1",
            "tags": ["x", "x", 3],
            "extra": true
        }));
        let messages: Vec<String> = violations.iter().map(|v| v.to_string()).collect();

        assert!(messages.contains(&"name: length 2 is shorter than minimum 3".to_string()));
        assert!(messages.contains(&"name: value \"A1\" does not match pattern ^[a-z]+$".to_string()));
        assert!(messages.contains(&"tags: has 3 items, more than maximum 2".to_string()));
        assert!(messages.contains(&"tags: items are not unique (duplicate at index 1)".to_string()));
        assert!(messages.contains(&"tags[2]: expected string, found number".to_string()));
        assert!(messages.contains(&"extra: additional property is not allowed".to_string()));
        assert_eq!(messages.len(), 6);
    }

    #[test]
    fn test_enum_membership() {
        let schema = Schema {
            enum_values: Some(vec![json!("S235"), json!("S355")]),
            ..Schema::default()
        };
        assert!(schema.validate(&json!("S355")).is_ok());
        let violations = schema.violations(&json!("S420"));
        assert_eq!(violations[0].to_string(), "$: value \"S420\" is not one of [\"S235\", \"S355\"]");
    }

    #[test]
    fn test_maximum_and_integer() {
        let schema = Schema::of_type(SchemaType::Integer).with_maximum(10.0);
        assert!(schema.validate(&json!(4)).is_ok());
        assert_eq!(schema.violations(&json!(11))[0].reason, "value 11 is above maximum 10");
        assert_eq!(schema.violations(&json!(2.5))[0].reason, "expected integer, found number");
    }

    #[test]
    fn test_nested_paths() {
        let schema = Schema::of_type(SchemaType::Object).with_property(
            "beam",
            Schema::of_type(SchemaType::Object)
                .require("span")
                .with_property("span", Schema::of_type(SchemaType::Number).with_minimum(0.5)),
        );
        let violations = schema.violations(&json!({"beam": {"span": 0.25}}));
        assert_eq!(violations[0].to_string(), "beam.span: value 0.25 is below minimum 0.5");
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let yaml = r#"
type: object
required: [load]
properties:
  load: { type: number, minimum: 0 }
additionalProperties: false
"#;
        let schema: Schema = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(schema.kind, Some(SchemaType::Object));
        assert_eq!(schema.additional_properties, Some(false));
        assert_eq!(schema.properties["load"].minimum, Some(0.0));
    }

    #[test]
    fn test_patterns_compiled_once() {
        let schema = Schema {
            kind: Some(SchemaType::String),
            pattern: Some("^S[0-9]{3}$".to_string()),
            ..Schema::default()
        };
        assert!(schema.validate(&json!("S235")).is_ok());
        assert!(schema.validate(&json!("S35")).is_err());

        let first = compiled("^S[0-9]{3}$").unwrap();
        let again = compiled("^S[0-9]{3}$").unwrap();
        assert_eq!(first.as_str(), again.as_str());
        assert!(PATTERNS.read().unwrap().contains_key("^S[0-9]{3}$"));

        assert!(compiled("([a-z").is_err());
        assert!(!PATTERNS.read().unwrap().contains_key("([a-z"));
    }

    #[test]
    fn test_lint_reports_bad_pattern() {
        let schema = Schema::of_type(SchemaType::Object).with_property(
            "code",
            Schema {
                pattern: Some("([a-z".to_string()),
                ..Schema::default()
            },
        );
        let problems = schema.lint();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].starts_with("code: invalid pattern"));
    }
}
