//! # Schema Validation
//!
//! Validates arbitrary JSON values against the JSON Schema subset used by
//! task and workflow documents, and checks producer/consumer schema
//! compatibility across dataflow edges.
//!
//! Validation never fails for bad data; it produces structured
//! [`Violation`]s with JSON-pointer paths. The only exceptional condition
//! is a malformed schema document (an uncompilable `pattern`), which
//! surfaces as `schema-invalid`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Value types understood by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Null,
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchemaType::String => "string",
            SchemaType::Integer => "integer",
            SchemaType::Number => "number",
            SchemaType::Boolean => "boolean",
            SchemaType::Object => "object",
            SchemaType::Array => "array",
            SchemaType::Null => "null",
        };
        f.write_str(name)
    }
}

/// JSON Schema subset: `type`, `properties`, `required`, `items`, numeric
/// and string bounds, `pattern`, `enum`, `additionalProperties`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Schema {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<SchemaType>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Schema>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,
}

impl Schema {
    /// Shorthand for a schema that only constrains the type.
    pub fn of_type(schema_type: SchemaType) -> Self {
        Self {
            schema_type: Some(schema_type),
            ..Self::default()
        }
    }
}

/// Classification of a single validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    MissingRequired,
    TypeMismatch,
    EnumViolation,
    AdditionalProperty,
    ConstraintViolation,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViolationKind::MissingRequired => "missing-required",
            ViolationKind::TypeMismatch => "type-mismatch",
            ViolationKind::EnumViolation => "enum-violation",
            ViolationKind::AdditionalProperty => "additional-property",
            ViolationKind::ConstraintViolation => "constraint-violation",
        };
        f.write_str(name)
    }
}

/// One validation failure: a JSON-pointer path, a kind, and a human
/// message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub path: String,
    pub kind: ViolationKind,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// A producer field that does not satisfy a consumer requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incompatibility {
    pub field: String,
    pub expected: String,
    pub found: String,
}

/// Validate `value` against `schema`. An empty result means the value
/// satisfies every constraint.
pub fn validate(schema: &Schema, value: &Value) -> Result<Vec<Violation>> {
    let mut violations = Vec::new();
    check(schema, value, "", &mut violations)?;
    Ok(violations)
}

fn check(schema: &Schema, value: &Value, path: &str, out: &mut Vec<Violation>) -> Result<()> {
    if let Some(expected) = schema.schema_type {
        if !type_matches(expected, value) {
            out.push(Violation {
                path: path.to_string(),
                kind: ViolationKind::TypeMismatch,
                message: format!("expected {}, found {}", expected, type_of(value)),
            });
            // Remaining constraints assume the declared type.
            return Ok(());
        }
    }

    if let Some(allowed) = &schema.enum_values {
        if !allowed.contains(value) {
            out.push(Violation {
                path: path.to_string(),
                kind: ViolationKind::EnumViolation,
                message: format!(
                    "value {} is not one of the allowed values",
                    compact(value)
                ),
            });
        }
    }

    match value {
        Value::Number(number) => {
            if let Some(n) = number.as_f64() {
                if let Some(minimum) = schema.minimum {
                    if n < minimum {
                        out.push(constraint(path, format!("{} is below minimum {}", n, minimum)));
                    }
                }
                if let Some(maximum) = schema.maximum {
                    if n > maximum {
                        out.push(constraint(path, format!("{} is above maximum {}", n, maximum)));
                    }
                }
            }
        }
        Value::String(s) => {
            let length = s.chars().count();
            if let Some(min_length) = schema.min_length {
                if length < min_length {
                    out.push(constraint(
                        path,
                        format!("length {} is below minLength {}", length, min_length),
                    ));
                }
            }
            if let Some(max_length) = schema.max_length {
                if length > max_length {
                    out.push(constraint(
                        path,
                        format!("length {} is above maxLength {}", length, max_length),
                    ));
                }
            }
            if let Some(pattern) = &schema.pattern {
                let regex = regex::Regex::new(pattern).map_err(|e| EngineError::SchemaInvalid {
                    message: format!("invalid pattern {:?}: {}", pattern, e),
                })?;
                if !regex.is_match(s) {
                    out.push(constraint(
                        path,
                        format!("{:?} does not match pattern {:?}", s, pattern),
                    ));
                }
            }
        }
        Value::Object(fields) => {
            for required in &schema.required {
                if !fields.contains_key(required) {
                    out.push(Violation {
                        path: format!("{}/{}", path, required),
                        kind: ViolationKind::MissingRequired,
                        message: format!("required property '{}' is missing", required),
                    });
                }
            }
            for (name, field_value) in fields {
                match schema.properties.get(name) {
                    Some(field_schema) => {
                        let field_path = format!("{}/{}", path, name);
                        check(field_schema, field_value, &field_path, out)?;
                    }
                    None => {
                        if schema.additional_properties == Some(false) {
                            out.push(Violation {
                                path: format!("{}/{}", path, name),
                                kind: ViolationKind::AdditionalProperty,
                                message: format!("property '{}' is not allowed", name),
                            });
                        }
                    }
                }
            }
        }
        Value::Array(elements) => {
            if let Some(item_schema) = &schema.items {
                for (index, element) in elements.iter().enumerate() {
                    let element_path = format!("{}/{}", path, index);
                    check(item_schema, element, &element_path, out)?;
                }
            }
        }
        _ => {}
    }

    Ok(())
}

/// Check that `producer` can feed `consumer`: every consumer-required
/// field must appear in the producer's properties with a matching type.
/// Nested objects recurse. An empty result means compatible.
pub fn compatible(producer: &Schema, consumer: &Schema) -> Vec<Incompatibility> {
    let mut missing = Vec::new();
    check_compatible(producer, consumer, "", &mut missing);
    missing
}

fn check_compatible(producer: &Schema, consumer: &Schema, prefix: &str, out: &mut Vec<Incompatibility>) {
    for required in &consumer.required {
        let field = if prefix.is_empty() {
            required.clone()
        } else {
            format!("{}.{}", prefix, required)
        };
        let consumed = consumer.properties.get(required);
        let Some(produced) = producer.properties.get(required) else {
            out.push(Incompatibility {
                field,
                expected: consumed
                    .and_then(|s| s.schema_type)
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "value".to_string()),
                found: "nothing".to_string(),
            });
            continue;
        };
        let (Some(produced_type), Some(consumed_type)) =
            (produced.schema_type, consumed.and_then(|s| s.schema_type))
        else {
            continue;
        };
        if produced_type != consumed_type {
            out.push(Incompatibility {
                field,
                expected: consumed_type.to_string(),
                found: produced_type.to_string(),
            });
        } else if produced_type == SchemaType::Object {
            if let Some(consumed_schema) = consumed {
                check_compatible(produced, consumed_schema, &field, out);
            }
        }
    }
}

fn type_matches(expected: SchemaType, value: &Value) -> bool {
    match expected {
        SchemaType::String => value.is_string(),
        SchemaType::Integer => value.is_i64() || value.is_u64(),
        SchemaType::Number => value.is_number(),
        SchemaType::Boolean => value.is_boolean(),
        SchemaType::Object => value.is_object(),
        SchemaType::Array => value.is_array(),
        SchemaType::Null => value.is_null(),
    }
}

/// Human-readable type of a JSON value, for error messages.
pub fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn constraint(path: &str, message: String) -> Violation {
    Violation {
        path: path.to_string(),
        kind: ViolationKind::ConstraintViolation,
        message,
    }
}

fn compact(value: &Value) -> String {
    let rendered = value.to_string();
    if rendered.chars().count() > 64 {
        let head: String = rendered.chars().take(64).collect();
        format!("{}...", head)
    } else {
        rendered
    }
}
