use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};

/// Shape declaration for structured provider output.
///
/// A closed set of variants validated when the schema is built, instead of a
/// free-form JSON map patched at call time. `from_value` accepts loose
/// declarations and repairs the known omissions (an object without a
/// `properties` map gets an empty one).
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    String,
    Number,
    Boolean,
    Array(Box<Schema>),
    Object {
        properties: Vec<(String, Schema)>,
        required: Vec<String>,
    },
}

impl Schema {
    pub fn array(item: Schema) -> Self {
        Schema::Array(Box::new(item))
    }

    /// Object schema with every field required, the common case for
    /// provider calls in this crate.
    pub fn object(fields: Vec<(&str, Schema)>) -> Self {
        let required = fields.iter().map(|(name, _)| name.to_string()).collect();
        Schema::Object {
            properties: fields
                .into_iter()
                .map(|(name, schema)| (name.to_string(), schema))
                .collect(),
            required,
        }
    }

    /// Render into the provider's `response_schema` wire form.
    pub fn to_value(&self) -> Value {
        match self {
            Schema::String => json!({"type": "STRING"}),
            Schema::Number => json!({"type": "NUMBER"}),
            Schema::Boolean => json!({"type": "BOOLEAN"}),
            Schema::Array(item) => json!({"type": "ARRAY", "items": item.to_value()}),
            Schema::Object {
                properties,
                required,
            } => {
                // Always emit a properties map, even when empty. The
                // provider rejects OBJECT schemas without one.
                let mut props = Map::new();
                for (name, schema) in properties {
                    props.insert(name.clone(), schema.to_value());
                }
                let mut out = Map::new();
                out.insert("type".to_string(), Value::String("OBJECT".to_string()));
                out.insert("properties".to_string(), Value::Object(props));
                if !required.is_empty() {
                    out.insert(
                        "required".to_string(),
                        Value::Array(required.iter().map(|r| json!(r)).collect()),
                    );
                }
                Value::Object(out)
            }
        }
    }

    /// Parse a loose schema declaration, repairing known structural
    /// omissions rather than failing the call. Unknown keys (e.g.
    /// `additionalProperties`) are ignored.
    pub fn from_value(value: &Value) -> Result<Self> {
        let ty = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| anyhow!("schema declaration has no type: {}", value))?;

        match ty.to_ascii_uppercase().as_str() {
            "STRING" => Ok(Schema::String),
            "NUMBER" | "INTEGER" => Ok(Schema::Number),
            "BOOLEAN" => Ok(Schema::Boolean),
            "ARRAY" => {
                // An array without items defaults to an array of strings.
                let item = match value.get("items") {
                    Some(items) => Schema::from_value(items)?,
                    None => Schema::String,
                };
                Ok(Schema::array(item))
            }
            "OBJECT" => {
                let mut properties = Vec::new();
                if let Some(props) = value.get("properties").and_then(|p| p.as_object()) {
                    for (name, prop) in props {
                        properties.push((name.clone(), Schema::from_value(prop)?));
                    }
                }
                let required = value
                    .get("required")
                    .and_then(|r| r.as_array())
                    .map(|r| {
                        r.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Schema::Object {
                    properties,
                    required,
                })
            }
            other => Err(anyhow!("unsupported schema type: {}", other)),
        }
    }
}
