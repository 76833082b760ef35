//! Declarative collection schemas.
//!
//! Each collection declares the exact shape of its documents; validators are
//! strict and reject unknown fields at any nesting level. The opaque
//! identifier format is a first-class field kind so cross-references are
//! checked for shape before they ever reach the snapshot builder.

use chunkio_common::{Error, ObjectId, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Type of a single document field.
#[derive(Clone, Debug)]
pub enum FieldKind {
    /// Opaque identifier (hyphenated UUID string in document form)
    ObjectId,
    /// Arbitrary string
    String,
    /// Integer number
    Integer,
    /// Epoch-milliseconds timestamp
    Timestamp,
    /// String restricted to a fixed set of values
    Enum(&'static [&'static str]),
    /// Homogeneous array
    Array(Box<FieldKind>),
    /// Nested object with its own strict schema
    Object(Schema),
}

#[derive(Clone, Debug)]
struct Field {
    name: &'static str,
    kind: FieldKind,
    required: bool,
}

/// Strict schema for one document shape.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    /// Create an empty schema
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required field
    #[must_use]
    pub fn field(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name,
            kind,
            required: true,
        });
        self
    }

    /// Add an optional field
    #[must_use]
    pub fn optional(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name,
            kind,
            required: false,
        });
        self
    }

    /// Validate a document against this schema, collecting every violation.
    #[must_use]
    pub fn validate(&self, item: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        self.validate_at("", item, &mut errors);
        errors
    }

    fn validate_at(&self, path: &str, item: &Value, errors: &mut Vec<String>) {
        let Some(object) = item.as_object() else {
            let at = if path.is_empty() { "document" } else { path };
            errors.push(format!("{at}: expected an object"));
            return;
        };

        for field in &self.fields {
            match object.get(field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        errors.push(format!(
                            "missing field: {}",
                            display_path(path, field.name)
                        ));
                    }
                }
                Some(value) => {
                    validate_kind(&display_path(path, field.name), &field.kind, value, errors);
                }
            }
        }

        for key in object.keys() {
            if !self.fields.iter().any(|f| f.name == key) {
                errors.push(format!("unknown field: {}", display_path(path, key)));
            }
        }
    }
}

fn display_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn validate_kind(path: &str, kind: &FieldKind, value: &Value, errors: &mut Vec<String>) {
    match kind {
        FieldKind::ObjectId => {
            let ok = value.as_str().is_some_and(|s| ObjectId::parse(s).is_some());
            if !ok {
                errors.push(format!("{path}: expected an objectid"));
            }
        }
        FieldKind::String => {
            if !value.is_string() {
                errors.push(format!("{path}: expected a string"));
            }
        }
        FieldKind::Integer => {
            if !value.is_i64() && !value.is_u64() {
                errors.push(format!("{path}: expected an integer"));
            }
        }
        FieldKind::Timestamp => {
            if !value.is_i64() && !value.is_u64() {
                errors.push(format!("{path}: expected an epoch-millis timestamp"));
            }
        }
        FieldKind::Enum(allowed) => {
            let ok = value.as_str().is_some_and(|s| allowed.contains(&s));
            if !ok {
                errors.push(format!("{path}: expected one of {allowed:?}"));
            }
        }
        FieldKind::Array(element) => match value.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    validate_kind(&format!("{path}.{i}"), element, item, errors);
                }
            }
            None => errors.push(format!("{path}: expected an array")),
        },
        FieldKind::Object(schema) => schema.validate_at(path, value, errors),
    }
}

/// Registry of per-collection validators.
#[derive(Clone, Debug, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<&'static str, Schema>,
}

impl SchemaRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the schema for a collection
    pub fn register(&mut self, collection: &'static str, schema: Schema) {
        self.schemas.insert(collection, schema);
    }

    /// Validate one document against its collection's schema.
    pub fn validate(&self, collection: &str, item: &Value) -> Result<()> {
        let Some(schema) = self.schemas.get(collection) else {
            return Err(Error::validation(
                collection,
                vec![format!("unknown collection: {collection}")],
            ));
        };
        let errors = schema.validate(item);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::validation(collection, errors))
        }
    }
}
