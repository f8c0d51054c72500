//! Declarative argument schemas and validation.
//!
//! A [`Schema`] is a plain data structure built by explicit construction
//! calls, independent of any typed input representation. Validation walks a
//! decoded JSON value against the schema and reports the first failing field
//! path; [`Schema::conform`] additionally fills in declared defaults for
//! absent optional properties before the value is handed to a handler.
//!
//! Properties not declared in an object schema pass through untouched
//! (permissive validation). Conforming an already-conformed value produces
//! the identical value.

use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use thiserror::Error;

/// The kind of value a schema describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    /// A JSON object with declared properties.
    Object,
    /// A JSON array with an item schema.
    Array,
    /// A JSON string.
    String,
    /// A JSON integer.
    Integer,
    /// A JSON boolean.
    Boolean,
}

impl SchemaKind {
    /// Returns the wire label for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::String => value.is_string(),
            Self::Integer => value.as_i64().is_some(),
            Self::Boolean => value.is_boolean(),
        }
    }
}

/// Describes the actual kind of a JSON value, for error messages.
fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A validation failure, carrying the first failing field path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {reason}")]
pub struct ValidationError {
    /// Dotted path to the failing field, `$` for the root value.
    pub path: String,
    /// Human-readable reason for the failure.
    pub reason: String,
}

impl ValidationError {
    fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

fn child_path(path: &str, name: &str) -> String {
    format!("{path}.{name}")
}

/// A declarative description of a value's shape.
///
/// Immutable once constructed; registries share schemas across concurrent
/// dispatches without synchronisation.
#[derive(Debug, Clone)]
pub struct Schema {
    kind: SchemaKind,
    description: Option<String>,
    properties: IndexMap<String, Schema>,
    required: Vec<String>,
    items: Option<Box<Schema>>,
    allowed: Vec<Value>,
    minimum: Option<i64>,
    maximum: Option<i64>,
    default: Option<Value>,
}

impl Schema {
    fn with_kind(kind: SchemaKind) -> Self {
        Self {
            kind,
            description: None,
            properties: IndexMap::new(),
            required: Vec::new(),
            items: None,
            allowed: Vec::new(),
            minimum: None,
            maximum: None,
            default: None,
        }
    }

    /// An object schema with no properties declared yet.
    #[must_use]
    pub fn object() -> Self {
        Self::with_kind(SchemaKind::Object)
    }

    /// An array schema whose elements conform to `items`.
    #[must_use]
    pub fn array(items: Self) -> Self {
        let mut schema = Self::with_kind(SchemaKind::Array);
        schema.items = Some(Box::new(items));
        schema
    }

    /// A string schema.
    #[must_use]
    pub fn string() -> Self {
        Self::with_kind(SchemaKind::String)
    }

    /// An integer schema.
    #[must_use]
    pub fn integer() -> Self {
        Self::with_kind(SchemaKind::Integer)
    }

    /// A boolean schema.
    #[must_use]
    pub fn boolean() -> Self {
        Self::with_kind(SchemaKind::Boolean)
    }

    /// Declares a named property on an object schema.
    #[must_use]
    pub fn property(mut self, name: impl Into<String>, schema: Self) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    /// Marks the named properties as required.
    #[must_use]
    pub fn required<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(names.into_iter().map(Into::into));
        self
    }

    /// Restricts the value to an enumerated set.
    #[must_use]
    pub fn allowed<I>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        self.allowed.extend(values);
        self
    }

    /// Declares an inclusive lower bound for an integer schema.
    #[must_use]
    pub const fn minimum(mut self, bound: i64) -> Self {
        self.minimum = Some(bound);
        self
    }

    /// Declares an inclusive upper bound for an integer schema.
    #[must_use]
    pub const fn maximum(mut self, bound: i64) -> Self {
        self.maximum = Some(bound);
        self
    }

    /// Declares a default applied when the property is absent and optional.
    #[must_use]
    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Attaches a human-readable description.
    #[must_use]
    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    /// Returns the schema's kind.
    #[must_use]
    pub const fn kind(&self) -> SchemaKind {
        self.kind
    }

    /// Validates `value` without applying defaults.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] encountered, walking object
    /// properties in declaration order.
    pub fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        self.conform(value.clone()).map(|_| ())
    }

    /// Validates `value` and fills in declared defaults for absent optional
    /// properties, returning the conformed value.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] encountered, walking object
    /// properties in declaration order.
    pub fn conform(&self, value: Value) -> Result<Value, ValidationError> {
        self.conform_at(value, "$")
    }

    fn conform_at(&self, value: Value, path: &str) -> Result<Value, ValidationError> {
        if !self.kind.matches(&value) {
            return Err(ValidationError::new(
                path,
                format!("expected {}, got {}", self.kind.as_str(), kind_of(&value)),
            ));
        }

        if !self.allowed.is_empty() && !self.allowed.contains(&value) {
            return Err(ValidationError::new(
                path,
                format!("value {value} is not one of the allowed values"),
            ));
        }

        if let Some(number) = value.as_i64() {
            if let Some(minimum) = self.minimum {
                if number < minimum {
                    return Err(ValidationError::new(
                        path,
                        format!("value {number} is below the minimum {minimum}"),
                    ));
                }
            }
            if let Some(maximum) = self.maximum {
                if number > maximum {
                    return Err(ValidationError::new(
                        path,
                        format!("value {number} is above the maximum {maximum}"),
                    ));
                }
            }
        }

        match value {
            Value::Object(map) => self.conform_object(map, path),
            Value::Array(values) => self.conform_array(values, path),
            other => Ok(other),
        }
    }

    fn conform_object(
        &self,
        mut map: Map<String, Value>,
        path: &str,
    ) -> Result<Value, ValidationError> {
        // Walk declared properties in declaration order so the first
        // reported failure is deterministic.
        for (name, property) in &self.properties {
            let is_required = self.required.iter().any(|required| required == name);
            match map.remove(name) {
                Some(present) => {
                    let conformed = property.conform_at(present, &child_path(path, name))?;
                    map.insert(name.clone(), conformed);
                }
                None if is_required => {
                    return Err(ValidationError::new(
                        child_path(path, name),
                        "missing required property",
                    ));
                }
                None => {
                    if let Some(default) = &property.default {
                        map.insert(name.clone(), default.clone());
                    }
                }
            }
        }

        // Required names without a declared property schema.
        for name in &self.required {
            if !map.contains_key(name) {
                return Err(ValidationError::new(
                    child_path(path, name),
                    "missing required property",
                ));
            }
        }

        Ok(Value::Object(map))
    }

    fn conform_array(&self, values: Vec<Value>, path: &str) -> Result<Value, ValidationError> {
        let Some(items) = &self.items else {
            return Ok(Value::Array(values));
        };

        let mut conformed = Vec::with_capacity(values.len());
        for (index, item) in values.into_iter().enumerate() {
            conformed.push(items.conform_at(item, &format!("{path}[{index}]"))?);
        }
        Ok(Value::Array(conformed))
    }

    /// Renders the schema as a JSON value for capability listings.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("type".to_string(), json!(self.kind.as_str()));
        if let Some(description) = &self.description {
            object.insert("description".to_string(), json!(description));
        }
        if !self.properties.is_empty() {
            let properties: Map<String, Value> = self
                .properties
                .iter()
                .map(|(name, schema)| (name.clone(), schema.to_value()))
                .collect();
            object.insert("properties".to_string(), Value::Object(properties));
        }
        if !self.required.is_empty() {
            object.insert("required".to_string(), json!(self.required));
        }
        if let Some(items) = &self.items {
            object.insert("items".to_string(), items.to_value());
        }
        if !self.allowed.is_empty() {
            object.insert("enum".to_string(), Value::Array(self.allowed.clone()));
        }
        if let Some(minimum) = self.minimum {
            object.insert("minimum".to_string(), json!(minimum));
        }
        if let Some(maximum) = self.maximum {
            object.insert("maximum".to_string(), json!(maximum));
        }
        if let Some(default) = &self.default {
            object.insert("default".to_string(), default.clone());
        }
        Value::Object(object)
    }
}
