use std::collections::BTreeMap;

use crate::error::ObjectError;
use crate::hash::{ContentHash, IdHash};

/// A single field value inside an [`ObjectData`] record.
///
/// The variant set mirrors the recipe item types: there is no open-map
/// fallback, every stored object is a tagged record with typed fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Number(f64),
    Text(String),
    /// Ordered sequence; element order is preserved exactly.
    Array(Vec<Value>),
    /// Unordered collection; deduplicated and canonically sorted at encode
    /// time, so insertion order never reaches the hash.
    Set(Vec<Value>),
    /// Reference to a specific revision by content hash.
    Reference(ContentHash),
    /// Reference to a logical object by id hash.
    IdReference(IdHash),
    /// Nested record, validated against its own recipe.
    Object(ObjectData),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Number(_) => "number",
            Value::Text(_) => "string",
            Value::Array(_) => "array",
            Value::Set(_) => "set",
            Value::Reference(_) => "reference",
            Value::IdReference(_) => "id-reference",
            Value::Object(_) => "object",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&[Value]> {
        match self {
            Value::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<ContentHash> {
        match self {
            Value::Reference(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_id_reference(&self) -> Option<IdHash> {
        match self {
            Value::IdReference(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectData> {
        match self {
            Value::Object(v) => Some(v),
            _ => None,
        }
    }
}

/// A typed record: a `kind` discriminator naming its recipe plus named,
/// typed fields. Field insertion order is irrelevant — the recipe dictates
/// encoding order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectData {
    kind: String,
    fields: BTreeMap<String, Value>,
}

impl ObjectData {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Builder-style field assignment.
    pub fn with(mut self, prop: impl Into<String>, value: Value) -> Self {
        self.fields.insert(prop.into(), value);
        self
    }

    /// Builder-style optional field: `None` leaves the field absent.
    pub fn with_opt(mut self, prop: impl Into<String>, value: Option<Value>) -> Self {
        if let Some(value) = value {
            self.fields.insert(prop.into(), value);
        }
        self
    }

    pub fn set(&mut self, prop: impl Into<String>, value: Value) {
        self.fields.insert(prop.into(), value);
    }

    pub fn clear_field(&mut self, prop: &str) {
        self.fields.remove(prop);
    }

    pub fn get(&self, prop: &str) -> Option<&Value> {
        self.fields.get(prop)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    // ── Typed accessors ──────────────────────────────────────────────────
    //
    // Used by the entity conversions; a missing or mistyped field is a
    // decoding problem, not a validation one, because stored objects were
    // validated on the way in.

    pub fn require(&self, prop: &str) -> Result<&Value, ObjectError> {
        self.fields.get(prop).ok_or_else(|| {
            ObjectError::InvalidEncoding(format!("{}: missing field `{prop}`", self.kind))
        })
    }

    pub fn text(&self, prop: &str) -> Result<&str, ObjectError> {
        self.require(prop)?
            .as_text()
            .ok_or_else(|| self.type_mismatch(prop, "string"))
    }

    pub fn int(&self, prop: &str) -> Result<i64, ObjectError> {
        self.require(prop)?
            .as_int()
            .ok_or_else(|| self.type_mismatch(prop, "int"))
    }

    pub fn number(&self, prop: &str) -> Result<f64, ObjectError> {
        self.require(prop)?
            .as_number()
            .ok_or_else(|| self.type_mismatch(prop, "number"))
    }

    pub fn bool(&self, prop: &str) -> Result<bool, ObjectError> {
        self.require(prop)?
            .as_bool()
            .ok_or_else(|| self.type_mismatch(prop, "bool"))
    }

    pub fn reference(&self, prop: &str) -> Result<ContentHash, ObjectError> {
        self.require(prop)?
            .as_reference()
            .ok_or_else(|| self.type_mismatch(prop, "reference"))
    }

    pub fn id_reference(&self, prop: &str) -> Result<IdHash, ObjectError> {
        self.require(prop)?
            .as_id_reference()
            .ok_or_else(|| self.type_mismatch(prop, "id-reference"))
    }

    pub fn opt_text(&self, prop: &str) -> Result<Option<&str>, ObjectError> {
        match self.fields.get(prop) {
            None => Ok(None),
            Some(value) => value
                .as_text()
                .map(Some)
                .ok_or_else(|| self.type_mismatch(prop, "string")),
        }
    }

    pub fn opt_int(&self, prop: &str) -> Result<Option<i64>, ObjectError> {
        match self.fields.get(prop) {
            None => Ok(None),
            Some(value) => value
                .as_int()
                .map(Some)
                .ok_or_else(|| self.type_mismatch(prop, "int")),
        }
    }

    pub fn opt_number(&self, prop: &str) -> Result<Option<f64>, ObjectError> {
        match self.fields.get(prop) {
            None => Ok(None),
            Some(value) => value
                .as_number()
                .map(Some)
                .ok_or_else(|| self.type_mismatch(prop, "number")),
        }
    }

    pub fn opt_reference(&self, prop: &str) -> Result<Option<ContentHash>, ObjectError> {
        match self.fields.get(prop) {
            None => Ok(None),
            Some(value) => value
                .as_reference()
                .map(Some)
                .ok_or_else(|| self.type_mismatch(prop, "reference")),
        }
    }

    /// Text elements of a set field.
    pub fn text_set(&self, prop: &str) -> Result<Vec<String>, ObjectError> {
        let elements = self
            .require(prop)?
            .as_set()
            .ok_or_else(|| self.type_mismatch(prop, "set"))?;
        elements
            .iter()
            .map(|v| {
                v.as_text()
                    .map(str::to_owned)
                    .ok_or_else(|| self.type_mismatch(prop, "set of strings"))
            })
            .collect()
    }

    /// Id-reference elements of a set field.
    pub fn id_reference_set(&self, prop: &str) -> Result<Vec<IdHash>, ObjectError> {
        let elements = self
            .require(prop)?
            .as_set()
            .ok_or_else(|| self.type_mismatch(prop, "set"))?;
        elements
            .iter()
            .map(|v| {
                v.as_id_reference()
                    .ok_or_else(|| self.type_mismatch(prop, "set of id-references"))
            })
            .collect()
    }

    fn type_mismatch(&self, prop: &str, expected: &str) -> ObjectError {
        let found = self
            .fields
            .get(prop)
            .map(Value::type_name)
            .unwrap_or("absent");
        ObjectError::InvalidEncoding(format!(
            "{}: field `{prop}` is {found}, expected {expected}",
            self.kind
        ))
    }
}

/// Convenience constructors used throughout the entity conversions.
pub fn text(value: impl Into<String>) -> Value {
    Value::Text(value.into())
}

pub fn text_set(values: impl IntoIterator<Item = impl Into<String>>) -> Value {
    Value::Set(values.into_iter().map(text).collect())
}
