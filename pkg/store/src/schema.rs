//! Per-entity field descriptors handed to the engine at bind time.

use serde_json::Value;

use crate::{
    StoreError,
    engine::{Document, ID_FIELD},
    filter::Update,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    /// RFC 3339 string.
    Date,
    Array,
    Object,
    Any,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub allowed: Vec<String>,
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            allowed: Vec::new(),
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn one_of<S: AsRef<str>>(mut self, values: impl IntoIterator<Item = S>) -> Self {
        self.allowed = values.into_iter().map(|v| v.as_ref().to_string()).collect();
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    fn check(&self, value: &Value) -> Result<(), StoreError> {
        if value.is_null() {
            if self.required {
                return Err(self.violation("is required"));
            }
            return Ok(());
        }
        let kind_ok = match self.kind {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Date => value
                .as_str()
                .is_some_and(|raw| chrono::DateTime::parse_from_rfc3339(raw).is_ok()),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        };
        if !kind_ok {
            return Err(self.violation(&format!("must be {:?}", self.kind).to_lowercase()));
        }
        if !self.allowed.is_empty() {
            let allowed = value
                .as_str()
                .is_some_and(|raw| self.allowed.iter().any(|a| a == raw));
            if !allowed {
                return Err(self.violation(&format!("must be one of {:?}", self.allowed)));
            }
        }
        Ok(())
    }

    fn violation(&self, reason: &str) -> StoreError {
        StoreError::SchemaViolation {
            field: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchemaDescriptor {
    pub fields: Vec<FieldSpec>,
}

impl SchemaDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    pub fn spec(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn apply_defaults(&self, document: &mut Document) {
        for spec in &self.fields {
            if let Some(default) = &spec.default {
                let missing = document.get(&spec.name).is_none_or(Value::is_null);
                if missing {
                    document.insert(spec.name.clone(), default.clone());
                }
            }
        }
    }

    pub fn validate(&self, document: &Document) -> Result<(), StoreError> {
        for spec in &self.fields {
            spec.check(document.get(&spec.name).unwrap_or(&Value::Null))?;
        }
        Ok(())
    }

    /// Checks only the fields an update writes.
    pub fn validate_update(&self, update: &Update) -> Result<(), StoreError> {
        for (field, value) in &update.set {
            if field == ID_FIELD {
                continue;
            }
            if let Some(spec) = self.spec(field) {
                spec.check(value)?;
            }
        }
        for (field, _) in &update.push {
            if let Some(spec) = self.spec(field)
                && !matches!(spec.kind, FieldKind::Array | FieldKind::Any)
            {
                return Err(spec.violation("is not an array"));
            }
        }
        Ok(())
    }
}
