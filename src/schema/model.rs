//! Schema definitions: named sets of expected fields plus classification hints.

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

/// Value shape expected for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Date,
    Datetime,
    Currency,
    Number,
    Array,
    Object,
}

impl FieldType {
    /// Whether values of this type are tables that may need normalizing.
    pub fn is_structured(&self) -> bool {
        matches!(self, FieldType::Array | FieldType::Object)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

fn default_field_type() -> FieldType {
    FieldType::Text
}

/// Structural hints used by classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaHints {
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Chosen when no schema scores above zero.
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub hints: SchemaHints,
}

impl Schema {
    /// Field definition whose name matches `key` ignoring case, spaces and underscores.
    pub fn field(&self, key: &str) -> Option<&FieldDef> {
        let wanted = normalize_key(key);
        self.fields.iter().find(|f| normalize_key(&f.name) == wanted)
    }
}

/// Lowercase and fold spaces, dashes and underscores together.
pub fn normalize_key(key: &str) -> String {
    key.trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Parse and check a list of schema definitions.
pub fn parse_schemas(json: &str) -> Result<Vec<Schema>, SchemaError> {
    let schemas: Vec<Schema> =
        serde_json::from_str(json).map_err(|e| SchemaError::Definition(e.to_string()))?;

    if schemas.is_empty() {
        return Err(SchemaError::Definition("no schemas defined".into()));
    }
    let mut ids = std::collections::HashSet::new();
    for schema in &schemas {
        if !ids.insert(schema.id.as_str()) {
            return Err(SchemaError::Definition(format!(
                "duplicate schema id '{}'",
                schema.id
            )));
        }
        if schema.fields.is_empty() {
            return Err(SchemaError::Definition(format!(
                "schema '{}' has no fields",
                schema.id
            )));
        }
    }
    Ok(schemas)
}

/// Schemas shipped with the pipeline.
pub fn builtin_schemas() -> Result<Vec<Schema>, SchemaError> {
    parse_schemas(include_str!("builtin.json"))
}
