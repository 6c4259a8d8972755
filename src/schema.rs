use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Geography columns the API appends to every row. Output keys may not shadow them.
pub const STATE_COLUMN: &str = "state";
pub const PLACE_COLUMN: &str = "place";

/// One `fields` entry as written in the config document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldSpec {
    pub var: Option<String>,
    pub key: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    Int,
    Float,
    Text,
}

impl VarType {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int" | "integer" => Ok(VarType::Int),
            "float" | "number" => Ok(VarType::Float),
            "text" | "str" | "string" => Ok(VarType::Text),
            other => Err(ConfigError::UnknownType(other.to_string())),
        }
    }
}

/// An ACS variable and the client-facing key it is published under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeVariable {
    #[serde(rename = "var")]
    pub external_code: String,
    #[serde(rename = "key")]
    pub output_key: String,
    #[serde(rename = "type")]
    pub kind: VarType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Ordered variable list. Drives both the `get=` query and the output columns.
#[derive(Debug, Clone)]
pub struct SchemaMapping {
    variables: Vec<AttributeVariable>,
}

impl SchemaMapping {
    pub fn from_fields(fields: &[FieldSpec]) -> Result<Self, ConfigError> {
        if fields.is_empty() {
            return Err(ConfigError::NoFields);
        }

        let mut keys = HashSet::new();
        let mut codes = HashSet::new();
        let mut variables = Vec::with_capacity(fields.len());

        for (index, f) in fields.iter().enumerate() {
            let external_code = required(f.var.as_deref(), index, "var")?;
            let output_key = required(f.key.as_deref(), index, "key")?;
            let kind = match f.kind.as_deref() {
                Some(t) => VarType::parse(t)?,
                None => VarType::Float,
            };

            if output_key == STATE_COLUMN || output_key == PLACE_COLUMN {
                return Err(ConfigError::ReservedOutputKey(output_key));
            }
            if !keys.insert(output_key.clone()) {
                return Err(ConfigError::DuplicateOutputKey(output_key));
            }
            if !codes.insert(external_code.clone()) {
                return Err(ConfigError::DuplicateVariable(external_code));
            }

            variables.push(AttributeVariable {
                external_code,
                output_key,
                kind,
                unit: f.unit.clone().filter(|u| !u.trim().is_empty()),
            });
        }

        Ok(SchemaMapping { variables })
    }

    pub fn variables(&self) -> &[AttributeVariable] {
        &self.variables
    }

    /// Comma-joined variable codes for the `get=` parameter.
    pub fn get_param(&self) -> String {
        self.variables
            .iter()
            .map(|v| v.external_code.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn required(value: Option<&str>, index: usize, field: &'static str) -> Result<String, ConfigError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ConfigError::MissingField { index, field }),
    }
}
