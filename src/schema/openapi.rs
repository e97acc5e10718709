//! Minimal OpenAPI v2 schema model
//!
//! Only the parts of the swagger document the resolver walks are modeled:
//! the flat `definitions` table and, per schema, `type`, `format`,
//! `properties`, `items`, `additionalProperties` and `$ref`. References stay
//! as strings and are resolved lazily against the definitions table, so the
//! recursive structure is finite even for self-referential schemas.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The cluster OpenAPI v2 document, reduced to its definitions table
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Document {
    /// Flat table of named schemas
    #[serde(default)]
    pub definitions: BTreeMap<String, Schema>,
}

/// A JSON schema node
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Declared type(s). Swagger uses a single string; some CRD schemas
    /// declare several.
    #[serde(default, rename = "type", skip_serializing_if = "StringOrStrings::is_empty")]
    pub schema_type: StringOrStrings,

    /// Declared format, e.g. `int32` or `byte`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub format: String,

    /// Named properties of an object schema
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Schema>,

    /// Item schema of an array schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,

    /// Schema (or boolean flag) for free-form map values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<SchemaOrBool>,

    /// Reference into the definitions table, `#/definitions/<name>`
    #[serde(default, rename = "$ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

/// `type` field: a single string or a list of strings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum StringOrStrings {
    /// Single declared type
    One(String),
    /// Multiple allowed types
    Many(Vec<String>),
}

impl Default for StringOrStrings {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl StringOrStrings {
    /// True when no type is declared
    pub fn is_empty(&self) -> bool {
        match self {
            Self::One(s) => s.is_empty(),
            Self::Many(v) => v.is_empty(),
        }
    }

    /// True when the given type name is among the declared types
    pub fn contains(&self, name: &str) -> bool {
        match self {
            Self::One(s) => s == name,
            Self::Many(v) => v.iter().any(|s| s == name),
        }
    }

    /// Declared types as a vector
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s.clone()],
            Self::Many(v) => v.clone(),
        }
    }
}

/// `additionalProperties`: either a nested schema or a boolean flag
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SchemaOrBool {
    /// Value schema for map entries
    Schema(Box<Schema>),
    /// Bare allow/deny flag, carries no type information
    Bool(bool),
}

impl SchemaOrBool {
    /// The nested schema, when one is present
    pub fn as_schema(&self) -> Option<&Schema> {
        match self {
            Self::Schema(s) => Some(s),
            Self::Bool(_) => None,
        }
    }
}

impl Schema {
    /// Name a `$ref` points at, when it targets the definitions table.
    ///
    /// Only `#/definitions/<name>` pointers are supported; anything else
    /// returns None and the referencing schema is used as-is.
    pub fn reference_name(&self) -> Option<&str> {
        self.reference
            .as_deref()
            .and_then(|r| r.strip_prefix("#/definitions/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_type_with_format() {
        let schema: Schema =
            serde_json::from_str(r#"{"type": "integer", "format": "int32"}"#).unwrap();
        assert!(schema.schema_type.contains("integer"));
        assert_eq!(schema.format, "int32");
    }

    #[test]
    fn parses_multiple_types() {
        let schema: Schema = serde_json::from_str(r#"{"type": ["string", "null"]}"#).unwrap();
        assert!(schema.schema_type.contains("string"));
        assert!(schema.schema_type.contains("null"));
        assert_eq!(schema.schema_type.to_vec().len(), 2);
    }

    #[test]
    fn parses_ref() {
        let schema: Schema = serde_json::from_str(
            r##"{"$ref": "#/definitions/io.k8s.api.apps.v1.DeploymentSpec"}"##,
        )
        .unwrap();
        assert_eq!(
            schema.reference_name(),
            Some("io.k8s.api.apps.v1.DeploymentSpec")
        );
    }

    #[test]
    fn non_definitions_ref_is_ignored() {
        let schema: Schema = serde_json::from_str(r##"{"$ref": "#/parameters/foo"}"##).unwrap();
        assert_eq!(schema.reference_name(), None);
    }

    #[test]
    fn additional_properties_bool_carries_no_schema() {
        let schema: Schema =
            serde_json::from_str(r#"{"type": "object", "additionalProperties": true}"#).unwrap();
        assert!(schema.additional_properties.unwrap().as_schema().is_none());
    }

    #[test]
    fn additional_properties_schema_is_usable() {
        let schema: Schema = serde_json::from_str(
            r#"{"type": "object", "additionalProperties": {"type": "string"}}"#,
        )
        .unwrap();
        let value_schema = schema.additional_properties.unwrap();
        assert!(value_schema.as_schema().unwrap().schema_type.contains("string"));
    }

    #[test]
    fn parses_document_definitions() {
        let doc: Document = serde_json::from_str(
            r#"{
                "swagger": "2.0",
                "definitions": {
                    "io.k8s.api.core.v1.Pod": {
                        "type": "object",
                        "properties": {"spec": {"type": "object"}}
                    }
                }
            }"#,
        )
        .unwrap();
        assert!(doc.definitions.contains_key("io.k8s.api.core.v1.Pod"));
    }
}
