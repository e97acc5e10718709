//! Schema resolution by Group/Version/Kind and dotted field path
//!
//! Built-in kinds resolve through the OpenAPI definitions table under the
//! canonical name `io.k8s.api.<group|"core">.<version>.<kind>`. Kinds that
//! are absent there (or present with an empty property set, as CRDs are)
//! fall back to the CRD list and a schema synthesized from the CRD's
//! `openAPIV3Schema`.

use std::sync::Arc;

use kube::core::GroupVersionKind;

use super::cache::SchemaCache;
use super::openapi::{Document, Schema};
use crate::{Error, Result};

/// The declared type(s) and format of a single field
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TypedField {
    /// Declared JSON types; a set because some CRD schemas declare several
    pub types: Vec<String>,
    /// Declared format, e.g. `int32`, `byte`, `int-or-string`
    pub format: String,
}

impl TypedField {
    /// True when the given type name is declared
    pub fn has_type(&self, name: &str) -> bool {
        self.types.iter().any(|t| t == name)
    }
}

impl From<&Schema> for TypedField {
    fn from(schema: &Schema) -> Self {
        Self {
            types: schema.schema_type.to_vec(),
            format: schema.format.clone(),
        }
    }
}

/// Resolves schemas and field types against the shared [`SchemaCache`]
pub struct SchemaResolver {
    cache: Arc<SchemaCache>,
}

impl SchemaResolver {
    /// Create a resolver over the given cache
    pub fn new(cache: Arc<SchemaCache>) -> Self {
        Self { cache }
    }

    /// The shared schema cache
    pub fn cache(&self) -> &Arc<SchemaCache> {
        &self.cache
    }

    /// Find the root schema for a kind, falling back to the CRD list
    pub async fn find_schema_for_kind(&self, gvk: &GroupVersionKind) -> Result<Arc<Schema>> {
        let document = self.cache.fetch_schema().await?;
        let name = definition_name(gvk);

        // CRD kinds sometimes appear in the definitions table with an empty
        // property set; those must resolve through the CRD itself.
        if let Some(schema) = document.definitions.get(&name) {
            if !schema.properties.is_empty() {
                return Ok(Arc::new(schema.clone()));
            }
        }

        self.find_schema_for_crd(gvk).await
    }

    async fn find_schema_for_crd(&self, gvk: &GroupVersionKind) -> Result<Arc<Schema>> {
        let crds = self.cache.fetch_crds().await?;
        for crd in crds.iter() {
            if crd.spec.group != gvk.group || crd.spec.names.kind != gvk.kind {
                continue;
            }
            if let Some(version) = crd.spec.versions.iter().find(|v| v.name == gvk.version) {
                return self.cache.cached_convert_schema(gvk, version).await;
            }
        }
        Err(Error::schema(format!(
            "schema for group={} version={} kind={} not found",
            gvk.group, gvk.version, gvk.kind
        )))
    }

    /// The declared type of `key` (dotted path) on the given kind
    pub async fn find_type_for_key(
        &self,
        gvk: &GroupVersionKind,
        key: &str,
    ) -> Result<TypedField> {
        let schema = self.find_schema_for_kind(gvk).await?;
        let document = self.cache.fetch_schema().await?;
        find_type_in(&document, &schema, key)
    }

    /// Coerce an untyped object into the types its kind's schema declares.
    ///
    /// See [`super::coerce::duck_type`] for the coercion rules.
    pub async fn duck_type(
        &self,
        gvk: &GroupVersionKind,
        value: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let schema = self.find_schema_for_kind(gvk).await?;
        let document = self.cache.fetch_schema().await?;
        super::coerce::duck_type(&document, &schema, value)
    }

    /// Like [`Self::duck_type`], but a kind the cluster does not know passes
    /// through uncoerced (offline runs, CRDs installed later). Real coercion
    /// failures still surface.
    pub async fn duck_type_if_known(
        &self,
        gvk: &GroupVersionKind,
        value: serde_json::Value,
    ) -> Result<serde_json::Value> {
        match self.find_schema_for_kind(gvk).await {
            Ok(schema) => {
                let document = self.cache.fetch_schema().await?;
                super::coerce::duck_type(&document, &schema, value)
            }
            Err(e) => {
                tracing::warn!(kind = %gvk.kind, error = %e, "no schema for kind, skipping coercion");
                Ok(value)
            }
        }
    }
}

/// Canonical OpenAPI definition name for a kind
pub(crate) fn definition_name(gvk: &GroupVersionKind) -> String {
    let group = if gvk.group.is_empty() {
        "core"
    } else {
        &gvk.group
    };
    format!("io.k8s.api.{}.{}.{}", group, gvk.version, gvk.kind)
}

/// Resolve the declared type of `key` against a root schema
pub(crate) fn find_type_in(document: &Document, schema: &Schema, key: &str) -> Result<TypedField> {
    let field = find_field_schema(document, schema, key)
        .map_err(|e| Error::schema(format!("failed to find type for key {}: {}", key, e)))?;
    Ok(TypedField::from(field))
}

fn resolve_reference<'a>(document: &'a Document, schema: &'a Schema) -> Result<&'a Schema> {
    match schema.reference_name() {
        Some(name) => document
            .definitions
            .get(name)
            .ok_or_else(|| Error::schema(format!("definition {} not found", name))),
        None => Ok(schema),
    }
}

fn find_field_schema<'a>(
    document: &'a Document,
    schema: &'a Schema,
    key: &str,
) -> Result<&'a Schema> {
    let (head, tail) = match key.split_once('.') {
        Some((head, tail)) => (head, Some(tail)),
        None => (key, None),
    };

    let field = match schema.properties.get(head) {
        Some(field) => field,
        None => {
            // Map-valued fields (labels, annotations, parameter maps) carry
            // their value type in additionalProperties.
            let fallback = schema
                .additional_properties
                .as_ref()
                .and_then(|ap| ap.as_schema())
                .filter(|_| schema.schema_type.contains("object"));
            match fallback {
                Some(value_schema) => value_schema,
                None => return Err(Error::schema(format!("failed to find property {}", head))),
            }
        }
    };

    let Some(tail) = tail else {
        return resolve_reference(document, field);
    };

    // Arrays are addressed through a numeric index segment which carries no
    // schema of its own; consume it and descend into the item schema.
    let (field, tail) = if field.schema_type.contains("array") {
        let items = field
            .items
            .as_deref()
            .ok_or_else(|| Error::schema(format!("array field {} has no item schema", head)))?;
        match tail.split_once('.') {
            Some((_index, rest)) => (items, rest),
            None => {
                return Err(Error::schema(
                    "found array index as last element of key".to_string(),
                ))
            }
        }
    } else {
        (field, tail)
    };

    let field = resolve_reference(document, field)?;
    find_field_schema(document, field, tail)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use serde_json::json;

    /// A swagger document with the kinds the resolver tests exercise
    pub fn document() -> Document {
        serde_json::from_value(json!({
            "definitions": {
                "io.k8s.api.apps.v1.Deployment": {
                    "type": "object",
                    "properties": {
                        "apiVersion": {"type": "string"},
                        "kind": {"type": "string"},
                        "metadata": {"$ref": "#/definitions/io.k8s.apimachinery.pkg.apis.meta.v1.ObjectMeta"},
                        "spec": {"$ref": "#/definitions/io.k8s.api.apps.v1.DeploymentSpec"}
                    }
                },
                "io.k8s.api.apps.v1.DeploymentSpec": {
                    "type": "object",
                    "properties": {
                        "replicas": {"type": "integer", "format": "int32"},
                        "paused": {"type": "boolean"},
                        "template": {"type": "object"}
                    }
                },
                "io.k8s.apimachinery.pkg.apis.meta.v1.ObjectMeta": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "namespace": {"type": "string"},
                        "annotations": {
                            "type": "object",
                            "additionalProperties": {"type": "string"}
                        }
                    }
                },
                "io.k8s.api.core.v1.Secret": {
                    "type": "object",
                    "properties": {
                        "apiVersion": {"type": "string"},
                        "kind": {"type": "string"},
                        "metadata": {"$ref": "#/definitions/io.k8s.apimachinery.pkg.apis.meta.v1.ObjectMeta"},
                        "data": {
                            "type": "object",
                            "additionalProperties": {"type": "string", "format": "byte"}
                        },
                        "stringData": {
                            "type": "object",
                            "additionalProperties": {"type": "string"}
                        }
                    }
                },
                "io.k8s.api.networking.v1.Ingress": {
                    "type": "object",
                    "properties": {
                        "spec": {"$ref": "#/definitions/io.k8s.api.networking.v1.IngressSpec"}
                    }
                },
                "io.k8s.api.networking.v1.IngressSpec": {
                    "type": "object",
                    "properties": {
                        "rules": {
                            "type": "array",
                            "items": {"$ref": "#/definitions/io.k8s.api.networking.v1.IngressRule"}
                        }
                    }
                },
                "io.k8s.api.networking.v1.IngressRule": {
                    "type": "object",
                    "properties": {
                        "host": {"type": "string"}
                    }
                }
            }
        }))
        .unwrap()
    }

    /// A CRD-style schema for a PostgresqlDB kind
    pub fn postgresql_db_schema() -> Schema {
        serde_json::from_value(json!({
            "type": "object",
            "properties": {
                "apiVersion": {"type": "string"},
                "kind": {"type": "string"},
                "metadata": {"type": "object"},
                "spec": {
                    "type": "object",
                    "properties": {
                        "replicas": {"type": "integer"},
                        "interval": {"type": "integer", "format": "int64"},
                        "parameters": {
                            "type": "object",
                            "additionalProperties": {"type": "string"}
                        },
                        "postgresql": {
                            "type": "object",
                            "properties": {
                                "parameters": {"type": "object"}
                            }
                        }
                    }
                }
            }
        }))
        .unwrap()
    }
}
