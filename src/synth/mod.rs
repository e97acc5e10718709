//! Resource synthesis
//!
//! Each item in a Template's `resources` list (or each document produced by
//! `resourcesTemplate`) is a templated object skeleton. Synthesis evaluates
//! the item's `when` guard, expands its `forEach` iteration, renders the
//! skeleton against the source object, and duck-types the result. Items may
//! carry `id`/`depends` markers that order application: an object is only
//! applied once everything it depends on is ready.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::crd::TemplateSpec;
use crate::object::Unstructured;
use crate::schema::SchemaResolver;
use crate::template::{json_path_value, TemplateEngine};
use crate::{Error, Result};

/// Synthesis-level keys that must not reach the API server
const META_KEYS: &[&str] = &["when", "forEach", "id", "depends"];

/// A rendered object together with its ordering markers
#[derive(Clone, Debug)]
pub struct Synthesized {
    /// The object to apply
    pub object: Unstructured,
    /// Ordering id other objects may depend on
    pub id: Option<String>,
    /// Ids that must be ready before this object is applied
    pub depends: Vec<String>,
}

enum Expansion {
    Single,
    Array(Vec<Value>),
    Map(Map<String, Value>),
}

/// Renders Template resource declarations into concrete objects
pub struct Synthesizer {
    engine: Arc<TemplateEngine>,
    resolver: Arc<SchemaResolver>,
}

impl Synthesizer {
    /// Create a synthesizer over the shared engine and resolver
    pub fn new(engine: Arc<TemplateEngine>, resolver: Arc<SchemaResolver>) -> Self {
        Self { engine, resolver }
    }

    /// Render every resource declaration of the template against one source
    pub async fn objects_for_source(
        &self,
        spec: &TemplateSpec,
        source: &Value,
    ) -> Result<Vec<Synthesized>> {
        let mut objects = Vec::new();
        for item in &spec.resources {
            objects.extend(self.objects_from_item(item, source).await?);
        }
        if !spec.resources_template.is_empty() {
            objects.extend(
                self.render_into_objects(&spec.resources_template, source.clone())
                    .await?,
            );
        }
        Ok(objects)
    }

    async fn objects_from_item(&self, item: &Value, source: &Value) -> Result<Vec<Synthesized>> {
        if !self.evaluate_when(item, source)? {
            debug!("when guard evaluated false, skipping item");
            return Ok(Vec::new());
        }

        // The item is JSON in the CRD; templating operates on its YAML form.
        let mut skeleton = item.clone();
        if let Some(map) = skeleton.as_object_mut() {
            map.remove("when");
            map.remove("forEach");
        }
        let text = serde_yaml::to_string(&skeleton)?;

        match self.expansion(item, source)? {
            Expansion::Single => self.render_into_objects(&text, source.clone()).await,
            Expansion::Array(values) => {
                let mut objects = Vec::new();
                for element in values {
                    let context = with_each(source, element);
                    objects.extend(self.render_into_objects(&text, context).await?);
                }
                Ok(objects)
            }
            Expansion::Map(entries) => {
                let mut objects = Vec::new();
                for (key, value) in entries {
                    let each = serde_json::json!({"key": key, "value": value});
                    let context = with_each(source, each);
                    objects.extend(self.render_into_objects(&text, context).await?);
                }
                Ok(objects)
            }
        }
    }

    fn evaluate_when(&self, item: &Value, source: &Value) -> Result<bool> {
        let Some(guard) = item.get("when").and_then(Value::as_str) else {
            return Ok(true);
        };
        if guard.is_empty() {
            return Ok(true);
        }

        let rendered = self.engine.render(guard, source)?;
        parse_bool(rendered.trim()).ok_or_else(|| {
            Error::template(format!(
                "when guard '{}' rendered '{}', expected a boolean",
                guard, rendered
            ))
        })
    }

    fn expansion(&self, item: &Value, source: &Value) -> Result<Expansion> {
        let Some(path) = item.get("forEach").and_then(Value::as_str) else {
            return Ok(Expansion::Single);
        };
        if path.is_empty() {
            return Ok(Expansion::Single);
        }

        match json_path_value(source, path) {
            None => Ok(Expansion::Single),
            Some(Value::Array(items)) => Ok(Expansion::Array(items.clone())),
            Some(Value::Object(map)) => Ok(Expansion::Map(map.clone())),
            Some(other) => Err(Error::template(format!(
                "forEach path {} resolved to {}, expected an array or map",
                path, other
            ))),
        }
    }

    /// Render a (possibly multi-document) template and parse every document
    /// into a synthesized object.
    async fn render_into_objects(&self, text: &str, context: Value) -> Result<Vec<Synthesized>> {
        let rendered = self.engine.render(text, &context)?;

        let mut values = Vec::new();
        for document in serde_yaml::Deserializer::from_str(&rendered) {
            let value = Value::deserialize(document)
                .map_err(|e| Error::template(format!("failed to parse rendered object: {}", e)))?;
            if value.is_null() {
                continue;
            }
            values.push(value);
        }

        let mut objects = Vec::new();
        for value in values {
            objects.push(self.into_synthesized(value).await?);
        }
        Ok(objects)
    }

    async fn into_synthesized(&self, mut value: Value) -> Result<Synthesized> {
        if !value.is_object() {
            return Err(Error::template(format!(
                "rendered document is not an object: {}",
                value
            )));
        }
        let id = value.get("id").and_then(Value::as_str).map(String::from);
        let depends = value
            .get("depends")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        if let Some(map) = value.as_object_mut() {
            for key in META_KEYS {
                map.remove(*key);
            }
        }

        let coerced = self.coerce(value).await?;
        Ok(Synthesized {
            object: Unstructured::new(coerced),
            id,
            depends,
        })
    }

    async fn coerce(&self, value: Value) -> Result<Value> {
        let gvk = Unstructured::new(value.clone()).gvk();
        if gvk.kind.is_empty() {
            return Ok(value);
        }
        self.resolver.duck_type_if_known(&gvk, value).await
    }
}

fn with_each(source: &Value, each: Value) -> Value {
    let mut context = source.clone();
    if let Some(map) = context.as_object_mut() {
        map.insert("each".to_string(), each);
    }
    context
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Ids of `objects` that `item` depends on but which do not exist.
///
/// A depends reference to an id nothing declares is a template bug and
/// surfaces as an error rather than an eternal requeue.
pub fn resolve_depends<'a>(
    item: &'a Synthesized,
    objects: &'a [Synthesized],
) -> Result<Vec<&'a Synthesized>> {
    item.depends
        .iter()
        .map(|id| {
            objects
                .iter()
                .find(|o| o.id.as_deref() == Some(id))
                .ok_or_else(|| Error::template(format!("no object found with id: {}", id)))
        })
        .collect()
}
