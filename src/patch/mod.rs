//! Patch application
//!
//! A patch is a text template that renders into either a strategic-merge
//! overlay (YAML) or an RFC-6902 operations document. Rendering sees the
//! patch target under the `source` name; the rendered overlay is duck-typed
//! against the target's schema before merging so string-rendered scalars
//! land with their declared types.

mod merge;

pub use merge::strategic_merge;

use std::sync::Arc;

use serde_json::json;

use crate::object::Unstructured;
use crate::schema::SchemaResolver;
use crate::template::TemplateEngine;
use crate::{Error, Result};

/// The two patch dialects a Template may carry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchType {
    /// YAML strategic-merge overlay
    StrategicMerge,
    /// RFC-6902 operation list
    Json,
}

/// Applies rendered patches to unstructured targets
pub struct PatchEngine {
    engine: Arc<TemplateEngine>,
    resolver: Arc<SchemaResolver>,
}

impl PatchEngine {
    /// Create a patch engine over the shared template engine and resolver
    pub fn new(engine: Arc<TemplateEngine>, resolver: Arc<SchemaResolver>) -> Self {
        Self { engine, resolver }
    }

    /// Apply one patch to the target, returning the patched object.
    ///
    /// The input target is left untouched; identity fields
    /// (apiVersion/kind/name/namespace) always survive the patch, and
    /// blacklisted annotations are stripped from the result.
    pub async fn apply(
        &self,
        target: &Unstructured,
        patch_text: &str,
        patch_type: PatchType,
    ) -> Result<Unstructured> {
        // Historical name: at this stage "source" is the patch target.
        let context = json!({"source": target.value()});
        let rendered = self.engine.render(patch_text, &context)?;

        let mut patched = match patch_type {
            PatchType::StrategicMerge => self.apply_strategic(target, &rendered).await?,
            PatchType::Json => self.apply_json(target, &rendered)?,
        };

        patched.restore_identity(target);
        patched.strip_blacklisted_annotations();
        Ok(patched)
    }

    /// Apply a numbered patch, wrapping failures with the ordinal
    pub async fn apply_indexed(
        &self,
        index: usize,
        target: &Unstructured,
        patch_text: &str,
        patch_type: PatchType,
    ) -> Result<Unstructured> {
        self.apply(target, patch_text, patch_type)
            .await
            .map_err(|e| Error::patch(index, e.to_string()))
    }

    async fn apply_strategic(&self, target: &Unstructured, rendered: &str) -> Result<Unstructured> {
        let mut overlay = Unstructured::from_yaml(rendered)
            .map_err(|e| Error::template(format!("failed to parse rendered patch: {}", e)))?;

        if overlay.name().is_empty() {
            overlay.set_name(target.name());
        }
        if overlay.namespace().is_empty() && !target.namespace().is_empty() {
            overlay.set_namespace(target.namespace());
        }

        let coerced = self
            .resolver
            .duck_type_if_known(&target.gvk(), overlay.into_value())
            .await?;

        Ok(Unstructured::new(strategic_merge(
            target.value(),
            &coerced,
        )))
    }

    fn apply_json(&self, target: &Unstructured, rendered: &str) -> Result<Unstructured> {
        let operations: json_patch::Patch = serde_yaml::from_str(rendered)
            .map_err(|e| Error::template(format!("failed to parse json patch: {}", e)))?;

        let mut document = target.value().clone();
        json_patch::patch(&mut document, &operations)
            .map_err(|e| Error::template(format!("failed to apply json patch: {}", e)))?;
        Ok(Unstructured::new(document))
    }
}
