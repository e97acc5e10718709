//! Template Custom Resource Definition
//!
//! A Template selects source objects in the cluster (or files in a
//! GitRepository artifact) and declares how to reshape them: strategic-merge
//! patches, RFC-6902 patches, synthesized resources, and namespace copies.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Specification for a Template
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "templating.flanksource.com",
    version = "v1",
    kind = "Template",
    plural = "templates",
    status = "TemplateStatus",
    printcolumn = r#"{"name":"Source Kind","type":"string","jsonPath":".spec.source.kind"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    /// Selects the objects to use as templating sources
    #[serde(default)]
    pub source: ResourceSelector,

    /// Optionally selects a related resource to patch instead of the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_target: Option<ResourceSelector>,

    /// Ordered strategic-merge patch templates applied to each target
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<String>,

    /// Ordered RFC-6902 patch templates applied to each target
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub json_patches: Vec<JsonPatch>,

    /// New resources to synthesize for each source found, as templated
    /// object skeletons
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Value>,

    /// Alternative form of `resources`: a single multi-document template
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resources_template: String,

    /// Materialize the source object into additional namespaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_to_namespaces: Option<CopyToNamespaces>,

    /// Apply patches at most once per target, tracked by annotation
    #[serde(default)]
    pub onceoff: bool,
}

/// Open status map, preserved across apply cycles
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct TemplateStatus(pub BTreeMap<String, String>);

/// Selects cluster objects by kind, labels, namespaces and fields
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    /// `group/version` of the source objects, e.g. `apps/v1`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,

    /// Kind of the source objects, e.g. `Deployment`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    /// Label selector applied to the source listing
    #[serde(default, skip_serializing_if = "Selector::is_empty")]
    pub label_selector: Selector,

    /// Namespace selector; empty means all namespaces
    #[serde(default, skip_serializing_if = "Selector::is_empty")]
    pub namespace_selector: Selector,

    /// Field selector applied to the source listing, e.g.
    /// `metadata.name=nginx`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub field_selector: String,

    /// Path into each source producing a sub-iteration
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub for_each: String,

    /// Use files from a GitRepository artifact as sources instead of
    /// cluster objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repository: Option<GitRepositoryRef>,
}

/// Reference to a fluxcd GitRepository whose artifact supplies file sources
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositoryRef {
    /// GitRepository name
    pub name: String,
    /// GitRepository namespace
    pub namespace: String,
    /// Glob matched against file paths inside the archive
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub glob: String,
}

/// An RFC-6902 patch and the object kind it targets
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct JsonPatch {
    /// Kind selector for the patch target
    pub object: PatchObject,
    /// Templated RFC-6902 operations document
    pub patch: String,
}

/// apiVersion/kind pair selecting the objects a JSON patch applies to
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatchObject {
    /// `group/version` of the target
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    /// Kind of the target
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

/// Destination namespaces for source copies
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CopyToNamespaces {
    /// Explicit destination namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    /// Additional destinations selected by namespace labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<Selector>,
}

/// Label selector with equality and set-based requirements
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    /// Equality requirements, ANDed together
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    /// Set-based requirements, ANDed together
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<SelectorRequirement>,
}

/// A single set-based selector requirement
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SelectorRequirement {
    /// Label key
    pub key: String,
    /// One of `In`, `NotIn`, `Exists`, `DoesNotExist`
    pub operator: String,
    /// Values for `In`/`NotIn`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl Selector {
    /// True when no requirement is present
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// Render the selector in the list-options string form understood by the
    /// API server, e.g. `app=nginx,tier in (web,api)`.
    pub fn to_label_selector(&self) -> String {
        let mut parts: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        for req in &self.match_expressions {
            match req.operator.as_str() {
                "In" => parts.push(format!("{} in ({})", req.key, req.values.join(","))),
                "NotIn" => parts.push(format!("{} notin ({})", req.key, req.values.join(","))),
                "Exists" => parts.push(req.key.clone()),
                "DoesNotExist" => parts.push(format!("!{}", req.key)),
                other => {
                    tracing::warn!(operator = %other, key = %req.key, "Unknown selector operator, skipping");
                }
            }
        }

        parts.join(",")
    }
}

impl Template {
    /// Namespace recorded in the applied-annotation key. Templates are
    /// cluster-scoped so this is normally empty, but the annotation format
    /// keeps the slot for compatibility.
    pub fn annotation_namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("")
    }

    /// True when the template declares any patch
    pub fn has_patches(&self) -> bool {
        !self.spec.patches.is_empty() || !self.spec.json_patches.is_empty()
    }
}
