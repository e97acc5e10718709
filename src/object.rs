//! Untyped cluster objects
//!
//! Objects flowing through the templating pipeline have schemas that are only
//! known at runtime, so they are carried as raw JSON values. [`Unstructured`]
//! wraps a `serde_json::Value` and exposes the common
//! `apiVersion/kind/metadata` accessors every pipeline stage needs.

use kube::core::GroupVersionKind;
use serde_json::{json, Map, Value};

use crate::{ANNOTATION_BLACKLIST, CROSS_NAMESPACE_OWNER_ANNOTATION};

/// A dynamically-typed Kubernetes object
#[derive(Clone, Debug, PartialEq)]
pub struct Unstructured(pub Value);

impl Unstructured {
    /// Wrap a JSON value. The value should be a JSON object; accessors on
    /// anything else return empty defaults.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Parse an object from YAML text
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        Ok(Self(serde_yaml::from_str(text)?))
    }

    /// Borrow the underlying JSON value
    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Take the underlying JSON value
    pub fn into_value(self) -> Value {
        self.0
    }

    /// `apiVersion` field, empty when absent
    pub fn api_version(&self) -> &str {
        self.0["apiVersion"].as_str().unwrap_or("")
    }

    /// `kind` field, empty when absent
    pub fn kind(&self) -> &str {
        self.0["kind"].as_str().unwrap_or("")
    }

    /// Group/version/kind parsed from `apiVersion` + `kind`.
    ///
    /// An `apiVersion` without a `/` is a core-group version ("v1").
    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = split_api_version(self.api_version());
        GroupVersionKind {
            group: group.to_string(),
            version: version.to_string(),
            kind: self.kind().to_string(),
        }
    }

    /// `metadata.name`, empty when absent
    pub fn name(&self) -> &str {
        self.0["metadata"]["name"].as_str().unwrap_or("")
    }

    /// `metadata.namespace`, empty when absent
    pub fn namespace(&self) -> &str {
        self.0["metadata"]["namespace"].as_str().unwrap_or("")
    }

    /// `metadata.uid`, empty when absent
    pub fn uid(&self) -> &str {
        self.0["metadata"]["uid"].as_str().unwrap_or("")
    }

    /// Set `metadata.name`
    pub fn set_name(&mut self, name: &str) {
        self.metadata_mut()
            .insert("name".to_string(), Value::String(name.to_string()));
    }

    /// Set `metadata.namespace`
    pub fn set_namespace(&mut self, namespace: &str) {
        self.metadata_mut()
            .insert("namespace".to_string(), Value::String(namespace.to_string()));
    }

    /// Annotation value, if present
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.0["metadata"]["annotations"][key].as_str()
    }

    /// Set an annotation, creating the annotations map when needed
    pub fn set_annotation(&mut self, key: &str, value: &str) {
        let metadata = self.metadata_mut();
        let annotations = metadata
            .entry("annotations".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = annotations {
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
    }

    /// Remove the machine-managed annotations that must never be written back
    pub fn strip_blacklisted_annotations(&mut self) {
        let mut emptied = false;
        if let Some(Value::Object(annotations)) = self.0.pointer_mut("/metadata/annotations") {
            for key in ANNOTATION_BLACKLIST {
                annotations.remove(*key);
            }
            emptied = annotations.is_empty();
        }
        if emptied {
            if let Some(meta) = self.0["metadata"].as_object_mut() {
                meta.remove("annotations");
            }
        }
    }

    /// Remove all annotations
    pub fn strip_annotations(&mut self) {
        if let Some(meta) = self.0["metadata"].as_object_mut() {
            meta.remove("annotations");
        }
    }

    /// Remove server-assigned identity so the object can be re-created
    /// elsewhere (namespace copies).
    pub fn strip_identifiers(&mut self) {
        if let Some(meta) = self.0["metadata"].as_object_mut() {
            for field in [
                "uid",
                "resourceVersion",
                "generation",
                "creationTimestamp",
                "deletionTimestamp",
                "managedFields",
                "selfLink",
                "ownerReferences",
            ] {
                meta.remove(field);
            }
        }
        if let Some(obj) = self.0.as_object_mut() {
            obj.remove("status");
        }
    }

    /// Point an ownerReference at the given object, replacing any existing ones
    pub fn set_owner_reference(&mut self, owner: &Unstructured) {
        let reference = json!([{
            "apiVersion": owner.api_version(),
            "kind": owner.kind(),
            "name": owner.name(),
            "uid": owner.uid(),
        }]);
        self.metadata_mut()
            .insert("ownerReferences".to_string(), reference);
    }

    /// Record ownership by annotation, used when owner and child live in
    /// different namespaces (cross-namespace ownerReferences are rejected by
    /// the API server).
    pub fn set_cross_namespace_owner(&mut self, owner: &Unstructured) {
        let value = format!("{}/{}", owner.namespace(), owner.name());
        self.set_annotation(CROSS_NAMESPACE_OWNER_ANNOTATION, &value);
    }

    /// Restore the immutable identity fields from another object.
    ///
    /// Patches must not alter group/version/kind/name/namespace; this is
    /// enforced after every patch composition.
    pub fn restore_identity(&mut self, original: &Unstructured) {
        let api_version = original.api_version().to_string();
        let kind = original.kind().to_string();
        let name = original.name().to_string();
        let namespace = original.namespace().to_string();
        if let Some(obj) = self.0.as_object_mut() {
            obj.insert("apiVersion".to_string(), Value::String(api_version));
            obj.insert("kind".to_string(), Value::String(kind));
        }
        self.set_name(&name);
        if namespace.is_empty() {
            if let Some(meta) = self.0["metadata"].as_object_mut() {
                meta.remove("namespace");
            }
        } else {
            self.set_namespace(&namespace);
        }
    }

    fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        let obj = self
            .0
            .as_object_mut()
            .expect("Unstructured must wrap a JSON object");
        let metadata = obj
            .entry("metadata".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        metadata
            .as_object_mut()
            .expect("metadata must be a JSON object")
    }
}

/// Split an `apiVersion` string into (group, version)
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> Unstructured {
        Unstructured::new(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "nginx",
                "namespace": "web",
                "uid": "abc-123",
                "resourceVersion": "42",
                "annotations": {
                    "kubectl.kubernetes.io/last-applied-configuration": "{}",
                    "keep-me": "yes"
                }
            },
            "spec": {"replicas": 1},
            "status": {"availableReplicas": 1}
        }))
    }

    #[test]
    fn accessors_read_identity() {
        let obj = deployment();
        assert_eq!(obj.api_version(), "apps/v1");
        assert_eq!(obj.kind(), "Deployment");
        assert_eq!(obj.name(), "nginx");
        assert_eq!(obj.namespace(), "web");

        let gvk = obj.gvk();
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Deployment");
    }

    #[test]
    fn core_group_api_version_has_empty_group() {
        let obj = Unstructured::new(json!({"apiVersion": "v1", "kind": "Secret"}));
        assert_eq!(obj.gvk().group, "");
        assert_eq!(obj.gvk().version, "v1");
    }

    #[test]
    fn blacklist_strip_keeps_other_annotations() {
        let mut obj = deployment();
        obj.strip_blacklisted_annotations();
        assert_eq!(obj.annotation("keep-me"), Some("yes"));
        assert_eq!(
            obj.annotation("kubectl.kubernetes.io/last-applied-configuration"),
            None
        );
    }

    #[test]
    fn strip_identifiers_clears_server_state() {
        let mut obj = deployment();
        obj.strip_identifiers();
        assert_eq!(obj.uid(), "");
        assert!(obj.0["metadata"].get("resourceVersion").is_none());
        assert!(obj.0.get("status").is_none());
        // identity survives
        assert_eq!(obj.name(), "nginx");
    }

    #[test]
    fn owner_reference_copies_identity() {
        let source = deployment();
        let mut child = Unstructured::new(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "child", "namespace": "web"}
        }));
        child.set_owner_reference(&source);
        let refs = child.0["metadata"]["ownerReferences"].as_array().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0]["kind"], "Deployment");
        assert_eq!(refs[0]["uid"], "abc-123");
    }

    #[test]
    fn cross_namespace_owner_is_an_annotation() {
        let source = deployment();
        let mut child = Unstructured::new(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "copy", "namespace": "other"}
        }));
        child.set_cross_namespace_owner(&source);
        assert_eq!(
            child.annotation(CROSS_NAMESPACE_OWNER_ANNOTATION),
            Some("web/nginx")
        );
    }

    #[test]
    fn restore_identity_reverts_patched_names() {
        let original = deployment();
        let mut patched = deployment();
        patched.set_name("hijacked");
        patched.0["kind"] = json!("StatefulSet");
        patched.restore_identity(&original);
        assert_eq!(patched.name(), "nginx");
        assert_eq!(patched.kind(), "Deployment");
    }
}
