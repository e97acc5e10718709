//! Dynamic cluster access
//!
//! Everything the reconcilers do against kinds that are only known at
//! runtime goes through here: GVK resolution via API discovery, listing
//! with label/field selectors, server-side apply, condition write-back, and
//! the per-kind readiness heuristics.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::{ApiResource, Discovery, Scope};
use kube::Client;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::crd::Selector;
use crate::object::Unstructured;
use crate::{Error, Result, FIELD_MANAGER};

/// Kinds that are ready the moment they exist
const TRIVIAL_KINDS: &[&str] = &[
    "ConfigMap",
    "Secret",
    "Service",
    "ServiceAccount",
    "Role",
    "RoleBinding",
    "ClusterRole",
    "ClusterRoleBinding",
    "NetworkPolicy",
    "PodDisruptionBudget",
    "Ingress",
];

/// Dynamic client with a refreshable discovery snapshot.
///
/// The discovery snapshot is the REST-mapper analog: when the schema cache
/// expires, [`DynamicClient::invalidate`] drops it so both views of the
/// cluster refresh together.
pub struct DynamicClient {
    client: Client,
    discovery: RwLock<Option<Arc<Discovery>>>,
}

impl DynamicClient {
    /// Create a dynamic client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            discovery: RwLock::new(None),
        }
    }

    /// The underlying kube client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Drop the discovery snapshot; the next resolution re-runs discovery
    pub async fn invalidate(&self) {
        debug!("invalidating discovery snapshot");
        *self.discovery.write().await = None;
    }

    async fn discovery(&self) -> Result<Arc<Discovery>> {
        if let Some(discovery) = self.discovery.read().await.as_ref() {
            return Ok(discovery.clone());
        }
        let mut guard = self.discovery.write().await;
        if let Some(discovery) = guard.as_ref() {
            return Ok(discovery.clone());
        }
        let discovery = Arc::new(Discovery::new(self.client.clone()).run().await?);
        *guard = Some(discovery.clone());
        Ok(discovery)
    }

    /// Resolve a GVK to its API resource and scope
    pub async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        if let Some((resource, capabilities)) = self.discovery().await?.resolve_gvk(gvk) {
            return Ok((resource, capabilities.scope == Scope::Namespaced));
        }
        // The kind may have been created after the snapshot; retry once on
        // a fresh discovery before giving up.
        self.invalidate().await;
        match self.discovery().await?.resolve_gvk(gvk) {
            Some((resource, capabilities)) => {
                Ok((resource, capabilities.scope == Scope::Namespaced))
            }
            None => Err(Error::schema(format!(
                "kind {}/{} {} is not served by this cluster",
                gvk.group, gvk.version, gvk.kind
            ))),
        }
    }

    /// An Api handle for the GVK, namespaced when a namespace is given and
    /// the resource is namespaced.
    pub async fn api_for(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>> {
        let (resource, namespaced) = self.resolve(gvk).await?;
        let api = match namespace {
            Some(ns) if namespaced && !ns.is_empty() => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        };
        Ok(api)
    }

    /// List objects of a kind with the given selectors.
    ///
    /// `namespace: None` lists across all namespaces.
    pub async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: &str,
        field_selector: &str,
    ) -> Result<Vec<Unstructured>> {
        let api = self.api_for(gvk, namespace).await?;
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        if !field_selector.is_empty() {
            params = params.fields(field_selector);
        }
        let list = api.list(&params).await?;
        list.items
            .into_iter()
            .map(|o| Ok(Unstructured::new(serde_json::to_value(o)?)))
            .collect()
    }

    /// Fetch one object
    pub async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Unstructured> {
        let api = self.api_for(gvk, namespace).await?;
        let object = api.get(name).await?;
        Ok(Unstructured::new(serde_json::to_value(object)?))
    }

    /// Server-side apply an object under this operator's field manager
    pub async fn apply(&self, object: &Unstructured) -> Result<Unstructured> {
        let gvk = object.gvk();
        let namespace = object.namespace();
        let api = self
            .api_for(&gvk, (!namespace.is_empty()).then_some(namespace))
            .await?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let applied = api
            .patch(object.name(), &params, &Patch::Apply(object.value()))
            .await?;
        Ok(Unstructured::new(serde_json::to_value(applied)?))
    }

    /// Namespaces matching a selector; `None` or an empty selector matches
    /// every namespace.
    pub async fn list_namespaces(&self, selector: Option<&Selector>) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if let Some(selector) = selector {
            let rendered = selector.to_label_selector();
            if !rendered.is_empty() {
                params = params.labels(&rendered);
            }
        }
        let list = api.list(&params).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    /// Upsert a condition on the object's status and write it back.
    ///
    /// Some targets (plain ConfigMaps, Secrets) have no status to patch;
    /// those failures are the caller's to downgrade.
    pub async fn set_condition(
        &self,
        object: &Unstructured,
        condition: &str,
        status: &str,
    ) -> Result<()> {
        let mut conditions = object.value()["status"]["conditions"].clone();
        upsert_condition(&mut conditions, condition, status);
        let patch = json!({"status": {"conditions": conditions}});

        let gvk = object.gvk();
        let namespace = object.namespace();
        let api = self
            .api_for(&gvk, (!namespace.is_empty()).then_some(namespace))
            .await?;
        let params = PatchParams::default();

        // Kinds with a status subresource only accept condition writes
        // there; everything else takes them on the main resource.
        match api
            .patch_status(object.name(), &params, &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 || e.code == 405 => {
                api.patch(object.name(), &params, &Patch::Merge(&patch))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Refresh the object and evaluate its readiness
    pub async fn is_ready(&self, object: &Unstructured) -> Result<(bool, String)> {
        if is_trivially_ready(object.kind()) {
            return Ok((true, String::new()));
        }
        let namespace = object.namespace();
        let refreshed = self
            .get(
                &object.gvk(),
                (!namespace.is_empty()).then_some(namespace),
                object.name(),
            )
            .await?;
        Ok(check_ready(refreshed.value()))
    }
}

/// Shared handle used across reconcilers
pub type SharedDynamicClient = Arc<DynamicClient>;

/// True for kinds with no meaningful readiness gate
pub fn is_trivially_ready(kind: &str) -> bool {
    TRIVIAL_KINDS.contains(&kind)
}

fn upsert_condition(conditions: &mut Value, name: &str, status: &str) {
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let entry = json!({
        "type": name,
        "status": status,
        "lastTransitionTime": now,
    });

    match conditions {
        Value::Array(items) => {
            match items
                .iter_mut()
                .find(|c| c["type"].as_str() == Some(name))
            {
                Some(existing) => {
                    // keep the transition time when the value did not change
                    if existing["status"].as_str() != Some(status) {
                        *existing = entry;
                    }
                }
                None => items.push(entry),
            }
        }
        other => *other = json!([entry]),
    }
}

/// Per-kind readiness heuristic over a refreshed object
pub fn check_ready(object: &Value) -> (bool, String) {
    let kind = object["kind"].as_str().unwrap_or("");
    let status = &object["status"];

    match kind {
        "Deployment" => {
            let generation = object["metadata"]["generation"].as_i64().unwrap_or(0);
            let observed = status["observedGeneration"].as_i64().unwrap_or(0);
            if observed < generation {
                return (false, format!("observed generation {} behind {}", observed, generation));
            }
            let desired = object["spec"]["replicas"].as_i64().unwrap_or(1);
            let available = status["availableReplicas"].as_i64().unwrap_or(0);
            if available != desired {
                return (false, format!("{}/{} replicas available", available, desired));
            }
            (true, String::new())
        }
        "StatefulSet" | "ReplicaSet" => {
            let desired = object["spec"]["replicas"].as_i64().unwrap_or(1);
            let ready = status["readyReplicas"].as_i64().unwrap_or(0);
            if ready != desired {
                return (false, format!("{}/{} replicas ready", ready, desired));
            }
            (true, String::new())
        }
        "DaemonSet" => {
            let desired = status["desiredNumberScheduled"].as_i64().unwrap_or(0);
            let ready = status["numberReady"].as_i64().unwrap_or(0);
            if ready < desired {
                return (false, format!("{}/{} pods ready", ready, desired));
            }
            (true, String::new())
        }
        "Pod" => match status["phase"].as_str() {
            Some("Running") | Some("Succeeded") => (true, String::new()),
            phase => (false, format!("pod phase is {}", phase.unwrap_or("unknown"))),
        },
        "Job" => {
            if status["succeeded"].as_i64().unwrap_or(0) > 0 {
                (true, String::new())
            } else {
                (false, "job has not succeeded".to_string())
            }
        }
        "PersistentVolumeClaim" => match status["phase"].as_str() {
            Some("Bound") => (true, String::new()),
            phase => (false, format!("claim phase is {}", phase.unwrap_or("unknown"))),
        },
        "Namespace" => match status["phase"].as_str() {
            Some("Active") => (true, String::new()),
            phase => (false, format!("namespace phase is {}", phase.unwrap_or("unknown"))),
        },
        _ => {
            // Generic fallback: honor a Ready condition when one exists,
            // otherwise an object with no signal counts as ready.
            if let Some(conditions) = status["conditions"].as_array() {
                if let Some(ready) = conditions
                    .iter()
                    .find(|c| c["type"].as_str() == Some("Ready"))
                {
                    let ok = ready["status"].as_str() == Some("True");
                    let message = ready["message"].as_str().unwrap_or("").to_string();
                    return (ok, message);
                }
            }
            (true, String::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trivial_kinds_are_ready() {
        assert!(is_trivially_ready("ConfigMap"));
        assert!(is_trivially_ready("Secret"));
        assert!(!is_trivially_ready("Deployment"));
    }

    #[test]
    fn deployment_readiness_tracks_replicas_and_generation() {
        let ready = json!({
            "kind": "Deployment",
            "metadata": {"generation": 2},
            "spec": {"replicas": 3},
            "status": {"observedGeneration": 2, "availableReplicas": 3}
        });
        assert!(check_ready(&ready).0);

        let behind = json!({
            "kind": "Deployment",
            "metadata": {"generation": 3},
            "spec": {"replicas": 3},
            "status": {"observedGeneration": 2, "availableReplicas": 3}
        });
        let (ok, msg) = check_ready(&behind);
        assert!(!ok);
        assert!(msg.contains("behind"));

        let scaling = json!({
            "kind": "Deployment",
            "metadata": {"generation": 2},
            "spec": {"replicas": 3},
            "status": {"observedGeneration": 2, "availableReplicas": 1}
        });
        assert!(!check_ready(&scaling).0);
    }

    #[test]
    fn statefulset_readiness_uses_ready_replicas() {
        let ready = json!({
            "kind": "StatefulSet",
            "spec": {"replicas": 2},
            "status": {"readyReplicas": 2}
        });
        assert!(check_ready(&ready).0);
    }

    #[test]
    fn job_readiness_requires_success() {
        let pending = json!({"kind": "Job", "status": {"active": 1}});
        assert!(!check_ready(&pending).0);
        let done = json!({"kind": "Job", "status": {"succeeded": 1}});
        assert!(check_ready(&done).0);
    }

    #[test]
    fn unknown_kind_with_ready_condition_uses_it() {
        let not_ready = json!({
            "kind": "Canary",
            "status": {"conditions": [{"type": "Ready", "status": "False", "message": "failing"}]}
        });
        let (ok, msg) = check_ready(&not_ready);
        assert!(!ok);
        assert_eq!(msg, "failing");

        let ready = json!({
            "kind": "Canary",
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        });
        assert!(check_ready(&ready).0);
    }

    #[test]
    fn unknown_kind_without_status_defaults_to_ready() {
        assert!(check_ready(&json!({"kind": "Mystery"})).0);
    }

    #[test]
    fn upsert_condition_replaces_matching_type() {
        let mut conditions = json!([
            {"type": "template-a", "status": "NotReady", "lastTransitionTime": "then"},
            {"type": "other", "status": "True"}
        ]);
        upsert_condition(&mut conditions, "template-a", "Ready");
        let items = conditions.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["status"], json!("Ready"));
        assert_eq!(items[1]["type"], json!("other"));
    }

    #[test]
    fn upsert_condition_keeps_transition_time_when_unchanged() {
        let mut conditions = json!([
            {"type": "template-a", "status": "Ready", "lastTransitionTime": "then"}
        ]);
        upsert_condition(&mut conditions, "template-a", "Ready");
        assert_eq!(conditions[0]["lastTransitionTime"], json!("then"));
    }

    #[test]
    fn upsert_condition_creates_the_array() {
        let mut conditions = Value::Null;
        upsert_condition(&mut conditions, "template-a", "NotReady");
        assert_eq!(conditions[0]["type"], json!("template-a"));
    }
}
