//! Cluster-aware template functions
//!
//! `kget("<kind>/<ns>/<name>", "<jsonpath>")` reads a ConfigMap or Secret
//! value during rendering; `jsonPath(obj, path)` extracts a field from any
//! value. Lookup failures never abort a render: they log and yield an empty
//! string, matching how templates are expected to degrade when referenced
//! objects are missing.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::Client;
use minijinja::value::Value as TemplateValue;
use minijinja::Environment;
use serde_json::Value;
use tracing::warn;

/// Synchronous object lookup used by `kget`.
///
/// Template functions cannot await, so the production implementation bridges
/// onto the async kube client; tests inject an in-memory map instead.
pub trait ObjectLookup: Send + Sync {
    /// Fetch a ConfigMap as a JSON object
    fn config_map(&self, namespace: &str, name: &str) -> Option<Value>;
    /// Fetch a Secret as a JSON object (data values base64-encoded)
    fn secret(&self, namespace: &str, name: &str) -> Option<Value>;
}

/// Lookup that always misses; for offline rendering
pub struct NullLookup;

impl ObjectLookup for NullLookup {
    fn config_map(&self, _namespace: &str, _name: &str) -> Option<Value> {
        None
    }
    fn secret(&self, _namespace: &str, _name: &str) -> Option<Value> {
        None
    }
}

/// Production lookup backed by a kube [`Client`].
///
/// Blocks the current worker on the async call; requires the multi-threaded
/// runtime, which `serve` always uses.
pub struct ClusterLookup {
    client: Client,
}

impl ClusterLookup {
    /// Create a lookup for the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn block_on<T, F: std::future::Future<Output = T>>(future: F) -> T {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
    }
}

impl ObjectLookup for ClusterLookup {
    fn config_map(&self, namespace: &str, name: &str) -> Option<Value> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let name = name.to_string();
        Self::block_on(async move {
            match api.get(&name).await {
                Ok(cm) => serde_json::to_value(cm).ok(),
                Err(e) => {
                    warn!(name = %name, error = %e, "failed to read configmap");
                    None
                }
            }
        })
    }

    fn secret(&self, namespace: &str, name: &str) -> Option<Value> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = name.to_string();
        Self::block_on(async move {
            match api.get(&name).await {
                Ok(secret) => serde_json::to_value(secret).ok(),
                Err(e) => {
                    warn!(name = %name, error = %e, "failed to read secret");
                    None
                }
            }
        })
    }
}

/// Register `kget` and `jsonPath` on the environment
pub fn register(env: &mut Environment<'static>, lookup: Arc<dyn ObjectLookup>) {
    env.add_function("kget", move |path: String, jsonpath: String| {
        kget(lookup.as_ref(), &path, &jsonpath)
    });
    env.add_function("jsonPath", |value: TemplateValue, path: String| {
        let value = serde_json::to_value(&value).unwrap_or(Value::Null);
        json_path_string(&value, &path)
    });
}

fn kget(lookup: &dyn ObjectLookup, path: &str, jsonpath: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    let [kind, namespace, name] = parts.as_slice() else {
        warn!(path = %path, "invalid call to kget, expected kind/namespace/name");
        return String::new();
    };

    match *kind {
        "cm" | "configmap" => match lookup.config_map(namespace, name) {
            Some(object) => json_path_string(&object, jsonpath),
            None => String::new(),
        },
        "secret" => {
            // The jsonpath argument is a key into the secret's data map; the
            // stored value is base64 and callers expect the decoded payload.
            let Some(object) = lookup.secret(namespace, name) else {
                return String::new();
            };
            let encoded = object["data"][jsonpath].as_str().unwrap_or("");
            match BASE64.decode(encoded) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(_) => String::new(),
            }
        }
        other => {
            warn!(kind = %other, "kget supports configmap and secret lookups only");
            String::new()
        }
    }
}

/// Resolve a dotted path (with numeric array indexes) into a value
pub fn json_path_value<'a>(object: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path
        .trim()
        .trim_start_matches("{{")
        .trim_end_matches("}}")
        .trim()
        .trim_start_matches('.');
    if path.is_empty() {
        return Some(object);
    }

    let mut current = object;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn json_path_string(object: &Value, path: &str) -> String {
    match json_path_value(object, path) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(scalar @ (Value::Bool(_) | Value::Number(_))) => scalar.to_string(),
        Some(composite) => serde_json::to_string(composite).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct MapLookup {
        config_maps: Value,
        secrets: Value,
    }

    impl ObjectLookup for MapLookup {
        fn config_map(&self, namespace: &str, name: &str) -> Option<Value> {
            let found = &self.config_maps[format!("{}/{}", namespace, name)];
            (!found.is_null()).then(|| found.clone())
        }
        fn secret(&self, namespace: &str, name: &str) -> Option<Value> {
            let found = &self.secrets[format!("{}/{}", namespace, name)];
            (!found.is_null()).then(|| found.clone())
        }
    }

    fn lookup() -> MapLookup {
        MapLookup {
            config_maps: json!({
                "web/nginx-config": {
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "nginx-config", "namespace": "web"},
                    "data": {"replicas": "3"}
                }
            }),
            secrets: json!({
                "web/db-auth": {
                    "apiVersion": "v1",
                    "kind": "Secret",
                    "metadata": {"name": "db-auth", "namespace": "web"},
                    "data": {"password": "aHVudGVyMg=="}
                }
            }),
        }
    }

    #[test]
    fn kget_configmap_applies_json_path() {
        let l = lookup();
        assert_eq!(kget(&l, "cm/web/nginx-config", "data.replicas"), "3");
        assert_eq!(kget(&l, "configmap/web/nginx-config", "metadata.name"), "nginx-config");
    }

    #[test]
    fn kget_secret_decodes_the_data_key() {
        let l = lookup();
        assert_eq!(kget(&l, "secret/web/db-auth", "password"), "hunter2");
    }

    #[test]
    fn kget_missing_object_is_empty() {
        let l = lookup();
        assert_eq!(kget(&l, "cm/web/missing", "data.replicas"), "");
        assert_eq!(kget(&l, "secret/web/missing", "password"), "");
    }

    #[test]
    fn kget_malformed_path_is_empty() {
        let l = lookup();
        assert_eq!(kget(&l, "just-a-name", "data.x"), "");
        assert_eq!(kget(&l, "deployment/web/nginx", "spec"), "");
    }

    #[test]
    fn json_path_descends_objects_and_arrays() {
        let object = json!({
            "spec": {"topics": ["a", "b", "c"], "replicas": 2}
        });
        assert_eq!(
            json_path_value(&object, "spec.topics.1"),
            Some(&json!("b"))
        );
        assert_eq!(json_path_string(&object, "spec.replicas"), "2");
        assert_eq!(json_path_string(&object, "spec.topics"), r#"["a","b","c"]"#);
    }

    #[test]
    fn json_path_accepts_template_braces() {
        let object = json!({"spec": {"topics": ["a"]}});
        assert_eq!(
            json_path_value(&object, "{{ .spec.topics }}"),
            Some(&json!(["a"]))
        );
    }

    #[test]
    fn json_path_misses_are_empty() {
        let object = json!({"spec": {}});
        assert_eq!(json_path_value(&object, "spec.missing.deeper"), None);
        assert_eq!(json_path_string(&object, "spec.missing"), "");
    }
}
