//! Strategic-merge patching as a pure function
//!
//! Kubernetes strategic merge differs from plain JSON merge in three ways:
//! `null` values delete keys, `$patch` directives override merge behavior,
//! and lists of objects merge element-wise by a per-field merge key instead
//! of being replaced. The merge keys for the well-known workload fields are
//! fixed by the Kubernetes API types, so they live in a static table here;
//! lists without a known key replace wholesale.

use serde_json::{Map, Value};

/// `$patch` directive key
const DIRECTIVE: &str = "$patch";

/// Merge key for a list-valued field, by field name
fn merge_key(field: &str) -> Option<&'static str> {
    match field {
        "containers" | "initContainers" | "ephemeralContainers" | "volumes" | "env"
        | "imagePullSecrets" | "hostAliases" => Some("name"),
        "volumeMounts" => Some("mountPath"),
        "volumeDevices" => Some("devicePath"),
        "ports" => Some("containerPort"),
        "conditions" => Some("type"),
        "readinessGates" => Some("conditionType"),
        _ => None,
    }
}

/// Merge `overlay` onto `target` with strategic-merge semantics.
///
/// Neither input is mutated; the merged document is returned.
pub fn strategic_merge(target: &Value, overlay: &Value) -> Value {
    merge_value(target, overlay, "")
}

fn merge_value(target: &Value, overlay: &Value, field: &str) -> Value {
    match (target, overlay) {
        (Value::Object(t), Value::Object(o)) => merge_objects(t, o),
        (Value::Array(t), Value::Array(o)) => merge_lists(t, o, field),
        // Type mismatch or scalar: the overlay wins.
        _ => overlay.clone(),
    }
}

fn merge_objects(target: &Map<String, Value>, overlay: &Map<String, Value>) -> Value {
    if overlay.get(DIRECTIVE).and_then(Value::as_str) == Some("replace") {
        let mut replacement = overlay.clone();
        replacement.remove(DIRECTIVE);
        return Value::Object(replacement);
    }

    let mut out = target.clone();
    for (key, value) in overlay {
        if key == DIRECTIVE {
            continue;
        }
        match value {
            // null deletes the key
            Value::Null => {
                out.remove(key);
            }
            _ => {
                let merged = match target.get(key) {
                    Some(existing) => merge_value(existing, value, key),
                    None => prune_directives(value),
                };
                out.insert(key.clone(), merged);
            }
        }
    }
    Value::Object(out)
}

fn merge_lists(target: &[Value], overlay: &[Value], field: &str) -> Value {
    let key = match merge_key(field) {
        Some(key) if lists_are_keyed(target, overlay, key) => key,
        _ => return Value::Array(overlay.iter().map(prune_directives).collect()),
    };

    let mut out: Vec<Value> = target.to_vec();
    for item in overlay {
        let Some(item_key) = item.get(key) else {
            out.push(prune_directives(item));
            continue;
        };

        let existing = out.iter().position(|t| t.get(key) == Some(item_key));

        if item.get(DIRECTIVE).and_then(Value::as_str) == Some("delete") {
            if let Some(index) = existing {
                out.remove(index);
            }
            continue;
        }

        match existing {
            Some(index) => out[index] = merge_value(&out[index], item, ""),
            None => out.push(prune_directives(item)),
        }
    }
    Value::Array(out)
}

// Keyed merge only applies when every element is an object; mixed lists
// fall back to replacement.
fn lists_are_keyed(target: &[Value], overlay: &[Value], key: &str) -> bool {
    let objects = target.iter().chain(overlay).all(Value::is_object);
    let keyed = overlay.iter().all(|v| {
        v.get(key).is_some() || v.get(DIRECTIVE).is_some()
    });
    objects && keyed
}

// Remove $patch markers from overlay fragments that are taken verbatim.
fn prune_directives(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| k.as_str() != DIRECTIVE)
                .map(|(k, v)| (k.clone(), prune_directives(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(prune_directives).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_fields_are_overwritten() {
        let target = json!({"spec": {"replicas": 1, "paused": false}});
        let overlay = json!({"spec": {"replicas": 3}});
        let merged = strategic_merge(&target, &overlay);
        assert_eq!(merged["spec"]["replicas"], json!(3));
        assert_eq!(merged["spec"]["paused"], json!(false));
    }

    #[test]
    fn null_deletes_a_key() {
        let target = json!({"metadata": {"labels": {"a": "1", "b": "2"}}});
        let overlay = json!({"metadata": {"labels": {"a": null}}});
        let merged = strategic_merge(&target, &overlay);
        assert_eq!(merged["metadata"]["labels"], json!({"b": "2"}));
    }

    #[test]
    fn containers_merge_by_name() {
        let target = json!({
            "spec": {
                "containers": [
                    {"name": "app", "image": "app:v1", "ports": [{"containerPort": 80}]},
                    {"name": "sidecar", "image": "proxy:v1"}
                ]
            }
        });
        let overlay = json!({
            "spec": {
                "containers": [
                    {"name": "app", "image": "app:v2"}
                ]
            }
        });
        let merged = strategic_merge(&target, &overlay);
        let containers = merged["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0]["image"], json!("app:v2"));
        // untouched fields survive the merge
        assert_eq!(containers[0]["ports"][0]["containerPort"], json!(80));
        assert_eq!(containers[1]["image"], json!("proxy:v1"));
    }

    #[test]
    fn new_keyed_items_are_appended() {
        let target = json!({"spec": {"containers": [{"name": "app"}]}});
        let overlay = json!({"spec": {"containers": [{"name": "extra", "image": "x"}]}});
        let merged = strategic_merge(&target, &overlay);
        assert_eq!(merged["spec"]["containers"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn patch_delete_removes_a_keyed_item() {
        let target = json!({
            "spec": {"containers": [{"name": "app"}, {"name": "sidecar"}]}
        });
        let overlay = json!({
            "spec": {"containers": [{"name": "sidecar", "$patch": "delete"}]}
        });
        let merged = strategic_merge(&target, &overlay);
        assert_eq!(
            merged["spec"]["containers"],
            json!([{"name": "app"}])
        );
    }

    #[test]
    fn patch_replace_swaps_an_object_wholesale() {
        let target = json!({"spec": {"selector": {"matchLabels": {"old": "1"}}}});
        let overlay = json!({"spec": {"selector": {"$patch": "replace", "matchLabels": {"new": "2"}}}});
        let merged = strategic_merge(&target, &overlay);
        assert_eq!(
            merged["spec"]["selector"],
            json!({"matchLabels": {"new": "2"}})
        );
    }

    #[test]
    fn unkeyed_lists_replace() {
        let target = json!({"spec": {"topics": ["a", "b"]}});
        let overlay = json!({"spec": {"topics": ["c"]}});
        let merged = strategic_merge(&target, &overlay);
        assert_eq!(merged["spec"]["topics"], json!(["c"]));
    }

    #[test]
    fn env_lists_merge_by_name() {
        let target = json!({"env": [{"name": "A", "value": "1"}, {"name": "B", "value": "2"}]});
        let overlay = json!({"env": [{"name": "B", "value": "patched"}]});
        let merged = strategic_merge(&target, &overlay);
        assert_eq!(
            merged["env"],
            json!([{"name": "A", "value": "1"}, {"name": "B", "value": "patched"}])
        );
    }

    #[test]
    fn directives_never_leak_into_output() {
        let target = json!({"spec": {}});
        let overlay = json!({
            "spec": {
                "containers": [{"name": "app", "$patch": "merge", "image": "x"}]
            }
        });
        let merged = strategic_merge(&target, &overlay);
        assert_eq!(
            merged["spec"]["containers"],
            json!([{"name": "app", "image": "x"}])
        );
    }

    #[test]
    fn merge_does_not_mutate_inputs() {
        let target = json!({"spec": {"replicas": 1}});
        let overlay = json!({"spec": {"replicas": 2}});
        let _ = strategic_merge(&target, &overlay);
        assert_eq!(target["spec"]["replicas"], json!(1));
    }
}
