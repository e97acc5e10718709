//! REST Custom Resource Definition
//!
//! A REST object mirrors its own lifecycle onto an external HTTP endpoint:
//! the update request runs whenever the generation advances, the remove
//! request runs on deletion before the finalizer is released, and response
//! fields flow back into `status`.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a REST resource
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "templating.flanksource.com",
    version = "v1",
    kind = "REST",
    plural = "rests",
    status = "RestStatus",
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".spec.url"}"#,
    printcolumn = r#"{"name":"Generation","type":"string","jsonPath":".status.observedGeneration"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RestSpec {
    /// Default URL for requests; individual actions may override it
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    /// HTTP basic authentication credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<RestAuth>,

    /// Headers sent on every request
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Request to send when the object is created or its generation changes
    #[serde(default)]
    pub update: RestAction,

    /// Request to send when the object is deleted
    #[serde(default)]
    pub remove: RestAction,
}

/// HTTP basic auth sourced from literals, Secrets or ConfigMaps
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestAuth {
    /// Username source
    #[serde(default)]
    pub username: ValueSource,
    /// Password source
    #[serde(default)]
    pub password: ValueSource,
    /// Namespace holding the referenced Secret / ConfigMap
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// A value resolved from a literal, a Secret key or a ConfigMap key
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValueSource {
    /// Literal value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Reference into a Secret's data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<KeyRef>,
    /// Reference into a ConfigMap's data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<KeyRef>,
}

/// Object name plus data key
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct KeyRef {
    /// Secret or ConfigMap name
    pub name: String,
    /// Key inside the data map
    pub key: String,
}

/// One templated HTTP request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RestAction {
    /// HTTP method, e.g. `POST`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    /// URL override for this action; falls back to `spec.url`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Templated request body
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    /// Status fields to set from the response: field name -> template over
    /// the object and the parsed response
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status: BTreeMap<String, String>,
}

/// Open status map. `observedGeneration` and `lastUpdated` are maintained by
/// the reconciler; the remaining keys come from `update.status` templates.
pub type RestStatus = BTreeMap<String, String>;

impl REST {
    /// The generation recorded on the last successful update, if any
    pub fn observed_generation(&self) -> Option<i64> {
        self.status
            .as_ref()
            .and_then(|s| s.get("observedGeneration"))
            .and_then(|v| v.parse().ok())
    }

    /// True when the last synchronized generation matches the current one
    pub fn same_generation(&self) -> bool {
        match (self.observed_generation(), self.metadata.generation) {
            (Some(observed), Some(generation)) => observed == generation,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn rest_with(status: Option<RestStatus>, generation: Option<i64>) -> REST {
        let mut rest = REST::new("alertmanager-silence", RestSpec::default());
        rest.metadata = ObjectMeta {
            name: Some("alertmanager-silence".to_string()),
            generation,
            ..Default::default()
        };
        rest.status = status;
        rest
    }

    #[test]
    fn same_generation_requires_matching_status() {
        let rest = rest_with(None, Some(1));
        assert!(!rest.same_generation());

        let mut status = RestStatus::new();
        status.insert("observedGeneration".to_string(), "1".to_string());
        let rest = rest_with(Some(status), Some(1));
        assert!(rest.same_generation());
    }

    #[test]
    fn stale_generation_is_not_same() {
        let mut status = RestStatus::new();
        status.insert("observedGeneration".to_string(), "1".to_string());
        let rest = rest_with(Some(status), Some(2));
        assert!(!rest.same_generation());
    }

    #[test]
    fn unparseable_observed_generation_is_ignored() {
        let mut status = RestStatus::new();
        status.insert("observedGeneration".to_string(), "not-a-number".to_string());
        let rest = rest_with(Some(status), Some(1));
        assert_eq!(rest.observed_generation(), None);
        assert!(!rest.same_generation());
    }

    #[test]
    fn spec_parses_from_manifest_yaml() {
        let yaml = r#"
url: http://alertmanager.monitoring/api/v2
auth:
  username:
    secretKeyRef:
      name: alertmanager-auth
      key: username
  password:
    secretKeyRef:
      name: alertmanager-auth
      key: password
  namespace: monitoring
update:
  method: POST
  url: "{{ spec.url }}/silences"
  status:
    silenceID: "{{ response.silenceID }}"
remove:
  method: DELETE
  url: "{{ spec.url }}/silence/{{ status.silenceID }}"
"#;
        let spec: RestSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.update.method, "POST");
        assert_eq!(
            spec.update.status.get("silenceID").unwrap(),
            "{{ response.silenceID }}"
        );
        assert_eq!(
            spec.auth.unwrap().username.secret_key_ref.unwrap().key,
            "username"
        );
    }
}
