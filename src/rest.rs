//! Templated HTTP requests for REST resources
//!
//! The update and remove actions of a REST object are text templates over
//! the object itself: url, body and the status mappings all render against
//! the object's fields (plus the parsed response for status templates).
//! Rendering is lenient - absent fields produce empty strings - because
//! status templates routinely reference fields that only exist after the
//! first round-trip.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::crd::{REST, RestAction, RestAuth, ValueSource};
use crate::template::TemplateEngine;
use crate::{Error, Result};

/// Composes and sends the HTTP requests a REST object declares
pub struct RestManager {
    engine: Arc<TemplateEngine>,
    http: reqwest::Client,
    client: Option<Client>,
}

impl RestManager {
    /// Create a manager resolving auth references through the given client
    pub fn new(engine: Arc<TemplateEngine>, client: Client) -> Self {
        Self {
            engine,
            http: reqwest::Client::new(),
            client: Some(client),
        }
    }

    /// Manager without cluster access; auth must use literal values
    pub fn offline(engine: Arc<TemplateEngine>) -> Self {
        Self {
            engine,
            http: reqwest::Client::new(),
            client: None,
        }
    }

    /// Run the update action and return the status fields to persist.
    ///
    /// The caller is responsible for generation gating; this always sends.
    pub async fn update(&self, rest: &REST) -> Result<BTreeMap<String, String>> {
        let action = &rest.spec.update;
        let body = self.do_request(rest, action).await?;
        let response = parse_response(&body);

        let mut updates = BTreeMap::new();
        for (field, template) in &action.status {
            let value = self
                .template_status(rest, &response, template)
                .map_err(|e| {
                    Error::template(format!("failed to template status field {}: {}", field, e))
                })?;
            updates.insert(field.clone(), value);
        }

        let generation = rest.metadata.generation.unwrap_or(0);
        updates.insert("observedGeneration".to_string(), generation.to_string());
        Ok(updates)
    }

    /// Run the remove action. The finalizer is only released once this
    /// returns successfully.
    pub async fn remove(&self, rest: &REST) -> Result<()> {
        self.do_request(rest, &rest.spec.remove).await?;
        Ok(())
    }

    async fn do_request(&self, rest: &REST, action: &RestAction) -> Result<Vec<u8>> {
        let body = self.template_field(rest, &action.body)?;
        let mut url = self.template_field(rest, &action.url)?;
        if url.is_empty() {
            if rest.spec.url.is_empty() {
                return Err(Error::http("url cannot be empty".to_string()));
            }
            url = rest.spec.url.clone();
        }

        let method = parse_method(&action.method)?;
        let mut request = self.http.request(method.clone(), &url).body(body.clone());

        for (name, value) in &rest.spec.headers {
            request = request.header(name, value);
        }
        if let Some(auth) = &rest.spec.auth {
            let (username, password) = self.resolve_auth(auth).await?;
            request = request.basic_auth(username, Some(password));
        }

        debug!(url = %url, method = %method, body = %body, "sending request");
        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        debug!(status = %status, "received response");

        if !status.is_success() {
            return Err(Error::http(format!(
                "expected response status 2xx, received status={} body={}",
                status.as_u16(),
                String::from_utf8_lossy(&bytes)
            )));
        }

        Ok(bytes.to_vec())
    }

    /// Render a field template over the REST object
    fn template_field(&self, rest: &REST, field: &str) -> Result<String> {
        if field.is_empty() {
            return Ok(String::new());
        }
        self.engine.render(field, &rest_context(rest, None))
    }

    /// Render a status template over the REST object plus the response
    fn template_status(&self, rest: &REST, response: &Value, field: &str) -> Result<String> {
        self.engine.render(field, &rest_context(rest, Some(response)))
    }

    async fn resolve_auth(&self, auth: &RestAuth) -> Result<(String, String)> {
        let username = self
            .resolve_value(&auth.username, &auth.namespace)
            .await
            .map_err(|e| Error::http(format!("failed to get username value: {}", e)))?;
        let password = self
            .resolve_value(&auth.password, &auth.namespace)
            .await
            .map_err(|e| Error::http(format!("failed to get password value: {}", e)))?;
        Ok((username, password))
    }

    async fn resolve_value(&self, source: &ValueSource, namespace: &str) -> Result<String> {
        if let Some(value) = &source.value {
            return Ok(value.clone());
        }

        let client = self.client.clone().ok_or_else(|| {
            Error::http("secret and configmap references need cluster access".to_string())
        })?;

        if let Some(key_ref) = &source.secret_key_ref {
            let api: Api<Secret> = Api::namespaced(client, namespace);
            let secret = api.get(&key_ref.name).await?;
            let data = secret.data.unwrap_or_default();
            let bytes = data.get(&key_ref.key).ok_or_else(|| {
                Error::http(format!(
                    "secret {} has no key {}",
                    key_ref.name, key_ref.key
                ))
            })?;
            return Ok(String::from_utf8_lossy(&bytes.0).into_owned());
        }

        if let Some(key_ref) = &source.config_map_key_ref {
            let api: Api<ConfigMap> = Api::namespaced(client, namespace);
            let cm = api.get(&key_ref.name).await?;
            let data = cm.data.unwrap_or_default();
            return data.get(&key_ref.key).cloned().ok_or_else(|| {
                Error::http(format!(
                    "configmap {} has no key {}",
                    key_ref.name, key_ref.key
                ))
            });
        }

        Err(Error::http("value source is empty".to_string()))
    }
}

/// Best-effort JSON parse of a response body.
///
/// Non-JSON responses are not an error: the request itself succeeded, so
/// status templates simply see an empty response map.
pub fn parse_response(body: &[u8]) -> Value {
    match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            info!(error = %e, "response body is not json, status templates see an empty response");
            json!({})
        }
    }
}

/// Template context: the object's own fields at the top level, an always-
/// present `status` map, and optionally the parsed `response`.
fn rest_context(rest: &REST, response: Option<&Value>) -> Value {
    let mut context = serde_json::to_value(rest).unwrap_or_else(|_| json!({}));
    if !context["status"].is_object() {
        context["status"] = json!({});
    }
    if let Some(response) = response {
        context["response"] = response.clone();
    }
    context
}

fn parse_method(method: &str) -> Result<reqwest::Method> {
    if method.is_empty() {
        return Ok(reqwest::Method::GET);
    }
    method
        .to_uppercase()
        .parse()
        .map_err(|_| Error::http(format!("invalid http method {}", method)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{KeyRef, RestSpec};
    use kube::core::ObjectMeta;

    fn rest() -> REST {
        let mut rest = REST::new(
            "silence",
            RestSpec {
                url: "http://alertmanager/api/v2".to_string(),
                ..Default::default()
            },
        );
        rest.metadata = ObjectMeta {
            name: Some("silence".to_string()),
            generation: Some(2),
            ..Default::default()
        };
        rest.status = Some(BTreeMap::from([(
            "silenceID".to_string(),
            "XYZ".to_string(),
        )]));
        rest
    }

    fn manager() -> RestManager {
        RestManager::offline(Arc::new(TemplateEngine::offline()))
    }

    #[test]
    fn field_templates_see_spec_and_status() {
        let m = manager();
        let rendered = m
            .template_field(&rest(), "{{ spec.url }}/silence/{{ status.silenceID }}")
            .unwrap();
        assert_eq!(rendered, "http://alertmanager/api/v2/silence/XYZ");
    }

    #[test]
    fn empty_fields_render_empty() {
        let m = manager();
        assert_eq!(m.template_field(&rest(), "").unwrap(), "");
    }

    #[test]
    fn missing_status_keys_render_empty() {
        let m = manager();
        let mut rest = rest();
        rest.status = None;
        let rendered = m
            .template_field(&rest, "[{{ status.silenceID }}]")
            .unwrap();
        assert_eq!(rendered, "[]");
    }

    #[test]
    fn status_templates_see_the_response() {
        let m = manager();
        let response = json!({"silenceID": "abc-123"});
        let rendered = m
            .template_status(&rest(), &response, "{{ response.silenceID }}")
            .unwrap();
        assert_eq!(rendered, "abc-123");
    }

    #[test]
    fn non_json_responses_become_empty_maps() {
        assert_eq!(parse_response(b"plain text"), json!({}));
        assert_eq!(parse_response(b"{\"a\": 1}"), json!({"a": 1}));
    }

    #[tokio::test]
    async fn literal_auth_values_resolve_offline() {
        let m = manager();
        let auth = RestAuth {
            username: ValueSource {
                value: Some("admin".to_string()),
                ..Default::default()
            },
            password: ValueSource {
                value: Some("hunter2".to_string()),
                ..Default::default()
            },
            namespace: String::new(),
        };
        let (user, pass) = m.resolve_auth(&auth).await.unwrap();
        assert_eq!(user, "admin");
        assert_eq!(pass, "hunter2");
    }

    #[tokio::test]
    async fn secret_refs_require_cluster_access() {
        let m = manager();
        let source = ValueSource {
            secret_key_ref: Some(KeyRef {
                name: "auth".to_string(),
                key: "username".to_string(),
            }),
            ..Default::default()
        };
        let err = m.resolve_value(&source, "monitoring").await.unwrap_err();
        assert!(err.to_string().contains("cluster access"));
    }

    #[test]
    fn method_parsing_defaults_to_get() {
        assert_eq!(parse_method("").unwrap(), reqwest::Method::GET);
        assert_eq!(parse_method("post").unwrap(), reqwest::Method::POST);
        assert!(parse_method("NOT A METHOD").is_err());
    }
}
