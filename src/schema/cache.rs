//! Schema cache
//!
//! Holds three independently-expiring cluster artifacts behind one mutex:
//! the OpenAPI document, the discovered API resource list, and the CRD list.
//! A bounded LRU additionally memoizes per-GVK schemas parsed out of CRDs.
//!
//! Expiry is monotonic: `expire_*` pulls the deadline back to now but never
//! pushes it forward, so repeated invalidations are idempotent and a fetch
//! racing an invalidation can never resurrect stale data.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionVersion,
};
use kube::api::{Api, ListParams};
use kube::core::GroupVersionKind;
use kube::discovery::{ApiResource, Discovery, Scope};
use kube::Client;
use tokio::sync::Mutex;
use tracing::debug;

use super::openapi::{Document, Schema};
use crate::{Error, Result};

/// Capacity of the parsed-CRD-schema LRU
const SCHEMA_LRU_CAPACITY: usize = 100;

/// A discovered API resource together with its scope
#[derive(Clone, Debug)]
pub struct ApiResourceInfo {
    /// Resource coordinates (group, version, kind, plural)
    pub resource: ApiResource,
    /// True for namespaced resources
    pub namespaced: bool,
}

/// Fetches the cluster artifacts the cache serves.
///
/// Production uses [`ClusterSchemaFetcher`]; tests inject counting stubs.
#[async_trait]
pub trait SchemaFetcher: Send + Sync {
    /// Fetch the OpenAPI v2 document from `/openapi/v2`
    async fn fetch_openapi(&self) -> Result<Document>;
    /// List all CustomResourceDefinitions
    async fn fetch_crds(&self) -> Result<Vec<CustomResourceDefinition>>;
    /// Run API discovery and return the flattened resource list
    async fn fetch_resources(&self) -> Result<Vec<ApiResourceInfo>>;
}

/// Production fetcher backed by a kube [`Client`]
pub struct ClusterSchemaFetcher {
    client: Client,
}

impl ClusterSchemaFetcher {
    /// Create a fetcher for the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SchemaFetcher for ClusterSchemaFetcher {
    async fn fetch_openapi(&self) -> Result<Document> {
        let request = http::Request::get("/openapi/v2")
            .body(Vec::new())
            .map_err(|e| Error::schema(format!("failed to build openapi request: {}", e)))?;
        let body = self.client.request_text(request).await?;
        serde_json::from_str(&body)
            .map_err(|e| Error::schema(format!("failed to parse openapi document: {}", e)))
    }

    async fn fetch_crds(&self) -> Result<Vec<CustomResourceDefinition>> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn fetch_resources(&self) -> Result<Vec<ApiResourceInfo>> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut resources = Vec::new();
        for group in discovery.groups() {
            for (resource, capabilities) in group.recommended_resources() {
                resources.push(ApiResourceInfo {
                    namespaced: capabilities.scope == Scope::Namespaced,
                    resource,
                });
            }
        }
        Ok(resources)
    }
}

struct Expiring<T> {
    value: Option<Arc<T>>,
    expires_at: Option<Instant>,
}

impl<T> Default for Expiring<T> {
    fn default() -> Self {
        Self {
            value: None,
            expires_at: None,
        }
    }
}

impl<T> Expiring<T> {
    fn fresh(&self) -> Option<Arc<T>> {
        match (&self.value, self.expires_at) {
            (Some(value), Some(deadline)) if Instant::now() < deadline => Some(value.clone()),
            _ => None,
        }
    }

    fn store(&mut self, value: T, expiry: Duration) -> Arc<T> {
        let value = Arc::new(value);
        self.value = Some(value.clone());
        self.expires_at = Some(Instant::now() + expiry);
        value
    }

    // Monotonic: only ever pulls the deadline back.
    fn expire(&mut self) {
        let now = Instant::now();
        if let Some(deadline) = self.expires_at {
            if deadline > now {
                self.expires_at = Some(now);
            }
        }
    }

    fn has_expired(&self) -> bool {
        self.expires_at.map_or(true, |t| t <= Instant::now())
    }
}

/// Bounded LRU keyed by string, used for parsed CRD schemas
struct LruMap<V> {
    entries: IndexMap<String, V>,
    capacity: usize,
}

impl<V: Clone> LruMap<V> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: IndexMap::new(),
            capacity,
        }
    }

    fn get(&mut self, key: &str) -> Option<V> {
        // Move to the back so the insertion order tracks recency.
        let value = self.entries.shift_remove(key)?;
        self.entries.insert(key.to_string(), value.clone());
        Some(value)
    }

    fn insert(&mut self, key: String, value: V) {
        self.entries.shift_remove(&key);
        self.entries.insert(key, value);
        while self.entries.len() > self.capacity {
            self.entries.shift_remove_index(0);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct CacheState {
    document: Expiring<Document>,
    resources: Expiring<Vec<ApiResourceInfo>>,
    crds: Expiring<Vec<CustomResourceDefinition>>,
    parsed: LruMap<Arc<Schema>>,
}

/// Shared cache of cluster schema artifacts
pub struct SchemaCache {
    fetcher: Arc<dyn SchemaFetcher>,
    expiry: Duration,
    state: Mutex<CacheState>,
}

impl SchemaCache {
    /// Create a cache serving values no older than `expiry`
    pub fn new(fetcher: Arc<dyn SchemaFetcher>, expiry: Duration) -> Self {
        Self {
            fetcher,
            expiry,
            state: Mutex::new(CacheState {
                document: Expiring::default(),
                resources: Expiring::default(),
                crds: Expiring::default(),
                parsed: LruMap::new(SCHEMA_LRU_CAPACITY),
            }),
        }
    }

    /// The cached OpenAPI document, fetching when absent or expired
    pub async fn fetch_schema(&self) -> Result<Arc<Document>> {
        let mut state = self.state.lock().await;
        if let Some(document) = state.document.fresh() {
            return Ok(document);
        }
        debug!("fetching cluster openapi document");
        let document = self.fetcher.fetch_openapi().await?;
        Ok(state.document.store(document, self.expiry))
    }

    /// The cached API resource list, fetching when absent or expired
    pub async fn fetch_resources(&self) -> Result<Arc<Vec<ApiResourceInfo>>> {
        let mut state = self.state.lock().await;
        if let Some(resources) = state.resources.fresh() {
            return Ok(resources);
        }
        debug!("running api discovery");
        let resources = self.fetcher.fetch_resources().await?;
        Ok(state.resources.store(resources, self.expiry))
    }

    /// The cached CRD list, fetching when absent or expired
    pub async fn fetch_crds(&self) -> Result<Arc<Vec<CustomResourceDefinition>>> {
        let mut state = self.state.lock().await;
        if let Some(crds) = state.crds.fresh() {
            return Ok(crds);
        }
        debug!("listing customresourcedefinitions");
        let crds = self.fetcher.fetch_crds().await?;
        Ok(state.crds.store(crds, self.expiry))
    }

    /// Expire the OpenAPI document and the CRD list. Idempotent.
    pub async fn expire_schema(&self) {
        let mut state = self.state.lock().await;
        state.document.expire();
        state.crds.expire();
    }

    /// Expire the API resource list. Idempotent.
    pub async fn expire_resources(&self) {
        let mut state = self.state.lock().await;
        state.resources.expire();
    }

    /// True when the next `fetch_schema` would hit the fetcher.
    ///
    /// Consumers holding derived caches (discovery mappings) refresh them
    /// when this reports true, so both views of the cluster stay aligned.
    pub async fn schema_has_expired(&self) -> bool {
        self.state.lock().await.document.has_expired()
    }

    /// True when the next `fetch_resources` would hit the fetcher
    pub async fn resources_have_expired(&self) -> bool {
        self.state.lock().await.resources.has_expired()
    }

    /// Parse a CRD version's `openAPIV3Schema` into the internal schema
    /// model, memoized per group/version/kind.
    pub async fn cached_convert_schema(
        &self,
        gvk: &GroupVersionKind,
        version: &CustomResourceDefinitionVersion,
    ) -> Result<Arc<Schema>> {
        let key = format!("{}|{}|{}", gvk.group, gvk.version, gvk.kind);
        let mut state = self.state.lock().await;
        if let Some(schema) = state.parsed.get(&key) {
            return Ok(schema);
        }

        let props = version
            .schema
            .as_ref()
            .and_then(|v| v.open_api_v3_schema.as_ref())
            .ok_or_else(|| {
                Error::schema(format!(
                    "crd {}/{} {} is missing openapi schema validation",
                    gvk.group, gvk.version, gvk.kind
                ))
            })?;

        let encoded = serde_json::to_value(props)
            .map_err(|e| Error::schema(format!("failed to encode crd schema: {}", e)))?;
        let schema: Schema = serde_json::from_value(encoded)
            .map_err(|e| Error::schema(format!("failed to decode crd schema: {}", e)))?;

        let schema = Arc::new(schema);
        state.parsed.insert(key, schema.clone());
        Ok(schema)
    }

    /// Number of parsed CRD schemas currently memoized
    #[cfg(test)]
    async fn parsed_len(&self) -> usize {
        self.state.lock().await.parsed.len()
    }
}
