//! CRD invalidation
//!
//! Watches CustomResourceDefinitions and expires the shared schema cache
//! when one actually changes. The resourceVersion watermark keeps
//! invalidation monotonic: unrelated update events replaying an old version
//! never trigger duplicate work.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::schema::SchemaCache;
use crate::{Error, Result};

/// Requeue delay after an error
const ERROR_REQUEUE: Duration = Duration::from_secs(60);

/// Shared state for the CRD invalidation controller
pub struct Context {
    /// The cache to expire on CRD changes
    pub cache: Arc<SchemaCache>,
    /// Highest resourceVersion seen so far
    pub watermark: AtomicI64,
}

impl Context {
    /// Create a context with an empty watermark
    pub fn new(cache: Arc<SchemaCache>) -> Self {
        Self {
            cache,
            watermark: AtomicI64::new(0),
        }
    }
}

/// Reconcile one CRD event
pub async fn reconcile(crd: Arc<CustomResourceDefinition>, ctx: Arc<Context>) -> Result<Action> {
    let name = crd.name_any();
    debug!(crd = %name, "crd update detected, checking cache state");

    let resource_version: i64 = crd
        .metadata
        .resource_version
        .as_deref()
        .unwrap_or("")
        .parse()
        .map_err(|_| {
            Error::serialization(format!(
                "crd {} has a non-numeric resourceVersion",
                name
            ))
        })?;

    // fetch_max is the monotonic guard: only the first event carrying a
    // newer version wins, concurrent replays lose.
    let previous = ctx.watermark.fetch_max(resource_version, Ordering::SeqCst);
    if resource_version > previous {
        debug!(crd = %name, resource_version, "newer resourceVersion detected, resetting cache");
        ctx.cache.expire_schema().await;
    }

    Ok(Action::await_change())
}

/// Error policy: requeue with a flat delay
pub fn error_policy(
    _crd: Arc<CustomResourceDefinition>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    warn!(error = %error, "CRD reconciliation failed");
    Action::requeue(ERROR_REQUEUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ApiResourceInfo, Document, SchemaFetcher};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingFetcher {
        openapi_calls: AtomicUsize,
    }

    #[async_trait]
    impl SchemaFetcher for CountingFetcher {
        async fn fetch_openapi(&self) -> Result<Document> {
            self.openapi_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Document::default())
        }
        async fn fetch_crds(&self) -> Result<Vec<CustomResourceDefinition>> {
            Ok(vec![])
        }
        async fn fetch_resources(&self) -> Result<Vec<ApiResourceInfo>> {
            Ok(vec![])
        }
    }

    fn crd_with_version(version: &str) -> Arc<CustomResourceDefinition> {
        let mut crd = CustomResourceDefinition::default();
        crd.metadata.name = Some("widgets.example.com".to_string());
        crd.metadata.resource_version = Some(version.to_string());
        Arc::new(crd)
    }

    fn context() -> (Arc<Context>, Arc<CountingFetcher>) {
        let fetcher = Arc::new(CountingFetcher {
            openapi_calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(SchemaCache::new(
            fetcher.clone(),
            Duration::from_secs(3600),
        ));
        (Arc::new(Context::new(cache)), fetcher)
    }

    #[tokio::test]
    async fn newer_version_expires_the_cache() {
        let (ctx, fetcher) = context();
        ctx.cache.fetch_schema().await.unwrap();
        assert_eq!(fetcher.openapi_calls.load(Ordering::SeqCst), 1);

        reconcile(crd_with_version("10"), ctx.clone()).await.unwrap();
        ctx.cache.fetch_schema().await.unwrap();
        assert_eq!(fetcher.openapi_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn replayed_version_expires_only_once() {
        let (ctx, fetcher) = context();

        reconcile(crd_with_version("10"), ctx.clone()).await.unwrap();
        ctx.cache.fetch_schema().await.unwrap();
        // same version again: no expiry, cache stays warm
        reconcile(crd_with_version("10"), ctx.clone()).await.unwrap();
        reconcile(crd_with_version("9"), ctx.clone()).await.unwrap();
        ctx.cache.fetch_schema().await.unwrap();
        assert_eq!(fetcher.openapi_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_numeric_resource_version_is_an_error() {
        let (ctx, _) = context();
        let err = reconcile(crd_with_version("abc"), ctx).await.unwrap_err();
        assert!(err.to_string().contains("non-numeric"));
    }
}
