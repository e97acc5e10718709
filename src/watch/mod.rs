//! Informer fleet
//!
//! Every Template needs change notifications for its source Kind, so the
//! fleet maintains at most one watch task per (Kind, Template-name) pair.
//! Registration is idempotent: repeated `watch` calls for a known key are
//! no-ops. Tasks live until process exit; Template deletion does not cancel
//! them (the stale task only triggers reconciles that no-op).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use tracing::{debug, warn};

use crate::crd::Template;
use crate::dynamic::SharedDynamicClient;
use crate::object::Unstructured;
use crate::Result;

/// Invoked with every added or updated source object
pub type WatchCallback = Arc<dyn Fn(Unstructured) + Send + Sync>;

/// Registration seam so reconcilers can run without a cluster
#[async_trait]
pub trait WatcherInterface: Send + Sync {
    /// Ensure a watch exists for the template's source kind
    async fn watch(
        &self,
        example: &Unstructured,
        template: &Template,
        callback: WatchCallback,
    ) -> Result<()>;
}

/// No-op watcher for offline runs and tests
pub struct NullWatcher;

#[async_trait]
impl WatcherInterface for NullWatcher {
    async fn watch(
        &self,
        _example: &Unstructured,
        _template: &Template,
        _callback: WatchCallback,
    ) -> Result<()> {
        Ok(())
    }
}

/// Deduplicated set of watch keys
struct DedupSet {
    keys: Mutex<HashSet<String>>,
}

impl DedupSet {
    fn new() -> Self {
        Self {
            keys: Mutex::new(HashSet::new()),
        }
    }

    /// True when the key was newly inserted
    fn try_insert(&self, key: &str) -> bool {
        self.keys
            .lock()
            .expect("watch key set poisoned")
            .insert(key.to_string())
    }
}

/// Fleet of dynamic watch tasks
pub struct InformerFleet {
    dynamic: SharedDynamicClient,
    active: DedupSet,
}

impl InformerFleet {
    /// Create an empty fleet
    pub fn new(dynamic: SharedDynamicClient) -> Self {
        Self {
            dynamic,
            active: DedupSet::new(),
        }
    }
}

fn watch_key(example: &Unstructured, template: &Template) -> String {
    let name = template.metadata.name.as_deref().unwrap_or("");
    format!("kind={};template={}", example.kind(), name)
}

#[async_trait]
impl WatcherInterface for InformerFleet {
    async fn watch(
        &self,
        example: &Unstructured,
        template: &Template,
        callback: WatchCallback,
    ) -> Result<()> {
        let key = watch_key(example, template);
        if !self.active.try_insert(&key) {
            return Ok(());
        }
        debug!(key = %key, "deploying new watcher");

        // Watches span all namespaces; the template's selectors narrow the
        // stream server-side.
        let api = self.dynamic.api_for(&example.gvk(), None).await?;
        let mut config = watcher::Config::default();
        let labels = template.spec.source.label_selector.to_label_selector();
        if !labels.is_empty() {
            config = config.labels(&labels);
        }
        if !template.spec.source.field_selector.is_empty() {
            config = config.fields(&template.spec.source.field_selector);
        }

        tokio::spawn(async move {
            // applied_objects surfaces adds and updates; deletions are
            // dropped by design - synthesized children are garbage-collected
            // through owner references, not re-reconciliation.
            let stream = watcher(api, config).default_backoff().applied_objects();
            futures::pin_mut!(stream);
            while let Some(event) = stream.next().await {
                match event {
                    Ok(object) => match serde_json::to_value(object) {
                        Ok(value) => callback(Unstructured::new(value)),
                        Err(e) => warn!(error = %e, "failed to encode watched object"),
                    },
                    Err(e) => warn!(key = %key, error = %e, "watch stream error"),
                }
            }
        });

        Ok(())
    }
}
