//! Kubernetes Event recording
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that reconcilers can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::object::Unstructured;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );

    /// Publish a Warning/Failed event for an unstructured object
    async fn warn_failed(&self, object: &Unstructured, note: String) {
        self.publish(
            &object_reference(object),
            EventType::Warning,
            reasons::FAILED,
            actions::RECONCILE,
            Some(note),
        )
        .await;
    }
}

/// Build an ObjectReference for an unstructured object
pub fn object_reference(object: &Unstructured) -> ObjectReference {
    ObjectReference {
        api_version: Some(object.api_version().to_string()),
        kind: Some(object.kind().to_string()),
        name: Some(object.name().to_string()),
        namespace: (!object.namespace().is_empty()).then(|| object.namespace().to_string()),
        uid: (!object.uid().is_empty()).then(|| object.uid().to_string()),
        ..Default::default()
    }
}

/// Production implementation wrapping `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher; the controller name appears as the Event's
    /// reporting component.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// No-op implementation for tests and offline runs
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        // intentionally empty
    }
}

/// Well-known event reason strings
pub mod reasons {
    /// A patch, synthesis or apply step failed for a source
    pub const FAILED: &str = "Failed";
    /// All declared objects applied for a source
    pub const APPLIED: &str = "Applied";
}

/// Well-known event action strings
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn object_reference_copies_identity() {
        let object = Unstructured::new(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "nginx", "namespace": "web", "uid": "u-1"}
        }));
        let reference = object_reference(&object);
        assert_eq!(reference.kind.as_deref(), Some("Deployment"));
        assert_eq!(reference.namespace.as_deref(), Some("web"));
        assert_eq!(reference.uid.as_deref(), Some("u-1"));
    }

    #[test]
    fn cluster_scoped_objects_have_no_namespace() {
        let object = Unstructured::new(json!({
            "apiVersion": "templating.flanksource.com/v1",
            "kind": "Template",
            "metadata": {"name": "t"}
        }));
        assert_eq!(object_reference(&object).namespace, None);
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        publisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::FAILED,
                actions::RECONCILE,
                Some("test".to_string()),
            )
            .await;
    }
}
