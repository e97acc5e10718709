//! Template Operator - declarative templating and synthesis for Kubernetes
//!
//! The operator watches source objects selected by `Template` resources,
//! reshapes them through strategic-merge and JSON patches, synthesizes new
//! downstream objects from templated skeletons, and reconciles `REST`
//! resources against external HTTP endpoints.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Template, REST)
//! - [`schema`] - cluster schema cache, resolver, and duck typing
//! - [`template`] - minijinja template engine with cluster-aware functions
//! - [`patch`] - strategic-merge and RFC-6902 patch application
//! - [`synth`] - resource synthesis (when / forEach / depends)
//! - [`dynamic`] - dynamic client helpers (discovery, apply, readiness)
//! - [`watch`] - informer fleet for source kinds
//! - [`git`] - GitRepository archive sources
//! - [`rest`] - templated HTTP request composition for REST resources
//! - [`controller`] - reconcilers (Template, REST, CRD invalidation)
//! - [`metrics`] - Prometheus metrics registry and exporter
//! - [`events`] - Kubernetes Event publishing
//! - [`error`] - error types

pub mod controller;
pub mod crd;
pub mod dynamic;
pub mod error;
pub mod events;
pub mod git;
pub mod leader_election;
pub mod metrics;
pub mod object;
pub mod patch;
pub mod rest;
pub mod schema;
pub mod synth;
pub mod template;
pub mod watch;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the Template and REST custom resources
pub const API_GROUP: &str = "templating.flanksource.com";

/// Finalizer protecting REST objects until the remove request succeeded
pub const REST_FINALIZER: &str = "termination.flanksource.com/protect";

/// Annotation marking a source as patched by a given Template.
///
/// Formatted with the Template's namespace and name; the value is "true".
pub const APPLIED_ANNOTATION_PREFIX: &str = "platform.flanksource.com/template-operator";

/// Annotation recording ownership across namespace boundaries, where a real
/// ownerReference is not allowed.
pub const CROSS_NAMESPACE_OWNER_ANNOTATION: &str = "template-operator-owner-ref";

/// Field manager used for all server-side applies
pub const FIELD_MANAGER: &str = "template-operator";

/// Annotations stripped from every object before it is written back.
///
/// These are machine-managed: re-applying them either fails validation or
/// fights the controller that owns them.
pub const ANNOTATION_BLACKLIST: &[&str] = &[
    "kubectl.kubernetes.io/last-applied-configuration",
    "serving.knative.dev/creator",
    "serving.knative.dev/lastModifier",
];

/// Build the applied-annotation key for a Template
pub fn applied_annotation(namespace: &str, name: &str) -> String {
    format!("{}_{}_{}", APPLIED_ANNOTATION_PREFIX, namespace, name)
}
