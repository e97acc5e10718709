//! Custom Resource Definitions for the template operator
//!
//! Two cluster-scoped resources drive the operator:
//! - [`Template`] - patch and synthesize cluster objects from a source selector
//! - [`REST`] - mirror an object's lifecycle onto an external HTTP endpoint

mod rest;
mod template;

pub use rest::{KeyRef, REST, RestAction, RestAuth, RestSpec, RestStatus, ValueSource};
pub use template::{
    CopyToNamespaces, GitRepositoryRef, JsonPatch, PatchObject, ResourceSelector, Selector,
    SelectorRequirement, Template, TemplateSpec, TemplateStatus,
};
