//! Template engine
//!
//! One minijinja environment per reconciler with a fixed function map:
//! cluster lookups (`kget`), json-path extraction (`jsonPath`) and the
//! encoding filters templates lean on (`toJSON`, `toYAML`, `b64enc`,
//! `b64dec`). Undefined values render as empty rather than erroring, which
//! is what patch and REST field templates rely on when optional fields are
//! absent from a source.

mod filters;
mod functions;

pub use functions::{json_path_value, ClusterLookup, NullLookup, ObjectLookup};

use std::sync::Arc;

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use crate::Result;

/// Template evaluator shared by the patch engine, the synthesizer and the
/// REST manager.
///
/// The function map is built once at construction and immutable afterwards;
/// per-call state (the current source object) travels through the template
/// context, never through the environment.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    /// Create an engine whose `kget` resolves through the given lookup
    pub fn new(lookup: Arc<dyn ObjectLookup>) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);

        functions::register(&mut env, lookup);
        filters::register(&mut env);

        Self { env }
    }

    /// Engine with no cluster access; `kget` always resolves empty.
    ///
    /// Used by the offline `run` subcommand and by tests that do not
    /// exercise lookups.
    pub fn offline() -> Self {
        Self::new(Arc::new(NullLookup))
    }

    /// Render a template string against a serializable context
    pub fn render<S: Serialize>(&self, template: &str, context: &S) -> Result<String> {
        Ok(self.env.render_str(template, context)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_source_fields() {
        let engine = TemplateEngine::offline();
        let ctx = json!({"spec": {"replicas": 3, "name": "pg"}});
        assert_eq!(
            engine.render("postgres-{{ spec.name }}", &ctx).unwrap(),
            "postgres-pg"
        );
        assert_eq!(engine.render("{{ spec.replicas }}", &ctx).unwrap(), "3");
    }

    #[test]
    fn undefined_values_render_empty() {
        let engine = TemplateEngine::offline();
        let ctx = json!({"spec": {}});
        assert_eq!(engine.render("[{{ spec.missing }}]", &ctx).unwrap(), "[]");
        assert_eq!(
            engine.render("[{{ status.conditions.0.type }}]", &ctx).unwrap(),
            "[]"
        );
    }

    #[test]
    fn comparisons_work_for_when_guards() {
        let engine = TemplateEngine::offline();
        let ctx = json!({"spec": {"exposeService": false}});
        assert_eq!(
            engine
                .render("{{ spec.exposeService == true }}", &ctx)
                .unwrap(),
            "false"
        );
    }

    #[test]
    fn to_json_filter_serializes_maps() {
        let engine = TemplateEngine::offline();
        let ctx = json!({"spec": {"parameters": {"work_mem": "475MB"}}});
        assert_eq!(
            engine
                .render("{{ spec.parameters | toJSON }}", &ctx)
                .unwrap(),
            r#"{"work_mem":"475MB"}"#
        );
    }

    #[test]
    fn base64_filters_round_trip() {
        let engine = TemplateEngine::offline();
        let ctx = json!({"v": "bar"});
        assert_eq!(engine.render("{{ v | b64enc }}", &ctx).unwrap(), "YmFy");
        assert_eq!(
            engine.render("{{ 'YmFy' | b64dec }}", &ctx).unwrap(),
            "bar"
        );
    }

    #[test]
    fn syntax_errors_surface() {
        let engine = TemplateEngine::offline();
        let err = engine.render("{{ unclosed", &json!({})).unwrap_err();
        assert!(matches!(err, crate::Error::Template(_)));
    }
}
