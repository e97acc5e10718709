//! Template reconciliation
//!
//! One reconcile selects the template's sources (cluster objects or git
//! archive files), applies the declared patches, synthesizes and applies
//! the declared resources honoring `depends` ordering, materializes
//! namespace copies, and records an aggregate readiness condition on each
//! source.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use kube::core::GroupVersionKind;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crd::{ResourceSelector, Template};
use crate::dynamic::SharedDynamicClient;
use crate::events::EventPublisher;
use crate::git;
use crate::metrics::Metrics;
use crate::object::{split_api_version, Unstructured};
use crate::patch::{PatchEngine, PatchType};
use crate::schema::SchemaCache;
use crate::synth::{resolve_depends, Synthesized, Synthesizer};
use crate::watch::{WatchCallback, WatcherInterface};
use crate::{applied_annotation, Error, Result};

/// Requeue delay when a synthesized object waits on its dependencies
pub const DEPENDENCY_REQUEUE: Duration = Duration::from_secs(120);

/// Requeue delay after an error, applied by the controller error policy
const ERROR_REQUEUE: Duration = Duration::from_secs(60);

/// Shared state for the Template controller
pub struct Context {
    /// Dynamic cluster access
    pub dynamic: SharedDynamicClient,
    /// Shared schema cache
    pub cache: Arc<SchemaCache>,
    /// Patch application
    pub patcher: Arc<PatchEngine>,
    /// Resource synthesis
    pub synthesizer: Arc<Synthesizer>,
    /// Informer fleet for source kinds
    pub watcher: Arc<dyn WatcherInterface>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Reconcile counters
    pub metrics: Arc<Metrics>,
    /// Per-template serialization
    pub locks: super::NamedLocks,
    /// Informer-driven requeue channel back into the serve loop
    pub requeue: mpsc::UnboundedSender<String>,
    /// Interval for periodic re-reconciliation
    pub sync_period: Duration,
}

/// Reconcile one Template
pub async fn reconcile(template: Arc<Template>, ctx: Arc<Context>) -> Result<Action> {
    let name = template.name_any();
    let _guard = ctx.locks.lock(&name).await;
    info!(template = %name, "Reconciling");

    match run(&ctx, &template).await {
        Ok(None) => {
            ctx.metrics.template_success(&name);
            debug!(template = %name, "Reconcile complete");
            Ok(Action::requeue(ctx.sync_period))
        }
        Ok(Some(requeue)) => {
            ctx.metrics.template_success(&name);
            debug!(template = %name, "Reconcile complete, dependencies pending");
            Ok(Action::requeue(requeue))
        }
        Err(e) if e.is_dependency_not_ready() => Ok(Action::requeue(DEPENDENCY_REQUEUE)),
        Err(e) => {
            ctx.metrics.template_failed(&name);
            Err(e)
        }
    }
}

/// Error policy: requeue with a flat delay
pub fn error_policy(_template: Arc<Template>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(error = %error, "Template reconciliation failed");
    Action::requeue(ERROR_REQUEUE)
}

/// Run the whole pipeline for one template; returns a requeue hint when
/// synthesized objects are waiting on dependencies.
pub async fn run(ctx: &Context, template: &Template) -> Result<Option<Duration>> {
    // The discovery snapshot and the schema cache must describe the same
    // cluster state.
    if ctx.cache.schema_has_expired().await {
        ctx.dynamic.invalidate().await;
    }

    if let Some(reference) = &template.spec.source.git_repository {
        return run_git(ctx, template, reference).await;
    }

    let sources = select_sources(ctx, template).await?;
    info!(template = %template.name_any(), count = sources.len(), "Found resources for template");

    if let Some(example) = sources.first() {
        register_watch(ctx, template, example).await;
    }

    let mut requeue = None;
    for source in sources {
        requeue = handle_source(ctx, template, &source).await?.or(requeue);
    }
    Ok(requeue)
}

async fn run_git(
    ctx: &Context,
    template: &Template,
    reference: &crate::crd::GitRepositoryRef,
) -> Result<Option<Duration>> {
    let files = git::fetch_repository_files(&ctx.dynamic, reference).await?;

    let mut requeue = None;
    for file in files {
        // Synthetic source: the template itself, annotated with the file.
        let mut synthetic = Unstructured::new(serde_json::to_value(template)?);
        synthetic.0["filename"] = Value::String(file.filename);
        synthetic.0["content"] = Value::String(file.content);
        requeue = handle_source(ctx, template, &synthetic).await?.or(requeue);
    }
    Ok(requeue)
}

fn source_gvk(selector: &ResourceSelector) -> Result<GroupVersionKind> {
    if selector.kind.is_empty() || selector.api_version.is_empty() {
        return Err(Error::template(
            "must specify a kind and apiVersion".to_string(),
        ));
    }
    let (group, version) = split_api_version(&selector.api_version);
    Ok(GroupVersionKind {
        group: group.to_string(),
        version: version.to_string(),
        kind: selector.kind.clone(),
    })
}

async fn select_sources(ctx: &Context, template: &Template) -> Result<Vec<Unstructured>> {
    let selector = &template.spec.source;
    let gvk = source_gvk(selector)?;

    // Empty namespace selector means all namespaces in one listing.
    let namespaces: Vec<Option<String>> = if selector.namespace_selector.is_empty() {
        vec![None]
    } else {
        ctx.dynamic
            .list_namespaces(Some(&selector.namespace_selector))
            .await?
            .into_iter()
            .map(Some)
            .collect()
    };

    let labels = selector.label_selector.to_label_selector();
    let mut sources = Vec::new();
    for namespace in namespaces {
        sources.extend(
            ctx.dynamic
                .list(&gvk, namespace.as_deref(), &labels, &selector.field_selector)
                .await?,
        );
    }
    Ok(sources)
}

async fn register_watch(ctx: &Context, template: &Template, example: &Unstructured) {
    let requeue = ctx.requeue.clone();
    let name = template.name_any();
    let callback: WatchCallback = Arc::new(move |_object| {
        let _ = requeue.send(name.clone());
    });
    if let Err(e) = ctx.watcher.watch(example, template, callback).await {
        warn!(template = %template.name_any(), error = %e, "failed to register source watch");
    }
}

/// Run patches, synthesis, namespace copies and the readiness condition for
/// one source object.
async fn handle_source(
    ctx: &Context,
    template: &Template,
    source: &Unstructured,
) -> Result<Option<Duration>> {
    let annotation = applied_annotation(template.annotation_namespace(), &template.name_any());
    let already_applied = source.annotation(&annotation) == Some("true");

    let mut target = source.clone();
    if !template.spec.onceoff || !already_applied {
        target = apply_patches(ctx, template, source).await?;

        if template.has_patches() {
            target.set_annotation(&annotation, "true");
            target.strip_blacklisted_annotations();
            if let Err(e) = ctx.dynamic.apply(&target).await {
                ctx.events
                    .warn_failed(source, format!("Failed to apply object: {}", e))
                    .await;
                return Err(e);
            }
        }
    }

    let mut is_source_ready = true;
    let mut requeue = None;

    let objects = match ctx
        .synthesizer
        .objects_for_source(&template.spec, target.value())
        .await
    {
        Ok(objects) => objects,
        Err(e) => {
            ctx.events
                .warn_failed(source, format!("Failed to synthesize resources: {}", e))
                .await;
            return Err(e);
        }
    };

    for item in &objects {
        if let Some(waiting_on) = blocked_on_dependency(ctx, item, &objects).await? {
            debug!(
                kind = item.object.kind(),
                name = item.object.name(),
                waiting_on = %waiting_on,
                "Dependent object not ready, skipping"
            );
            requeue = Some(DEPENDENCY_REQUEUE);
            continue;
        }

        let mut object = item.object.clone();

        // Cross-namespace owner references are rejected by the API server,
        // so those children carry a tracking annotation instead.
        if object.namespace() == source.namespace() {
            object.set_owner_reference(source);
        } else {
            object.set_cross_namespace_owner(source);
        }
        object.strip_blacklisted_annotations();

        info!(
            kind = object.kind(),
            namespace = object.namespace(),
            name = object.name(),
            "Applying"
        );
        if let Err(e) = ctx.dynamic.apply(&object).await {
            ctx.events
                .warn_failed(
                    source,
                    format!(
                        "Failed to apply new resource kind={} name={} err={}",
                        object.kind(),
                        object.name(),
                        e
                    ),
                )
                .await;
            return Err(e);
        }

        match ready_state(ctx, &object).await? {
            (true, _) => {}
            (false, message) => {
                debug!(kind = object.kind(), name = object.name(), message = %message, "resource is not ready");
                is_source_ready = false;
            }
        }
    }

    if let Some(copy) = &template.spec.copy_to_namespaces {
        let mut namespaces: BTreeSet<String> = copy.namespaces.iter().cloned().collect();
        if let Some(selector) = &copy.namespace_selector {
            namespaces.extend(ctx.dynamic.list_namespaces(Some(selector)).await?);
        }

        for namespace in namespaces {
            let mut copied = source.clone();
            copied.set_namespace(&namespace);
            copied.strip_annotations();
            copied.strip_identifiers();
            copied.set_cross_namespace_owner(source);

            info!(
                kind = copied.kind(),
                namespace = %namespace,
                name = copied.name(),
                "Applying"
            );
            if let Err(e) = ctx.dynamic.apply(&copied).await {
                ctx.events
                    .warn_failed(source, format!("Failed to copy to namespace {}: {}", namespace, e))
                    .await;
                return Err(e);
            }

            if !ready_state(ctx, &copied).await?.0 {
                is_source_ready = false;
            }
        }
    }

    let condition = format!("template-{}", template.name_any());
    let value = if is_source_ready { "Ready" } else { "NotReady" };
    if let Err(e) = ctx.dynamic.set_condition(source, &condition, value).await {
        // Sources without a status (ConfigMaps, files) cannot carry the
        // condition; reconciliation still succeeded.
        debug!(
            kind = source.kind(),
            name = source.name(),
            error = %e,
            "failed to set condition on source"
        );
    }

    Ok(requeue)
}

async fn apply_patches(
    ctx: &Context,
    template: &Template,
    source: &Unstructured,
) -> Result<Unstructured> {
    let mut target = source.clone();

    for (index, patch) in template.spec.patches.iter().enumerate() {
        target = ctx
            .patcher
            .apply_indexed(index, &target, patch, PatchType::StrategicMerge)
            .await
            .map_err(|e| fail_patch(ctx, source, e))?;
    }
    for (index, patch) in template.spec.json_patches.iter().enumerate() {
        target = ctx
            .patcher
            .apply_indexed(index, &target, &patch.patch, PatchType::Json)
            .await
            .map_err(|e| fail_patch(ctx, source, e))?;
    }
    Ok(target)
}

// Event emission is fire-and-forget but needs an async context; spawn it so
// the error path stays synchronous.
fn fail_patch(ctx: &Context, source: &Unstructured, error: Error) -> Error {
    let events = ctx.events.clone();
    let source = source.clone();
    let message = format!("Failed to apply patch: {}", error);
    tokio::spawn(async move {
        events.warn_failed(&source, message).await;
    });
    error
}

/// The id of the first dependency that is not ready yet, if any
async fn blocked_on_dependency(
    ctx: &Context,
    item: &Synthesized,
    all: &[Synthesized],
) -> Result<Option<String>> {
    for dependency in resolve_depends(item, all)? {
        match ready_state(ctx, &dependency.object).await? {
            (true, _) => continue,
            (false, _) => {
                return Ok(Some(
                    dependency.id.clone().unwrap_or_else(|| "unnamed".to_string()),
                ))
            }
        }
    }
    Ok(None)
}

// Readiness with not-found downgraded: an object that is not there yet is
// simply not ready.
async fn ready_state(ctx: &Context, object: &Unstructured) -> Result<(bool, String)> {
    match ctx.dynamic.is_ready(object).await {
        Ok(state) => Ok(state),
        Err(e) if e.is_not_found() => Ok((false, "object does not exist yet".to_string())),
        Err(e) => Err(e),
    }
}

/// Drain informer-driven requeue requests: fetch the template and run the
/// same reconcile entrypoint the controller uses (the per-name lock keeps
/// the two paths serialized).
pub fn spawn_requeue_worker(
    ctx: Arc<Context>,
    api: kube::Api<Template>,
    mut rx: mpsc::UnboundedReceiver<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(name) = rx.recv().await {
            match api.get_opt(&name).await {
                Ok(Some(template)) => {
                    if let Err(e) = reconcile(Arc::new(template), ctx.clone()).await {
                        warn!(template = %name, error = %e, "informer-driven reconcile failed");
                    }
                }
                Ok(None) => debug!(template = %name, "template gone, ignoring watch event"),
                Err(e) => warn!(template = %name, error = %e, "failed to fetch template"),
            }
        }
    })
}
