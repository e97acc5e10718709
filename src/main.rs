//! Template Operator - create, copy and update Kubernetes resources from
//! declarative templates

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::Api;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, CustomResourceExt, ResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use template_operator::controller::{crd, rest, template, NamedLocks};
use template_operator::crd::{REST, Template};
use template_operator::dynamic::DynamicClient;
use template_operator::events::KubeEventPublisher;
use template_operator::leader_election::{LeaderElector, LEADER_LEASE_NAME};
use template_operator::metrics::{self, Metrics};
use template_operator::object::Unstructured;
use template_operator::patch::{PatchEngine, PatchType};
use template_operator::rest::RestManager;
use template_operator::schema::{
    ApiResourceInfo, ClusterSchemaFetcher, Document, SchemaCache, SchemaFetcher, SchemaResolver,
};
use template_operator::synth::Synthesizer;
use template_operator::template::{ClusterLookup, TemplateEngine};
use template_operator::watch::InformerFleet;

/// The Template Operator is for platform engineers needing an easy and
/// reliable way to create, copy and update kubernetes resources.
#[derive(Parser, Debug)]
#[command(name = "template-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Enable json logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run kubernetes controller
    Serve(ServeArgs),

    /// Execute template locally
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// The address the metric endpoint binds to
    #[arg(long, default_value = ":8080")]
    metrics_addr: String,

    /// The time duration to run a full reconcile
    #[arg(long, default_value = "5m", value_parser = parse_duration)]
    sync_period: Duration,

    /// The time duration to expire the API schema cache
    #[arg(long, default_value = "15m", value_parser = parse_duration)]
    expire: Duration,

    /// Enable leader election for the controller manager.
    /// Enabling this will ensure there is only one active controller manager.
    #[arg(long)]
    enable_leader_election: bool,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// The template to run
    #[arg(long)]
    template: String,

    /// The object used as source for the template
    #[arg(long)]
    obj: String,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (number, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => value.split_at(split),
        None => (value, "s"),
    };
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration {}", value))?;
    let seconds = match unit {
        "s" | "" => number,
        "m" => number * 60,
        "h" => number * 3600,
        other => return Err(format!("unknown duration unit {}", other)),
    };
    Ok(Duration::from_secs(seconds))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,tower=warn,hyper=warn"));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }

    if cli.crd {
        print!("{}", serde_yaml::to_string(&Template::crd())?);
        println!("---");
        print!("{}", serde_yaml::to_string(&REST::crd())?);
        return Ok(());
    }

    match cli.command {
        Some(Commands::Serve(args)) => serve(args).await,
        Some(Commands::Run(args)) => run(args).await,
        None => serve(ServeArgs {
            metrics_addr: ":8080".to_string(),
            sync_period: Duration::from_secs(300),
            expire: Duration::from_secs(900),
            enable_leader_election: false,
        })
        .await,
    }
}

/// Run the controller loop
async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {}", e))?;

    let metrics = Arc::new(Metrics::new()?);
    let metrics_addr = parse_bind_addr(&args.metrics_addr)?;
    let metrics_server = tokio::spawn({
        let router = metrics::router(metrics.clone());
        async move {
            tracing::info!(addr = %metrics_addr, "Metrics endpoint listening");
            let listener = match tokio::net::TcpListener::bind(metrics_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!(error = %e, "failed to bind metrics address");
                    return;
                }
            };
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!(error = %e, "metrics server error");
            }
        }
    });

    // Leadership gates the controllers, not the metrics endpoint.
    let _leadership = if args.enable_leader_election {
        let namespace =
            std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".to_string());
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "template-operator".to_string());
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            LEADER_LEASE_NAME,
            &namespace,
            &identity,
        ));
        Some(elector.acquire().await?)
    } else {
        None
    };

    // Shared plumbing: one schema cache, one dynamic client, one immutable
    // template function map.
    let cache = Arc::new(SchemaCache::new(
        Arc::new(ClusterSchemaFetcher::new(client.clone())),
        args.expire,
    ));
    let dynamic = Arc::new(DynamicClient::new(client.clone()));
    let engine = Arc::new(TemplateEngine::new(Arc::new(ClusterLookup::new(
        client.clone(),
    ))));
    let resolver = Arc::new(SchemaResolver::new(cache.clone()));
    let patcher = Arc::new(PatchEngine::new(engine.clone(), resolver.clone()));
    let synthesizer = Arc::new(Synthesizer::new(engine.clone(), resolver.clone()));
    let fleet = Arc::new(InformerFleet::new(dynamic.clone()));
    let events = Arc::new(KubeEventPublisher::new(client.clone(), "template-operator"));

    let (requeue_tx, requeue_rx) = tokio::sync::mpsc::unbounded_channel();

    let template_ctx = Arc::new(template::Context {
        dynamic: dynamic.clone(),
        cache: cache.clone(),
        patcher,
        synthesizer,
        watcher: fleet,
        events,
        metrics: metrics.clone(),
        locks: NamedLocks::new(),
        requeue: requeue_tx,
        sync_period: args.sync_period,
    });

    let rest_ctx = Arc::new(rest::Context {
        client: client.clone(),
        dynamic: dynamic.clone(),
        cache: cache.clone(),
        manager: RestManager::new(engine.clone(), client.clone()),
        metrics: metrics.clone(),
        locks: NamedLocks::new(),
        sync_period: args.sync_period,
    });

    let crd_ctx = Arc::new(crd::Context::new(cache));

    let templates: Api<Template> = Api::all(client.clone());
    let requeue_worker =
        template::spawn_requeue_worker(template_ctx.clone(), templates.clone(), requeue_rx);

    tracing::info!("Starting controllers");

    let template_controller = Controller::new(templates, WatcherConfig::default())
        .shutdown_on_signal()
        .run(template::reconcile, template::error_policy, template_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "Template reconciliation completed"),
                Err(e) => tracing::error!(error = %e, "Template reconciliation error"),
            }
        });

    let rests: Api<REST> = Api::all(client.clone());
    let rest_controller = Controller::new(rests, WatcherConfig::default())
        .shutdown_on_signal()
        .run(rest::reconcile, rest::error_policy, rest_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "REST reconciliation completed"),
                Err(e) => tracing::error!(error = %e, "REST reconciliation error"),
            }
        });

    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let crd_controller = Controller::new(crds, WatcherConfig::default())
        .shutdown_on_signal()
        .run(crd::reconcile, crd::error_policy, crd_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "CRD reconciliation completed"),
                Err(e) => tracing::error!(error = %e, "CRD reconciliation error"),
            }
        });

    tokio::join!(template_controller, rest_controller, crd_controller);

    requeue_worker.abort();
    metrics_server.abort();
    tracing::info!("Controllers stopped, shutting down");
    Ok(())
}

/// Offline fetcher: no cluster, no schemas, coercion passes through
struct OfflineFetcher;

#[async_trait::async_trait]
impl SchemaFetcher for OfflineFetcher {
    async fn fetch_openapi(&self) -> template_operator::Result<Document> {
        Ok(Document::default())
    }
    async fn fetch_crds(
        &self,
    ) -> template_operator::Result<
        Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>,
    > {
        Ok(vec![])
    }
    async fn fetch_resources(&self) -> template_operator::Result<Vec<ApiResourceInfo>> {
        Ok(vec![])
    }
}

/// Render a Template against a single object without touching the cluster
async fn run(args: RunArgs) -> anyhow::Result<()> {
    let template: Template = serde_yaml::from_str(&std::fs::read_to_string(&args.template)?)?;
    let source = Unstructured::from_yaml(&std::fs::read_to_string(&args.obj)?)?;

    let engine = Arc::new(TemplateEngine::offline());
    let cache = Arc::new(SchemaCache::new(
        Arc::new(OfflineFetcher),
        Duration::from_secs(900),
    ));
    let resolver = Arc::new(SchemaResolver::new(cache));
    let patcher = PatchEngine::new(engine.clone(), resolver.clone());
    let synthesizer = Synthesizer::new(engine, resolver);

    let mut target = source.clone();
    for (index, patch) in template.spec.patches.iter().enumerate() {
        target = patcher
            .apply_indexed(index, &target, patch, PatchType::StrategicMerge)
            .await?;
    }
    for (index, patch) in template.spec.json_patches.iter().enumerate() {
        target = patcher
            .apply_indexed(index, &target, &patch.patch, PatchType::Json)
            .await?;
    }

    if template.has_patches() {
        print!("{}", serde_yaml::to_string(target.value())?);
        println!("---");
    }

    let objects = synthesizer
        .objects_for_source(&template.spec, target.value())
        .await?;
    tracing::info!(template = %template.name_any(), count = objects.len(), "rendered objects");
    for synthesized in objects {
        print!("{}", serde_yaml::to_string(synthesized.object.value())?);
        println!("---");
    }

    Ok(())
}

fn parse_bind_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics address {}: {}", addr, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_like_go_flags() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("42").unwrap(), Duration::from_secs(42));
        assert!(parse_duration("five minutes").is_err());
    }

    #[test]
    fn metrics_addr_accepts_port_only_form() {
        assert_eq!(
            parse_bind_addr(":8080").unwrap(),
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_bind_addr("nonsense").is_err());
    }
}
