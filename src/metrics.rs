//! Prometheus metrics
//!
//! Reconcile counters for both resource kinds, labeled by resource name,
//! collected in one registry and served in text format on the address
//! `serve --metrics-addr` binds.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::{Error, Result};

/// Metric handles plus their registry
pub struct Metrics {
    registry: Registry,
    template_count: IntGaugeVec,
    template_success: IntGaugeVec,
    template_failed: IntGaugeVec,
    rest_count: IntGaugeVec,
    rest_success: IntGaugeVec,
    rest_failed: IntGaugeVec,
}

impl Metrics {
    /// Create and register all metric families
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let template_count = gauge(
            "template_operator_template_count",
            "Total template runs count",
            "template",
        )?;
        let template_success = gauge(
            "template_operator_template_success",
            "Total successful template runs count",
            "template",
        )?;
        let template_failed = gauge(
            "template_operator_template_failed",
            "Total failed template runs count",
            "template",
        )?;
        let rest_count = gauge(
            "template_operator_rest_count",
            "Total rest runs count",
            "rest",
        )?;
        let rest_success = gauge(
            "template_operator_rest_success",
            "Total successful rest runs count",
            "rest",
        )?;
        let rest_failed = gauge(
            "template_operator_rest_failed",
            "Total failed rest runs count",
            "rest",
        )?;

        for metric in [
            &template_count,
            &template_success,
            &template_failed,
            &rest_count,
            &rest_success,
            &rest_failed,
        ] {
            registry
                .register(Box::new(metric.clone()))
                .map_err(|e| Error::serialization(format!("failed to register metric: {}", e)))?;
        }

        Ok(Self {
            registry,
            template_count,
            template_success,
            template_failed,
            rest_count,
            rest_success,
            rest_failed,
        })
    }

    /// Record a successful template reconcile
    pub fn template_success(&self, name: &str) {
        self.template_count.with_label_values(&[name]).inc();
        self.template_success.with_label_values(&[name]).inc();
    }

    /// Record a failed template reconcile
    pub fn template_failed(&self, name: &str) {
        self.template_count.with_label_values(&[name]).inc();
        self.template_failed.with_label_values(&[name]).inc();
    }

    /// Record a successful REST reconcile
    pub fn rest_success(&self, name: &str) {
        self.rest_count.with_label_values(&[name]).inc();
        self.rest_success.with_label_values(&[name]).inc();
    }

    /// Record a failed REST reconcile
    pub fn rest_failed(&self, name: &str) {
        self.rest_count.with_label_values(&[name]).inc();
        self.rest_failed.with_label_values(&[name]).inc();
    }

    /// Gather all metric families
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

fn gauge(name: &str, help: &str, label: &str) -> Result<IntGaugeVec> {
    IntGaugeVec::new(Opts::new(name, help), &[label])
        .map_err(|e| Error::serialization(format!("failed to create metric {}: {}", name, e)))
}

/// Router serving `/metrics` in Prometheus text format
pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metrics.gather(), &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
    }
    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_of(metrics: &Metrics, family: &str, label: (&str, &str)) -> Option<i64> {
        metrics
            .gather()
            .iter()
            .find(|f| f.get_name() == family)?
            .get_metric()
            .iter()
            .find(|m| {
                m.get_label()
                    .iter()
                    .any(|l| l.get_name() == label.0 && l.get_value() == label.1)
            })
            .map(|m| m.get_gauge().get_value() as i64)
    }

    #[test]
    fn success_increments_count_and_success() {
        let metrics = Metrics::new().unwrap();
        metrics.template_success("scale-up");
        metrics.template_success("scale-up");
        metrics.template_failed("scale-up");

        assert_eq!(
            value_of(&metrics, "template_operator_template_count", ("template", "scale-up")),
            Some(3)
        );
        assert_eq!(
            value_of(&metrics, "template_operator_template_success", ("template", "scale-up")),
            Some(2)
        );
        assert_eq!(
            value_of(&metrics, "template_operator_template_failed", ("template", "scale-up")),
            Some(1)
        );
    }

    #[test]
    fn rest_metrics_are_labeled_by_name() {
        let metrics = Metrics::new().unwrap();
        metrics.rest_failed("silence");
        assert_eq!(
            value_of(&metrics, "template_operator_rest_count", ("rest", "silence")),
            Some(1)
        );
        assert_eq!(
            value_of(&metrics, "template_operator_rest_failed", ("rest", "silence")),
            Some(1)
        );
        assert_eq!(
            value_of(&metrics, "template_operator_rest_success", ("rest", "silence")),
            None
        );
    }
}
