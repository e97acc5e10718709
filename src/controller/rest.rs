//! REST reconciliation
//!
//! A REST object's lifecycle maps onto two HTTP requests: update runs when
//! the generation advances, remove runs on deletion. The finalizer
//! guarantees the remove request happens before the object disappears, and
//! status writes retry through a bounded backoff because the status map is
//! contended between the operator and users patching specs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::crd::REST;
use crate::dynamic::SharedDynamicClient;
use crate::metrics::Metrics;
use crate::rest::RestManager;
use crate::schema::SchemaCache;
use crate::{Error, Result, REST_FINALIZER};

/// Requeue delay after an error
const ERROR_REQUEUE: Duration = Duration::from_secs(60);

/// Status persistence backoff: 50ms base, x1.5, jitter, 10 steps, 5s cap
#[derive(Clone, Debug)]
struct Backoff {
    delay: Duration,
    factor: f64,
    cap: Duration,
    steps: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(50),
            factor: 1.5,
            cap: Duration::from_secs(5),
            steps: 10,
        }
    }
}

impl Backoff {
    /// The next sleep, jittered, or None when the schedule is exhausted
    fn step(&mut self) -> Option<Duration> {
        if self.steps == 0 {
            return None;
        }
        self.steps -= 1;

        let jitter = rand::thread_rng().gen_range(1.0..2.0);
        let jittered = self.delay.mul_f64(jitter);
        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.factor).min(self.cap.as_secs_f64()),
        );
        Some(jittered.min(self.cap))
    }
}

/// Shared state for the REST controller
pub struct Context {
    /// Typed access to REST objects
    pub client: Client,
    /// Dynamic access, invalidated together with the schema cache
    pub dynamic: SharedDynamicClient,
    /// Shared schema cache
    pub cache: Arc<SchemaCache>,
    /// Request composer
    pub manager: RestManager,
    /// Reconcile counters
    pub metrics: Arc<Metrics>,
    /// Per-object serialization
    pub locks: super::NamedLocks,
    /// Interval for periodic re-reconciliation
    pub sync_period: Duration,
}

/// Reconcile one REST object
pub async fn reconcile(rest: Arc<REST>, ctx: Arc<Context>) -> Result<Action> {
    let name = rest.name_any();
    let _guard = ctx.locks.lock(&name).await;
    debug!(rest = %name, "Started reconciling");

    if ctx.cache.schema_has_expired().await {
        ctx.dynamic.invalidate().await;
    }

    let api: Api<REST> = Api::all(ctx.client.clone());

    if rest.metadata.deletion_timestamp.is_some() {
        debug!(rest = %name, "Object marked as deleted");
        if let Err(e) = ctx.manager.remove(&rest).await {
            ctx.metrics.rest_failed(&name);
            return Err(e);
        }
        remove_finalizer(&api, &name).await?;
        return Ok(Action::await_change());
    }

    if !has_finalizer(&rest) {
        debug!(rest = %name, "Setting finalizer");
        add_finalizer(&api, &rest).await?;
        // The update that added the finalizer re-triggers reconciliation;
        // the update request runs on that pass.
        return Ok(Action::await_change());
    }

    if rest.same_generation() {
        debug!(rest = %name, "Generation unchanged, skipping update");
        ctx.metrics.rest_success(&name);
        return Ok(Action::requeue(ctx.sync_period));
    }

    let updates = match ctx.manager.update(&rest).await {
        Ok(updates) => updates,
        Err(e) => {
            warn!(rest = %name, error = %e, "Failed to run update");
            ctx.metrics.rest_failed(&name);
            return Err(e);
        }
    };

    persist_status(&api, &name, updates).await?;
    ctx.metrics.rest_success(&name);
    info!(rest = %name, generation = rest.metadata.generation, "Finished reconciling");
    Ok(Action::requeue(ctx.sync_period))
}

/// Error policy: requeue with a flat delay
pub fn error_policy(_rest: Arc<REST>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(error = %error, "REST reconciliation failed");
    Action::requeue(ERROR_REQUEUE)
}

fn has_finalizer(rest: &REST) -> bool {
    rest.metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == REST_FINALIZER))
}

fn without_finalizer(finalizers: Option<&Vec<String>>) -> Vec<String> {
    finalizers
        .map(|f| f.iter().filter(|x| *x != REST_FINALIZER).cloned().collect())
        .unwrap_or_default()
}

async fn add_finalizer(api: &Api<REST>, rest: &REST) -> Result<()> {
    let mut updated = rest.clone();
    updated
        .metadata
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(REST_FINALIZER.to_string());
    updated.metadata.managed_fields = None;
    api.replace(&rest.name_any(), &PostParams::default(), &updated)
        .await?;
    Ok(())
}

/// Remove the finalizer under the bounded backoff, refetching on conflicts
async fn remove_finalizer(api: &Api<REST>, name: &str) -> Result<()> {
    let mut backoff = Backoff::default();
    let mut current = match api.get_opt(name).await? {
        Some(rest) => rest,
        None => return Ok(()),
    };

    loop {
        current.metadata.finalizers =
            Some(without_finalizer(current.metadata.finalizers.as_ref()));
        current.metadata.managed_fields = None;

        match api.replace(name, &PostParams::default(), &current).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                let conflict = matches!(&e, kube::Error::Api(ae) if ae.code == 409);
                let Some(delay) = backoff.step() else {
                    return Err(Error::Conflict(format!(
                        "failed to remove finalizer from {}: {}",
                        name, e
                    )));
                };
                warn!(rest = %name, error = %e, "remove finalizer failed, retrying");
                tokio::time::sleep(delay).await;
                if conflict {
                    current = match api.get_opt(name).await? {
                        Some(rest) => rest,
                        None => return Ok(()),
                    };
                }
            }
        }
    }
}

/// Merge the computed status fields and persist them under the bounded
/// backoff, refetching and re-applying the delta on conflicts.
async fn persist_status(
    api: &Api<REST>,
    name: &str,
    updates: BTreeMap<String, String>,
) -> Result<()> {
    let mut backoff = Backoff::default();
    let mut current = api.get(name).await?;
    let old_status = current.status.clone().unwrap_or_default();

    loop {
        let status = current.status.get_or_insert_with(BTreeMap::new);
        for (key, value) in &updates {
            status.insert(key.clone(), value.clone());
        }
        if *status == old_status {
            debug!(rest = %name, "status did not change, skipping");
            return Ok(());
        }
        status.insert(
            "lastUpdated".to_string(),
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        );

        let data = serde_json::to_vec(&current)?;
        match api.replace_status(name, &PostParams::default(), data).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                let conflict = matches!(&e, kube::Error::Api(ae) if ae.code == 409);
                let Some(delay) = backoff.step() else {
                    return Err(Error::Conflict(format!(
                        "failed to update status of {}: {}",
                        name, e
                    )));
                };
                warn!(rest = %name, error = %e, "update status failed, retrying");
                tokio::time::sleep(delay).await;
                if conflict {
                    current = api.get(name).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded_and_exhausts() {
        let mut backoff = Backoff::default();
        let mut steps = 0;
        while let Some(delay) = backoff.step() {
            steps += 1;
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_secs(5));
        }
        assert_eq!(steps, 10);
    }

    #[test]
    fn backoff_grows_toward_the_cap() {
        let mut backoff = Backoff::default();
        for _ in 0..9 {
            backoff.step();
        }
        // after nine steps the raw delay is 50ms * 1.5^9 ~= 1.9s, capped at 5s
        assert!(backoff.delay <= Duration::from_secs(5));
        assert!(backoff.delay > Duration::from_millis(500));
    }

    #[test]
    fn finalizer_membership_checks() {
        let mut rest = REST::new("r", Default::default());
        assert!(!has_finalizer(&rest));

        rest.metadata.finalizers = Some(vec![
            "other/finalizer".to_string(),
            REST_FINALIZER.to_string(),
        ]);
        assert!(has_finalizer(&rest));

        let remaining = without_finalizer(rest.metadata.finalizers.as_ref());
        assert_eq!(remaining, vec!["other/finalizer".to_string()]);
    }

    #[test]
    fn without_finalizer_handles_empty() {
        assert!(without_finalizer(None).is_empty());
    }
}
