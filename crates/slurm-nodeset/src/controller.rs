//! NodeSet reconciliation
//!
//! Keeps `spec.replicas` ordinally named worker pods running, lowest ordinals
//! first. Pods above the desired count are condemned, have their claims
//! handed over per the retention policy, and are then deleted highest first.
//! Pods built from an older template are replaced per the update strategy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use slurm_common::crd::{NodeSet, NodeSetStatus};
use slurm_common::events::{EventPublisher, KubeEventPublisher, NODESET_REPORTER};
use slurm_common::kube_utils::{controller_of, is_deleting, uid_of};
use slurm_common::{metrics, DurationStore, Error, NamespacedName};

use crate::client::{KubeClient, KubeClientImpl};
use crate::identity::{
    is_condemned, new_nodeset_pod, parent_and_ordinal, selector_labels, update_revision,
    validate_claim_templates,
};
use crate::pod_control::PodControl;
use crate::update::{is_pod_updated, pods_to_replace};

/// Most pods created by a single reconcile
pub const BURST_REPLICAS: usize = 250;

/// Delay before retrying a pod whose claims still belong to its predecessor
const STALE_CLAIM_REQUEUE: Duration = Duration::from_secs(5);

/// Delay before observing the result of pod creations and deletions
const OBSERVE_REQUEUE: Duration = Duration::from_secs(1);

/// Requeue for errors that need a spec change
const PERMANENT_ERROR_REQUEUE: Duration = Duration::from_secs(300);

/// Requeue for errors that may clear on their own
const RETRYABLE_ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Shared context for the NodeSet controller
///
/// Use [`Context::builder`] to construct instances.
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Pod and claim writer
    pub pod_control: PodControl,
    /// Requeue delays requested during a reconcile, keyed by NodeSet
    pub durations: DurationStore,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a new controller context with the given Kubernetes client
    pub fn new(client: Client) -> Self {
        Self::builder(client).build()
    }

    /// Create a context over test doubles
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            pod_control: PodControl::new(kube.clone(), events),
            kube,
            durations: DurationStore::new(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            events: None,
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kube = self
            .kube
            .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone())));
        let events = self.events.unwrap_or_else(|| {
            Arc::new(KubeEventPublisher::new(self.client.clone(), NODESET_REPORTER))
        });
        Context {
            pod_control: PodControl::new(kube.clone(), events),
            kube,
            durations: DurationStore::new(),
        }
    }
}

/// Reconcile a NodeSet
///
/// Requeue delays pushed into the context's [`DurationStore`] during the
/// sync are drained here, whether or not the sync succeeded.
#[instrument(skip(nodeset, ctx), fields(nodeset = %nodeset.name_any()))]
pub async fn reconcile(nodeset: Arc<NodeSet>, ctx: Arc<Context>) -> Result<Action, Error> {
    let started = Instant::now();
    let key = NamespacedName::of(nodeset.as_ref());

    let result = sync(&key, &ctx).await;
    let requeue = ctx.durations.pop(&key.to_string());
    metrics::record_reconcile("nodeset", started.elapsed(), result.as_ref().err());
    result?;

    if requeue.is_zero() {
        Ok(Action::await_change())
    } else {
        debug!(requeue_ms = requeue.as_millis() as u64, "Requeueing NodeSet");
        Ok(Action::requeue(requeue))
    }
}

/// Error policy for the NodeSet controller
pub fn error_policy(nodeset: Arc<NodeSet>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        nodeset = %nodeset.name_any(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(RETRYABLE_ERROR_REQUEUE)
    } else {
        Action::requeue(PERMANENT_ERROR_REQUEUE)
    }
}

/// `k=v,...` form of the NodeSet's pod selector
pub fn selector_string(nodeset: &NodeSet) -> String {
    selector_labels(nodeset)
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// True if the pod is Running with a true Ready condition
pub fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status
            .conditions
            .iter()
            .flatten()
            .any(|c| c.type_ == "Ready" && c.status == "True")
}

async fn list_owned_pods(ctx: &Context, nodeset: &NodeSet) -> Result<Vec<Pod>, Error> {
    let namespace = nodeset.namespace().unwrap_or_default();
    let uid = uid_of(&nodeset.metadata);
    let pods = ctx.kube.list_pods(&namespace, &selector_string(nodeset)).await?;
    Ok(pods
        .into_iter()
        .filter(|pod| controller_of(&pod.metadata).is_some_and(|r| r.uid == uid))
        .collect())
}

async fn sync(key: &NamespacedName, ctx: &Context) -> Result<(), Error> {
    let Some(nodeset) = ctx.kube.get_nodeset(&key.namespace, &key.name).await? else {
        debug!("NodeSet is gone");
        return Ok(());
    };
    if is_deleting(&nodeset.metadata) {
        debug!("NodeSet is being deleted");
        return Ok(());
    }

    validate_claim_templates(&nodeset)?;
    let max_unavailable = if nodeset.spec.is_rolling_update() {
        Some(nodeset.spec.max_unavailable()?)
    } else {
        None
    };

    let name = nodeset.name_any();
    let replicas = nodeset.spec.desired_replicas();
    let mut errors = Vec::new();
    let mut changed = false;

    let mut members: BTreeMap<i32, Pod> = BTreeMap::new();
    for pod in list_owned_pods(ctx, &nodeset).await? {
        if is_deleting(&pod.metadata) {
            continue;
        }
        let pod_name = pod.name_any();
        match parent_and_ordinal(&pod_name) {
            Some((parent, ordinal)) if parent == name => {
                members.insert(ordinal, pod);
            }
            _ => {
                warn!(pod = %pod_name, "Deleting pod without a valid ordinal");
                match ctx.pod_control.delete_pod(&nodeset, &pod).await {
                    Ok(()) => changed = true,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => errors.push(e),
                }
            }
        }
    }

    // scale out, lowest ordinals first
    let missing: Vec<i32> = (0..replicas)
        .filter(|ordinal| !members.contains_key(ordinal))
        .take(BURST_REPLICAS)
        .collect();
    for ordinal in missing {
        let pod = new_nodeset_pod(&nodeset, ordinal);
        match ctx.pod_control.is_pod_claims_stale(&nodeset, &pod).await {
            Ok(true) => {
                info!(pod = %pod.name_any(), "Claims still held by previous pod, waiting");
                ctx.durations.push(key.to_string(), STALE_CLAIM_REQUEUE);
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                errors.push(e);
                continue;
            }
        }
        match ctx.pod_control.create_pod(&nodeset, &pod).await {
            Ok(()) => changed = true,
            Err(e) if e.is_already_exists() => {}
            Err(e) => errors.push(e),
        }
    }

    // scale in, highest ordinals first
    for pod in members.range(replicas..).rev().map(|(_, pod)| pod) {
        let condemned = match ctx.pod_control.set_condemned(pod, true).await {
            Ok(condemned) => condemned,
            Err(e) if e.is_not_found() => continue,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };
        // claims must change hands before the pod goes away
        if let Err(e) = ctx.pod_control.update_pod(&nodeset, &condemned).await {
            errors.push(e);
            continue;
        }
        match ctx.pod_control.delete_pod(&nodeset, &condemned).await {
            Ok(()) => changed = true,
            Err(e) if e.is_not_found() => {}
            Err(e) => errors.push(e),
        }
    }

    // keep
    for pod in members.range(..replicas).map(|(_, pod)| pod) {
        let pod = if is_condemned(pod) {
            match ctx.pod_control.set_condemned(pod, false).await {
                Ok(uncordoned) => uncordoned,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            }
        } else {
            pod.clone()
        };
        if let Err(e) = ctx.pod_control.update_pod(&nodeset, &pod).await {
            errors.push(e);
        }
    }

    // roll pods built from an older template; scale-out recreates them
    if let Some(max_unavailable) = max_unavailable {
        for pod in pods_to_replace(&nodeset, &members, max_unavailable) {
            info!(pod = %pod.name_any(), "Replacing pod built from an outdated template");
            match ctx.pod_control.delete_pod(&nodeset, pod).await {
                Ok(()) => changed = true,
                Err(e) if e.is_not_found() => {}
                Err(e) => errors.push(e),
            }
        }
    }

    let pods = if changed {
        ctx.durations.push(key.to_string(), OBSERVE_REQUEUE);
        list_owned_pods(ctx, &nodeset).await?
    } else {
        members.into_values().collect()
    };
    if let Err(e) = sync_status(ctx, &nodeset, &pods).await {
        errors.push(e);
    }

    Error::aggregate(errors)
}

/// Status as observed from the NodeSet's live pods
pub fn compute_status(nodeset: &NodeSet, pods: &[Pod]) -> NodeSetStatus {
    let live: Vec<&Pod> = pods.iter().filter(|p| !is_deleting(&p.metadata)).collect();
    NodeSetStatus {
        replicas: live.len() as i32,
        ready_replicas: live.iter().filter(|p| is_pod_ready(p)).count() as i32,
        condemned_replicas: live.iter().filter(|p| is_condemned(p)).count() as i32,
        updated_replicas: live.iter().filter(|p| is_pod_updated(nodeset, p)).count() as i32,
        update_revision: update_revision(nodeset),
        observed_generation: nodeset.metadata.generation,
        selector: selector_string(nodeset),
    }
}

async fn sync_status(ctx: &Context, nodeset: &NodeSet, pods: &[Pod]) -> Result<(), Error> {
    let status = compute_status(nodeset, pods);
    if nodeset.status.as_ref() == Some(&status) {
        return Ok(());
    }
    debug!(
        replicas = status.replicas,
        ready = status.ready_replicas,
        condemned = status.condemned_replicas,
        "Updating NodeSet status"
    );
    let namespace = nodeset.namespace().unwrap_or_default();
    match ctx
        .kube
        .patch_nodeset_status(&namespace, &nodeset.name_any(), &status)
        .await
    {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
