//! Cluster reconciliation
//!
//! Keeps one live Slurm client per Cluster in the shared registry, built
//! from `spec.server` and the token secret, and records in status whether
//! any Slurm controller answers pings.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use slurm_common::crd::{Cluster, ClusterStatus};
use slurm_common::events::{actions, reasons, EventPublisher, KubeEventPublisher, CLUSTER_REPORTER};
use slurm_common::kube_utils::is_deleting;
use slurm_common::retry::{retry_on_conflict, RetryConfig};
use slurm_common::{metrics, DurationStore, Error, NamespacedName, AUTH_TOKEN_KEY, FIELD_MANAGER};

use crate::registry::ClusterRegistry;
use crate::slurm_client::{PingResult, RestClientFactory, SlurmClientFactory};

/// Delay before looking for a token secret that does not exist yet
pub const SECRET_REQUEUE: Duration = Duration::from_secs(10);

/// Delay before pinging a cluster that is not ready again
pub const READY_REQUEUE: Duration = Duration::from_secs(30);

/// Requeue for errors that need a spec change
const PERMANENT_ERROR_REQUEUE: Duration = Duration::from_secs(300);

/// Requeue for errors that may clear on their own
const RETRYABLE_ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Trait abstracting Kubernetes client operations for Clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a Cluster
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, Error>;

    /// Fetch a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Write the status of `cluster`, conflicting if its resourceVersion is stale
    async fn patch_cluster_status(&self, cluster: &Cluster, status: &ClusterStatus) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, Error> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_cluster_status(&self, cluster: &Cluster, status: &ClusterStatus) -> Result<(), Error> {
        let name = cluster.name_any();
        let api: Api<Cluster> =
            Api::namespaced(self.client.clone(), &cluster.namespace().unwrap_or_default());
        // carrying resourceVersion makes the merge patch conditional
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": cluster.resource_version() },
            "status": status,
        });
        api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube("Cluster", &name, e))?;
        Ok(())
    }
}

/// Shared context for the Cluster controller
///
/// Use [`Context::builder`] to construct instances.
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Live Slurm clients, shared with anything that talks to slurmrestd
    pub registry: Arc<ClusterRegistry>,
    /// Builds Slurm clients for new or changed Clusters
    pub factory: Arc<dyn SlurmClientFactory>,
    /// Event sink for Cluster events
    pub events: Arc<dyn EventPublisher>,
    /// Requeue delays requested during a reconcile, keyed by Cluster
    pub durations: DurationStore,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context over test doubles
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        factory: Arc<dyn SlurmClientFactory>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            registry: Arc::new(ClusterRegistry::new()),
            factory,
            events,
            durations: DurationStore::new(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    registry: Option<Arc<ClusterRegistry>>,
    factory: Option<Arc<dyn SlurmClientFactory>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            registry: None,
            factory: None,
            events: None,
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Share an existing registry instead of creating one
    pub fn registry(mut self, registry: Arc<ClusterRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the Slurm client factory
    pub fn factory(mut self, factory: Arc<dyn SlurmClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            registry: self.registry.unwrap_or_default(),
            factory: self
                .factory
                .unwrap_or_else(|| Arc::new(RestClientFactory::default())),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CLUSTER_REPORTER))
            }),
            durations: DurationStore::new(),
        }
    }
}

/// Reconcile a Cluster
///
/// Requeue delays pushed during the sync are drained here, whether or not
/// the sync succeeded.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let started = Instant::now();
    let id = NamespacedName::of(cluster.as_ref());

    let result = sync(&id, &ctx).await;
    let requeue = ctx.durations.pop(&id.to_string());
    metrics::record_reconcile("cluster", started.elapsed(), result.as_ref().err());
    result?;

    if requeue.is_zero() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(requeue))
    }
}

/// Error policy for the Cluster controller
pub fn error_policy(cluster: Arc<Cluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(RETRYABLE_ERROR_REQUEUE)
    } else {
        Action::requeue(PERMANENT_ERROR_REQUEUE)
    }
}

/// Clusters in the Secret's namespace whose token references it
pub fn clusters_for_secret(
    clusters: impl IntoIterator<Item = Arc<Cluster>>,
    secret: &Secret,
) -> Vec<ObjectRef<Cluster>> {
    let namespace = secret.namespace();
    let name = secret.name_any();
    clusters
        .into_iter()
        .filter(|c| c.namespace() == namespace && c.spec.token.secret_ref == name)
        .map(|c| ObjectRef::from_obj(c.as_ref()))
        .collect()
}

async fn sync(id: &NamespacedName, ctx: &Context) -> Result<(), Error> {
    let Some(cluster) = ctx.kube.get_cluster(&id.namespace, &id.name).await? else {
        info!("Cluster has been deleted");
        remove_client(ctx, id);
        return Ok(());
    };

    let mut errors = Vec::new();
    if let Err(e) = sync_client(ctx, id, &cluster).await {
        errors.push(e);
    }
    if let Err(e) = sync_status(ctx, id, &cluster).await {
        errors.push(e);
    }
    Error::aggregate(errors)
}

fn remove_client(ctx: &Context, id: &NamespacedName) {
    if ctx.registry.remove(id) {
        info!(cluster = %id, "Removed Slurm cluster client");
    }
}

fn auth_token(secret: &Secret) -> String {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(AUTH_TOKEN_KEY))
        .map(|token| String::from_utf8_lossy(&token.0).into_owned())
        .unwrap_or_default()
}

/// Make the registry entry for the Cluster match its spec and token
async fn sync_client(ctx: &Context, id: &NamespacedName, cluster: &Cluster) -> Result<(), Error> {
    if is_deleting(&cluster.metadata) {
        remove_client(ctx, id);
        return Ok(());
    }

    if let Err(e) = cluster.spec.validate(&id.to_string()) {
        ctx.events
            .publish(
                &cluster.object_ref(&()),
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::RECONCILE,
                Some(e.to_string()),
            )
            .await;
        remove_client(ctx, id);
        return Err(e);
    }

    let secret_name = &cluster.spec.token.secret_ref;
    let Some(secret) = ctx.kube.get_secret(&id.namespace, secret_name).await? else {
        info!(secret = %secret_name, "Secret not found, retry later");
        ctx.durations.push(id.to_string(), SECRET_REQUEUE);
        remove_client(ctx, id);
        return Ok(());
    };
    let token = auth_token(&secret);
    let server = cluster.spec.server.trim_end_matches('/');

    if let Some(existing) = ctx.registry.get(id) {
        if existing.server() == server && existing.token() == token {
            return Ok(());
        }
    }

    let client = match ctx.factory.create(server, &token) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, server = %server, "Failed to create Slurm client");
            return Ok(());
        }
    };
    if ctx.registry.add(id.clone(), client) {
        info!(cluster = %id, server = %server, "Added Slurm cluster client");
        ctx.events
            .publish(
                &cluster.object_ref(&()),
                EventType::Normal,
                reasons::CLIENT_UPDATED,
                actions::UPDATE,
                Some(format!("Slurm client for {server} registered")),
            )
            .await;
    }
    Ok(())
}

/// Ping the cluster and record readiness in status
async fn sync_status(ctx: &Context, id: &NamespacedName, cluster: &Cluster) -> Result<(), Error> {
    let mut errors = Vec::new();

    let is_ready = match ctx.registry.get(id) {
        None => {
            debug!("No Slurm client for cluster, cannot ping");
            false
        }
        Some(client) => match client.list_pings().await {
            Ok(pings) => pings.iter().any(PingResult::is_up),
            Err(e) => {
                warn!(error = %e, "Unable to ping cluster");
                errors.push(e);
                false
            }
        },
    };

    if cluster.is_ready() != is_ready {
        if let Err(e) = update_status(ctx, id, is_ready).await {
            errors.push(e);
        }
    }

    if !is_ready {
        ctx.durations.push(id.to_string(), READY_REQUEUE);
    }

    Error::aggregate(errors)
}

async fn update_status(ctx: &Context, id: &NamespacedName, is_ready: bool) -> Result<(), Error> {
    debug!(is_ready, "Pending Cluster status update");
    retry_on_conflict(&RetryConfig::conflict(), "update_cluster_status", || async move {
        let Some(fresh) = ctx.kube.get_cluster(&id.namespace, &id.name).await? else {
            return Ok(());
        };
        match ctx
            .kube
            .patch_cluster_status(&fresh, &ClusterStatus { is_ready })
            .await
        {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    })
    .await
}
