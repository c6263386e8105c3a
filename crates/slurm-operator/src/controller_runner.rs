//! Controller runner - builds one controller future per resource kind
//!
//! Each `build_*` function returns a boxed future so the binary can run them
//! side by side and stop when any of them finishes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use slurm_cluster::{clusters_for_secret, ClusterRegistry, RestClientFactory, SlurmClientConfig};
use slurm_common::crd::{Cluster, NodeSet};

/// A controller future ready to be awaited
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the NodeSet controller, re-reconciling on changes to owned pods
pub fn build_nodeset_controller(client: Client, workers: u16) -> ControllerFuture {
    let ctx = Arc::new(slurm_nodeset::Context::builder(client.clone()).build());
    let nodesets: Api<NodeSet> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client);

    tracing::info!(workers, "- NodeSet controller");

    Box::pin(
        Controller::new(nodesets, watcher_config())
            .owns(pods, watcher_config())
            .with_config(ControllerConfig::default().concurrency(workers))
            .shutdown_on_signal()
            .run(slurm_nodeset::reconcile, slurm_nodeset::error_policy, ctx)
            .for_each(log_reconcile_result("NodeSet")),
    )
}

/// Build the Cluster controller, re-reconciling when a token secret changes
pub fn build_cluster_controller(
    client: Client,
    workers: u16,
    registry: Arc<ClusterRegistry>,
    slurm: SlurmClientConfig,
) -> ControllerFuture {
    let ctx = Arc::new(
        slurm_cluster::Context::builder(client.clone())
            .registry(registry)
            .factory(Arc::new(RestClientFactory::new(slurm)))
            .build(),
    );
    let clusters: Api<Cluster> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client);

    tracing::info!(workers, "- Cluster controller");

    let controller = Controller::new(clusters, watcher_config());
    let store = controller.store();
    Box::pin(
        controller
            .watches(secrets, watcher_config(), move |secret| {
                let affected = clusters_for_secret(store.state(), &secret);
                if !affected.is_empty() {
                    tracing::debug!(
                        secret = %secret.metadata.name.as_deref().unwrap_or_default(),
                        affected_count = affected.len(),
                        "Token secret changed, triggering re-reconciliation of clusters"
                    );
                }
                affected
            })
            .with_config(ControllerConfig::default().concurrency(workers))
            .shutdown_on_signal()
            .run(slurm_cluster::reconcile, slurm_cluster::error_policy, ctx)
            .for_each(log_reconcile_result("Cluster")),
    )
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
