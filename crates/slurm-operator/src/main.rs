//! Slurm Operator - Kubernetes controllers for Slurm NodeSets and Clusters

use std::sync::Arc;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use slurm_cluster::ClusterRegistry;
use slurm_common::crd::{Cluster, NodeSet};
use slurm_common::telemetry::{init_telemetry, TelemetryConfig};
use slurm_common::FIELD_MANAGER;
use slurm_operator::cli::{Cli, Commands, ControllerArgs};
use slurm_operator::controller_runner::{build_cluster_controller, build_nodeset_controller};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let nodeset = serde_yaml::to_string(&NodeSet::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize NodeSet CRD: {}", e))?;
        let cluster = serde_yaml::to_string(&Cluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Cluster CRD: {}", e))?;
        println!("{nodeset}---\n{cluster}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.controller).await,
    }
}

/// Ensure the operator's CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply.
/// This ensures the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [NodeSet::crd(), Cluster::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD...");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    tracing::info!("All Slurm operator CRDs installed/updated");
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let registry = Arc::new(ClusterRegistry::new());

    tracing::info!("Starting Slurm operator controllers...");
    let nodesets = build_nodeset_controller(client.clone(), args.nodeset_workers);
    let clusters = build_cluster_controller(
        client,
        args.cluster_workers,
        registry.clone(),
        args.slurm_client_config(),
    );

    tokio::select! {
        _ = nodesets => {
            tracing::info!("NodeSet controller completed");
        }
        _ = clusters => {
            tracing::info!("Cluster controller completed");
        }
    }

    tracing::info!(clients = registry.len(), "Slurm operator shutting down");
    Ok(())
}
