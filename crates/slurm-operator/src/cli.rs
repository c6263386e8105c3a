use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use slurm_cluster::SlurmClientConfig;

/// Slurm operator - manages Slurm NodeSets and Cluster connections
#[derive(Parser, Debug)]
#[command(name = "slurm-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Controller tuning, read for every mode
    #[command(flatten)]
    pub controller: ControllerArgs,

    /// Subcommand; runs the controllers when omitted
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Operator modes
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the NodeSet and Cluster controllers (default mode)
    Controller,
}

/// Tuning for the controllers
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Concurrent NodeSet reconciles
    #[arg(long, global = true, env = "SLURM_OPERATOR_NODESET_WORKERS", default_value_t = 4)]
    pub nodeset_workers: u16,

    /// Concurrent Cluster reconciles
    #[arg(long, global = true, env = "SLURM_OPERATOR_CLUSTER_WORKERS", default_value_t = 2)]
    pub cluster_workers: u16,

    /// Seconds between background pings of each Slurm cluster
    #[arg(long, global = true, env = "SLURM_OPERATOR_SLURM_REFRESH_INTERVAL", default_value = "30", value_parser = parse_seconds)]
    pub slurm_refresh_interval: Duration,

    /// Timeout in seconds for a single Slurm REST request
    #[arg(long, global = true, env = "SLURM_OPERATOR_SLURM_REQUEST_TIMEOUT", default_value = "10", value_parser = parse_seconds)]
    pub slurm_request_timeout: Duration,
}

impl ControllerArgs {
    /// Slurm client tuning taken from the flags
    pub fn slurm_client_config(&self) -> SlurmClientConfig {
        SlurmClientConfig {
            refresh_interval: self.slurm_refresh_interval,
            request_timeout: self.slurm_request_timeout,
        }
    }
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: u64 = value
        .parse()
        .map_err(|e| format!("expected whole seconds: {e}"))?;
    if secs == 0 {
        return Err("must be at least one second".to_string());
    }
    Ok(Duration::from_secs(secs))
}
