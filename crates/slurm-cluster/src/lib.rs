//! Cluster controller for the Slurm operator
//!
//! A Cluster names one slurmrestd endpoint and the secret holding its JWT.
//! The controller keeps a live REST client per Cluster in a shared
//! [`ClusterRegistry`] and reports whether the Slurm controller is up.

pub mod controller;
pub mod registry;
pub mod slurm_client;

#[cfg(test)]
mod fake;

pub use controller::{clusters_for_secret, error_policy, reconcile, Context, ContextBuilder, KubeClient, KubeClientImpl};
pub use registry::ClusterRegistry;
pub use slurm_client::{
    PingResult, RestClientFactory, RestSlurmClient, SlurmClient, SlurmClientConfig, SlurmClientFactory,
};

pub use slurm_common::{Error, Result};
