//! NodeSet controller for the Slurm operator
//!
//! A NodeSet runs a fixed number of ordinally named `slurmd` pods, each with
//! its own persistent volume claims. This crate provides the reconciler and
//! the pod and claim lifecycle behind it.
//!
//! Related crates:
//! - `slurm-common`: CRDs, errors, events and retry helpers
//! - `slurm-cluster`: Cluster controller and Slurm client registry

pub mod claims;
pub mod client;
pub mod controller;
pub mod identity;
pub mod ownership;
pub mod pod_control;
pub mod update;

#[cfg(test)]
mod fake;

pub use claims::ClaimControl;
pub use client::{KubeClient, KubeClientImpl};
pub use controller::{error_policy, reconcile, Context, ContextBuilder};
pub use pod_control::PodControl;

pub use slurm_common::{Error, Result};
