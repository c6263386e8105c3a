//! Slurm operator binary support: command line and controller wiring

#![deny(missing_docs)]

/// Command line and environment configuration
pub mod cli;
/// Builds the NodeSet and Cluster controller futures
pub mod controller_runner;
