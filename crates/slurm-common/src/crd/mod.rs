//! Custom Resource Definitions for the Slurm operator
//!
//! Both kinds live in the `slinky.slurm.net/v1alpha1` API group.

mod cluster;
mod nodeset;

pub use cluster::{Cluster, ClusterSpec, ClusterStatus, ClusterToken};
pub use nodeset::{
    NodeSet, NodeSetSpec, NodeSetStatus, NodeSetUpdateStrategy, PersistentVolumeClaimRetentionPolicy,
    RetentionPolicyType, RollingUpdateNodeSetStrategy, UpdateStrategyType, NODESET_GVK,
};
