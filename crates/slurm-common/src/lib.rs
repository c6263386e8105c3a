//! Common types for the Slurm operator: CRDs, errors, events and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod duration_store;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use duration_store::DurationStore;
pub use error::Error;
pub use kube_utils::NamespacedName;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all operator CRDs
pub const API_GROUP: &str = "slinky.slurm.net";

/// API version for all operator CRDs
pub const API_VERSION: &str = "v1alpha1";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "slurm-operator";

/// Annotation marking a NodeSet pod as condemned (being scaled in)
pub const ANNOTATION_POD_CORDON: &str = "nodeset.slinky.slurm.net/pod-cordon";

/// Label carrying the pod name of a NodeSet pod
pub const LABEL_POD_NAME: &str = "nodeset.slinky.slurm.net/pod-name";

/// Label carrying the ordinal of a NodeSet pod
pub const LABEL_POD_INDEX: &str = "nodeset.slinky.slurm.net/pod-index";

/// Secret data key holding the Slurm JWT
pub const AUTH_TOKEN_KEY: &str = "auth-token";
