//! Cluster: one remote Slurm REST endpoint and its credentials

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Specification for a Cluster
///
/// The operator keeps a live REST client for every Cluster whose token
/// secret resolves, and reports whether the Slurm controller answers pings.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "slinky.slurm.net",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    namespaced,
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Server","type":"string","jsonPath":".spec.server"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.isReady"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Base URL of slurmrestd (e.g. "http://slurm-restapi.slurm:6820")
    pub server: String,

    /// Where to find the JWT used against slurmrestd
    pub token: ClusterToken,
}

/// Reference to the secret holding the Slurm JWT
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterToken {
    /// Name of a Secret in the Cluster's namespace with an `auth-token` key
    pub secret_ref: String,
}

/// Observed state of a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// True when at least one Slurm controller answered a ping with UP
    #[serde(default)]
    pub is_ready: bool,
}

impl ClusterSpec {
    /// Reject specs the controller cannot act on
    pub fn validate(&self, resource: &str) -> Result<(), Error> {
        if self.server.trim().is_empty() {
            return Err(Error::validation_for_field(
                resource,
                "spec.server",
                "`Cluster.Spec.Server` cannot be empty",
            ));
        }
        if self.token.secret_ref.trim().is_empty() {
            return Err(Error::validation_for_field(
                resource,
                "spec.token.secretRef",
                "`Cluster.Spec.Token.SecretRef` cannot be empty",
            ));
        }
        Ok(())
    }
}

impl Cluster {
    /// Readiness recorded in status, false when status is absent
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.is_ready)
    }
}
