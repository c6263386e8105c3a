//! NodeSet: an ordinally indexed set of Slurm worker pods
//!
//! Pods are named `{nodeset}-{ordinal}`. Each pod gets one claim per volume
//! claim template, named `{template}-{nodeset}-{ordinal}`, and the retention
//! policy decides which of the NodeSet or the pod owns those claims.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::kube_utils::Gvk;

/// Owner reference target kind for NodeSets
pub const NODESET_GVK: Gvk = Gvk {
    api_version: "slinky.slurm.net/v1alpha1",
    kind: "NodeSet",
};

/// Specification for a NodeSet
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "slinky.slurm.net",
    version = "v1alpha1",
    kind = "NodeSet",
    plural = "nodesets",
    shortname = "nss",
    namespaced,
    status = "NodeSetStatus",
    scale = r#"{"specReplicasPath":".spec.replicas","statusReplicasPath":".status.replicas","labelSelectorPath":".status.selector"}"#,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetSpec {
    /// Name of the Cluster these workers join
    pub cluster_name: String,

    /// Desired number of worker pods (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Label query over pods; defaults to the template labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Headless service governing pod DNS
    #[serde(default)]
    pub service_name: String,

    /// Template every worker pod is built from
    pub template: PodTemplateSpec,

    /// Claims every pod gets, mounted as volumes of the same name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,

    /// How pods are replaced when the template changes
    #[serde(default)]
    pub update_strategy: NodeSetUpdateStrategy,

    /// What happens to claims on scale-in and NodeSet deletion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_retention_policy: Option<PersistentVolumeClaimRetentionPolicy>,
}

/// Replacement of pods built from an older template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetUpdateStrategy {
    /// RollingUpdate (default) or OnDelete
    #[serde(default, rename = "type")]
    pub type_: UpdateStrategyType,

    /// Parameters for RollingUpdate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdateNodeSetStrategy>,
}

/// How outdated pods are replaced
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpdateStrategyType {
    /// Delete outdated pods a few at a time so they are recreated
    #[default]
    RollingUpdate,
    /// Outdated pods are only replaced once something else deletes them
    OnDelete,
}

/// Parameters for a rolling update
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateNodeSetStrategy {
    /// Most pods unavailable during the update, as a count or a percentage
    /// of the desired replicas rounded up. Defaults to 1; never below 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,

    /// Ordinals below this value keep their current template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
}

/// Claim retention on scale-in and NodeSet deletion
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimRetentionPolicy {
    /// Applied when the NodeSet is deleted
    #[serde(default)]
    pub when_deleted: RetentionPolicyType,

    /// Applied when a pod is removed by scale-in
    #[serde(default)]
    pub when_scaled: RetentionPolicyType,
}

/// Retain or delete a claim
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RetentionPolicyType {
    /// Keep the claim
    #[default]
    Retain,
    /// Garbage collect the claim with its owner
    Delete,
    /// Any value this version does not understand; treated as Retain
    #[serde(other)]
    #[schemars(skip)]
    Unknown,
}

/// Observed state of a NodeSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetStatus {
    /// Pods currently owned by the NodeSet
    #[serde(default)]
    pub replicas: i32,

    /// Owned pods that are Running and Ready
    #[serde(default)]
    pub ready_replicas: i32,

    /// Owned pods marked for scale-in
    #[serde(default)]
    pub condemned_replicas: i32,

    /// Generation the status was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Owned pods built from the current template
    #[serde(default)]
    pub updated_replicas: i32,

    /// Hash of the current template, as found on up-to-date pods
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub update_revision: String,

    /// Label selector in string form, for the scale subresource
    #[serde(default)]
    pub selector: String,
}

impl NodeSetSpec {
    /// Desired replica count
    pub fn desired_replicas(&self) -> i32 {
        self.replicas.unwrap_or(1).max(0)
    }

    /// True unless the update strategy is OnDelete
    pub fn is_rolling_update(&self) -> bool {
        self.update_strategy.type_ == UpdateStrategyType::RollingUpdate
    }

    /// Ordinals below the partition are not rolled
    pub fn partition(&self) -> i32 {
        self.update_strategy
            .rolling_update
            .as_ref()
            .and_then(|r| r.partition)
            .unwrap_or(0)
            .max(0)
    }

    /// Resolve maxUnavailable against the desired replica count.
    ///
    /// Percentages round up. The result is at least 1 so an update can
    /// always make progress.
    pub fn max_unavailable(&self) -> Result<i32, Error> {
        let value = self
            .update_strategy
            .rolling_update
            .as_ref()
            .and_then(|r| r.max_unavailable.as_ref());
        let resolved = match value {
            None => 1,
            Some(IntOrString::Int(n)) => *n,
            Some(IntOrString::String(text)) => {
                let invalid = || {
                    Error::validation_for_field(
                        "NodeSet",
                        "spec.updateStrategy.rollingUpdate.maxUnavailable",
                        format!("maxUnavailable {text:?} is neither an integer nor a percentage"),
                    )
                };
                match text.strip_suffix('%') {
                    Some(percent) => {
                        let percent: i64 = percent.parse().map_err(|_| invalid())?;
                        let replicas = i64::from(self.desired_replicas());
                        ((percent * replicas + 99) / 100).clamp(0, i64::from(i32::MAX)) as i32
                    }
                    None => text.parse().map_err(|_| invalid())?,
                }
            }
        };
        Ok(resolved.max(1))
    }
}

impl NodeSet {
    /// Effective retention policy; Retain/Retain when unset
    pub fn retention_policy(&self) -> PersistentVolumeClaimRetentionPolicy {
        self.spec
            .persistent_volume_claim_retention_policy
            .unwrap_or_default()
    }
}
