//! Claim ownership under the NodeSet retention policy
//!
//! Expected controller references per policy:
//!
//! | whenDeleted | whenScaled | NodeSet ref        | Pod ref        |
//! |-------------|------------|--------------------|----------------|
//! | Retain      | Retain     | no                 | no             |
//! | Delete      | Retain     | yes                | no             |
//! | Retain      | Delete     | no                 | iff condemned  |
//! | Delete      | Delete     | iff not condemned  | iff condemned  |
//!
//! Two kinds of reference are never corrected:
//! - Stale references, which name the NodeSet or pod but carry an old UID.
//!   The garbage collector owns those claims.
//! - Controllers other than the NodeSet or pod. The claim is left to them,
//!   after our own references are scrubbed.
//!
//! Identity matching (apiVersion, kind, name) ignores the UID. Ownership
//! checks compare UIDs only.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tracing::warn;

use slurm_common::crd::{NodeSet, RetentionPolicyType, NODESET_GVK};
use slurm_common::kube_utils::{controller_ref, matches_ref, uid_of, Gvk, POD_GVK};

use crate::identity::is_condemned;

/// Which of the NodeSet and pod should control a claim
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Expected {
    nodeset: bool,
    pod: bool,
}

fn owner_refs(claim: &PersistentVolumeClaim) -> &[OwnerReference] {
    claim.metadata.owner_references.as_deref().unwrap_or_default()
}

/// Expected ownership for the NodeSet's policy; unknown values act as Retain/Retain
fn expected_owners(nodeset: &NodeSet, pod: &Pod) -> Expected {
    use RetentionPolicyType::{Delete, Retain};

    let policy = nodeset.retention_policy();
    let condemned = is_condemned(pod);
    match (policy.when_deleted, policy.when_scaled) {
        (Retain, Retain) => Expected {
            nodeset: false,
            pod: false,
        },
        (Delete, Retain) => Expected {
            nodeset: true,
            pod: false,
        },
        (Retain, Delete) => Expected {
            nodeset: false,
            pod: condemned,
        },
        (Delete, Delete) => Expected {
            nodeset: !condemned,
            pod: condemned,
        },
        (when_deleted, when_scaled) => {
            warn!(
                nodeset = %nodeset.metadata.name.as_deref().unwrap_or_default(),
                ?when_deleted,
                ?when_scaled,
                "Unknown claim retention policy, treating as Retain"
            );
            Expected {
                nodeset: false,
                pod: false,
            }
        }
    }
}

/// True if `claim` has any owner reference with the UID of `owner`
pub fn has_owner_ref(claim: &PersistentVolumeClaim, owner: &ObjectMeta) -> bool {
    let uid = uid_of(owner);
    owner_refs(claim).iter().any(|r| r.uid == uid)
}

/// True if the first reference naming `owner` carries a different UID
pub fn has_stale_owner_ref(claim: &PersistentVolumeClaim, owner: &ObjectMeta, gvk: Gvk) -> bool {
    owner_refs(claim)
        .iter()
        .find(|r| matches_ref(r, owner, gvk))
        .is_some_and(|r| r.uid != uid_of(owner))
}

/// True if the NodeSet or pod owns the claim without being its controller
pub fn has_non_controller_owner(claim: &PersistentVolumeClaim, nodeset: &NodeSet, pod: &Pod) -> bool {
    let nodeset_uid = uid_of(&nodeset.metadata);
    let pod_uid = uid_of(&pod.metadata);
    owner_refs(claim)
        .iter()
        .filter(|r| r.uid == nodeset_uid || r.uid == pod_uid)
        .any(|r| r.controller != Some(true))
}

/// True if something other than the NodeSet or pod controls the claim.
///
/// A Retain/Retain policy (including an absent one) tolerates any
/// controller. A reference naming the NodeSet or pod with a foreign UID also
/// counts, since it means the claim was orphaned from an earlier incarnation.
pub fn has_unexpected_controller(claim: &PersistentVolumeClaim, nodeset: &NodeSet, pod: &Pod) -> bool {
    let policy = nodeset.retention_policy();
    if policy.when_scaled == RetentionPolicyType::Retain
        && policy.when_deleted == RetentionPolicyType::Retain
    {
        return false;
    }

    let nodeset_uid = uid_of(&nodeset.metadata);
    let pod_uid = uid_of(&pod.metadata);
    owner_refs(claim).iter().any(|r| {
        if matches_ref(r, &nodeset.metadata, NODESET_GVK) {
            return r.uid != nodeset_uid;
        }
        if matches_ref(r, &pod.metadata, POD_GVK) {
            return r.uid != pod_uid;
        }
        r.controller == Some(true)
    })
}

/// True if the claim's references already agree with the retention policy.
///
/// Claims with stale references, and claims left cleanly to a foreign
/// controller, report true so they are never written.
pub fn is_owner_up_to_date(claim: &PersistentVolumeClaim, nodeset: &NodeSet, pod: &Pod) -> bool {
    if has_stale_owner_ref(claim, &nodeset.metadata, NODESET_GVK)
        || has_stale_owner_ref(claim, &pod.metadata, POD_GVK)
    {
        return true;
    }

    let owned_by_nodeset = has_owner_ref(claim, &nodeset.metadata);
    let owned_by_pod = has_owner_ref(claim, &pod.metadata);

    if has_unexpected_controller(claim, nodeset, pod) {
        return !(owned_by_nodeset || owned_by_pod);
    }

    if has_non_controller_owner(claim, nodeset, pod) {
        return false;
    }

    let expected = expected_owners(nodeset, pod);
    expected.nodeset == owned_by_nodeset && expected.pod == owned_by_pod
}

fn add_controller_ref(refs: &mut Vec<OwnerReference>, owner: &ObjectMeta, gvk: Gvk) {
    let uid = uid_of(owner);
    if refs.iter().any(|r| r.uid == uid) {
        return;
    }
    refs.push(controller_ref(gvk, owner));
}

/// Owner references the claim should carry under the retention policy.
///
/// References naming the NodeSet or pod are dropped and re-added as
/// controllers where the policy asks for them. Everything else is kept
/// as-is. With an unexpected controller present nothing is re-added.
pub fn corrected_owner_refs(
    claim: &PersistentVolumeClaim,
    nodeset: &NodeSet,
    pod: &Pod,
) -> Vec<OwnerReference> {
    let unexpected = has_unexpected_controller(claim, nodeset, pod);

    let mut refs: Vec<OwnerReference> = owner_refs(claim)
        .iter()
        .filter(|r| {
            !matches_ref(r, &nodeset.metadata, NODESET_GVK) && !matches_ref(r, &pod.metadata, POD_GVK)
        })
        .cloned()
        .collect();

    if unexpected {
        return refs;
    }

    let expected = expected_owners(nodeset, pod);
    if expected.pod {
        add_controller_ref(&mut refs, &pod.metadata, POD_GVK);
    }
    if expected.nodeset {
        add_controller_ref(&mut refs, &nodeset.metadata, NODESET_GVK);
    }
    refs
}

/// Clone of `claim` carrying the corrected owner references
pub fn with_corrected_owner_refs(
    claim: &PersistentVolumeClaim,
    nodeset: &NodeSet,
    pod: &Pod,
) -> PersistentVolumeClaim {
    let mut updated = claim.clone();
    let refs = corrected_owner_refs(claim, nodeset, pod);
    updated.metadata.owner_references = if refs.is_empty() { None } else { Some(refs) };
    updated
}
