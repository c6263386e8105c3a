//! Pod identity and storage layout for NodeSet members
//!
//! A member pod is `{nodeset}-{ordinal}` in the NodeSet's namespace, labelled
//! with its name and ordinal. Every volume claim template yields one claim per
//! pod, mounted as a volume named after the template. Pods also record a
//! hash of the template they were built from.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod, PodTemplateSpec, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use slurm_common::crd::{NodeSet, NODESET_GVK};
use slurm_common::kube_utils::controller_ref;
use slurm_common::{Error, ANNOTATION_POD_CORDON, LABEL_POD_INDEX, LABEL_POD_NAME};

/// Label selecting every pod of one NodeSet when the spec has no selector
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
/// Component label applied to worker pods and claims
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
/// Hash of the pod template a member pod was built from
pub const LABEL_REVISION_HASH: &str = "controller-revision-hash";
const WORKER_COMPONENT: &str = "slurmd";
const REVISION_HASH_LEN: usize = 10;

/// Split `name` into its parent name and ordinal (`compute-3` -> `compute`, 3)
pub fn parent_and_ordinal(name: &str) -> Option<(&str, i32)> {
    let (parent, suffix) = name.rsplit_once('-')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok().map(|ordinal| (parent, ordinal))
}

/// Ordinal of a member pod, if its name carries one
pub fn ordinal(pod: &Pod) -> Option<i32> {
    parent_and_ordinal(pod.metadata.name.as_deref().unwrap_or_default()).map(|(_, o)| o)
}

/// `{nodeset}-{ordinal}`
pub fn pod_name(nodeset: &NodeSet, ordinal: i32) -> String {
    format!("{}-{}", nodeset.name_any(), ordinal)
}

/// `{template}-{nodeset}-{ordinal}`
pub fn claim_name(nodeset: &NodeSet, template: &PersistentVolumeClaim, ordinal: i32) -> String {
    format!("{}-{}-{}", template.name_any(), nodeset.name_any(), ordinal)
}

/// True if the pod carries the cordon annotation set to `"true"`
pub fn is_condemned(pod: &Pod) -> bool {
    pod.annotations()
        .get(ANNOTATION_POD_CORDON)
        .is_some_and(|v| v == "true")
}

/// Set or clear the cordon annotation
pub fn set_condemned(pod: &mut Pod, condemned: bool) {
    let annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
    if condemned {
        annotations.insert(ANNOTATION_POD_CORDON.to_string(), "true".to_string());
    } else {
        annotations.remove(ANNOTATION_POD_CORDON);
    }
}

/// Short stable hash of a pod template
pub fn template_revision(template: &PodTemplateSpec) -> String {
    // PodTemplateSpec always serializes; maps are ordered so output is stable
    let bytes = serde_json::to_vec(template).unwrap_or_default();
    let mut hash = hex::encode(Sha256::digest(&bytes));
    hash.truncate(REVISION_HASH_LEN);
    hash
}

/// Revision pods of this NodeSet are currently built at
pub fn update_revision(nodeset: &NodeSet) -> String {
    template_revision(&nodeset.spec.template)
}

/// Revision recorded on the pod, if any
pub fn pod_revision(pod: &Pod) -> Option<&str> {
    pod.labels().get(LABEL_REVISION_HASH).map(String::as_str)
}

/// Reject volume claim templates that would map onto the same volume.
///
/// Claims and volumes are keyed by template name, so a duplicate would
/// silently drop all but the last template.
pub fn validate_claim_templates(nodeset: &NodeSet) -> Result<(), Error> {
    let mut seen = BTreeSet::new();
    for (index, template) in nodeset.spec.volume_claim_templates.iter().enumerate() {
        let name = template.name_any();
        if name.is_empty() {
            return Err(Error::validation_for_field(
                format!("NodeSet {}", nodeset.name_any()),
                format!("spec.volumeClaimTemplates[{index}].metadata.name"),
                format!("volumeClaimTemplates[{index}] has no name"),
            ));
        }
        if !seen.insert(name.clone()) {
            return Err(Error::validation_for_field(
                format!("NodeSet {}", nodeset.name_any()),
                format!("spec.volumeClaimTemplates[{index}].metadata.name"),
                format!("volumeClaimTemplates name {name:?} is used more than once"),
            ));
        }
    }
    Ok(())
}

/// Labels identifying the NodeSet's pods and claims
pub fn selector_labels(nodeset: &NodeSet) -> BTreeMap<String, String> {
    if let Some(labels) = nodeset
        .spec
        .selector
        .as_ref()
        .and_then(|s| s.match_labels.clone())
        .filter(|labels| !labels.is_empty())
    {
        return labels;
    }
    BTreeMap::from([
        (LABEL_NAME.to_string(), WORKER_COMPONENT.to_string()),
        (LABEL_INSTANCE.to_string(), nodeset.name_any()),
    ])
}

/// True if name, namespace and name label agree with the pod's ordinal slot
pub fn is_identity_match(nodeset: &NodeSet, pod: &Pod) -> bool {
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let Some((parent, ordinal)) = parent_and_ordinal(name) else {
        return false;
    };
    ordinal >= 0
        && parent == nodeset.name_any()
        && name == pod_name(nodeset, ordinal)
        && pod.metadata.namespace == nodeset.metadata.namespace
        && pod.labels().get(LABEL_POD_NAME).map(String::as_str) == Some(name)
}

/// Rewrite name, namespace and identity labels from the pod's ordinal
pub fn update_identity(nodeset: &NodeSet, pod: &mut Pod, ordinal: i32) {
    let name = pod_name(nodeset, ordinal);
    pod.metadata.namespace = nodeset.metadata.namespace.clone();
    let labels = pod.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(LABEL_POD_NAME.to_string(), name.clone());
    labels.insert(LABEL_POD_INDEX.to_string(), ordinal.to_string());
    pod.metadata.name = Some(name);
}

/// Claims the pod should own, keyed by template name
pub fn claims_for_pod(nodeset: &NodeSet, ordinal: i32) -> BTreeMap<String, PersistentVolumeClaim> {
    let selector = selector_labels(nodeset);
    nodeset
        .spec
        .volume_claim_templates
        .iter()
        .map(|template| {
            let mut claim = template.clone();
            claim.metadata.name = Some(claim_name(nodeset, template, ordinal));
            claim.metadata.namespace = nodeset.metadata.namespace.clone();
            claim
                .metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .extend(selector.clone());
            (template.name_any(), claim)
        })
        .collect()
}

/// True if every template is mounted from the claim with the expected name
pub fn is_storage_match(nodeset: &NodeSet, pod: &Pod) -> bool {
    let Some(ordinal) = ordinal(pod) else {
        return false;
    };
    let volumes: BTreeMap<&str, &Volume> = pod
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|vs| vs.iter().map(|v| (v.name.as_str(), v)).collect())
        .unwrap_or_default();

    nodeset.spec.volume_claim_templates.iter().all(|template| {
        volumes
            .get(template.name_any().as_str())
            .and_then(|v| v.persistent_volume_claim.as_ref())
            .is_some_and(|pvc| pvc.claim_name == claim_name(nodeset, template, ordinal))
    })
}

/// Replace template volumes with claim-backed ones; other volumes are kept
pub fn update_storage(nodeset: &NodeSet, pod: &mut Pod, ordinal: i32) {
    let claims = claims_for_pod(nodeset, ordinal);
    let spec = pod.spec.get_or_insert_with(Default::default);
    let current = spec.volumes.take().unwrap_or_default();

    let mut volumes: Vec<Volume> = claims
        .iter()
        .map(|(name, claim)| Volume {
            name: name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.name_any(),
                read_only: Some(false),
            }),
            ..Default::default()
        })
        .collect();
    volumes.extend(current.into_iter().filter(|v| !claims.contains_key(&v.name)));
    spec.volumes = Some(volumes);
}

/// Build the member pod for `ordinal` from the NodeSet template
pub fn new_nodeset_pod(nodeset: &NodeSet, ordinal: i32) -> Pod {
    let template = &nodeset.spec.template;
    let template_meta = template.metadata.clone().unwrap_or_default();

    let mut labels = template_meta.labels.unwrap_or_default();
    labels.extend(selector_labels(nodeset));
    labels.insert(LABEL_REVISION_HASH.to_string(), update_revision(nodeset));

    let mut pod = Pod {
        metadata: ObjectMeta {
            labels: Some(labels),
            annotations: template_meta.annotations,
            finalizers: template_meta.finalizers,
            owner_references: Some(vec![controller_ref(NODESET_GVK, &nodeset.metadata)]),
            ..Default::default()
        },
        spec: template.spec.clone(),
        status: None,
    };
    update_identity(nodeset, &mut pod, ordinal);

    let name = pod.name_any();
    let service_name = nodeset.spec.service_name.clone();
    let spec = pod.spec.get_or_insert_with(Default::default);
    spec.hostname = Some(match spec.hostname.as_deref() {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}{ordinal}"),
        _ => name,
    });
    if !service_name.is_empty() {
        spec.subdomain = Some(service_name);
    }
    spec.node_name = None;

    update_storage(nodeset, &mut pod, ordinal);
    pod
}
