//! Persistent volume claims backing NodeSet pods
//!
//! Every pod gets one claim per volume claim template. Claims are created
//! before their pod and their owner references are kept in line with the
//! NodeSet retention policy for as long as the pod exists.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::debug;

use slurm_common::crd::NodeSet;
use slurm_common::events::{actions, reasons, EventPublisher, Verb};
use slurm_common::kube_utils::{is_deleting, POD_GVK};
use slurm_common::Error;

use crate::client::KubeClient;
use crate::identity::{claim_name, claims_for_pod, ordinal};
use crate::ownership::{has_stale_owner_ref, has_unexpected_controller, is_owner_up_to_date, with_corrected_owner_refs};

/// Publish a Normal or Warning event on the NodeSet for `verb` applied to a pod
pub(crate) async fn record_pod_event(
    events: &dyn EventPublisher,
    verb: Verb,
    nodeset: &NodeSet,
    pod: &Pod,
    err: Option<&Error>,
) {
    let subject = format!("{} Pod {} in NodeSet {}", verb.as_str(), pod.name_any(), nodeset.name_any());
    publish_outcome(events, verb, nodeset, subject, err).await;
}

async fn record_claim_event(
    events: &dyn EventPublisher,
    verb: Verb,
    nodeset: &NodeSet,
    pod: &Pod,
    claim: &str,
    err: Option<&Error>,
) {
    let link = if err.is_some() { "for Pod" } else { "Pod" };
    let subject = format!(
        "{} Claim {claim} {link} {} in NodeSet {}",
        verb.as_str(),
        pod.name_any(),
        nodeset.name_any()
    );
    publish_outcome(events, verb, nodeset, subject, err).await;
}

async fn publish_outcome(
    events: &dyn EventPublisher,
    verb: Verb,
    nodeset: &NodeSet,
    subject: String,
    err: Option<&Error>,
) {
    let note = match err {
        None => format!("{subject} successful"),
        Some(err) => format!("{subject} failed error: {err}"),
    };
    events
        .publish(
            &nodeset.object_ref(&()),
            Verb::event_type(err.is_some()),
            verb.reason(err.is_some()),
            verb.action(),
            Some(note),
        )
        .await;
}

/// Creates claims and keeps their ownership in line with the retention policy
#[derive(Clone)]
pub struct ClaimControl {
    kube: Arc<dyn KubeClient>,
    events: Arc<dyn EventPublisher>,
}

impl ClaimControl {
    /// Create a claim controller over the given client and event sink
    pub fn new(kube: Arc<dyn KubeClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self { kube, events }
    }

    /// Names of the claims `pod` should mount, in template order
    fn claim_names(nodeset: &NodeSet, pod: &Pod) -> Vec<String> {
        let Some(ordinal) = ordinal(pod) else {
            return Vec::new();
        };
        nodeset
            .spec
            .volume_claim_templates
            .iter()
            .map(|template| claim_name(nodeset, template, ordinal))
            .collect()
    }

    /// Create every missing claim for `pod`.
    ///
    /// All templates are attempted; failures are collected into one error.
    /// A claim that is being deleted counts as a failure since the pod
    /// would mount a volume that is about to disappear.
    pub async fn ensure_claims_exist(&self, nodeset: &NodeSet, pod: &Pod) -> Result<(), Error> {
        let Some(ordinal) = ordinal(pod) else {
            return Ok(());
        };
        let namespace = nodeset.namespace().unwrap_or_default();
        let mut errors = Vec::new();

        for claim in claims_for_pod(nodeset, ordinal).into_values() {
            let name = claim.name_any();
            match self.kube.get_claim(&namespace, &name).await {
                Ok(None) => match self.kube.create_claim(&claim).await {
                    Ok(_) => {
                        record_claim_event(self.events.as_ref(), Verb::Create, nodeset, pod, &name, None)
                            .await;
                    }
                    Err(e) => {
                        if !e.is_already_exists() {
                            record_claim_event(
                                self.events.as_ref(),
                                Verb::Create,
                                nodeset,
                                pod,
                                &name,
                                Some(&e),
                            )
                            .await;
                        }
                        errors.push(Error::claim(&name, format!("failed to create PVC {name}: {e}")));
                    }
                },
                Ok(Some(existing)) => {
                    if is_deleting(&existing.metadata) {
                        errors.push(Error::claim(&name, format!("pvc {name} is being deleted")));
                    }
                }
                Err(e) => {
                    record_claim_event(self.events.as_ref(), Verb::Create, nodeset, pod, &name, Some(&e))
                        .await;
                    errors.push(Error::claim(&name, format!("failed to retrieve PVC {name}: {e}")));
                }
            }
        }

        Error::aggregate(errors)
    }

    async fn fetch(&self, nodeset: &NodeSet, pod: &Pod, name: &str) -> Result<Option<PersistentVolumeClaim>, Error> {
        let namespace = nodeset.namespace().unwrap_or_default();
        self.kube.get_claim(&namespace, name).await.map_err(|e| {
            Error::claim(
                name,
                format!(
                    "could not retrieve claim {name} for {} when checking PVC deletion policy: {e}",
                    pod.name_any()
                ),
            )
        })
    }

    /// True if every existing claim of `pod` is owned as the policy expects.
    ///
    /// Missing claims count as matching; they are picked up once created.
    pub async fn claims_match_retention_policy(&self, nodeset: &NodeSet, pod: &Pod) -> Result<bool, Error> {
        for name in Self::claim_names(nodeset, pod) {
            match self.fetch(nodeset, pod, &name).await? {
                None => debug!(claim = %name, "Expected claim missing, continuing"),
                Some(claim) => {
                    if !is_owner_up_to_date(&claim, nodeset, pod) {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Rewrite the owner references of every existing claim of `pod` that
    /// does not match the retention policy.
    ///
    /// A claim controlled by a foreign controller gets a Warning event on
    /// the NodeSet; only our own references are removed from it.
    pub async fn enforce_retention_policy(&self, nodeset: &NodeSet, pod: &Pod) -> Result<(), Error> {
        for name in Self::claim_names(nodeset, pod) {
            let Some(claim) = self.fetch(nodeset, pod, &name).await? else {
                debug!(claim = %name, "Expected claim missing, continuing");
                continue;
            };

            if has_unexpected_controller(&claim, nodeset, pod) {
                self.events
                    .publish(
                        &nodeset.object_ref(&()),
                        EventType::Warning,
                        reasons::CONFLICTING_CONTROLLER,
                        actions::RECONCILE,
                        Some(format!(
                            "PersistentVolumeClaim {name} has a conflicting OwnerReference that acts as a managing controller, the retention policy is ignored for this claim"
                        )),
                    )
                    .await;
            }

            if !is_owner_up_to_date(&claim, nodeset, pod) {
                let updated = with_corrected_owner_refs(&claim, nodeset, pod);
                // Conflicts pass through unwrapped so the caller can retry
                self.kube.update_claim(&updated).await.map_err(|e| {
                    if e.is_conflict() {
                        return e;
                    }
                    Error::claim(
                        &name,
                        format!("could not update claim {name} for delete policy ownerRefs: {e}"),
                    )
                })?;
            }
        }
        Ok(())
    }

    /// True if an existing claim still references an earlier pod of the
    /// same name, which must be garbage collected before the pod is recreated
    pub async fn is_stale(&self, nodeset: &NodeSet, pod: &Pod) -> Result<bool, Error> {
        let namespace = nodeset.namespace().unwrap_or_default();
        for name in Self::claim_names(nodeset, pod) {
            if let Some(claim) = self.kube.get_claim(&namespace, &name).await? {
                if has_stale_owner_ref(&claim, &pod.metadata, POD_GVK) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}
