//! Pod lifecycle for NodeSet members
//!
//! Creation, deletion and in-place repair of member pods, keeping each pod's
//! claims in step with it. Every write is reported as an event on the
//! NodeSet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use slurm_common::crd::{NodeSet, RetentionPolicyType};
use slurm_common::events::{EventPublisher, Verb};
use slurm_common::retry::{retry_on_conflict, RetryConfig};
use slurm_common::Error;

use crate::claims::{record_pod_event, ClaimControl};
use crate::client::KubeClient;
use crate::identity::{
    is_condemned, is_identity_match, is_storage_match, ordinal, set_condemned, update_identity,
    update_storage,
};

/// Writes member pods on behalf of a NodeSet
#[derive(Clone)]
pub struct PodControl {
    kube: Arc<dyn KubeClient>,
    events: Arc<dyn EventPublisher>,
    claims: ClaimControl,
}

impl PodControl {
    /// Create a pod controller over the given client and event sink
    pub fn new(kube: Arc<dyn KubeClient>, events: Arc<dyn EventPublisher>) -> Self {
        let claims = ClaimControl::new(kube.clone(), events.clone());
        Self {
            kube,
            events,
            claims,
        }
    }

    /// Claim lifecycle used by this controller
    pub fn claims(&self) -> &ClaimControl {
        &self.claims
    }

    /// Create `pod` after its claims, then hand claim ownership over per the
    /// retention policy.
    ///
    /// An already-existing pod is returned as-is without an event.
    pub async fn create_pod(&self, nodeset: &NodeSet, pod: &Pod) -> Result<(), Error> {
        if let Err(e) = self.claims.ensure_claims_exist(nodeset, pod).await {
            record_pod_event(self.events.as_ref(), Verb::Create, nodeset, pod, Some(&e)).await;
            return Err(e);
        }

        let created = match self.kube.create_pod(pod).await {
            Err(e) if e.is_already_exists() => return Err(e),
            other => other,
        };

        // the created pod carries the UID the claims must reference
        let owner = created.as_ref().unwrap_or(pod);
        if let Err(e) = self.claims.enforce_retention_policy(nodeset, owner).await {
            record_pod_event(self.events.as_ref(), Verb::Update, nodeset, pod, Some(&e)).await;
            return Err(e);
        }

        let result = created.map(|_| ());
        record_pod_event(self.events.as_ref(), Verb::Create, nodeset, pod, result.as_ref().err()).await;
        result
    }

    /// Delete `pod`; a missing pod is reported as [`Error::NotFound`]
    pub async fn delete_pod(&self, nodeset: &NodeSet, pod: &Pod) -> Result<(), Error> {
        let namespace = pod.namespace().unwrap_or_default();
        let result = self.kube.delete_pod(&namespace, &pod.name_any()).await;
        record_pod_event(self.events.as_ref(), Verb::Delete, nodeset, pod, result.as_ref().err()).await;
        result
    }

    /// Bring `pod` back in line with its identity, storage and claim policy.
    ///
    /// Nothing is written when the pod is already consistent. Conflicting
    /// writes are retried against the live pod; an event is recorded only
    /// when a write was attempted.
    pub async fn update_pod(&self, nodeset: &NodeSet, pod: &Pod) -> Result<(), Error> {
        let Some(ordinal) = ordinal(pod) else {
            return Err(Error::internal_with_context(
                "pod_control",
                format!("pod {} has no ordinal", pod.name_any()),
            ));
        };

        let current = Mutex::new(pod.clone());
        let attempted = AtomicBool::new(false);

        let result = retry_on_conflict(&RetryConfig::conflict(), "update_pod", || {
            let current = &current;
            let attempted = &attempted;
            async move {
                let mut pod = current.lock().clone();
                let mut consistent = true;

                if !is_identity_match(nodeset, &pod) {
                    update_identity(nodeset, &mut pod, ordinal);
                    consistent = false;
                }

                if !is_storage_match(nodeset, &pod) {
                    update_storage(nodeset, &mut pod, ordinal);
                    consistent = false;
                    if let Err(e) = self.claims.ensure_claims_exist(nodeset, &pod).await {
                        record_pod_event(self.events.as_ref(), Verb::Update, nodeset, &pod, Some(&e)).await;
                        return Err(e);
                    }
                }

                match self.claims.claims_match_retention_policy(nodeset, &pod).await {
                    Err(e) => {
                        record_pod_event(self.events.as_ref(), Verb::Update, nodeset, &pod, Some(&e)).await;
                        return Err(e);
                    }
                    Ok(false) => {
                        if let Err(e) = self.claims.enforce_retention_policy(nodeset, &pod).await {
                            if !e.is_conflict() {
                                record_pod_event(self.events.as_ref(), Verb::Update, nodeset, &pod, Some(&e))
                                    .await;
                            }
                            return Err(e);
                        }
                        consistent = false;
                    }
                    Ok(true) => {}
                }

                if consistent {
                    *current.lock() = pod;
                    return Ok(());
                }

                attempted.store(true, Ordering::SeqCst);
                match self.kube.update_pod(&pod).await {
                    Ok(updated) => {
                        *current.lock() = updated;
                        Ok(())
                    }
                    Err(update_err) => {
                        let namespace = nodeset.namespace().unwrap_or_default();
                        match self.kube.get_pod(&namespace, &pod.name_any()).await {
                            Ok(Some(live)) => *current.lock() = live,
                            Ok(None) => {
                                warn!(pod = %pod.name_any(), "Pod vanished while updating");
                                *current.lock() = pod;
                            }
                            Err(e) => {
                                warn!(pod = %pod.name_any(), error = %e, "Error getting updated pod");
                                *current.lock() = pod;
                            }
                        }
                        Err(update_err)
                    }
                }
            }
        })
        .await;

        if attempted.load(Ordering::SeqCst) {
            let pod = current.lock().clone();
            record_pod_event(self.events.as_ref(), Verb::Update, nodeset, &pod, result.as_ref().err()).await;
        }
        result
    }

    /// Set or clear the condemned annotation on the live pod.
    ///
    /// Returns the pod as written, or as read when it already had the
    /// requested marking.
    pub async fn set_condemned(&self, pod: &Pod, condemned: bool) -> Result<Pod, Error> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();

        retry_on_conflict(&RetryConfig::conflict(), "set_condemned", || {
            let (namespace, name) = (&namespace, &name);
            async move {
                let mut live = self
                    .kube
                    .get_pod(namespace, name)
                    .await?
                    .ok_or_else(|| Error::not_found("Pod", name.as_str()))?;
                if is_condemned(&live) == condemned {
                    return Ok(live);
                }
                set_condemned(&mut live, condemned);
                debug!(pod = %name, condemned, "Marking pod");
                self.kube.update_pod(&live).await
            }
        })
        .await
    }

    /// True if a claim of `pod` still belongs to an earlier pod of the same
    /// name. Claims are reused under a Retain scale-in policy and so are
    /// never stale.
    pub async fn is_pod_claims_stale(&self, nodeset: &NodeSet, pod: &Pod) -> Result<bool, Error> {
        match nodeset.retention_policy().when_scaled {
            RetentionPolicyType::Retain | RetentionPolicyType::Unknown => Ok(false),
            RetentionPolicyType::Delete => self.claims.is_stale(nodeset, pod).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PersistentVolumeClaim;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use mockall::predicate::eq;
    use slurm_common::crd::PersistentVolumeClaimRetentionPolicy;
    use slurm_common::events::RecordingEventPublisher;
    use slurm_common::kube_utils::{controller_ref, POD_GVK};
    use RetentionPolicyType::{Delete, Retain};

    use crate::client::MockKubeClient;
    use crate::fake::FakeKubeClient;
    use crate::identity::new_nodeset_pod;
    use crate::identity::tests::nodeset_with_templates;

    struct Harness {
        kube: Arc<FakeKubeClient>,
        events: Arc<RecordingEventPublisher>,
        control: PodControl,
    }

    fn harness() -> Harness {
        let kube = Arc::new(FakeKubeClient::new());
        let events = Arc::new(RecordingEventPublisher::new());
        let control = PodControl::new(kube.clone(), events.clone());
        Harness {
            kube,
            events,
            control,
        }
    }

    fn nodeset(policy: Option<(RetentionPolicyType, RetentionPolicyType)>) -> NodeSet {
        let mut nodeset = nodeset_with_templates(&["data"]);
        nodeset.spec.persistent_volume_claim_retention_policy =
            policy.map(|(when_deleted, when_scaled)| PersistentVolumeClaimRetentionPolicy {
                when_deleted,
                when_scaled,
            });
        nodeset
    }

    fn owner_uids(claim: &PersistentVolumeClaim) -> Vec<String> {
        claim
            .metadata
            .owner_references
            .iter()
            .flatten()
            .map(|r: &OwnerReference| r.uid.clone())
            .collect()
    }

    mod create {
        use super::*;

        /// Story: a fresh pod under Delete/Retain gets its claim created
        /// first, then the claim is handed to the NodeSet.
        #[tokio::test]
        async fn story_claims_precede_pod_and_follow_policy() {
            let h = harness();
            let nodeset = nodeset(Some((Delete, Retain)));
            let pod = new_nodeset_pod(&nodeset, 0);

            h.control.create_pod(&nodeset, &pod).await.unwrap();

            assert!(h.kube.pod("slurm", "compute-0").is_some());
            let claim = h.kube.claim("slurm", "data-compute-0").unwrap();
            assert_eq!(owner_uids(&claim), vec!["nodeset-uid"]);
            assert_eq!(h.events.reasons(), vec!["SuccessfulCreate", "SuccessfulCreate"]);
            assert_eq!(
                h.events.events()[1].note.as_deref(),
                Some("create Pod compute-0 in NodeSet compute successful")
            );
        }

        #[tokio::test]
        async fn condemned_pod_claims_reference_created_pod() {
            let h = harness();
            let nodeset = nodeset(Some((Retain, Delete)));
            let mut pod = new_nodeset_pod(&nodeset, 1);
            set_condemned(&mut pod, true);

            h.control.create_pod(&nodeset, &pod).await.unwrap();

            let claim = h.kube.claim("slurm", "data-compute-1").unwrap();
            assert_eq!(owner_uids(&claim), vec!["uid-compute-1"]);
        }

        #[tokio::test]
        async fn already_exists_is_silent() {
            let h = harness();
            let nodeset = nodeset(None);
            let pod = new_nodeset_pod(&nodeset, 0);
            h.kube.insert_pod(pod.clone());

            let err = h.control.create_pod(&nodeset, &pod).await.unwrap_err();

            assert!(err.is_already_exists());
            // only the claim creation is reported
            assert_eq!(h.events.reasons(), vec!["SuccessfulCreate"]);
        }

        #[tokio::test]
        async fn claim_failure_blocks_pod() {
            let h = harness();
            let nodeset = nodeset(None);
            let pod = new_nodeset_pod(&nodeset, 0);
            h.kube.fail_claim_get("data-compute-0");

            assert!(h.control.create_pod(&nodeset, &pod).await.is_err());

            assert!(h.kube.pod("slurm", "compute-0").is_none());
            assert_eq!(h.events.reasons(), vec!["FailedCreate", "FailedCreate"]);
        }
    }

    mod delete {
        use super::*;

        #[tokio::test]
        async fn records_success() {
            let h = harness();
            let nodeset = nodeset(None);
            let pod = h.kube.insert_pod(new_nodeset_pod(&nodeset, 0));

            h.control.delete_pod(&nodeset, &pod).await.unwrap();

            assert!(h.kube.pods().is_empty());
            assert_eq!(h.events.reasons(), vec!["SuccessfulDelete"]);
        }

        #[tokio::test]
        async fn not_found_is_surfaced_with_warning() {
            let mut mock = MockKubeClient::new();
            mock.expect_delete_pod()
                .with(eq("slurm"), eq("compute-0"))
                .times(1)
                .returning(|_, name| Err(Error::not_found("Pod", name)));
            let events = Arc::new(RecordingEventPublisher::new());
            let control = PodControl::new(Arc::new(mock), events.clone());
            let nodeset = nodeset(None);
            let pod = new_nodeset_pod(&nodeset, 0);

            let err = control.delete_pod(&nodeset, &pod).await.unwrap_err();

            assert!(err.is_not_found());
            let recorded = events.events();
            assert_eq!(recorded[0].reason, "FailedDelete");
            assert!(recorded[0].warning);
            assert_eq!(
                recorded[0].note.as_deref(),
                Some("delete Pod compute-0 in NodeSet compute failed error: Pod compute-0 not found")
            );
        }
    }

    mod update {
        use super::*;

        #[tokio::test]
        async fn consistent_pod_is_not_written() {
            let h = harness();
            let nodeset = nodeset(None);
            let pod = h.kube.insert_pod(new_nodeset_pod(&nodeset, 0));

            h.control.update_pod(&nodeset, &pod).await.unwrap();

            assert_eq!(h.kube.writes().pod_updates, 0);
            assert!(h.events.events().is_empty());
        }

        #[tokio::test]
        async fn repairs_identity_labels() {
            let h = harness();
            let nodeset = nodeset(None);
            let mut pod = new_nodeset_pod(&nodeset, 0);
            pod.metadata.labels.as_mut().unwrap().clear();
            let pod = h.kube.insert_pod(pod);

            h.control.update_pod(&nodeset, &pod).await.unwrap();

            let live = h.kube.pod("slurm", "compute-0").unwrap();
            assert!(is_identity_match(&nodeset, &live));
            assert_eq!(h.events.reasons(), vec!["SuccessfulUpdate"]);
        }

        #[tokio::test]
        async fn repairs_storage_and_creates_claims() {
            let h = harness();
            let nodeset = nodeset(None);
            let mut pod = new_nodeset_pod(&nodeset, 2);
            pod.spec.as_mut().unwrap().volumes = None;
            let pod = h.kube.insert_pod(pod);

            h.control.update_pod(&nodeset, &pod).await.unwrap();

            assert!(is_storage_match(&nodeset, &h.kube.pod("slurm", "compute-2").unwrap()));
            assert!(h.kube.claim("slurm", "data-compute-2").is_some());
        }

        /// Story: another writer keeps touching the pod. Two conflicts are
        /// absorbed by re-reading the live pod; the third attempt lands.
        #[tokio::test]
        async fn story_conflicts_are_retried_against_live_pod() {
            let h = harness();
            let nodeset = nodeset(None);
            let mut pod = new_nodeset_pod(&nodeset, 0);
            pod.metadata.labels.as_mut().unwrap().clear();
            let pod = h.kube.insert_pod(pod);
            h.kube.conflict_next_pod_updates(2);

            h.control.update_pod(&nodeset, &pod).await.unwrap();

            assert_eq!(h.kube.writes().pod_updates, 1);
            assert_eq!(h.events.reasons(), vec!["SuccessfulUpdate"]);
        }

        #[tokio::test]
        async fn conflict_budget_is_bounded() {
            let h = harness();
            let nodeset = nodeset(None);
            let mut pod = new_nodeset_pod(&nodeset, 0);
            pod.metadata.labels.as_mut().unwrap().clear();
            let pod = h.kube.insert_pod(pod);
            h.kube.conflict_next_pod_updates(10);

            let err = h.control.update_pod(&nodeset, &pod).await.unwrap_err();

            assert!(err.is_conflict());
            assert_eq!(h.events.reasons(), vec!["FailedUpdate"]);
        }

        #[tokio::test]
        async fn condemned_pod_takes_claim_ownership() {
            let h = harness();
            let nodeset = nodeset(Some((Delete, Delete)));
            let mut pod = new_nodeset_pod(&nodeset, 0);
            pod.metadata.uid = Some("pod-uid".to_string());
            let pod = h.kube.insert_pod(pod);
            h.kube.insert_claim({
                let mut claim = PersistentVolumeClaim::default();
                claim.metadata.name = Some("data-compute-0".to_string());
                claim.metadata.namespace = Some("slurm".to_string());
                claim.metadata.owner_references = Some(vec![controller_ref(
                    slurm_common::crd::NODESET_GVK,
                    &nodeset.metadata,
                )]);
                claim
            });

            let condemned = h.control.set_condemned(&pod, true).await.unwrap();
            h.control.update_pod(&nodeset, &condemned).await.unwrap();

            let claim = h.kube.claim("slurm", "data-compute-0").unwrap();
            assert_eq!(owner_uids(&claim), vec!["pod-uid"]);
        }

        /// Story: a claim written concurrently is retried, not reported
        ///
        /// Another writer bumps the claim between our read and our write. The
        /// ownership change is re-applied against the fresh claim and the pod
        /// still converges without a failure event.
        #[tokio::test]
        async fn story_claim_conflict_is_retried_until_pod_owns_claim() {
            let h = harness();
            let nodeset = nodeset(Some((Delete, Delete)));
            let mut pod = new_nodeset_pod(&nodeset, 0);
            pod.metadata.uid = Some("pod-uid".to_string());
            let pod = h.kube.insert_pod(pod);
            h.kube.insert_claim({
                let mut claim = PersistentVolumeClaim::default();
                claim.metadata.name = Some("data-compute-0".to_string());
                claim.metadata.namespace = Some("slurm".to_string());
                claim.metadata.owner_references = Some(vec![controller_ref(
                    slurm_common::crd::NODESET_GVK,
                    &nodeset.metadata,
                )]);
                claim
            });

            let condemned = h.control.set_condemned(&pod, true).await.unwrap();
            h.kube.conflict_next_claim_updates(1);
            h.control.update_pod(&nodeset, &condemned).await.unwrap();

            let claim = h.kube.claim("slurm", "data-compute-0").unwrap();
            assert_eq!(owner_uids(&claim), vec!["pod-uid"]);
            assert_eq!(h.kube.writes().claim_updates, 1);
            assert!(!h.events.reasons().contains(&"FailedUpdate".to_string()));
        }

        #[tokio::test]
        async fn pod_without_ordinal_is_rejected() {
            let h = harness();
            let nodeset = nodeset(None);
            let mut pod = new_nodeset_pod(&nodeset, 0);
            pod.metadata.name = Some("compute".to_string());

            assert!(h.control.update_pod(&nodeset, &pod).await.is_err());
            assert_eq!(h.kube.writes().pod_updates, 0);
        }
    }

    mod condemn {
        use super::*;

        #[tokio::test]
        async fn marks_and_clears_live_pod() {
            let h = harness();
            let nodeset = nodeset(None);
            let pod = h.kube.insert_pod(new_nodeset_pod(&nodeset, 0));

            let marked = h.control.set_condemned(&pod, true).await.unwrap();
            assert!(is_condemned(&marked));
            assert!(is_condemned(&h.kube.pod("slurm", "compute-0").unwrap()));

            // idempotent
            h.control.set_condemned(&pod, true).await.unwrap();
            assert_eq!(h.kube.writes().pod_updates, 1);

            h.control.set_condemned(&pod, false).await.unwrap();
            assert!(!is_condemned(&h.kube.pod("slurm", "compute-0").unwrap()));
        }

        #[tokio::test]
        async fn missing_pod_is_not_found() {
            let h = harness();
            let nodeset = nodeset(None);
            let pod = new_nodeset_pod(&nodeset, 0);
            assert!(h.control.set_condemned(&pod, true).await.unwrap_err().is_not_found());
        }
    }

    mod staleness {
        use super::*;

        #[rstest::rstest]
        #[case(Retain, false)]
        #[case(Delete, true)]
        #[tokio::test]
        async fn only_delete_on_scale_checks_claims(#[case] when_scaled: RetentionPolicyType, #[case] stale: bool) {
            let h = harness();
            let nodeset = nodeset(Some((Retain, when_scaled)));
            let mut old = new_nodeset_pod(&nodeset, 0);
            old.metadata.uid = Some("old-uid".to_string());
            h.kube.insert_claim({
                let mut claim = PersistentVolumeClaim::default();
                claim.metadata.name = Some("data-compute-0".to_string());
                claim.metadata.namespace = Some("slurm".to_string());
                claim.metadata.owner_references = Some(vec![controller_ref(POD_GVK, &old.metadata)]);
                claim
            });
            let replacement = new_nodeset_pod(&nodeset, 0);

            assert_eq!(h.control.is_pod_claims_stale(&nodeset, &replacement).await.unwrap(), stale);
        }
    }
}
