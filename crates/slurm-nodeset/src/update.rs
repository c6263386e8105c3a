//! Rolling replacement of pods built from an older template
//!
//! Outdated pods are deleted and recreated from the current template by the
//! next scale-out pass. Pods that are not ready are replaced right away;
//! ready ones only while fewer than `maxUnavailable` pods are unavailable.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;

use slurm_common::crd::NodeSet;

use crate::controller::is_pod_ready;
use crate::identity::{pod_revision, update_revision};

/// True if the pod was built from the NodeSet's current template
pub fn is_pod_updated(nodeset: &NodeSet, pod: &Pod) -> bool {
    pod_revision(pod) == Some(update_revision(nodeset).as_str())
}

/// Outdated pods to delete this round, highest ordinal first.
///
/// `members` are the live pods keyed by ordinal. Missing ordinals below
/// the desired count are about to be created and count as unavailable, as
/// do up-to-date pods that are not ready. Ordinals below the partition are
/// never selected.
pub fn pods_to_replace<'a>(
    nodeset: &NodeSet,
    members: &'a BTreeMap<i32, Pod>,
    max_unavailable: i32,
) -> Vec<&'a Pod> {
    let replicas = nodeset.spec.desired_replicas();
    let partition = nodeset.spec.partition();
    let revision = update_revision(nodeset);

    let present = members.range(..replicas).count() as i32;
    let mut unavailable = replicas - present;
    let mut broken = Vec::new();
    let mut candidates = Vec::new();

    for (&ordinal, pod) in members.range(..replicas).rev() {
        let ready = is_pod_ready(pod);
        if pod_revision(pod) == Some(revision.as_str()) || ordinal < partition {
            if !ready {
                unavailable += 1;
            }
            continue;
        }
        if ready {
            candidates.push(pod);
        } else {
            broken.push(pod);
        }
    }

    let budget = (max_unavailable - unavailable).max(0) as usize;
    broken.into_iter().chain(candidates.into_iter().take(budget)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use kube::ResourceExt;
    use slurm_common::crd::RollingUpdateNodeSetStrategy;

    use crate::identity::tests::nodeset_with_templates;
    use crate::identity::{new_nodeset_pod, LABEL_REVISION_HASH};

    fn ready(mut pod: Pod) -> Pod {
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        pod
    }

    fn outdated(mut pod: Pod) -> Pod {
        pod.labels_mut()
            .insert(LABEL_REVISION_HASH.to_string(), "0000000000".to_string());
        pod
    }

    fn nodeset(replicas: i32) -> NodeSet {
        let mut nodeset = nodeset_with_templates(&[]);
        nodeset.spec.replicas = Some(replicas);
        nodeset
    }

    fn names(pods: Vec<&Pod>) -> Vec<String> {
        pods.into_iter().map(|p| p.name_any()).collect()
    }

    #[test]
    fn up_to_date_set_replaces_nothing() {
        let ns = nodeset(3);
        let members: BTreeMap<i32, Pod> =
            (0..3).map(|o| (o, ready(new_nodeset_pod(&ns, o)))).collect();

        assert!(pods_to_replace(&ns, &members, 1).is_empty());
        assert!(members.values().all(|p| is_pod_updated(&ns, p)));
    }

    /// Story: three ready pods on an old template with maxUnavailable=1.
    /// One pod is replaced per round, starting from the top ordinal; while
    /// its successor is not yet ready nothing else is touched.
    #[test]
    fn story_ready_pods_roll_one_at_a_time() {
        let ns = nodeset(3);
        let mut members: BTreeMap<i32, Pod> = (0..3)
            .map(|o| (o, ready(outdated(new_nodeset_pod(&ns, o)))))
            .collect();

        assert_eq!(names(pods_to_replace(&ns, &members, 1)), vec!["compute-2"]);

        members.remove(&2);
        assert!(pods_to_replace(&ns, &members, 1).is_empty());

        members.insert(2, new_nodeset_pod(&ns, 2));
        assert!(pods_to_replace(&ns, &members, 1).is_empty());

        members.insert(2, ready(new_nodeset_pod(&ns, 2)));
        assert_eq!(names(pods_to_replace(&ns, &members, 1)), vec!["compute-1"]);
    }

    #[test]
    fn unready_outdated_pods_are_always_replaced() {
        let ns = nodeset(3);
        let members = BTreeMap::from([
            (0, ready(outdated(new_nodeset_pod(&ns, 0)))),
            (1, outdated(new_nodeset_pod(&ns, 1))),
            (2, new_nodeset_pod(&ns, 2)),
        ]);

        // compute-2 is new and unready, using up the only slot
        assert_eq!(names(pods_to_replace(&ns, &members, 1)), vec!["compute-1"]);
    }

    #[test]
    fn max_unavailable_bounds_the_batch() {
        let ns = nodeset(4);
        let members: BTreeMap<i32, Pod> = (0..4)
            .map(|o| (o, ready(outdated(new_nodeset_pod(&ns, o)))))
            .collect();

        assert_eq!(
            names(pods_to_replace(&ns, &members, 3)),
            vec!["compute-3", "compute-2", "compute-1"]
        );
        assert_eq!(pods_to_replace(&ns, &members, 10).len(), 4);
    }

    #[test]
    fn partition_keeps_low_ordinals() {
        let mut ns = nodeset(3);
        ns.spec.update_strategy.rolling_update = Some(RollingUpdateNodeSetStrategy {
            max_unavailable: None,
            partition: Some(2),
        });
        let members: BTreeMap<i32, Pod> = (0..3)
            .map(|o| (o, outdated(new_nodeset_pod(&ns, o))))
            .collect();

        assert_eq!(names(pods_to_replace(&ns, &members, 1)), vec!["compute-2"]);
    }

    #[test]
    fn pods_above_desired_count_are_ignored() {
        let ns = nodeset(1);
        let members = BTreeMap::from([
            (0, ready(new_nodeset_pod(&ns, 0))),
            (1, ready(outdated(new_nodeset_pod(&ns, 1)))),
        ]);

        assert!(pods_to_replace(&ns, &members, 1).is_empty());
    }
}
