//! In-memory object store for NodeSet controller tests
//!
//! Behaves like the API server for the handful of semantics the controller
//! relies on: create assigns a UID and resourceVersion, replace rejects stale
//! resourceVersions with a conflict, and writes to missing objects are
//! not-found.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::ResourceExt;
use parking_lot::Mutex;

use slurm_common::crd::{NodeSet, NodeSetStatus};
use slurm_common::Error;

use crate::client::KubeClient;

type Key = (String, String);

fn key_of<K: kube::Resource>(obj: &K) -> Key {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

#[derive(Default)]
struct State {
    nodesets: BTreeMap<Key, NodeSet>,
    pods: BTreeMap<Key, Pod>,
    claims: BTreeMap<Key, PersistentVolumeClaim>,
    pod_conflicts: u32,
    claim_conflicts: u32,
    failing_claim_gets: Vec<String>,
}

/// Counts of writes that reached the store
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub pod_creates: u32,
    pub pod_updates: u32,
    pub pod_deletes: u32,
    pub claim_creates: u32,
    pub claim_updates: u32,
    pub status_patches: u32,
}

#[derive(Default)]
pub struct FakeKubeClient {
    state: Mutex<State>,
    writes: Mutex<WriteCounts>,
    next_version: AtomicU64,
}

impl FakeKubeClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn stamp(&self, meta: &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        meta.resource_version = Some(version.to_string());
    }

    /// Seed a NodeSet as-is
    pub fn insert_nodeset(&self, nodeset: NodeSet) {
        self.state.lock().nodesets.insert(key_of(&nodeset), nodeset);
    }

    /// Seed a pod, stamping a resourceVersion and keeping its UID
    pub fn insert_pod(&self, mut pod: Pod) -> Pod {
        self.stamp(&mut pod.metadata);
        self.state.lock().pods.insert(key_of(&pod), pod.clone());
        pod
    }

    /// Seed a claim, stamping a resourceVersion
    pub fn insert_claim(&self, mut claim: PersistentVolumeClaim) -> PersistentVolumeClaim {
        self.stamp(&mut claim.metadata);
        self.state.lock().claims.insert(key_of(&claim), claim.clone());
        claim
    }

    /// Make the next `n` pod replaces fail with a conflict
    pub fn conflict_next_pod_updates(&self, n: u32) {
        self.state.lock().pod_conflicts = n;
    }

    /// Fail the next `n` claim updates as if another writer got there first
    pub fn conflict_next_claim_updates(&self, n: u32) {
        self.state.lock().claim_conflicts = n;
    }

    /// Make gets of the named claim fail with a transport error
    pub fn fail_claim_get(&self, name: &str) {
        self.state.lock().failing_claim_gets.push(name.to_string());
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state
            .lock()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.state.lock().pods.values().cloned().collect()
    }

    pub fn claim(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.state
            .lock()
            .claims
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn nodeset(&self, namespace: &str, name: &str) -> Option<NodeSet> {
        self.state
            .lock()
            .nodesets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn writes(&self) -> WriteCounts {
        *self.writes.lock()
    }
}

fn selector_matches(pod: &Pod, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => pod.labels().get(k).map(String::as_str) == Some(v),
            None => pod.labels().contains_key(term),
        })
}

#[async_trait]
impl KubeClient for FakeKubeClient {
    async fn get_nodeset(&self, namespace: &str, name: &str) -> Result<Option<NodeSet>, Error> {
        Ok(self.nodeset(namespace, name))
    }

    async fn patch_nodeset_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NodeSetStatus,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        let nodeset = state
            .nodesets
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::not_found("NodeSet", name))?;
        nodeset.status = Some(status.clone());
        self.writes.lock().status_patches += 1;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        Ok(self
            .state
            .lock()
            .pods
            .values()
            .filter(|p| p.namespace().as_deref() == Some(namespace))
            .filter(|p| selector_matches(p, selector))
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(self.pod(namespace, name))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        let key = key_of(pod);
        if self.state.lock().pods.contains_key(&key) {
            return Err(Error::already_exists("Pod", &key.1));
        }
        let mut created = pod.clone();
        created.metadata.uid = Some(format!("uid-{}", key.1));
        self.stamp(&mut created.metadata);
        self.state.lock().pods.insert(key, created.clone());
        self.writes.lock().pod_creates += 1;
        Ok(created)
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        let key = key_of(pod);
        let mut state = self.state.lock();
        if state.pod_conflicts > 0 {
            state.pod_conflicts -= 1;
            // a competing writer touched the pod
            if let Some(live) = state.pods.get_mut(&key) {
                self.stamp(&mut live.metadata);
            }
            return Err(Error::conflict("Pod", &key.1, "the object has been modified"));
        }
        let live = state
            .pods
            .get(&key)
            .ok_or_else(|| Error::not_found("Pod", &key.1))?;
        if live.metadata.resource_version != pod.metadata.resource_version {
            return Err(Error::conflict("Pod", &key.1, "the object has been modified"));
        }
        let mut updated = pod.clone();
        self.stamp(&mut updated.metadata);
        state.pods.insert(key, updated.clone());
        self.writes.lock().pod_updates += 1;
        Ok(updated)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.state
            .lock()
            .pods
            .remove(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::not_found("Pod", name))?;
        self.writes.lock().pod_deletes += 1;
        Ok(())
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        if self.state.lock().failing_claim_gets.iter().any(|n| n == name) {
            return Err(Error::internal_with_context("fake", "connection reset"));
        }
        Ok(self.claim(namespace, name))
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, Error> {
        let key = key_of(claim);
        if self.state.lock().claims.contains_key(&key) {
            return Err(Error::already_exists("PersistentVolumeClaim", &key.1));
        }
        let mut created = claim.clone();
        created.metadata.uid = Some(format!("uid-{}", key.1));
        self.stamp(&mut created.metadata);
        self.state.lock().claims.insert(key, created.clone());
        self.writes.lock().claim_creates += 1;
        Ok(created)
    }

    async fn update_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, Error> {
        let key = key_of(claim);
        let mut state = self.state.lock();
        if state.claim_conflicts > 0 {
            state.claim_conflicts -= 1;
            if let Some(live) = state.claims.get_mut(&key) {
                self.stamp(&mut live.metadata);
            }
            return Err(Error::conflict(
                "PersistentVolumeClaim",
                &key.1,
                "the object has been modified",
            ));
        }
        let live = state
            .claims
            .get(&key)
            .ok_or_else(|| Error::not_found("PersistentVolumeClaim", &key.1))?;
        if live.metadata.resource_version != claim.metadata.resource_version {
            return Err(Error::conflict(
                "PersistentVolumeClaim",
                &key.1,
                "the object has been modified",
            ));
        }
        let mut updated = claim.clone();
        self.stamp(&mut updated.metadata);
        state.claims.insert(key, updated.clone());
        self.writes.lock().claim_updates += 1;
        Ok(updated)
    }
}
