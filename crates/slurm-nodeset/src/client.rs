//! Kubernetes access for the NodeSet controller
//!
//! The controller only ever talks to the API server through [`KubeClient`],
//! so tests can substitute a mock or the in-memory store.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use slurm_common::crd::{NodeSet, NodeSetStatus};
use slurm_common::{Error, FIELD_MANAGER};

/// Trait abstracting Kubernetes client operations for NodeSets
///
/// Gets return `Ok(None)` when the object does not exist. Writes report
/// [`Error::NotFound`], [`Error::AlreadyExists`] and [`Error::Conflict`]
/// as distinct variants.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a NodeSet
    async fn get_nodeset(&self, namespace: &str, name: &str) -> Result<Option<NodeSet>, Error>;

    /// Merge-patch the status of a NodeSet
    async fn patch_nodeset_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NodeSetStatus,
    ) -> Result<(), Error>;

    /// List pods in a namespace matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error>;

    /// Fetch a pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Create a pod
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, Error>;

    /// Replace a pod; conflicts when its resourceVersion is out of date
    async fn update_pod(&self, pod: &Pod) -> Result<Pod, Error>;

    /// Delete a pod
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Fetch a persistent volume claim
    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// Create a persistent volume claim
    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, Error>;

    /// Replace a persistent volume claim
    async fn update_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of<K: kube::Resource>(obj: &K) -> Result<String, Error> {
    obj.namespace()
        .ok_or_else(|| Error::validation(format!("{} has no namespace", obj.name_any())))
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_nodeset(&self, namespace: &str, name: &str) -> Result<Option<NodeSet>, Error> {
        Ok(self.namespaced::<NodeSet>(namespace).get_opt(name).await?)
    }

    async fn patch_nodeset_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NodeSetStatus,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "status": status });
        self.namespaced::<NodeSet>(namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube("NodeSet", name, e))?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        let params = ListParams::default().labels(selector);
        Ok(self.namespaced::<Pod>(namespace).list(&params).await?.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(self.namespaced::<Pod>(namespace).get_opt(name).await?)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        let name = pod.name_any();
        self.namespaced::<Pod>(&namespace_of(pod)?)
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| Error::from_kube("Pod", &name, e))
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        let name = pod.name_any();
        self.namespaced::<Pod>(&namespace_of(pod)?)
            .replace(&name, &PostParams::default(), pod)
            .await
            .map_err(|e| Error::from_kube("Pod", &name, e))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.namespaced::<Pod>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube("Pod", name, e))?;
        Ok(())
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        Ok(self
            .namespaced::<PersistentVolumeClaim>(namespace)
            .get_opt(name)
            .await?)
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, Error> {
        let name = claim.name_any();
        self.namespaced::<PersistentVolumeClaim>(&namespace_of(claim)?)
            .create(&PostParams::default(), claim)
            .await
            .map_err(|e| Error::from_kube("PersistentVolumeClaim", &name, e))
    }

    async fn update_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, Error> {
        let name = claim.name_any();
        self.namespaced::<PersistentVolumeClaim>(&namespace_of(claim)?)
            .replace(&name, &PostParams::default(), claim)
            .await
            .map_err(|e| Error::from_kube("PersistentVolumeClaim", &name, e))
    }
}
