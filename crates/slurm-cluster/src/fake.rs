//! In-memory doubles for Cluster controller tests

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use parking_lot::Mutex;

use slurm_common::crd::{Cluster, ClusterSpec, ClusterStatus, ClusterToken};
use slurm_common::{Error, AUTH_TOKEN_KEY};

use crate::controller::KubeClient;
use crate::slurm_client::{PingResult, SlurmClient, SlurmClientFactory, PINGED_UP};

type Key = (String, String);

#[derive(Default)]
struct State {
    clusters: BTreeMap<Key, Cluster>,
    secrets: BTreeMap<Key, Secret>,
    status_conflicts: u32,
    status_patches: u32,
}

#[derive(Default)]
pub struct FakeKubeClient {
    state: Mutex<State>,
    next_version: AtomicU64,
}

pub fn cluster(name: &str, server: &str, secret: &str) -> Cluster {
    let mut cluster = Cluster::new(
        name,
        ClusterSpec {
            server: server.to_string(),
            token: ClusterToken {
                secret_ref: secret.to_string(),
            },
        },
    );
    cluster.metadata.namespace = Some("slurm".to_string());
    cluster.metadata.uid = Some(format!("{name}-uid"));
    cluster
}

pub fn token_secret(name: &str, token: &str) -> Secret {
    let mut secret = Secret::default();
    secret.metadata.name = Some(name.to_string());
    secret.metadata.namespace = Some("slurm".to_string());
    secret.data = Some(BTreeMap::from([(
        AUTH_TOKEN_KEY.to_string(),
        ByteString(token.as_bytes().to_vec()),
    )]));
    secret
}

impl FakeKubeClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn version(&self) -> String {
        (self.next_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    pub fn insert_cluster(&self, mut cluster: Cluster) {
        cluster.metadata.resource_version = Some(self.version());
        let key = (cluster.namespace().unwrap_or_default(), cluster.name_any());
        self.state.lock().clusters.insert(key, cluster);
    }

    pub fn delete_cluster(&self, name: &str) {
        self.state
            .lock()
            .clusters
            .remove(&("slurm".to_string(), name.to_string()));
    }

    pub fn insert_secret(&self, secret: Secret) {
        let key = (secret.namespace().unwrap_or_default(), secret.name_any());
        self.state.lock().secrets.insert(key, secret);
    }

    pub fn cluster(&self, name: &str) -> Option<Cluster> {
        self.state
            .lock()
            .clusters
            .get(&("slurm".to_string(), name.to_string()))
            .cloned()
    }

    /// Make the next `n` status patches conflict, as if another writer won
    pub fn conflict_next_status_patches(&self, n: u32) {
        self.state.lock().status_conflicts = n;
    }

    pub fn status_patches(&self) -> u32 {
        self.state.lock().status_patches
    }
}

#[async_trait]
impl KubeClient for FakeKubeClient {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, Error> {
        Ok(self
            .state
            .lock()
            .clusters
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self
            .state
            .lock()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn patch_cluster_status(&self, cluster: &Cluster, status: &ClusterStatus) -> Result<(), Error> {
        let name = cluster.name_any();
        let version = self.version();
        let mut state = self.state.lock();
        if state.status_conflicts > 0 {
            state.status_conflicts -= 1;
            if let Some(live) = state
                .clusters
                .get_mut(&(cluster.namespace().unwrap_or_default(), name.clone()))
            {
                live.metadata.resource_version = Some(version);
            }
            return Err(Error::conflict("Cluster", &name, "the object has been modified"));
        }
        let live = state
            .clusters
            .get_mut(&(cluster.namespace().unwrap_or_default(), name.clone()))
            .ok_or_else(|| Error::not_found("Cluster", &name))?;
        if live.metadata.resource_version != cluster.metadata.resource_version {
            return Err(Error::conflict("Cluster", &name, "the object has been modified"));
        }
        live.status = Some(status.clone());
        live.metadata.resource_version = Some(version);
        state.status_patches += 1;
        Ok(())
    }
}

/// Slurm client answering pings from a shared switch
pub struct FakeSlurmClient {
    server: String,
    token: String,
    up: Arc<AtomicBool>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

#[async_trait]
impl SlurmClient for FakeSlurmClient {
    fn server(&self) -> String {
        self.server.clone()
    }

    fn token(&self) -> String {
        self.token.clone()
    }

    async fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    async fn list_pings(&self) -> Result<Vec<PingResult>, Error> {
        let pinged = if self.up.load(Ordering::SeqCst) { PINGED_UP } else { "DOWN" };
        Ok(vec![PingResult {
            hostname: "slurmctld-0".to_string(),
            pinged: pinged.to_string(),
            ..Default::default()
        }])
    }
}

/// Factory handing out [`FakeSlurmClient`]s and remembering them
#[derive(Default)]
pub struct FakeFactory {
    pub up: Arc<AtomicBool>,
    created: Mutex<Vec<Arc<FakeSlurmClient>>>,
    failures: Mutex<HashMap<String, String>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    /// Make creation for `server` fail
    pub fn fail_for(&self, server: &str) {
        self.failures
            .lock()
            .insert(server.to_string(), "invalid server URL".to_string());
    }

    pub fn created(&self) -> Vec<Arc<FakeSlurmClient>> {
        self.created.lock().clone()
    }
}

impl SlurmClientFactory for FakeFactory {
    fn create(&self, server: &str, token: &str) -> Result<Arc<dyn SlurmClient>, Error> {
        if let Some(message) = self.failures.lock().get(server) {
            return Err(Error::slurm(server, message.clone(), None));
        }
        let client = Arc::new(FakeSlurmClient {
            server: server.trim_end_matches('/').to_string(),
            token: token.to_string(),
            up: self.up.clone(),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        });
        self.created.lock().push(client.clone());
        Ok(client)
    }
}
