//! Registry of live Slurm clients, one per Cluster
//!
//! Shared by every Cluster reconcile and by anything that needs to talk to
//! a cluster's slurmrestd. Replacing or removing an entry stops the old
//! client's background loop.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use slurm_common::metrics::record_registry_operation;
use slurm_common::NamespacedName;

use crate::slurm_client::SlurmClient;

/// Live Slurm clients keyed by Cluster
#[derive(Default)]
pub struct ClusterRegistry {
    clients: RwLock<HashMap<NamespacedName, Arc<dyn SlurmClient>>>,
}

impl ClusterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Client registered for `id`
    pub fn get(&self, id: &NamespacedName) -> Option<Arc<dyn SlurmClient>> {
        self.clients.read().get(id).cloned()
    }

    /// True if any of `ids` has a client
    pub fn has<'a>(&self, ids: impl IntoIterator<Item = &'a NamespacedName>) -> bool {
        let clients = self.clients.read();
        ids.into_iter().any(|id| clients.contains_key(id))
    }

    /// Number of registered clients
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// True if no client is registered
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Register `client` for `id`, stopping any client it replaces.
    ///
    /// The new client's background loop is spawned on the current tokio
    /// runtime after the lock is released.
    pub fn add(&self, id: NamespacedName, client: Arc<dyn SlurmClient>) -> bool {
        {
            let mut clients = self.clients.write();
            if let Some(previous) = clients.remove(&id) {
                debug!(cluster = %id, "Stopping replaced Slurm client");
                previous.stop();
            }
            clients.insert(id.clone(), client.clone());
        }
        record_registry_operation("add");
        debug!(cluster = %id, server = %client.server(), "Registered Slurm client");

        tokio::spawn(async move { client.start().await });
        true
    }

    /// Stop and drop the client for `id`; false if there was none
    pub fn remove(&self, id: &NamespacedName) -> bool {
        let mut clients = self.clients.write();
        let Some(client) = clients.remove(id) else {
            return false;
        };
        client.stop();
        record_registry_operation("remove");
        debug!(cluster = %id, "Removed Slurm client");
        true
    }
}
