//! Collaborator Backends
//!
//! Implementations of the storage client and HA config store ports:
//! - LINSTOR: the controller REST API, configs in its key-value store
//! - Memory: a simulated cluster for tests and standalone mode

pub mod linstor;
pub mod memory;

pub use linstor::*;
pub use memory::*;

use crate::domain::ports::{HaConfigStoreRef, StorageClientRef};
use crate::error::Result;
use std::sync::Arc;

/// Both collaborators of a reconciler
#[derive(Clone)]
pub struct Backends {
    pub storage: StorageClientRef,
    pub store: HaConfigStoreRef,
}

/// Factory for the collaborator pair
pub struct BackendFactory;

impl BackendFactory {
    /// Connect to the first reachable LINSTOR controller
    pub async fn linstor(config: &LinstorConfig) -> Result<Backends> {
        let client = Arc::new(LinstorClient::connect(config).await?);
        Ok(Backends {
            storage: client.clone(),
            store: Arc::new(LinstorConfigStore::new(client)),
        })
    }

    /// A fresh simulated cluster
    pub fn in_memory() -> Backends {
        Self::from_cluster(Arc::new(InMemoryCluster::new()))
    }

    pub fn from_cluster(cluster: Arc<InMemoryCluster>) -> Backends {
        Backends {
            storage: cluster.clone(),
            store: cluster,
        }
    }
}
