//! Domain Ports - collaborator traits and the deployed state they return
//!
//! The reconciler only talks to the outside world through [`StorageClient`]
//! (the replicated storage controller) and [`HaConfigStore`] (the HA daemon's
//! declarative configuration). Adapters in `controlplane::backends` implement
//! both.

use crate::domain::model::VolumeConfig;
use crate::error::{Error, Result};
use crate::promoter::PromoterConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Deployed State
// =============================================================================

/// The controller's canonical shape for a named resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub name: String,
    pub resource_group: String,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

/// Placement policy snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroup {
    pub name: String,
    /// Number of diskful replicas the controller places
    #[serde(default)]
    pub place_count: Option<u32>,
}

impl ResourceGroup {
    /// Place count the controller falls back to when the group sets none
    pub const DEFAULT_PLACE_COUNT: u32 = 2;

    pub fn expected_replicas(&self) -> u32 {
        self.place_count.unwrap_or(Self::DEFAULT_PLACE_COUNT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDefinition {
    pub number: u32,
    pub size_kib: u64,
    /// Size includes replication metadata
    #[serde(default)]
    pub gross: bool,
}

/// Replication state of one volume on one node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskState {
    UpToDate,
    Outdated,
    Inconsistent,
    Diskless,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVolume {
    pub number: u32,
    #[serde(default)]
    pub device_path: Option<String>,
    #[serde(default)]
    pub disk_state: DiskState,
}

/// A per-node placement instance of a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub node_name: String,
    /// Promotion status; `None` when the node has not reported yet
    #[serde(default)]
    pub in_use: Option<bool>,
    #[serde(default)]
    pub diskless: bool,
    #[serde(default)]
    pub volumes: Vec<ResourceVolume>,
}

impl Resource {
    pub fn is_in_use(&self) -> bool {
        self.in_use.unwrap_or(false)
    }
}

/// Requested shape of a resource at the storage layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub name: String,
    pub resource_group: String,
    /// Full volume set, including the cluster-private volume
    pub volumes: Vec<VolumeConfig>,
    pub gross_size: bool,
    /// Properties set on the resource definition
    pub props: BTreeMap<String, String>,
}

impl ResourceSpec {
    /// Requested volumes that do not exist yet
    ///
    /// A size mismatch is always a conflict. A missing volume is one unless
    /// `allow_extend` is set.
    pub fn missing_volumes(
        &self,
        existing: &[VolumeDefinition],
        allow_extend: bool,
    ) -> Result<Vec<&VolumeConfig>> {
        let mut missing = Vec::new();
        for vol in &self.volumes {
            match existing.iter().find(|vd| vd.number == vol.number) {
                Some(vd) if vd.size_kib != vol.size_kib => {
                    return Err(Error::Conflict(format!(
                        "volume {} of resource {} has size {} KiB, requested {} KiB",
                        vol.number, self.name, vd.size_kib, vol.size_kib
                    )));
                }
                Some(_) => {}
                None if allow_extend => missing.push(vol),
                None => {
                    return Err(Error::Conflict(format!(
                        "resource {} already exists without volume {}",
                        self.name, vol.number
                    )));
                }
            }
        }
        Ok(missing)
    }

    /// Requested properties whose value differs from `current`
    pub fn changed_props(&self, current: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        self.props
            .iter()
            .filter(|(k, v)| current.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Result of ensuring a resource
#[derive(Debug, Clone)]
pub struct Deployment {
    pub definition: ResourceDefinition,
    pub group: ResourceGroup,
    pub resources: Vec<Resource>,
}

/// Everything the controller knows about a resource
#[derive(Debug, Clone, Default)]
pub struct DeployedState {
    pub definition: Option<ResourceDefinition>,
    pub group: Option<ResourceGroup>,
    pub volume_definitions: Vec<VolumeDefinition>,
    pub resources: Vec<Resource>,
}

// =============================================================================
// Storage Client Port
// =============================================================================

/// Port for the replicated storage controller
///
/// Missing objects are reported as `Error::ResourceNotFound`, distinct from
/// transport failures.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Create the resource or reconcile it towards `spec`
    ///
    /// Without `allow_extend`, an existing definition whose volumes differ from
    /// `spec` is a conflict. With it, missing volumes are added.
    async fn ensure_resource(&self, spec: &ResourceSpec, allow_extend: bool) -> Result<Deployment>;

    async fn delete_resource_definition(&self, name: &str) -> Result<()>;

    async fn delete_volume_definition(&self, name: &str, number: u32) -> Result<()>;

    /// Read back definition, group, volume definitions and placements
    async fn deployed(&self, name: &str) -> Result<DeployedState>;

    /// Current placements; empty when the resource does not exist
    async fn resources(&self, name: &str) -> Result<Vec<Resource>>;
}

// =============================================================================
// HA Config Store Port
// =============================================================================

/// A configuration object together with where and how it is stored
#[derive(Debug, Clone, PartialEq)]
pub struct StoredConfig {
    pub config: PromoterConfig,
    /// Path the HA daemon reads the object from
    pub path: String,
    /// Whether the daemon is permitted to manage the resource
    pub attached: bool,
}

/// Port for the HA daemon's declarative configuration
///
/// Attach and detach only toggle management; they do not wait for the
/// resulting promotion or demotion.
#[async_trait]
pub trait HaConfigStore: Send + Sync {
    async fn find(&self, id: &str) -> Result<Option<StoredConfig>>;

    async fn list(&self) -> Result<Vec<StoredConfig>>;

    /// Create or replace the object with the same id
    async fn ensure(&self, config: &PromoterConfig) -> Result<()>;

    async fn attach(&self, config: &PromoterConfig) -> Result<()>;

    async fn detach(&self, config: &PromoterConfig) -> Result<()>;

    /// Remove the object; absence is not an error
    async fn delete(&self, id: &str) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type StorageClientRef = Arc<dyn StorageClient>;
pub type HaConfigStoreRef = Arc<dyn HaConfigStore>;
