//! In-Memory Cluster
//!
//! Simulates a storage controller and the HA daemon in one process. Both
//! collaborator traits are implemented over a single shared state, so a
//! config attached through [`HaConfigStore`] promotes the resource that
//! [`StorageClient::resources`] reports. Used by the tests and by the
//! `--standalone` mode of the binary.

use crate::domain::ports::{
    DeployedState, Deployment, DiskState, HaConfigStore, Resource, ResourceDefinition,
    ResourceGroup, ResourceSpec, ResourceVolume, StorageClient, StoredConfig, VolumeDefinition,
};
use crate::error::{Error, Result};
use crate::promoter::{config_path, PromoterConfig};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// First DRBD minor handed out to a new volume
const FIRST_MINOR: u32 = 1000;

// =============================================================================
// Simulated State
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Transition {
    promote: bool,
    polls_left: u32,
}

#[derive(Debug, Clone)]
struct SimResource {
    definition: ResourceDefinition,
    volumes: BTreeMap<u32, VolumeDefinition>,
    placements: Vec<Resource>,
    transition: Option<Transition>,
}

#[derive(Debug, Clone)]
struct SimConfig {
    content: String,
    attached: bool,
}

#[derive(Debug)]
struct ClusterState {
    nodes: Vec<String>,
    groups: BTreeMap<String, ResourceGroup>,
    resources: BTreeMap<String, SimResource>,
    /// Keyed by storage path
    configs: BTreeMap<String, SimConfig>,
    next_minor: u32,
    transition_polls: u32,
}

impl ClusterState {
    fn schedule(&mut self, config: &PromoterConfig, promote: bool) {
        let polls_left = self.transition_polls;
        for name in config.resources.keys() {
            if let Some(rsc) = self.resources.get_mut(name) {
                debug!("Scheduling {} of {}", if promote { "promotion" } else { "demotion" }, name);
                rsc.transition = Some(Transition { promote, polls_left });
            }
        }
    }

    fn next_minor(&mut self) -> u32 {
        let minor = self.next_minor;
        self.next_minor += 1;
        minor
    }
}

// =============================================================================
// In-Memory Cluster
// =============================================================================

/// Simulated storage controller plus HA daemon
pub struct InMemoryCluster {
    state: RwLock<ClusterState>,
    storage_writes: AtomicU64,
    config_writes: AtomicU64,
    failing_polls: AtomicU32,
    daemon_stalled: AtomicBool,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    /// Three diskful nodes and the default resource group with two replicas
    pub fn new() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(
            crate::domain::model::DEFAULT_RESOURCE_GROUP.to_string(),
            ResourceGroup {
                name: crate::domain::model::DEFAULT_RESOURCE_GROUP.to_string(),
                place_count: Some(ResourceGroup::DEFAULT_PLACE_COUNT),
            },
        );

        Self {
            state: RwLock::new(ClusterState {
                nodes: vec!["node-a".into(), "node-b".into(), "node-c".into()],
                groups,
                resources: BTreeMap::new(),
                configs: BTreeMap::new(),
                next_minor: FIRST_MINOR,
                transition_polls: 0,
            }),
            storage_writes: AtomicU64::new(0),
            config_writes: AtomicU64::new(0),
            failing_polls: AtomicU32::new(0),
            daemon_stalled: AtomicBool::new(false),
        }
    }

    pub fn with_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.get_mut().nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_resource_group(mut self, group: ResourceGroup) -> Self {
        self.state.get_mut().groups.insert(group.name.clone(), group);
        self
    }

    /// Number of polls the daemon needs before a promotion or demotion shows
    pub fn with_transition_polls(mut self, polls: u32) -> Self {
        self.state.get_mut().transition_polls = polls;
        self
    }

    /// Number of mutating calls made against either collaborator
    pub fn mutation_count(&self) -> u64 {
        self.storage_write_count() + self.config_write_count()
    }

    /// Mutating calls made against the storage controller
    pub fn storage_write_count(&self) -> u64 {
        self.storage_writes.load(Ordering::SeqCst)
    }

    /// Mutating calls made against the config store
    pub fn config_write_count(&self) -> u64 {
        self.config_writes.load(Ordering::SeqCst)
    }

    /// Stop the simulated daemon from completing transitions
    pub fn set_daemon_stalled(&self, stalled: bool) {
        self.daemon_stalled.store(stalled, Ordering::SeqCst);
    }

    /// Fail the next `count` placement reads with a controller error
    pub fn fail_next_polls(&self, count: u32) {
        self.failing_polls.store(count, Ordering::SeqCst);
    }

    /// Store raw configuration text, bypassing rendering
    pub async fn insert_raw_config(&self, id: &str, content: impl Into<String>, attached: bool) {
        self.state.write().await.configs.insert(
            config_path(id),
            SimConfig {
                content: content.into(),
                attached,
            },
        );
    }

    /// Overwrite the disk state of one volume on one node
    pub async fn set_disk_state(&self, resource: &str, node: &str, number: u32, disk_state: DiskState) -> Result<()> {
        let mut state = self.state.write().await;
        let volume = state
            .resources
            .get_mut(resource)
            .and_then(|r| r.placements.iter_mut().find(|p| p.node_name == node))
            .and_then(|p| p.volumes.iter_mut().find(|v| v.number == number))
            .ok_or_else(|| Error::not_found("resource-volume", format!("{}/{}/{}", resource, node, number)))?;
        volume.disk_state = disk_state;
        Ok(())
    }

    fn storage_written(&self) {
        self.storage_writes.fetch_add(1, Ordering::SeqCst);
    }

    fn config_written(&self) {
        self.config_writes.fetch_add(1, Ordering::SeqCst);
    }

    fn new_volume(state: &mut ClusterState, number: u32) -> ResourceVolume {
        ResourceVolume {
            number,
            device_path: Some(format!("/dev/drbd{}", state.next_minor())),
            disk_state: DiskState::UpToDate,
        }
    }

    fn autoplace(state: &mut ClusterState, name: &str, place_count: u32) -> Result<()> {
        if (state.nodes.len() as u32) < place_count {
            return Err(Error::ControllerApi {
                method: "POST".into(),
                path: format!("/v1/resource-definitions/{}/autoplace", name),
                status: 400,
                message: format!(
                    "not enough nodes: {} available, {} requested",
                    state.nodes.len(),
                    place_count
                ),
            });
        }

        let nodes: Vec<String> = state.nodes.iter().take(place_count as usize).cloned().collect();
        let numbers: Vec<u32> = state
            .resources
            .get(name)
            .map(|r| r.volumes.keys().copied().collect())
            .unwrap_or_default();

        let mut placements = Vec::new();
        for node in nodes {
            let volumes = numbers.iter().map(|n| Self::new_volume(state, *n)).collect();
            placements.push(Resource {
                name: name.to_string(),
                node_name: node,
                in_use: Some(false),
                diskless: false,
                volumes,
            });
        }
        if let Some(rsc) = state.resources.get_mut(name) {
            rsc.placements = placements;
        }
        Ok(())
    }
}

// =============================================================================
// Storage Client
// =============================================================================

#[async_trait]
impl StorageClient for InMemoryCluster {
    async fn ensure_resource(&self, spec: &ResourceSpec, allow_extend: bool) -> Result<Deployment> {
        let mut state = self.state.write().await;

        let group = state
            .groups
            .get(&spec.resource_group)
            .cloned()
            .ok_or_else(|| Error::not_found("resource-group", &spec.resource_group))?;

        let missing = match state.resources.get_mut(&spec.name) {
            Some(rsc) => {
                let existing: Vec<VolumeDefinition> = rsc.volumes.values().cloned().collect();
                let missing = spec.missing_volumes(&existing, allow_extend)?;
                let changed = spec.changed_props(&rsc.definition.props);
                if !changed.is_empty() {
                    debug!("Updating {} properties of {}", changed.len(), spec.name);
                    rsc.definition.props.extend(changed);
                    self.storage_written();
                }
                missing
            }
            None => {
                info!("Creating resource definition {}", spec.name);
                state.resources.insert(
                    spec.name.clone(),
                    SimResource {
                        definition: ResourceDefinition {
                            name: spec.name.clone(),
                            resource_group: group.name.clone(),
                            props: spec.props.clone(),
                        },
                        volumes: BTreeMap::new(),
                        placements: Vec::new(),
                        transition: None,
                    },
                );
                self.storage_written();
                spec.volumes.iter().collect()
            }
        };

        for vol in missing {
            info!("Creating volume definition {}/{}", spec.name, vol.number);
            let gross = spec.gross_size && vol.number != 0;
            let placed = state
                .resources
                .get(&spec.name)
                .map(|r| r.placements.len())
                .unwrap_or(0);
            let new_volumes: Vec<ResourceVolume> = (0..placed)
                .map(|_| Self::new_volume(&mut *state, vol.number))
                .collect();
            if let Some(rsc) = state.resources.get_mut(&spec.name) {
                rsc.volumes.insert(
                    vol.number,
                    VolumeDefinition {
                        number: vol.number,
                        size_kib: vol.size_kib,
                        gross,
                    },
                );
                for (placement, volume) in rsc.placements.iter_mut().zip(new_volumes) {
                    placement.volumes.push(volume);
                    placement.volumes.sort_by_key(|v| v.number);
                }
            }
            self.storage_written();
        }

        let unplaced = state
            .resources
            .get(&spec.name)
            .map(|r| r.placements.is_empty())
            .unwrap_or(false);
        if unplaced {
            info!("Autoplacing resource {} on {} nodes", spec.name, group.expected_replicas());
            Self::autoplace(&mut *state, &spec.name, group.expected_replicas())?;
            self.storage_written();
        }

        let rsc = state
            .resources
            .get(&spec.name)
            .ok_or_else(|| Error::Internal(format!("resource {} vanished", spec.name)))?;
        Ok(Deployment {
            definition: rsc.definition.clone(),
            group,
            resources: rsc.placements.clone(),
        })
    }

    async fn delete_resource_definition(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let rsc = state
            .resources
            .get(name)
            .ok_or_else(|| Error::not_found("resource-definition", name))?;
        if rsc.placements.iter().any(Resource::is_in_use) {
            return Err(Error::Conflict(format!("resource {} is in use", name)));
        }
        info!("Deleting resource definition {}", name);
        state.resources.remove(name);
        self.storage_written();
        Ok(())
    }

    async fn delete_volume_definition(&self, name: &str, number: u32) -> Result<()> {
        let mut state = self.state.write().await;
        let rsc = state
            .resources
            .get_mut(name)
            .filter(|r| r.volumes.contains_key(&number))
            .ok_or_else(|| Error::not_found("volume-definition", format!("{}/{}", name, number)))?;
        info!("Deleting volume definition {}/{}", name, number);
        rsc.volumes.remove(&number);
        for placement in &mut rsc.placements {
            placement.volumes.retain(|v| v.number != number);
        }
        self.storage_written();
        Ok(())
    }

    async fn deployed(&self, name: &str) -> Result<DeployedState> {
        let state = self.state.read().await;
        let Some(rsc) = state.resources.get(name) else {
            return Ok(DeployedState::default());
        };
        Ok(DeployedState {
            definition: Some(rsc.definition.clone()),
            group: state.groups.get(&rsc.definition.resource_group).cloned(),
            volume_definitions: rsc.volumes.values().cloned().collect(),
            resources: rsc.placements.clone(),
        })
    }

    async fn resources(&self, name: &str) -> Result<Vec<Resource>> {
        let failing = self.failing_polls.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_polls.store(failing - 1, Ordering::SeqCst);
            return Err(Error::ControllerApi {
                method: "GET".into(),
                path: format!("/v1/view/resources?resources={}", name),
                status: 503,
                message: "controller unavailable".into(),
            });
        }

        let stalled = self.daemon_stalled.load(Ordering::SeqCst);
        let mut state = self.state.write().await;
        let Some(rsc) = state.resources.get_mut(name) else {
            return Ok(Vec::new());
        };

        if let Some(transition) = rsc.transition.as_mut().filter(|_| !stalled) {
            if transition.polls_left > 0 {
                transition.polls_left -= 1;
            } else {
                let promote = transition.promote;
                rsc.transition = None;
                let primary = rsc.placements.iter().position(|p| !p.diskless);
                for (i, placement) in rsc.placements.iter_mut().enumerate() {
                    placement.in_use = Some(promote && Some(i) == primary);
                }
                debug!("Simulated daemon {} {}", if promote { "promoted" } else { "demoted" }, name);
            }
        }

        Ok(rsc.placements.clone())
    }
}

// =============================================================================
// HA Config Store
// =============================================================================

#[async_trait]
impl HaConfigStore for InMemoryCluster {
    async fn find(&self, id: &str) -> Result<Option<StoredConfig>> {
        let path = config_path(id);
        let state = self.state.read().await;
        let Some(stored) = state.configs.get(&path) else {
            return Ok(None);
        };
        Ok(Some(StoredConfig {
            config: PromoterConfig::from_toml(&stored.content)?,
            path,
            attached: stored.attached,
        }))
    }

    async fn list(&self) -> Result<Vec<StoredConfig>> {
        let state = self.state.read().await;
        let mut configs = Vec::new();
        for (path, stored) in &state.configs {
            match PromoterConfig::from_toml(&stored.content) {
                Ok(config) => configs.push(StoredConfig {
                    config,
                    path: path.clone(),
                    attached: stored.attached,
                }),
                Err(e) => warn!("Skipping unreadable promoter config {}: {}", path, e),
            }
        }
        Ok(configs)
    }

    async fn ensure(&self, config: &PromoterConfig) -> Result<()> {
        let content = config.to_toml()?;
        let mut state = self.state.write().await;
        let path = config.path();
        info!("Writing promoter config {}", path);
        let attached = state.configs.get(&path).map(|c| c.attached).unwrap_or(false);
        state.configs.insert(path, SimConfig { content, attached });
        self.config_written();
        Ok(())
    }

    async fn attach(&self, config: &PromoterConfig) -> Result<()> {
        let content = config.to_toml()?;
        let mut state = self.state.write().await;
        info!("Attaching promoter config {}", config.id);
        state.configs.insert(config.path(), SimConfig { content, attached: true });
        state.schedule(config, true);
        self.config_written();
        Ok(())
    }

    async fn detach(&self, config: &PromoterConfig) -> Result<()> {
        let mut state = self.state.write().await;
        let stored = state
            .configs
            .get_mut(&config.path())
            .ok_or_else(|| Error::not_found("promoter-config", &config.id))?;
        info!("Detaching promoter config {}", config.id);
        stored.attached = false;
        state.schedule(config, false);
        self.config_written();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let Some(stored) = state.configs.remove(&config_path(id)) else {
            return Ok(());
        };
        info!("Deleting promoter config {}", id);
        if let Ok(config) = PromoterConfig::from_toml(&stored.content) {
            state.schedule(&config, false);
        }
        self.config_written();
        Ok(())
    }
}
