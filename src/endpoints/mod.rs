//! Endpoint Types
//!
//! Every endpoint type (iSCSI target, NFS export, NVMe-oF subsystem) is a
//! resource descriptor plus a small capability set: its naming template, the
//! agent signature that must be unique cluster-wide (if any), and the
//! translation to and from a promoter configuration. The lifecycle logic is
//! shared and lives in [`crate::controlplane::Reconciler`].

pub mod iscsi;
pub mod nfs;
pub mod nvmeof;

pub use iscsi::{Iqn, IscsiTarget};
pub use nfs::NfsExport;
pub use nvmeof::{NvmeSubsystem, Nqn};

use crate::domain::model::{
    cluster_private_volume, ResourceStatus, VolumeConfig, DEFAULT_RESOURCE_GROUP,
};
use crate::domain::ports::{Resource, ResourceDefinition, VolumeDefinition};
use crate::error::{Error, Result};
use crate::promoter::{agent, PromoterConfig, ResourceAgent};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use uuid::Uuid;

/// Mount point of the cluster-private volume on the promoted node
pub const CLUSTER_PRIVATE_MOUNT: &str = "/srv/ha/internal";

/// Capabilities the generic reconciler needs from an endpoint type
pub trait Endpoint: Clone + Debug + PartialEq + Serialize + Send + Sync + 'static {
    /// User-facing identity, the reconciliation key
    type Id: Clone + Debug + Display + Send + Sync;

    /// Protocol name used in messages
    const PROTOCOL: &'static str;

    /// Prefix of the naming template `{prefix}-{resource}`
    const ID_PREFIX: &'static str;

    /// Agent that may only exist once cluster-wide
    const EXCLUSIVE_AGENT: Option<&'static str> = None;

    fn parse_id(raw: &str) -> Result<Self::Id>;

    fn id(&self) -> &Self::Id;

    /// Name of the storage resource backing the endpoint
    fn resource_name(id: &Self::Id) -> String;

    fn fill_defaults(&mut self);

    fn validate(&self) -> Result<()>;

    /// User-visible volumes, sorted, never containing volume 0
    fn volumes(&self) -> &[VolumeConfig];

    fn volumes_mut(&mut self) -> &mut Vec<VolumeConfig>;

    fn resource_group(&self) -> &str;

    fn gross_size(&self) -> bool;

    fn status(&self) -> &ResourceStatus;

    fn set_status(&mut self, status: ResourceStatus);

    /// Build the promoter configuration, resolving device paths from `placements`
    fn to_promoter(&self, placements: &[Resource]) -> Result<PromoterConfig>;

    /// Rebuild a descriptor from a stored configuration and deployed state
    fn from_promoter(
        cfg: &PromoterConfig,
        definition: Option<&ResourceDefinition>,
        volume_definitions: &[VolumeDefinition],
    ) -> Result<Self>;

    /// Descriptor fields kept as resource definition properties
    ///
    /// For settings the promoter configuration cannot carry on its own.
    fn definition_props(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// HA configuration object identifier
    fn config_id(id: &Self::Id) -> String {
        format!("{}-{}", Self::ID_PREFIX, Self::resource_name(id))
    }

    /// Reverse of [`Endpoint::config_id`]: the resource name, if the id fits
    fn parse_config_id(config_id: &str) -> Option<&str> {
        config_id
            .strip_prefix(Self::ID_PREFIX)
            .and_then(|rest| rest.strip_prefix('-'))
            .filter(|rest| !rest.is_empty())
    }

    /// Volume set at the storage layer, cluster-private volume first
    fn storage_volumes(&self) -> Vec<VolumeConfig> {
        std::iter::once(cluster_private_volume())
            .chain(self.volumes().iter().cloned())
            .collect()
    }

    /// Field-by-field comparison ignoring status
    fn matches(&self, other: &Self) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.set_status(ResourceStatus::default());
        b.set_status(ResourceStatus::default());
        a == b
    }
}

// =============================================================================
// Shared Helpers
// =============================================================================

/// Storage resource names: a letter, then letters, digits, `_` or `-`
pub fn validate_resource_name(name: &str) -> Result<()> {
    const MAX_LEN: usize = 48;

    let mut chars = name.chars();
    match chars.next() {
        None => return Err(Error::Validation("name must not be empty".into())),
        Some(c) if !c.is_ascii_alphabetic() => {
            return Err(Error::Validation(format!(
                "name '{}' must start with a letter",
                name
            )))
        }
        _ => {}
    }
    if name.len() > MAX_LEN {
        return Err(Error::Validation(format!(
            "name '{}' is longer than {} characters",
            name, MAX_LEN
        )));
    }
    if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-')) {
        return Err(Error::Validation(format!(
            "name '{}' contains invalid character '{}'",
            name, bad
        )));
    }
    Ok(())
}

pub(crate) fn resource_group_of(definition: Option<&ResourceDefinition>) -> String {
    definition
        .map(|d| d.resource_group.clone())
        .filter(|g| !g.is_empty())
        .unwrap_or_else(|| DEFAULT_RESOURCE_GROUP.to_string())
}

/// Whether the data volumes were sized gross
pub(crate) fn gross_size_of(volume_definitions: &[VolumeDefinition]) -> bool {
    volume_definitions.iter().any(|vd| vd.number != 0 && vd.gross)
}

/// Attach sizes from the volume definitions to the numbers found in the agents
///
/// A number without a definition gets size 0, which never matches a request.
pub(crate) fn volumes_with_sizes(
    numbers: impl IntoIterator<Item = (u32, Option<String>)>,
    volume_definitions: &[VolumeDefinition],
) -> Vec<VolumeConfig> {
    let mut volumes: Vec<VolumeConfig> = numbers
        .into_iter()
        .filter(|(number, _)| *number != 0)
        .map(|(number, file_system)| VolumeConfig {
            number,
            size_kib: volume_definitions
                .iter()
                .find(|vd| vd.number == number)
                .map(|vd| vd.size_kib)
                .unwrap_or(0),
            file_system,
        })
        .collect();
    volumes.sort_by_key(|v| v.number);
    volumes
}

/// Agents every endpoint starts with: cluster-private mount, port block, IPs
pub(crate) fn leading_agents(
    resource: &str,
    service_ips: &[crate::domain::model::ServiceIp],
    ports: &str,
    placements: &[Resource],
) -> Vec<ResourceAgent> {
    let mut agents = vec![agent::filesystem(
        "fs_cluster_private",
        &agent::device_path(resource, 0, placements),
        &format!("{}/{}", CLUSTER_PRIVATE_MOUNT, resource),
        "ext4",
    )];
    for (i, ip) in service_ips.iter().enumerate() {
        agents.push(agent::portblock(&format!("portblock{}", i), ip, ports, "block"));
    }
    for (i, ip) in service_ips.iter().enumerate() {
        agents.push(agent::service_ip(i, ip));
    }
    agents
}

/// Agents every endpoint ends with: unblock the ports again
pub(crate) fn trailing_agents(
    service_ips: &[crate::domain::model::ServiceIp],
    ports: &str,
) -> Vec<ResourceAgent> {
    service_ips
        .iter()
        .enumerate()
        .map(|(i, ip)| agent::portblock(&format!("portunblock{}", i), ip, ports, "unblock"))
        .collect()
}

/// Name-based (SHA-1) UUID below the namespace derived from `domain`
///
/// Identifiers the HA daemon hands to initiators are derived from names so
/// they survive a failover and a recreate.
pub(crate) fn derived_uuid(domain: &str, name: &str) -> Uuid {
    let namespace = Uuid::new_v5(&Uuid::nil(), domain.as_bytes());
    Uuid::new_v5(&namespace, name.as_bytes())
}

/// Check that the config id agrees with the resource it manages
pub(crate) fn check_config_id<E: Endpoint>(cfg: &PromoterConfig, id: &E::Id) -> Result<()> {
    let expected = E::config_id(id);
    if cfg.id != expected {
        return Err(Error::PromoterDecode(format!(
            "config id '{}' does not match {} resource '{}'",
            cfg.id,
            E::PROTOCOL,
            expected
        )));
    }
    Ok(())
}
