//! NFS Exports
//!
//! An NFS export is a set of volumes, each formatted and exported under
//! `/srv/gateway-exports{export_path}/vol{N}`, served by a single NFS server
//! instance. Only one NFS export may exist per cluster because the server
//! keeps its state on the export's cluster-private volume.

use super::{
    check_config_id, derived_uuid, gross_size_of, leading_agents, resource_group_of,
    trailing_agents, validate_resource_name, volumes_with_sizes, Endpoint, CLUSTER_PRIVATE_MOUNT,
};
use crate::domain::model::{
    sort_volumes, validate_volumes, ResourceStatus, ServiceIp, VolumeConfig,
    DEFAULT_RESOURCE_GROUP,
};
use crate::domain::ports::{Resource, ResourceDefinition, VolumeDefinition};
use crate::error::{Error, Result};
use crate::promoter::{agent, PromoterConfig, ResourceAgent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Directory all export mount points live under
pub const EXPORT_ROOT: &str = "/srv/gateway-exports";

const NFS_PORTS: &str = "2049";
const DEFAULT_FILE_SYSTEM: &str = "ext4";

/// Resource definition properties holding settings that outlive the volumes
const EXPORT_PATH_PROP: &str = "Aux/gateway/nfs-export-path";
const ALLOWED_IPS_PROP: &str = "Aux/gateway/nfs-allowed-ips";

/// Namespace for identifiers derived from names
const UUID_DOMAIN: &str = "nfs.gateway.linstor.linbit.com";

/// A highly available NFS export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NfsExport {
    pub name: String,
    pub service_ips: Vec<ServiceIp>,
    /// Path below the export root; defaults to `/{name}`
    #[serde(default)]
    pub export_path: String,
    /// Networks allowed to mount; defaults to everyone
    #[serde(default)]
    pub allowed_ips: Vec<ServiceIp>,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
    #[serde(default)]
    pub resource_group: String,
    #[serde(default)]
    pub gross_size: bool,
    #[serde(default)]
    pub status: ResourceStatus,
}

impl NfsExport {
    pub fn new(name: impl Into<String>, service_ip: ServiceIp, volumes: Vec<VolumeConfig>) -> Self {
        Self {
            name: name.into(),
            service_ips: vec![service_ip],
            export_path: String::new(),
            allowed_ips: Vec::new(),
            volumes,
            resource_group: String::new(),
            gross_size: false,
            status: ResourceStatus::default(),
        }
    }

    fn volume_directory(&self, number: u32) -> String {
        format!("{}{}/vol{}", EXPORT_ROOT, self.export_path, number)
    }

    fn default_export_path(name: &str) -> String {
        format!("/{}", name)
    }
}

impl Endpoint for NfsExport {
    type Id = String;

    const PROTOCOL: &'static str = "NFS";
    const ID_PREFIX: &'static str = "nfs";
    const EXCLUSIVE_AGENT: Option<&'static str> = Some(agent::NFSSERVER);

    fn parse_id(raw: &str) -> Result<String> {
        validate_resource_name(raw)?;
        Ok(raw.to_string())
    }

    fn id(&self) -> &String {
        &self.name
    }

    fn resource_name(id: &String) -> String {
        id.clone()
    }

    fn fill_defaults(&mut self) {
        if self.resource_group.is_empty() {
            self.resource_group = DEFAULT_RESOURCE_GROUP.to_string();
        }
        if self.export_path.is_empty() {
            self.export_path = Self::default_export_path(&self.name);
        }
        if self.allowed_ips.is_empty() {
            self.allowed_ips.push(ServiceIp::any_v4());
        }
        for vol in &mut self.volumes {
            if vol.file_system.is_none() {
                vol.file_system = Some(DEFAULT_FILE_SYSTEM.to_string());
            }
        }
        sort_volumes(&mut self.volumes);
    }

    fn validate(&self) -> Result<()> {
        validate_resource_name(&self.name)?;
        if self.service_ips.len() != 1 {
            return Err(Error::Validation(format!(
                "NFS export needs exactly one service IP, got {}",
                self.service_ips.len()
            )));
        }
        if !self.export_path.starts_with('/')
            || self.export_path.contains("//")
            || self.export_path.split('/').any(|c| c == ".." || c == ".")
        {
            return Err(Error::Validation(format!(
                "export path '{}' must be an absolute, normalized path",
                self.export_path
            )));
        }
        if self.export_path.len() > 1 && self.export_path.ends_with('/') {
            return Err(Error::Validation(format!(
                "export path '{}' must not end with '/'",
                self.export_path
            )));
        }
        validate_volumes(&self.volumes)
    }

    fn volumes(&self) -> &[VolumeConfig] {
        &self.volumes
    }

    fn volumes_mut(&mut self) -> &mut Vec<VolumeConfig> {
        &mut self.volumes
    }

    fn resource_group(&self) -> &str {
        &self.resource_group
    }

    fn gross_size(&self) -> bool {
        self.gross_size
    }

    fn status(&self) -> &ResourceStatus {
        &self.status
    }

    fn set_status(&mut self, status: ResourceStatus) {
        self.status = status;
    }

    fn definition_props(&self) -> BTreeMap<String, String> {
        let allowed: Vec<String> = self.allowed_ips.iter().map(ToString::to_string).collect();
        BTreeMap::from([
            (EXPORT_PATH_PROP.to_string(), self.export_path.clone()),
            (ALLOWED_IPS_PROP.to_string(), allowed.join(",")),
        ])
    }

    fn to_promoter(&self, placements: &[Resource]) -> Result<PromoterConfig> {
        let service_ip = self
            .service_ips
            .first()
            .ok_or_else(|| Error::Validation("NFS export needs a service IP".into()))?;
        let mut agents = leading_agents(&self.name, &self.service_ips, NFS_PORTS, placements);

        let info_dir = format!("{}/{}/nfs", CLUSTER_PRIVATE_MOUNT, self.name);
        agents.push(
            ResourceAgent::new(agent::NFSSERVER, "nfsserver")
                .attr("nfs_ip", service_ip.addr.to_string())
                .attr("nfs_shared_infodir", info_dir)
                .attr("nfs_server_scope", service_ip.addr.to_string()),
        );

        for vol in &self.volumes {
            agents.push(agent::filesystem(
                &format!("fs_{}", vol.number),
                &agent::device_path(&self.name, vol.number, placements),
                &self.volume_directory(vol.number),
                vol.file_system.as_deref().unwrap_or(DEFAULT_FILE_SYSTEM),
            ));
        }

        for vol in &self.volumes {
            let directory = self.volume_directory(vol.number);
            let fsid = derived_uuid(UUID_DOMAIN, &format!("{}/{}", self.name, vol.number))
                .as_fields()
                .0;
            for (i, allowed) in self.allowed_ips.iter().enumerate() {
                agents.push(
                    ResourceAgent::new(agent::EXPORTFS, format!("export_{}_{}", vol.number, i))
                        .attr("clientspec", format!("{}/{}", allowed.addr, allowed.netmask()))
                        .attr("allowed_ip", allowed.to_string())
                        .attr("directory", directory.clone())
                        .attr("fsid", fsid.to_string())
                        .attr("options", "rw,all_squash,anonuid=0,anongid=0")
                        .attr("wait_for_leasetime_on_stop", "true"),
                );
            }
        }

        agents.extend(trailing_agents(&self.service_ips, NFS_PORTS));

        Ok(PromoterConfig::single(
            Self::config_id(&self.name),
            self.name.clone(),
            agents,
        ))
    }

    fn from_promoter(
        cfg: &PromoterConfig,
        definition: Option<&ResourceDefinition>,
        volume_definitions: &[VolumeDefinition],
    ) -> Result<Self> {
        let (name, resource) = cfg.resource()?;
        let name = name.to_string();
        check_config_id::<Self>(cfg, &name)?;

        if !resource.start.iter().any(|a| a.agent_type == agent::NFSSERVER) {
            return Err(Error::PromoterDecode(format!(
                "config '{}' has no NFS server agent",
                cfg.id
            )));
        }

        let service_ips = agent::parse_service_ips(resource.start.iter())?;

        let mut numbered = Vec::new();
        for a in resource.start.iter().filter(|a| a.agent_type == agent::FILESYSTEM) {
            let Some(number) = a.name.strip_prefix("fs_").and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            numbered.push((number, Some(a.require("fstype")?.to_string())));
        }
        let volumes = volumes_with_sizes(numbered, volume_definitions);

        let exports: Vec<&ResourceAgent> = resource
            .start
            .iter()
            .filter(|a| a.agent_type == agent::EXPORTFS)
            .collect();

        // settings recorded on the definition win over what the agents show
        let props = definition.map(|d| &d.props);
        let recorded_path = props.and_then(|p| p.get(EXPORT_PATH_PROP));
        let export_path = match (recorded_path, exports.first(), volumes.first()) {
            (Some(path), _, _) => path.clone(),
            (None, Some(export), Some(vol)) => {
                let directory = export.require("directory")?;
                let suffix = format!("/vol{}", vol.number);
                directory
                    .strip_prefix(EXPORT_ROOT)
                    .and_then(|p| p.strip_suffix(suffix.as_str()))
                    .map(str::to_string)
                    .ok_or_else(|| {
                        Error::PromoterDecode(format!(
                            "export directory '{}' is outside {}",
                            directory, EXPORT_ROOT
                        ))
                    })?
            }
            _ => Self::default_export_path(&name),
        };

        let mut allowed_ips = Vec::new();
        if let Some(recorded) = props.and_then(|p| p.get(ALLOWED_IPS_PROP)) {
            for ip in recorded.split(',').filter(|ip| !ip.is_empty()) {
                allowed_ips.push(ip.parse::<ServiceIp>().map_err(|e| {
                    Error::PromoterDecode(format!("property {}: {}", ALLOWED_IPS_PROP, e))
                })?);
            }
        } else if let Some(first) = volumes.first() {
            let prefix = format!("export_{}_", first.number);
            for export in exports.iter().filter(|a| a.name.starts_with(&prefix)) {
                let ip = export.require("allowed_ip")?;
                allowed_ips.push(ip.parse::<ServiceIp>().map_err(|e| {
                    Error::PromoterDecode(format!("agent '{}': {}", export.name, e))
                })?);
            }
        }
        if allowed_ips.is_empty() {
            allowed_ips.push(ServiceIp::any_v4());
        }

        Ok(Self {
            name,
            service_ips,
            export_path,
            allowed_ips,
            volumes,
            resource_group: resource_group_of(definition),
            gross_size: gross_size_of(volume_definitions),
            status: ResourceStatus::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn export() -> NfsExport {
        let mut e = NfsExport::new(
            "export1",
            "192.168.1.5/24".parse().unwrap(),
            vec![VolumeConfig::new(1, 2 * 1024 * 1024)],
        );
        e.fill_defaults();
        e
    }

    fn definitions(e: &NfsExport) -> Vec<VolumeDefinition> {
        e.storage_volumes()
            .into_iter()
            .map(|v| VolumeDefinition {
                number: v.number,
                size_kib: v.size_kib,
                gross: false,
            })
            .collect()
    }

    #[test]
    fn test_fill_defaults() {
        let e = export();
        assert_eq!(e.resource_group, "DfltRscGrp");
        assert_eq!(e.export_path, "/export1");
        assert_eq!(e.allowed_ips, vec![ServiceIp::any_v4()]);
        assert_eq!(e.volumes[0].file_system.as_deref(), Some("ext4"));
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let mut e = export();
        e.service_ips.clear();
        assert_matches!(e.validate(), Err(Error::Validation(_)));

        let mut e = export();
        e.export_path = "relative".into();
        assert_matches!(e.validate(), Err(Error::Validation(_)));

        let mut e = export();
        e.export_path = "/a/../b".into();
        assert_matches!(e.validate(), Err(Error::Validation(_)));

        let mut e = export();
        e.name = "bad name".into();
        assert_matches!(e.validate(), Err(Error::Validation(_)));
    }

    #[test]
    fn test_promoter_agent_order() {
        let cfg = export().to_promoter(&[]).unwrap();
        assert_eq!(cfg.id, "nfs-export1");

        let types: Vec<&str> = cfg
            .resource()
            .unwrap()
            .1
            .start
            .iter()
            .map(|a| a.agent_type.as_str())
            .collect();
        assert_eq!(
            types,
            vec![
                agent::FILESYSTEM,
                agent::PORTBLOCK,
                agent::IPADDR2,
                agent::NFSSERVER,
                agent::FILESYSTEM,
                agent::EXPORTFS,
                agent::PORTBLOCK,
            ]
        );
    }

    #[test]
    fn test_translate_both_ways() {
        let mut e = export();
        e.export_path = "/data/share".into();
        e.allowed_ips = vec!["10.0.0.0/8".parse().unwrap(), "172.16.0.0/12".parse().unwrap()];
        e.volumes.push(VolumeConfig::new(3, 1024).with_file_system("xfs"));

        let cfg = e.to_promoter(&[]).unwrap();
        let definition = ResourceDefinition {
            name: "export1".into(),
            resource_group: "DfltRscGrp".into(),
            props: Default::default(),
        };
        let back = NfsExport::from_promoter(&cfg, Some(&definition), &definitions(&e)).unwrap();

        assert!(back.matches(&e));
        assert!(back.volumes.iter().all(|v| v.number != 0));
    }

    #[test]
    fn test_settings_survive_without_volumes() {
        let mut e = export();
        e.export_path = "/data".into();
        e.allowed_ips = vec!["10.0.0.0/8".parse().unwrap(), "172.16.0.0/12".parse().unwrap()];
        e.volumes.clear();

        let cfg = e.to_promoter(&[]).unwrap();
        let definition = ResourceDefinition {
            name: "export1".into(),
            resource_group: "DfltRscGrp".into(),
            props: e.definition_props(),
        };
        let back = NfsExport::from_promoter(&cfg, Some(&definition), &definitions(&e)).unwrap();
        assert!(back.matches(&e));

        // without the properties only the defaults can be recovered
        let bare = NfsExport::from_promoter(&cfg, None, &definitions(&e)).unwrap();
        assert_eq!(bare.export_path, "/export1");
        assert_eq!(bare.allowed_ips, vec![ServiceIp::any_v4()]);
    }

    #[test]
    fn test_from_promoter_rejects_bad_allowed_ips_property() {
        let e = export();
        let cfg = e.to_promoter(&[]).unwrap();
        let mut props = e.definition_props();
        props.insert(ALLOWED_IPS_PROP.into(), "10.0.0.0".into());
        let definition = ResourceDefinition {
            name: "export1".into(),
            resource_group: "DfltRscGrp".into(),
            props,
        };
        assert_matches!(
            NfsExport::from_promoter(&cfg, Some(&definition), &definitions(&e)),
            Err(Error::PromoterDecode(_))
        );
    }

    #[test]
    fn test_from_promoter_rejects_foreign_config() {
        let cfg = PromoterConfig::single(
            "nfs-export1",
            "export1",
            vec![agent::service_ip(0, &"10.0.0.1/24".parse().unwrap())],
        );
        assert_matches!(
            NfsExport::from_promoter(&cfg, None, &[]),
            Err(Error::PromoterDecode(_))
        );
    }

    #[test]
    fn test_config_id_template() {
        assert_eq!(NfsExport::config_id(&"export1".to_string()), "nfs-export1");
        assert_eq!(NfsExport::parse_config_id("nfs-export1"), Some("export1"));
        assert_eq!(NfsExport::parse_config_id("nfs-"), None);
        assert_eq!(NfsExport::parse_config_id("nvmeof-export1"), None);
        assert_eq!(NfsExport::parse_config_id("iscsi-export1"), None);
    }
}
