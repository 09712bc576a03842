//! NVMe-oF Subsystems
//!
//! A subsystem is identified by its NQN; the storage resource is named after
//! the subsystem part (`nqn.2021-08.com.example:nvme:vol1` -> `vol1`). Each
//! volume is exported as a namespace with the volume number as namespace id.

use super::{
    check_config_id, derived_uuid, gross_size_of, leading_agents, resource_group_of,
    trailing_agents, validate_resource_name, volumes_with_sizes, Endpoint,
};
use crate::domain::model::{
    sort_volumes, validate_volumes, ResourceStatus, ServiceIp, VolumeConfig,
    DEFAULT_RESOURCE_GROUP,
};
use crate::domain::ports::{Resource, ResourceDefinition, VolumeDefinition};
use crate::error::{Error, Result};
use crate::promoter::{agent, PromoterConfig, ResourceAgent};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Default NVMe/TCP service port
pub const DEFAULT_PORT: u16 = 4420;

/// Namespace for identifiers derived from names
const UUID_DOMAIN: &str = "nvmeof.gateway.linstor.linbit.com";

// =============================================================================
// NQN
// =============================================================================

/// NVMe qualified name: `nqn.YYYY-MM.reversed.domain:...:subsystem`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Nqn(String);

impl Nqn {
    /// The last colon-separated part, used as storage resource name
    pub fn subsystem(&self) -> &str {
        self.0.rsplit_once(':').map(|(_, s)| s).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Nqn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: &str| Error::Validation(format!("invalid NQN '{}': {}", s, why));

        if s.len() > 223 {
            return Err(invalid("longer than 223 bytes"));
        }
        let rest = s
            .strip_prefix("nqn.")
            .ok_or_else(|| invalid("must start with 'nqn.'"))?;
        let (prefix, subsystem) = rest
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing ':' before the subsystem name"))?;
        let date = prefix.get(..7).unwrap_or_default();
        let date_ok = date.len() == 7
            && date.as_bytes()[4] == b'-'
            && date
                .chars()
                .enumerate()
                .all(|(i, c)| i == 4 || c.is_ascii_digit())
            && prefix[7..].starts_with('.')
            && prefix.len() > 8;
        if !date_ok {
            return Err(invalid("expected 'nqn.YYYY-MM.<domain>'"));
        }
        validate_resource_name(subsystem).map_err(|e| invalid(&e.to_string()))?;

        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for Nqn {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Nqn> for String {
    fn from(nqn: Nqn) -> Self {
        nqn.0
    }
}

impl std::fmt::Display for Nqn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// NVMe-oF Subsystem
// =============================================================================

/// A highly available NVMe-oF subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NvmeSubsystem {
    pub nqn: Nqn,
    pub service_ips: Vec<ServiceIp>,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
    #[serde(default)]
    pub resource_group: String,
    #[serde(default)]
    pub gross_size: bool,
    #[serde(default)]
    pub status: ResourceStatus,
}

impl NvmeSubsystem {
    pub fn new(nqn: Nqn, service_ips: Vec<ServiceIp>, volumes: Vec<VolumeConfig>) -> Self {
        Self {
            nqn,
            service_ips,
            port: 0,
            volumes,
            resource_group: String::new(),
            gross_size: false,
            status: ResourceStatus::default(),
        }
    }
}

impl Endpoint for NvmeSubsystem {
    type Id = Nqn;

    const PROTOCOL: &'static str = "NVMe-oF";
    const ID_PREFIX: &'static str = "nvmeof";

    fn parse_id(raw: &str) -> Result<Nqn> {
        raw.parse()
    }

    fn id(&self) -> &Nqn {
        &self.nqn
    }

    fn resource_name(id: &Nqn) -> String {
        id.subsystem().to_string()
    }

    fn fill_defaults(&mut self) {
        if self.resource_group.is_empty() {
            self.resource_group = DEFAULT_RESOURCE_GROUP.to_string();
        }
        if self.port == 0 {
            self.port = DEFAULT_PORT;
        }
        // namespaces are exported raw
        for vol in &mut self.volumes {
            vol.file_system = None;
        }
        sort_volumes(&mut self.volumes);
    }

    fn validate(&self) -> Result<()> {
        validate_resource_name(self.nqn.subsystem())?;
        if self.service_ips.is_empty() {
            return Err(Error::Validation(
                "NVMe-oF subsystem needs at least one service IP".into(),
            ));
        }
        if self.port == 0 {
            return Err(Error::Validation("port must not be 0".into()));
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

    fn to_promoter(&self, placements: &[Resource]) -> Result<PromoterConfig> {
        let resource = Self::resource_name(&self.nqn);
        let ports = self.port.to_string();
        let mut agents = leading_agents(&resource, &self.service_ips, &ports, placements);

        let serial = derived_uuid(UUID_DOMAIN, self.nqn.as_str()).as_u64_pair().0;
        agents.push(
            ResourceAgent::new(agent::NVMET_SUBSYSTEM, "subsys")
                .attr("nqn", self.nqn.as_str())
                .attr("serial", format!("{:016x}", serial))
                .attr("allowed_hosts", ""),
        );

        for vol in &self.volumes {
            agents.push(
                ResourceAgent::new(agent::NVMET_NAMESPACE, format!("ns{}", vol.number))
                    .attr("nqn", self.nqn.as_str())
                    .attr("namespace_id", vol.number.to_string())
                    .attr(
                        "uuid",
                        derived_uuid(UUID_DOMAIN, &format!("{}/{}", self.nqn, vol.number)).to_string(),
                    )
                    .attr("backing_path", agent::device_path(&resource, vol.number, placements)),
            );
        }

        for (i, ip) in self.service_ips.iter().enumerate() {
            let family = if ip.addr.is_ipv4() { "ipv4" } else { "ipv6" };
            agents.push(
                ResourceAgent::new(agent::NVMET_PORT, format!("port{}", i))
                    .attr("nqns", self.nqn.as_str())
                    .attr("addr", ip.addr.to_string())
                    .attr("svcid", ports.clone())
                    .attr("type", "tcp")
                    .attr("addr_fam", family),
            );
        }

        agents.extend(trailing_agents(&self.service_ips, &ports));

        Ok(PromoterConfig::single(Self::config_id(&self.nqn), resource, agents))
    }

    fn from_promoter(
        cfg: &PromoterConfig,
        definition: Option<&ResourceDefinition>,
        volume_definitions: &[VolumeDefinition],
    ) -> Result<Self> {
        let (resource_name, resource) = cfg.resource()?;

        let subsystem = resource
            .start
            .iter()
            .find(|a| a.agent_type == agent::NVMET_SUBSYSTEM)
            .ok_or_else(|| {
                Error::PromoterDecode(format!("config '{}' has no NVMe-oF subsystem agent", cfg.id))
            })?;

        let nqn = subsystem
            .require("nqn")?
            .parse::<Nqn>()
            .map_err(|e| Error::PromoterDecode(e.to_string()))?;
        if nqn.subsystem() != resource_name {
            return Err(Error::PromoterDecode(format!(
                "subsystem {} does not belong to resource '{}'",
                nqn, resource_name
            )));
        }
        check_config_id::<Self>(cfg, &nqn)?;

        let port = resource
            .start
            .iter()
            .find(|a| a.agent_type == agent::NVMET_PORT)
            .ok_or_else(|| {
                Error::PromoterDecode(format!("config '{}' has no NVMe-oF port agent", cfg.id))
            })?
            .require_parsed::<u16>("svcid")?;

        let mut namespaces = Vec::new();
        for ns in resource.start.iter().filter(|a| a.agent_type == agent::NVMET_NAMESPACE) {
            namespaces.push((ns.require_parsed::<u32>("namespace_id")?, None));
        }

        Ok(Self {
            service_ips: agent::parse_service_ips(resource.start.iter())?,
            port,
            volumes: volumes_with_sizes(namespaces, volume_definitions),
            resource_group: resource_group_of(definition),
            gross_size: gross_size_of(volume_definitions),
            status: ResourceStatus::default(),
            nqn,
        })
    }
}
