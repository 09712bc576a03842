//! iSCSI Targets
//!
//! A target is identified by its IQN. The storage resource is named after the
//! IQN's unique part, so `iqn.2019-08.com.example:disk1` is backed by resource
//! `disk1` and stored as config `iscsi-disk1`. Each volume becomes a logical
//! unit whose LUN is the volume number.

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

const ISCSI_PORTS: &str = "3260";
const IMPLEMENTATION: &str = "lio-t";
const PRODUCT_ID: &str = "HA iSCSI";

/// Namespace for identifiers derived from names
const UUID_DOMAIN: &str = "iscsi.gateway.linstor.linbit.com";

// =============================================================================
// IQN
// =============================================================================

/// iSCSI qualified name: `iqn.YYYY-MM.reversed.domain:unique`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Iqn(String);

impl Iqn {
    /// The part after the colon, used as storage resource name
    pub fn wwn(&self) -> &str {
        self.0.split_once(':').map(|(_, wwn)| wwn).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Iqn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: &str| Error::Validation(format!("invalid IQN '{}': {}", s, why));

        let rest = s
            .strip_prefix("iqn.")
            .ok_or_else(|| invalid("must start with 'iqn.'"))?;
        let (prefix, wwn) = rest
            .split_once(':')
            .ok_or_else(|| invalid("missing ':' before the unique name"))?;
        let (date, authority) = prefix
            .split_once('.')
            .ok_or_else(|| invalid("missing naming authority"))?;

        let date_ok = date.len() == 7
            && date.as_bytes()[4] == b'-'
            && date
                .chars()
                .enumerate()
                .all(|(i, c)| i == 4 || c.is_ascii_digit());
        if !date_ok {
            return Err(invalid("date must have the form YYYY-MM"));
        }
        if authority.is_empty() {
            return Err(invalid("empty naming authority"));
        }
        validate_resource_name(wwn).map_err(|e| invalid(&e.to_string()))?;

        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for Iqn {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Iqn> for String {
    fn from(iqn: Iqn) -> Self {
        iqn.0
    }
}

impl std::fmt::Display for Iqn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// iSCSI Target
// =============================================================================

/// A highly available iSCSI target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IscsiTarget {
    pub iqn: Iqn,
    pub service_ips: Vec<ServiceIp>,
    /// CHAP user name; set together with `password`
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Initiators allowed to log in; empty allows all
    #[serde(default)]
    pub allowed_initiators: Vec<Iqn>,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
    #[serde(default)]
    pub resource_group: String,
    #[serde(default)]
    pub gross_size: bool,
    #[serde(default)]
    pub status: ResourceStatus,
}

impl IscsiTarget {
    pub fn new(iqn: Iqn, service_ips: Vec<ServiceIp>, volumes: Vec<VolumeConfig>) -> Self {
        Self {
            iqn,
            service_ips,
            username: String::new(),
            password: String::new(),
            allowed_initiators: Vec::new(),
            volumes,
            resource_group: String::new(),
            gross_size: false,
            status: ResourceStatus::default(),
        }
    }

    fn portals(&self) -> String {
        self.service_ips
            .iter()
            .map(|ip| match ip.addr {
                std::net::IpAddr::V4(a) => format!("{}:{}", a, ISCSI_PORTS),
                std::net::IpAddr::V6(a) => format!("[{}]:{}", a, ISCSI_PORTS),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Endpoint for IscsiTarget {
    type Id = Iqn;

    const PROTOCOL: &'static str = "iSCSI";
    const ID_PREFIX: &'static str = "iscsi";

    fn parse_id(raw: &str) -> Result<Iqn> {
        raw.parse()
    }

    fn id(&self) -> &Iqn {
        &self.iqn
    }

    fn resource_name(id: &Iqn) -> String {
        id.wwn().to_string()
    }

    fn fill_defaults(&mut self) {
        if self.resource_group.is_empty() {
            self.resource_group = DEFAULT_RESOURCE_GROUP.to_string();
        }
        // LUNs are exported raw
        for vol in &mut self.volumes {
            vol.file_system = None;
        }
        sort_volumes(&mut self.volumes);
    }

    fn validate(&self) -> Result<()> {
        validate_resource_name(self.iqn.wwn())?;
        if self.service_ips.is_empty() {
            return Err(Error::Validation("iSCSI target needs at least one service IP".into()));
        }
        if self.username.is_empty() != self.password.is_empty() {
            return Err(Error::Validation(
                "CHAP username and password must be set together".into(),
            ));
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
        let resource = Self::resource_name(&self.iqn);
        let mut agents = leading_agents(&resource, &self.service_ips, ISCSI_PORTS, placements);

        let mut target = ResourceAgent::new(agent::ISCSI_TARGET, "target")
            .attr("iqn", self.iqn.as_str())
            .attr("implementation", IMPLEMENTATION)
            .attr("portals", self.portals());
        if !self.username.is_empty() {
            target = target
                .attr("incoming_username", self.username.clone())
                .attr("incoming_password", self.password.clone());
        }
        if !self.allowed_initiators.is_empty() {
            let initiators: Vec<&str> = self.allowed_initiators.iter().map(Iqn::as_str).collect();
            target = target.attr("allowed_initiators", initiators.join(" "));
        }
        agents.push(target);

        for vol in &self.volumes {
            let serial = derived_uuid(UUID_DOMAIN, &format!("{}/{}", self.iqn, vol.number))
                .as_fields()
                .0;
            agents.push(
                ResourceAgent::new(agent::ISCSI_LOGICAL_UNIT, format!("lu{}", vol.number))
                    .attr("target_iqn", self.iqn.as_str())
                    .attr("lun", vol.number.to_string())
                    .attr("path", agent::device_path(&resource, vol.number, placements))
                    .attr("product_id", PRODUCT_ID)
                    .attr("scsi_sn", format!("{:08x}", serial))
                    .attr("implementation", IMPLEMENTATION),
            );
        }

        agents.extend(trailing_agents(&self.service_ips, ISCSI_PORTS));

        Ok(PromoterConfig::single(Self::config_id(&self.iqn), resource, agents))
    }

    fn from_promoter(
        cfg: &PromoterConfig,
        definition: Option<&ResourceDefinition>,
        volume_definitions: &[VolumeDefinition],
    ) -> Result<Self> {
        let (resource_name, resource) = cfg.resource()?;

        let target = resource
            .start
            .iter()
            .find(|a| a.agent_type == agent::ISCSI_TARGET)
            .ok_or_else(|| {
                Error::PromoterDecode(format!("config '{}' has no iSCSI target agent", cfg.id))
            })?;

        let iqn = target
            .require("iqn")?
            .parse::<Iqn>()
            .map_err(|e| Error::PromoterDecode(e.to_string()))?;
        if iqn.wwn() != resource_name {
            return Err(Error::PromoterDecode(format!(
                "target {} does not belong to resource '{}'",
                iqn, resource_name
            )));
        }
        check_config_id::<Self>(cfg, &iqn)?;

        let allowed_initiators = target
            .get("allowed_initiators")
            .unwrap_or_default()
            .split_whitespace()
            .map(|raw| raw.parse::<Iqn>())
            .collect::<Result<Vec<_>>>()
            .map_err(|e| Error::PromoterDecode(e.to_string()))?;

        let mut luns = Vec::new();
        for lu in resource.start.iter().filter(|a| a.agent_type == agent::ISCSI_LOGICAL_UNIT) {
            luns.push((lu.require_parsed::<u32>("lun")?, None));
        }

        Ok(Self {
            service_ips: agent::parse_service_ips(resource.start.iter())?,
            username: target.get("incoming_username").unwrap_or_default().to_string(),
            password: target.get("incoming_password").unwrap_or_default().to_string(),
            allowed_initiators,
            volumes: volumes_with_sizes(luns, volume_definitions),
            resource_group: resource_group_of(definition),
            gross_size: gross_size_of(volume_definitions),
            status: ResourceStatus::default(),
            iqn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn target() -> IscsiTarget {
        let mut t = IscsiTarget::new(
            "iqn.2019-08.com.example:disk1".parse().unwrap(),
            vec!["192.168.122.181/24".parse().unwrap()],
            vec![VolumeConfig::new(2, 4096), VolumeConfig::new(1, 2048)],
        );
        t.fill_defaults();
        t
    }

    #[test]
    fn test_iqn_parse() {
        let iqn: Iqn = "iqn.2019-08.com.example:disk1".parse().unwrap();
        assert_eq!(iqn.wwn(), "disk1");

        assert_matches!("iqn.2019-08.com.example".parse::<Iqn>(), Err(Error::Validation(_)));
        assert_matches!("eui.02004567A425678D".parse::<Iqn>(), Err(Error::Validation(_)));
        assert_matches!("iqn.19-08.com.example:a".parse::<Iqn>(), Err(Error::Validation(_)));
        assert_matches!("iqn.2019-08.:a".parse::<Iqn>(), Err(Error::Validation(_)));
        assert_matches!("iqn.2019-08.com.example:1a".parse::<Iqn>(), Err(Error::Validation(_)));
    }

    #[test]
    fn test_fill_defaults_sorts_volumes() {
        let t = target();
        assert_eq!(t.resource_group, "DfltRscGrp");
        assert_eq!(t.volumes[0].number, 1);
        assert_eq!(t.volumes[1].number, 2);
    }

    #[test]
    fn test_fill_defaults_drops_file_system() {
        let mut t = IscsiTarget::new(
            "iqn.2019-08.com.example:disk1".parse().unwrap(),
            vec!["192.168.122.181/24".parse().unwrap()],
            vec![VolumeConfig::new(1, 2048).with_file_system("xfs")],
        );
        t.fill_defaults();
        assert_eq!(t.volumes[0].file_system, None);

        let cfg = t.to_promoter(&[]).unwrap();
        let vds = vec![
            VolumeDefinition { number: 0, size_kib: 65536, gross: false },
            VolumeDefinition { number: 1, size_kib: 2048, gross: false },
        ];
        assert!(IscsiTarget::from_promoter(&cfg, None, &vds).unwrap().matches(&t));
    }

    #[test]
    fn test_scsi_serial_is_name_based() {
        let cfg = target().to_promoter(&[]).unwrap();
        let serial = |name: &str| {
            cfg.agents()
                .find(|a| a.name == name)
                .and_then(|a| a.require("scsi_sn").ok())
                .map(str::to_string)
                .unwrap()
        };

        let expected = derived_uuid(UUID_DOMAIN, "iqn.2019-08.com.example:disk1/1").as_fields().0;
        assert_eq!(serial("lu1"), format!("{:08x}", expected));
        assert_ne!(serial("lu1"), serial("lu2"));
        assert_eq!(target().to_promoter(&[]).unwrap(), cfg);
    }

    #[test]
    fn test_validate_chap_pair() {
        let mut t = target();
        t.username = "user".into();
        assert_matches!(t.validate(), Err(Error::Validation(_)));

        t.password = "secret".into();
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_translate_both_ways() {
        let mut t = target();
        t.username = "user".into();
        t.password = "pass word".into();
        t.allowed_initiators = vec!["iqn.2020-01.org.client:host1".parse().unwrap()];

        let cfg = t.to_promoter(&[]).unwrap();
        assert_eq!(cfg.id, "iscsi-disk1");
        assert!(cfg.resources.contains_key("disk1"));

        let vds = vec![
            VolumeDefinition { number: 0, size_kib: 65536, gross: false },
            VolumeDefinition { number: 1, size_kib: 2048, gross: false },
            VolumeDefinition { number: 2, size_kib: 4096, gross: false },
        ];
        let back = IscsiTarget::from_promoter(&cfg, None, &vds).unwrap();
        assert!(back.matches(&t));
    }

    #[test]
    fn test_from_promoter_rejects_nfs_config() {
        let mut nfs = crate::endpoints::NfsExport::new(
            "disk1",
            "10.0.0.1/24".parse().unwrap(),
            vec![],
        );
        nfs.fill_defaults();
        let cfg = nfs.to_promoter(&[]).unwrap();

        assert_matches!(
            IscsiTarget::from_promoter(&cfg, None, &[]),
            Err(Error::PromoterDecode(_))
        );
    }
}
