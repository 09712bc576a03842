//! HA Configuration Objects
//!
//! A promoter configuration tells the HA daemon which service agents to run
//! on the node where a resource is promoted. It is stored as a TOML document:
//!
//! ```toml
//! [[promoter]]
//! id = "nfs-export1"
//!
//! [promoter.resources.export1]
//! start = ["ocf:heartbeat:Filesystem fs_cluster_private device=...", "..."]
//! stop-services-on-exit = true
//! on-drbd-demote-failure = "reboot-immediate"
//! target-as = "Requires"
//! ```

pub mod agent;

pub use agent::ResourceAgent;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Directory the HA daemon loads configuration snippets from
pub const CONFIG_DIR: &str = "/etc/drbd-reactor.d";

/// One declarative promoter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromoterConfig {
    pub id: String,
    #[serde(default)]
    pub resources: BTreeMap<String, PromoterResource>,
}

/// What to run while a single storage resource is promoted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PromoterResource {
    #[serde(default)]
    pub start: Vec<ResourceAgent>,
    #[serde(default)]
    pub stop_services_on_exit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_drbd_demote_failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_as: Option<String>,
}

impl PromoterResource {
    /// Resource settings shared by every gateway endpoint
    pub fn with_agents(start: Vec<ResourceAgent>) -> Self {
        Self {
            start,
            stop_services_on_exit: true,
            on_drbd_demote_failure: Some("reboot-immediate".into()),
            target_as: Some("Requires".into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PromoterFile {
    #[serde(default)]
    promoter: Vec<PromoterConfig>,
}

impl PromoterConfig {
    /// Configuration managing a single storage resource
    pub fn single(id: impl Into<String>, resource: impl Into<String>, start: Vec<ResourceAgent>) -> Self {
        let mut resources = BTreeMap::new();
        resources.insert(resource.into(), PromoterResource::with_agents(start));
        Self {
            id: id.into(),
            resources,
        }
    }

    /// Path the object is stored under
    pub fn path(&self) -> String {
        config_path(&self.id)
    }

    /// The storage resource this configuration manages
    pub fn resource(&self) -> Result<(&str, &PromoterResource)> {
        let mut iter = self.resources.iter();
        match (iter.next(), iter.next()) {
            (Some((name, rsc)), None) => Ok((name.as_str(), rsc)),
            (None, _) => Err(Error::PromoterDecode(format!(
                "promoter config '{}' manages no resource",
                self.id
            ))),
            (Some(_), Some(_)) => Err(Error::PromoterDecode(format!(
                "promoter config '{}' manages more than one resource",
                self.id
            ))),
        }
    }

    /// All start agents across every managed resource
    pub fn agents(&self) -> impl Iterator<Item = &ResourceAgent> {
        self.resources.values().flat_map(|r| r.start.iter())
    }

    pub fn has_agent_type(&self, agent_type: &str) -> bool {
        self.agents().any(|a| a.agent_type == agent_type)
    }

    pub fn to_toml(&self) -> Result<String> {
        let file = PromoterFile {
            promoter: vec![self.clone()],
        };
        Ok(toml::to_string(&file)?)
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        let file: PromoterFile = toml::from_str(s)?;
        let mut promoters = file.promoter.into_iter();
        match (promoters.next(), promoters.next()) {
            (Some(cfg), None) => Ok(cfg),
            _ => Err(Error::PromoterDecode(
                "expected exactly one [[promoter]] section".into(),
            )),
        }
    }
}

/// Storage path for the configuration object with the given id
pub fn config_path(id: &str) -> String {
    format!("{}/linstor-gateway-{}.toml", CONFIG_DIR, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn sample() -> PromoterConfig {
        PromoterConfig::single(
            "nfs-export1",
            "export1",
            vec![
                agent::filesystem("fs_cluster_private", "/dev/drbd/by-res/export1/0", "/srv/ha/internal", "ext4"),
                agent::service_ip(0, &"192.168.1.5/24".parse().unwrap()),
            ],
        )
    }

    #[test]
    fn test_toml_round_trip_keeps_agent_order() {
        let cfg = sample();
        let rendered = cfg.to_toml().unwrap();

        assert!(rendered.contains("[[promoter]]"));
        assert!(rendered.contains("stop-services-on-exit = true"));
        assert!(rendered.contains("target-as = \"Requires\""));

        let parsed = PromoterConfig::from_toml(&rendered).unwrap();
        assert_eq!(parsed, cfg);
        assert_eq!(parsed.resource().unwrap().1.start[0].agent_type, agent::FILESYSTEM);
    }

    #[test]
    fn test_from_toml_rejects_malformed_agent() {
        let doc = r#"
[[promoter]]
id = "nfs-broken"

[promoter.resources.broken]
start = ["ocf:heartbeat:IPaddr2"]
"#;
        assert_matches!(PromoterConfig::from_toml(doc), Err(Error::TomlParse(_)));
    }

    #[test]
    fn test_resource_requires_exactly_one() {
        let mut cfg = sample();
        cfg.resources.insert("other".into(), PromoterResource::with_agents(vec![]));
        assert_matches!(cfg.resource(), Err(Error::PromoterDecode(_)));

        cfg.resources.clear();
        assert_matches!(cfg.resource(), Err(Error::PromoterDecode(_)));
    }

    #[test]
    fn test_config_path() {
        assert_eq!(
            sample().path(),
            "/etc/drbd-reactor.d/linstor-gateway-nfs-export1.toml"
        );
    }
}
