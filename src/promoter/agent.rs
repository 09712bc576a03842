//! Resource agent entries of a promoter configuration
//!
//! An agent is written as a single line: `type name key=value ...`. Values
//! containing whitespace or quotes are wrapped in double quotes with `\"` and
//! `\\` escapes.

use crate::domain::model::ServiceIp;
use crate::domain::ports::Resource;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

pub const FILESYSTEM: &str = "ocf:heartbeat:Filesystem";
pub const IPADDR2: &str = "ocf:heartbeat:IPaddr2";
pub const PORTBLOCK: &str = "ocf:heartbeat:portblock";
pub const NFSSERVER: &str = "ocf:heartbeat:nfsserver";
pub const EXPORTFS: &str = "ocf:heartbeat:exportfs";
pub const ISCSI_TARGET: &str = "ocf:heartbeat:iSCSITarget";
pub const ISCSI_LOGICAL_UNIT: &str = "ocf:heartbeat:iSCSILogicalUnit";
pub const NVMET_SUBSYSTEM: &str = "ocf:heartbeat:nvmet-subsystem";
pub const NVMET_NAMESPACE: &str = "ocf:heartbeat:nvmet-namespace";
pub const NVMET_PORT: &str = "ocf:heartbeat:nvmet-port";

/// One OCF resource agent the HA daemon starts on promotion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceAgent {
    pub agent_type: String,
    pub name: String,
    pub attributes: BTreeMap<String, String>,
}

impl ResourceAgent {
    pub fn new(agent_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Attribute that must be present for the agent to make sense
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            Error::PromoterDecode(format!(
                "agent '{}' ({}) is missing attribute '{}'",
                self.name, self.agent_type, key
            ))
        })
    }

    /// Parse a required numeric attribute
    pub fn require_parsed<T: FromStr>(&self, key: &str) -> Result<T> {
        let raw = self.require(key)?;
        raw.parse().map_err(|_| {
            Error::PromoterDecode(format!(
                "agent '{}' has invalid value '{}' for '{}'",
                self.name, raw, key
            ))
        })
    }
}

impl std::fmt::Display for ResourceAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.agent_type, self.name)?;
        for (key, value) in &self.attributes {
            write!(f, " {}={}", key, quote(value))?;
        }
        Ok(())
    }
}

impl FromStr for ResourceAgent {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let tokens = tokenize(s)?;
        let mut tokens = tokens.into_iter();

        let agent_type = tokens
            .next()
            .ok_or_else(|| Error::PromoterDecode("empty agent entry".into()))?;
        let name = tokens
            .next()
            .ok_or_else(|| Error::PromoterDecode(format!("agent '{}' has no name", agent_type)))?;

        let mut agent = ResourceAgent::new(agent_type, name);
        for token in tokens {
            let (key, value) = token.split_once('=').ok_or_else(|| {
                Error::PromoterDecode(format!("malformed attribute '{}' in '{}'", token, s))
            })?;
            if key.is_empty() {
                return Err(Error::PromoterDecode(format!("empty attribute key in '{}'", s)));
            }
            agent.attributes.insert(key.to_string(), value.to_string());
        }

        Ok(agent)
    }
}

impl TryFrom<String> for ResourceAgent {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ResourceAgent> for String {
    fn from(agent: ResourceAgent) -> Self {
        agent.to_string()
    }
}

fn quote(value: &str) -> String {
    let needs_quotes =
        value.is_empty() || value.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn tokenize(s: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_quotes = false;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                in_token = true;
            }
            '\\' if in_quotes => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => return Err(Error::PromoterDecode(format!("dangling escape in '{}'", s))),
            },
            c if c.is_whitespace() && !in_quotes => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if in_quotes {
        return Err(Error::PromoterDecode(format!("unterminated quote in '{}'", s)));
    }
    if in_token {
        tokens.push(current);
    }

    Ok(tokens)
}

// =============================================================================
// Shared Agent Builders
// =============================================================================

/// Device node of a volume, preferring what a placement reports
pub fn device_path(resource: &str, number: u32, placements: &[Resource]) -> String {
    placements
        .iter()
        .flat_map(|r| r.volumes.iter())
        .find(|v| v.number == number)
        .and_then(|v| v.device_path.clone())
        .unwrap_or_else(|| format!("/dev/drbd/by-res/{}/{}", resource, number))
}

pub fn filesystem(name: &str, device: &str, directory: &str, fstype: &str) -> ResourceAgent {
    ResourceAgent::new(FILESYSTEM, name)
        .attr("device", device)
        .attr("directory", directory)
        .attr("fstype", fstype)
        .attr("run_fsck", "no")
}

/// Block (or unblock) the service ports while the service moves
pub fn portblock(name: &str, ip: &ServiceIp, ports: &str, action: &str) -> ResourceAgent {
    ResourceAgent::new(PORTBLOCK, name)
        .attr("ip", ip.addr.to_string())
        .attr("portno", ports)
        .attr("action", action)
        .attr("protocol", "tcp")
}

pub fn service_ip(index: usize, ip: &ServiceIp) -> ResourceAgent {
    ResourceAgent::new(IPADDR2, format!("service_ip{}", index))
        .attr("ip", ip.addr.to_string())
        .attr("cidr_netmask", ip.prefix.to_string())
}

/// Recover the service IPs from the `IPaddr2` agents, in declaration order
pub fn parse_service_ips<'a>(agents: impl Iterator<Item = &'a ResourceAgent>) -> Result<Vec<ServiceIp>> {
    agents
        .filter(|a| a.agent_type == IPADDR2)
        .map(|a| {
            let addr = a.require("ip")?;
            let prefix = a.require("cidr_netmask")?;
            format!("{}/{}", addr, prefix)
                .parse::<ServiceIp>()
                .map_err(|e| Error::PromoterDecode(format!("agent '{}': {}", a.name, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_agent_display_and_parse() {
        let agent = ResourceAgent::new(ISCSI_LOGICAL_UNIT, "lu1")
            .attr("lun", "1")
            .attr("product_id", "HA iSCSI")
            .attr("path", "/dev/drbd/by-res/example/1");

        let line = agent.to_string();
        assert_eq!(
            line,
            r#"ocf:heartbeat:iSCSILogicalUnit lu1 lun=1 path=/dev/drbd/by-res/example/1 product_id="HA iSCSI""#
        );

        let parsed: ResourceAgent = line.parse().unwrap();
        assert_eq!(parsed, agent);
    }

    #[test]
    fn test_agent_parse_escapes() {
        let parsed: ResourceAgent =
            r#"t n password="se\"cr et" empty="""#.parse().unwrap();
        assert_eq!(parsed.get("password"), Some(r#"se"cr et"#));
        assert_eq!(parsed.get("empty"), Some(""));
    }

    #[test]
    fn test_agent_parse_errors() {
        assert_matches!("".parse::<ResourceAgent>(), Err(Error::PromoterDecode(_)));
        assert_matches!(
            "ocf:heartbeat:IPaddr2".parse::<ResourceAgent>(),
            Err(Error::PromoterDecode(_))
        );
        assert_matches!(
            "ocf:heartbeat:IPaddr2 ip novalue".parse::<ResourceAgent>(),
            Err(Error::PromoterDecode(_))
        );
        assert_matches!(
            r#"ocf:heartbeat:IPaddr2 ip ip="10.0.0.1"#.parse::<ResourceAgent>(),
            Err(Error::PromoterDecode(_))
        );
    }

    #[test]
    fn test_service_ip_agents() {
        let ips: Vec<ServiceIp> = vec!["10.0.0.5/24".parse().unwrap(), "fd00::5/64".parse().unwrap()];
        let agents: Vec<_> = ips.iter().enumerate().map(|(i, ip)| service_ip(i, ip)).collect();

        assert_eq!(parse_service_ips(agents.iter()).unwrap(), ips);
    }

    #[test]
    fn test_device_path_fallback() {
        assert_eq!(device_path("res", 3, &[]), "/dev/drbd/by-res/res/3");
    }
}
