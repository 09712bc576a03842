//! Domain Model - value types shared by every endpoint type

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::str::FromStr;

/// Volume number reserved for the cluster-private volume
pub const CLUSTER_PRIVATE_VOLUME_NUMBER: u32 = 0;

/// Size of the cluster-private volume (64 MiB)
pub const CLUSTER_PRIVATE_VOLUME_SIZE_KIB: u64 = 64 * 1024;

/// Resource group used when none is requested
pub const DEFAULT_RESOURCE_GROUP: &str = "DfltRscGrp";

// =============================================================================
// Volumes
// =============================================================================

/// A single volume of an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Volume number (LUN / namespace id / export index)
    pub number: u32,
    /// Size in KiB
    pub size_kib: u64,
    /// Filesystem created on the volume, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_system: Option<String>,
}

impl VolumeConfig {
    pub fn new(number: u32, size_kib: u64) -> Self {
        Self {
            number,
            size_kib,
            file_system: None,
        }
    }

    pub fn with_file_system(mut self, fs: impl Into<String>) -> Self {
        self.file_system = Some(fs.into());
        self
    }
}

/// The volume the HA daemon keeps its coordination state on
pub fn cluster_private_volume() -> VolumeConfig {
    VolumeConfig::new(CLUSTER_PRIVATE_VOLUME_NUMBER, CLUSTER_PRIVATE_VOLUME_SIZE_KIB)
        .with_file_system("ext4")
}

/// Check user-visible volumes: non-zero, unique numbers and non-zero sizes
pub fn validate_volumes(volumes: &[VolumeConfig]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for vol in volumes {
        if vol.number == CLUSTER_PRIVATE_VOLUME_NUMBER {
            return Err(Error::Validation(
                "volume number 0 is reserved for the cluster private volume".into(),
            ));
        }
        if !seen.insert(vol.number) {
            return Err(Error::Validation(format!(
                "volume number {} is used more than once",
                vol.number
            )));
        }
        if vol.size_kib == 0 {
            return Err(Error::Validation(format!(
                "volume {} must have a non-zero size",
                vol.number
            )));
        }
    }
    Ok(())
}

/// Sort volumes by ascending number
pub fn sort_volumes(volumes: &mut [VolumeConfig]) {
    volumes.sort_by_key(|v| v.number);
}

/// Parse a size string (e.g., "2G", "512MiB", "100Ki") to KiB
///
/// A bare number is interpreted as bytes and rounded up to whole KiB.
pub fn parse_size_kib(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Validation("empty size string".into()));
    }

    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::Validation(format!("invalid size: {}", s)))?;

    let multiplier: u64 = match unit_str.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KI" | "KIB" => 1 << 10,
        "M" | "MB" | "MI" | "MIB" => 1 << 20,
        "G" | "GB" | "GI" | "GIB" => 1 << 30,
        "T" | "TB" | "TI" | "TIB" => 1 << 40,
        "P" | "PB" | "PI" | "PIB" => 1 << 50,
        _ => return Err(Error::Validation(format!("unknown size unit: {}", unit_str))),
    };

    let bytes = (num * multiplier as f64) as u64;
    Ok(bytes.div_ceil(1024))
}

// =============================================================================
// Network Identity
// =============================================================================

/// An IP address plus prefix length claimed by an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceIp {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl ServiceIp {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(Error::Validation(format!(
                "prefix length {} out of range for {}",
                prefix, addr
            )));
        }
        Ok(Self { addr, prefix })
    }

    /// The network containing every address (`0.0.0.0/0`)
    pub fn any_v4() -> Self {
        Self {
            addr: IpAddr::from([0, 0, 0, 0]),
            prefix: 0,
        }
    }

    /// Netmask in dotted notation, as exportfs expects for IPv4
    pub fn netmask(&self) -> String {
        match self.addr {
            IpAddr::V4(_) => {
                let mask = if self.prefix == 0 {
                    0u32
                } else {
                    u32::MAX << (32 - self.prefix)
                };
                std::net::Ipv4Addr::from(mask).to_string()
            }
            IpAddr::V6(_) => self.prefix.to_string(),
        }
    }
}

impl FromStr for ServiceIp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::Validation(format!("'{}' is not in ADDRESS/PREFIX form", s)))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| Error::Validation(format!("invalid IP address '{}'", addr)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| Error::Validation(format!("invalid prefix length '{}'", prefix)))?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for ServiceIp {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ServiceIp> for String {
    fn from(ip: ServiceIp) -> Self {
        ip.to_string()
    }
}

impl std::fmt::Display for ServiceIp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Aggregated state of the service an endpoint provides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Stopped,
    Starting,
    Started,
    #[default]
    Unknown,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Started => write!(f, "started"),
            ServiceState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Replication health of a single volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Ok,
    Degraded,
    #[default]
    Unknown,
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceState::Ok => write!(f, "ok"),
            ResourceState::Degraded => write!(f, "degraded"),
            ResourceState::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStatus {
    pub number: u32,
    pub state: ResourceState,
}

/// Status attached to a descriptor at read time; never persisted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub service: ServiceState,
    /// Node the resource is currently promoted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
    /// Nodes holding a placement of the resource
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_size_kib() {
        assert_eq!(parse_size_kib("1K").unwrap(), 1);
        assert_eq!(parse_size_kib("64MiB").unwrap(), CLUSTER_PRIVATE_VOLUME_SIZE_KIB);
        assert_eq!(parse_size_kib("2G").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size_kib("1.5Gi").unwrap(), 1536 * 1024);
        assert_eq!(parse_size_kib("100").unwrap(), 1);

        assert!(parse_size_kib("").is_err());
        assert!(parse_size_kib("abc").is_err());
        assert!(parse_size_kib("100X").is_err());
    }

    #[test]
    fn test_service_ip() {
        let ip: ServiceIp = "192.168.1.5/24".parse().unwrap();
        assert_eq!(ip.prefix, 24);
        assert_eq!(ip.netmask(), "255.255.255.0");
        assert_eq!(ip.to_string(), "192.168.1.5/24");
        assert_eq!(ServiceIp::any_v4().netmask(), "0.0.0.0");

        assert_matches!("192.168.1.5".parse::<ServiceIp>(), Err(Error::Validation(_)));
        assert_matches!("192.168.1.5/33".parse::<ServiceIp>(), Err(Error::Validation(_)));
        assert!("fd00::1/64".parse::<ServiceIp>().is_ok());
    }

    #[test]
    fn test_validate_volumes() {
        assert!(validate_volumes(&[VolumeConfig::new(1, 1024), VolumeConfig::new(2, 1024)]).is_ok());
        assert!(validate_volumes(&[]).is_ok());

        assert_matches!(
            validate_volumes(&[VolumeConfig::new(0, 1024)]),
            Err(Error::Validation(_))
        );
        assert_matches!(
            validate_volumes(&[VolumeConfig::new(1, 1024), VolumeConfig::new(1, 2048)]),
            Err(Error::Validation(_))
        );
        assert_matches!(
            validate_volumes(&[VolumeConfig::new(3, 0)]),
            Err(Error::Validation(_))
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ServiceState::Started.to_string(), "started");
        assert_eq!(ResourceState::Degraded.to_string(), "degraded");
        assert_eq!(ResourceStatus::default().service, ServiceState::Unknown);
    }
}
