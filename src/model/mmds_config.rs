use serde::{Deserialize, Serialize};

use crate::utils::Json;

/// Defines the MMDS configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MmdsConfig {
    /// Enumeration indicating the MMDS version to be configured.
    #[serde(rename = "version", skip_serializing_if = "Option::is_none")]
    pub version: Option<MmdsVersion>,

    /// A valid IPv4 link-local address.
    /// default: "169.254.169.254"
    #[serde(rename = "ipv4_address", skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,

    /// List of the network interface IDs capable of forwarding packets to
    /// the MMDS. Network interface IDs mentioned must be valid at the time
    /// of this request.
    #[serde(rename = "network_interfaces")]
    pub network_interfaces: Vec<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MmdsVersion {
    #[serde(rename = "V1")]
    V1,
    #[serde(rename = "V2")]
    V2,
}

impl<'a> Json<'a> for MmdsConfig {
    type Item = MmdsConfig;
}

/// Opaque data store contents pushed to /mmds. The guest sees exactly this
/// JSON document.
pub type MmdsContentsObject = serde_json::Value;

impl Default for MmdsConfig {
    fn default() -> Self {
        Self {
            ipv4_address: None,
            version: None,
            network_interfaces: Vec::new(),
        }
    }
}

impl MmdsConfig {
    pub fn with_version(mut self, version: MmdsVersion) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_ipv4_address(mut self, addr: impl Into<String>) -> Self {
        self.ipv4_address = Some(addr.into());
        self
    }

    pub fn with_network_interfaces(mut self, ifaces: Vec<String>) -> Self {
        self.network_interfaces = ifaces;
        self
    }
}
