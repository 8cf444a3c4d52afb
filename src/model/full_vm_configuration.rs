use serde::{Deserialize, Serialize};

use crate::utils::Json;

use super::{
    balloon::Balloon, boot_source::BootSource, drive::Drive, logger::Logger,
    machine_configuration::MachineConfiguration, metrics::Metrics, mmds_config::MmdsConfig,
    network_interface::NetworkInterface, vsock::Vsock,
};

/// The full configuration of the running microVM, as exported by
/// `GET /vm/config`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FullVmConfiguration {
    #[serde(rename = "balloon", skip_serializing_if = "Option::is_none")]
    pub balloon: Option<Balloon>,

    /// Configurations for all block devices.
    #[serde(rename = "drives", skip_serializing_if = "Option::is_none")]
    pub drives: Option<Vec<Drive>>,

    #[serde(rename = "boot-source", skip_serializing_if = "Option::is_none")]
    pub boot_source: Option<BootSource>,

    #[serde(rename = "logger", skip_serializing_if = "Option::is_none")]
    pub logger: Option<Logger>,

    #[serde(rename = "machine-config", skip_serializing_if = "Option::is_none")]
    pub machine_config: Option<MachineConfiguration>,

    #[serde(rename = "metrics", skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,

    #[serde(rename = "mmds-config", skip_serializing_if = "Option::is_none")]
    pub mmds_config: Option<MmdsConfig>,

    /// Configurations for all net devices.
    #[serde(rename = "network-interfaces", skip_serializing_if = "Option::is_none")]
    pub network_interfaces: Option<Vec<NetworkInterface>>,

    #[serde(rename = "vsock", skip_serializing_if = "Option::is_none")]
    pub vsock: Option<Vsock>,
}

impl<'a> Json<'a> for FullVmConfiguration {
    type Item = FullVmConfiguration;
}
