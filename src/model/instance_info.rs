use serde::{Deserialize, Serialize};

use crate::utils::Json;

/// Describes the current running instance, as returned by `GET /`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InstanceInfo {
    /// Application name.
    /// Required: true
    #[serde(rename = "app_name")]
    pub app_name: String,

    /// MicroVM / instance ID.
    /// Required: true
    #[serde(rename = "id")]
    pub id: String,

    /// The current detailed state of the instance.
    /// Required: true
    /// Enum: [Not started Running Paused]
    #[serde(rename = "state")]
    pub state: String,

    /// MicroVM hypervisor build version.
    /// Required: true
    #[serde(rename = "vmm_version")]
    pub vmm_version: String,
}

impl<'a> Json<'a> for InstanceInfo {
    type Item = InstanceInfo;
}
