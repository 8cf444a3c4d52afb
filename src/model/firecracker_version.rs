use serde::{Deserialize, Serialize};

use crate::utils::Json;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FirecrackerVersion {
    /// Required: true
    #[serde(rename = "firecracker_version")]
    pub firecracker_version: String,
}

impl<'a> Json<'a> for FirecrackerVersion {
    type Item = FirecrackerVersion;
}
