use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::utils::Json;

use super::rate_limiter::RateLimiter;

/// Subset of drive properties that may be updated after boot, used with
/// `PATCH /drives/{drive_id}`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PartialDrive {
    /// drive id
    /// Required: true
    #[serde(rename = "drive_id")]
    pub drive_id: String,

    /// Host level path for the guest drive
    #[serde(rename = "path_on_host", skip_serializing_if = "Option::is_none")]
    pub path_on_host: Option<PathBuf>,

    /// rate limiter
    #[serde(rename = "rate_limiter", skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiter>,
}

impl<'a> Json<'a> for PartialDrive {
    type Item = PartialDrive;
}

impl PartialDrive {
    pub fn get_drive_id(&self) -> String {
        self.drive_id.to_owned()
    }
}
