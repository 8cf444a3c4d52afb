use std::path::PathBuf;

use log::error;
use serde::{Deserialize, Serialize};

use crate::{components::machine::MachineError, utils::Json};

use super::rate_limiter::RateLimiter;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Drive {
    /// drive id, unique within the VM
    /// Required: true
    #[serde(rename = "drive_id")]
    pub drive_id: String,

    /// Represents the unique id of the boot partition of this device.
    /// It is optional and it will be taken into account
    /// only if the is_root_device field is true.
    #[serde(rename = "partuuid", skip_serializing_if = "Option::is_none")]
    pub partuuid: Option<String>,

    /// is root device
    /// Required: true
    #[serde(rename = "is_root_device")]
    pub is_root_device: bool,

    /// Represents the caching strategy for the block device.
    #[serde(rename = "cache_type", skip_serializing_if = "Option::is_none")]
    pub cache_type: Option<CacheType>,

    /// Is block read only.
    /// Required: true
    #[serde(rename = "is_read_only")]
    pub is_read_only: bool,

    /// Host level path for the guest drive.
    /// Required: true
    #[serde(rename = "path_on_host")]
    pub path_on_host: PathBuf,

    /// rate limiter
    #[serde(rename = "rate_limiter", skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiter>,

    /// Type of the IO engine used by the device. "Async" is supported on
    /// host kernels newer than 5.10.51.
    #[serde(rename = "io_engine", skip_serializing_if = "Option::is_none")]
    pub io_engine: Option<IoEngine>,
}

impl<'a> Json<'a> for Drive {
    type Item = Drive;
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum CacheType {
    #[serde(rename = "Unsafe")]
    Unsafe,
    #[serde(rename = "Writeback")]
    Writeback,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum IoEngine {
    #[serde(rename = "Sync")]
    Sync,
    #[serde(rename = "Async")]
    Async,
}

impl Drive {
    pub fn new() -> Self {
        Self {
            drive_id: "".into(),
            path_on_host: "".into(),
            is_root_device: false,
            is_read_only: false,
            partuuid: None,
            rate_limiter: None,
            cache_type: None,
            io_engine: None,
        }
    }

    pub fn with_drive_id<S>(mut self, id: S) -> Self
    where
        S: Into<String>,
    {
        self.drive_id = id.into();
        self
    }

    pub fn with_partuuid(mut self, uuid: impl Into<String>) -> Self {
        self.partuuid = Some(uuid.into());
        self
    }

    pub fn set_root_device(mut self, is_root_device: bool) -> Self {
        self.is_root_device = is_root_device;
        self
    }

    pub fn set_read_only(mut self, read_only: bool) -> Self {
        self.is_read_only = read_only;
        self
    }

    pub fn with_drive_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path_on_host = path.into();
        self
    }

    pub fn set_drive_path(&mut self, path: impl Into<PathBuf>) {
        self.path_on_host = path.into();
    }

    pub fn with_cache_type(mut self, cache_type: CacheType) -> Self {
        self.cache_type = Some(cache_type);
        self
    }

    pub fn with_io_engine(mut self, io_engine: IoEngine) -> Self {
        self.io_engine = Some(io_engine);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn get_drive_id(&self) -> String {
        self.drive_id.to_owned()
    }

    pub fn is_root_device(&self) -> bool {
        self.is_root_device
    }

    pub fn get_path_on_host(&self) -> PathBuf {
        self.path_on_host.to_owned()
    }

    #[must_use = "must validate Drive before putting it to microVM"]
    pub fn validate(&self) -> Result<(), MachineError> {
        if self.drive_id.is_empty() {
            error!(target: "Drive::validate", "cannot assign empty id to the drive");
            return Err(MachineError::Validation(
                "cannot assign empty id to the drive".to_string(),
            ));
        }

        if self.partuuid.is_some() && self.partuuid.as_deref() == Some("") {
            error!(target: "Drive::validate", "cannot assign empty partuuid to the drive, leave it None");
            return Err(MachineError::Validation(
                "cannot assign empty partuuid to the drive, leave it None".to_string(),
            ));
        }

        if self.is_root_device && self.partuuid.is_some() && !self.is_read_only {
            error!(target: "Drive::validate", "root drive {} with a partuuid must be read only", self.drive_id);
            return Err(MachineError::Validation(format!(
                "root drive {} with a partuuid must be read only",
                self.drive_id
            )));
        }

        if let Err(e) = std::fs::metadata(&self.path_on_host) {
            error!(target: "Drive::validate", "fail to stat drive path {}: {}", self.path_on_host.display(), e.to_string());
            return Err(MachineError::Validation(format!(
                "fail to stat drive path {}: {}",
                self.path_on_host.display(),
                e.to_string()
            )));
        }

        Ok(())
    }
}
