use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::utils::Json;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SnapshotCreateParams {
    /// Path to the file that will contain the guest memory.
    /// Required: true
    #[serde(rename = "mem_file_path")]
    pub mem_file_path: PathBuf,

    /// Path to the file that will contain the microVM state.
    /// Required: true
    #[serde(rename = "snapshot_path")]
    pub snapshot_path: PathBuf,

    /// Type of snapshot to create. It is optional and by default, a full
    /// snapshot is created.
    #[serde(rename = "snapshot_type", skip_serializing_if = "Option::is_none")]
    pub snapshot_type: Option<SnapshotType>,

    /// The microVM version for which we want to create the snapshot.
    /// It is optional and it defaults to the current version.
    #[serde(rename = "version", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotType {
    Full,
    Diff,
}

impl<'a> Json<'a> for SnapshotCreateParams {
    type Item = SnapshotCreateParams;
}

impl SnapshotCreateParams {
    pub fn new(mem_file_path: impl Into<PathBuf>, snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            mem_file_path: mem_file_path.into(),
            snapshot_path: snapshot_path.into(),
            snapshot_type: None,
            version: None,
        }
    }

    pub fn with_snapshot_type(mut self, snapshot_type: SnapshotType) -> Self {
        self.snapshot_type = Some(snapshot_type);
        self
    }
}
