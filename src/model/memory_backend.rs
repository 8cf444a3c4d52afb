use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::utils::Json;

/// Configuration for the backend responsible for handling memory load during
/// snapshot restore.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MemoryBackend {
    /// Required: true
    /// Enum: [File Uffd]
    #[serde(rename = "backend_type")]
    pub backend_type: BackendType,

    /// Based on the `backend_type` it is either:
    /// 1) Path to the file that contains the guest memory to be loaded
    /// 2) Path to the UDS where a process is listening for a UFFD initialization
    ///    control payload and open file descriptor that it can use to serve this
    ///    process's guest memory page faults
    /// Required: true
    #[serde(rename = "backend_path")]
    pub backend_path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    File,
    Uffd,
}

impl<'a> Json<'a> for MemoryBackend {
    type Item = MemoryBackend;
}
