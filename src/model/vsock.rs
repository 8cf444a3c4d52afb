use std::path::PathBuf;

use log::error;
use serde::{Deserialize, Serialize};

use crate::{components::machine::MachineError, utils::Json};

/// Defines a vsock device, backed by a set of Unix Domain Sockets on the
/// host side.
///
/// For host-initiated connections, firecracker will be listening on the Unix
/// socket identified by the path `uds_path`. Connections are forwarded to a
/// guest-side port by writing `CONNECT <port>\n` after connecting.
///
/// For guest-initiated connections, firecracker expects host software to be
/// bound and listening on Unix sockets at `uds_path_<PORT>`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Vsock {
    /// Guest Vsock CID
    /// Required: true
    /// Minimum: 3
    #[serde(rename = "guest_cid")]
    pub guest_cid: u64,

    /// Path to UNIX domain socket, used to proxy vsock connections.
    /// Required: true
    #[serde(rename = "uds_path")]
    pub uds_path: PathBuf,

    /// vsock id
    /// Required: true
    #[serde(rename = "vsock_id")]
    pub vsock_id: String,
}

impl<'a> Json<'a> for Vsock {
    type Item = Vsock;
}

impl Vsock {
    pub fn new(vsock_id: impl Into<String>, guest_cid: u64, uds_path: impl Into<PathBuf>) -> Self {
        Self {
            guest_cid,
            uds_path: uds_path.into(),
            vsock_id: vsock_id.into(),
        }
    }

    #[must_use = "must validate Vsock before putting it to microVM"]
    pub fn validate(&self) -> Result<(), MachineError> {
        // cids 0, 1 and 2 are reserved for the hypervisor and the host
        if self.guest_cid < 3 {
            error!(target: "Vsock::validate", "guest_cid must be at least 3, got {}", self.guest_cid);
            return Err(MachineError::Validation(format!(
                "guest_cid must be at least 3, got {}",
                self.guest_cid
            )));
        }

        if self.vsock_id.is_empty() {
            error!(target: "Vsock::validate", "cannot assign empty id to the vsock device");
            return Err(MachineError::Validation(
                "cannot assign empty id to the vsock device".to_string(),
            ));
        }

        Ok(())
    }
}
