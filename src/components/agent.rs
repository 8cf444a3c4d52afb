use std::path::PathBuf;

use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector};
use log::{debug, error, trace};
use serde::Deserialize;
use tokio::time::timeout;

use crate::{
    model::{
        balloon::Balloon,
        balloon_stats::BalloonStatistics,
        balloon_stats_update::BalloonStatsUpdate,
        balloon_update::BalloonUpdate,
        boot_source::BootSource,
        drive::Drive,
        firecracker_version::FirecrackerVersion,
        full_vm_configuration::FullVmConfiguration,
        instance_action_info::InstanceActionInfo,
        instance_info::InstanceInfo,
        logger::Logger,
        machine_configuration::MachineConfiguration,
        metrics::Metrics,
        mmds_config::{MmdsConfig, MmdsContentsObject},
        network_interface::NetworkInterface,
        partial_drive::PartialDrive,
        partial_network_interface::PartialNetworkInterface,
        snapshot_create_params::SnapshotCreateParams,
        snapshot_load_params::SnapshotLoadParams,
        vm::Vm,
        vsock::Vsock,
    },
    utils::{Json, DEFAULT_FIRECRACKER_REQUEST_TIMEOUT_SECS},
};

/// An error from one control plane request. `is_temporary` distinguishes the
/// conditions worth retrying (the socket file not yet bound, the hypervisor
/// answering "resource busy") from real faults.
#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("could not reach firecracker on {op}: {reason}")]
    Transport {
        op: &'static str,
        reason: String,
        temporary: bool,
    },

    #[error("{op} failed with status {status}: {fault}")]
    Endpoint {
        op: &'static str,
        status: u16,
        fault: String,
        temporary: bool,
    },

    #[error("request on {op} timed out after {timeout_s} seconds")]
    Timeout { op: &'static str, timeout_s: u64 },

    #[error("could not serialize request or deserialize response on {op}: {source}")]
    Serde {
        op: &'static str,
        source: serde_json::Error,
    },
}

impl AgentError {
    pub fn is_temporary(&self) -> bool {
        match self {
            AgentError::Transport { temporary, .. } => *temporary,
            AgentError::Endpoint { temporary, .. } => *temporary,
            AgentError::Timeout { .. } => false,
            AgentError::Serde { .. } => false,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            AgentError::Transport { op, .. } => op,
            AgentError::Endpoint { op, .. } => op,
            AgentError::Timeout { op, .. } => op,
            AgentError::Serde { op, .. } => op,
        }
    }
}

/// The body firecracker sends along with every non-2xx response.
#[derive(Deserialize)]
struct FaultMessage {
    #[serde(default)]
    fault_message: String,
}

/// Typed facade over the HTTP-over-UNIX-socket control plane. One method per
/// endpoint the crate consumes. Cloning is cheap and clones share the
/// underlying connection pool, so the machine and all its handlers can hold
/// the same agent.
#[derive(Clone)]
pub struct Agent {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
    request_timeout_s: u64,
}

impl Agent {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Agent {
            socket_path: socket_path.into(),
            client: Client::unix(),
            request_timeout_s: DEFAULT_FIRECRACKER_REQUEST_TIMEOUT_SECS,
        }
    }

    pub fn with_request_timeout_s(mut self, timeout_s: u64) -> Self {
        self.request_timeout_s = timeout_s;
        self
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    async fn send_request(
        &self,
        op: &'static str,
        path: &str,
        method: Method,
        body: String,
    ) -> Result<String, AgentError> {
        let url: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, path).into();
        debug!(target: "Agent", "{} {}", op, url);
        trace!(target: "Agent", "{} body: {}", op, body);

        let request = Request::builder()
            .method(method)
            .uri(url.clone())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Body::from(body))
            .map_err(|e| AgentError::Transport {
                op,
                reason: e.to_string(),
                temporary: false,
            })?;

        let response = timeout(
            tokio::time::Duration::from_secs(self.request_timeout_s),
            self.client.request(request),
        )
        .await
        .map_err(|_| {
            error!(target: "Agent", "{} timed out after {} seconds", op, self.request_timeout_s);
            AgentError::Timeout {
                op,
                timeout_s: self.request_timeout_s,
            }
        })?
        .map_err(|e| AgentError::Transport {
            op,
            // the socket file not existing or nothing accepting on it both
            // surface as a connect error, which clears once firecracker binds
            temporary: e.is_connect(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        let body_bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| AgentError::Transport {
                op,
                reason: e.to_string(),
                temporary: false,
            })?;
        let body_string = String::from_utf8_lossy(&body_bytes).to_string();

        if !status.is_success() {
            let fault = serde_json::from_str::<FaultMessage>(&body_string)
                .map(|f| f.fault_message)
                .unwrap_or_else(|_| body_string.clone());
            error!(target: "Agent", "{} failed with status {}: {}", op, status, fault);
            return Err(AgentError::Endpoint {
                op,
                status: status.as_u16(),
                temporary: Self::is_temporary_fault(status, &fault),
                fault,
            });
        }

        trace!(target: "Agent", "{} response: {}", op, body_string);
        Ok(body_string)
    }

    fn is_temporary_fault(status: StatusCode, fault: &str) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || fault.to_lowercase().contains("resource busy")
    }

    fn serde(op: &'static str) -> impl FnOnce(serde_json::Error) -> AgentError {
        move |source| AgentError::Serde { op, source }
    }

    // PUT /machine-config
    pub async fn put_machine_configuration(
        &self,
        machine_config: &MachineConfiguration,
    ) -> Result<(), AgentError> {
        const OP: &'static str = "put_machine_configuration";
        let json = machine_config.to_json().map_err(Self::serde(OP))?;
        self.send_request(OP, "/machine-config", Method::PUT, json)
            .await?;
        Ok(())
    }

    // GET /machine-config
    pub async fn get_machine_configuration(&self) -> Result<MachineConfiguration, AgentError> {
        const OP: &'static str = "get_machine_configuration";
        let string = self
            .send_request(OP, "/machine-config", Method::GET, String::new())
            .await?;
        MachineConfiguration::from_json(&string).map_err(Self::serde(OP))
    }

    // PATCH /machine-config
    pub async fn patch_machine_configuration(
        &self,
        machine_config: &MachineConfiguration,
    ) -> Result<(), AgentError> {
        const OP: &'static str = "patch_machine_configuration";
        let json = machine_config.to_json().map_err(Self::serde(OP))?;
        self.send_request(OP, "/machine-config", Method::PATCH, json)
            .await?;
        Ok(())
    }

    // PUT /boot-source
    pub async fn put_guest_boot_source(&self, boot_source: &BootSource) -> Result<(), AgentError> {
        const OP: &'static str = "put_guest_boot_source";
        let json = boot_source.to_json().map_err(Self::serde(OP))?;
        self.send_request(OP, "/boot-source", Method::PUT, json)
            .await?;
        Ok(())
    }

    // PUT /drives/{drive_id}
    pub async fn put_guest_drive_by_id(&self, drive: &Drive) -> Result<(), AgentError> {
        const OP: &'static str = "put_guest_drive_by_id";
        let drive_id = drive.get_drive_id();
        let json = drive.to_json().map_err(Self::serde(OP))?;
        self.send_request(OP, format!("/drives/{drive_id}").as_str(), Method::PUT, json)
            .await?;
        Ok(())
    }

    // PATCH /drives/{drive_id}
    pub async fn patch_guest_drive_by_id(
        &self,
        partial_drive: &PartialDrive,
    ) -> Result<(), AgentError> {
        const OP: &'static str = "patch_guest_drive_by_id";
        let drive_id = partial_drive.get_drive_id();
        let json = partial_drive.to_json().map_err(Self::serde(OP))?;
        self.send_request(
            OP,
            format!("/drives/{drive_id}").as_str(),
            Method::PATCH,
            json,
        )
        .await?;
        Ok(())
    }

    // PUT /network-interfaces/{iface_id}
    pub async fn put_guest_network_interface_by_id(
        &self,
        network_interface: &NetworkInterface,
    ) -> Result<(), AgentError> {
        const OP: &'static str = "put_guest_network_interface_by_id";
        let iface_id = network_interface.get_iface_id();
        let json = network_interface.to_json().map_err(Self::serde(OP))?;
        self.send_request(
            OP,
            format!("/network-interfaces/{iface_id}").as_str(),
            Method::PUT,
            json,
        )
        .await?;
        Ok(())
    }

    // PATCH /network-interfaces/{iface_id}
    pub async fn patch_guest_network_interface_by_id(
        &self,
        partial_network_interface: &PartialNetworkInterface,
    ) -> Result<(), AgentError> {
        const OP: &'static str = "patch_guest_network_interface_by_id";
        let iface_id = partial_network_interface.get_iface_id();
        let json = partial_network_interface
            .to_json()
            .map_err(Self::serde(OP))?;
        self.send_request(
            OP,
            format!("/network-interfaces/{iface_id}").as_str(),
            Method::PATCH,
            json,
        )
        .await?;
        Ok(())
    }

    // PUT /vsock
    pub async fn put_guest_vsock(&self, vsock: &Vsock) -> Result<(), AgentError> {
        const OP: &'static str = "put_guest_vsock";
        let json = vsock.to_json().map_err(Self::serde(OP))?;
        self.send_request(OP, "/vsock", Method::PUT, json).await?;
        Ok(())
    }

    // PUT /logger
    pub async fn put_logger(&self, logger: &Logger) -> Result<(), AgentError> {
        const OP: &'static str = "put_logger";
        let json = logger.to_json().map_err(Self::serde(OP))?;
        self.send_request(OP, "/logger", Method::PUT, json).await?;
        Ok(())
    }

    // PUT /metrics
    pub async fn put_metrics(&self, metrics: &Metrics) -> Result<(), AgentError> {
        const OP: &'static str = "put_metrics";
        let json = metrics.to_json().map_err(Self::serde(OP))?;
        self.send_request(OP, "/metrics", Method::PUT, json).await?;
        Ok(())
    }

    // PUT /mmds
    pub async fn put_mmds(&self, contents: &MmdsContentsObject) -> Result<(), AgentError> {
        const OP: &'static str = "put_mmds";
        let json = serde_json::to_string(contents).map_err(Self::serde(OP))?;
        self.send_request(OP, "/mmds", Method::PUT, json).await?;
        Ok(())
    }

    // PATCH /mmds
    pub async fn patch_mmds(&self, contents: &MmdsContentsObject) -> Result<(), AgentError> {
        const OP: &'static str = "patch_mmds";
        let json = serde_json::to_string(contents).map_err(Self::serde(OP))?;
        self.send_request(OP, "/mmds", Method::PATCH, json).await?;
        Ok(())
    }

    // GET /mmds
    pub async fn get_mmds(&self) -> Result<MmdsContentsObject, AgentError> {
        const OP: &'static str = "get_mmds";
        let string = self
            .send_request(OP, "/mmds", Method::GET, String::new())
            .await?;
        serde_json::from_str(&string).map_err(Self::serde(OP))
    }

    // PUT /mmds/config
    pub async fn put_mmds_config(&self, mmds_config: &MmdsConfig) -> Result<(), AgentError> {
        const OP: &'static str = "put_mmds_config";
        let json = mmds_config.to_json().map_err(Self::serde(OP))?;
        self.send_request(OP, "/mmds/config", Method::PUT, json)
            .await?;
        Ok(())
    }

    // PUT /balloon
    pub async fn put_balloon(&self, balloon: &Balloon) -> Result<(), AgentError> {
        const OP: &'static str = "put_balloon";
        let json = balloon.to_json().map_err(Self::serde(OP))?;
        self.send_request(OP, "/balloon", Method::PUT, json).await?;
        Ok(())
    }

    // GET /balloon
    pub async fn describe_balloon_config(&self) -> Result<Balloon, AgentError> {
        const OP: &'static str = "describe_balloon_config";
        let string = self
            .send_request(OP, "/balloon", Method::GET, String::new())
            .await?;
        Balloon::from_json(&string).map_err(Self::serde(OP))
    }

    // PATCH /balloon
    pub async fn patch_balloon(&self, balloon_update: &BalloonUpdate) -> Result<(), AgentError> {
        const OP: &'static str = "patch_balloon";
        let json = balloon_update.to_json().map_err(Self::serde(OP))?;
        self.send_request(OP, "/balloon", Method::PATCH, json)
            .await?;
        Ok(())
    }

    // GET /balloon/statistics
    pub async fn describe_balloon_stats(&self) -> Result<BalloonStatistics, AgentError> {
        const OP: &'static str = "describe_balloon_stats";
        let string = self
            .send_request(OP, "/balloon/statistics", Method::GET, String::new())
            .await?;
        BalloonStatistics::from_json(&string).map_err(Self::serde(OP))
    }

    // PATCH /balloon/statistics
    pub async fn patch_balloon_stats_interval(
        &self,
        balloon_stats_update: &BalloonStatsUpdate,
    ) -> Result<(), AgentError> {
        const OP: &'static str = "patch_balloon_stats_interval";
        let json = balloon_stats_update.to_json().map_err(Self::serde(OP))?;
        self.send_request(OP, "/balloon/statistics", Method::PATCH, json)
            .await?;
        Ok(())
    }

    // PUT /actions
    pub async fn create_sync_action(&self, action: &InstanceActionInfo) -> Result<(), AgentError> {
        const OP: &'static str = "create_sync_action";
        let json = action.to_json().map_err(Self::serde(OP))?;
        self.send_request(OP, "/actions", Method::PUT, json).await?;
        Ok(())
    }

    // GET /
    pub async fn describe_instance(&self) -> Result<InstanceInfo, AgentError> {
        const OP: &'static str = "describe_instance";
        let string = self
            .send_request(OP, "/", Method::GET, String::new())
            .await?;
        InstanceInfo::from_json(&string).map_err(Self::serde(OP))
    }

    // GET /version
    pub async fn get_firecracker_version(&self) -> Result<FirecrackerVersion, AgentError> {
        const OP: &'static str = "get_firecracker_version";
        let string = self
            .send_request(OP, "/version", Method::GET, String::new())
            .await?;
        FirecrackerVersion::from_json(&string).map_err(Self::serde(OP))
    }

    // GET /vm/config
    pub async fn get_export_vm_config(&self) -> Result<FullVmConfiguration, AgentError> {
        const OP: &'static str = "get_export_vm_config";
        let string = self
            .send_request(OP, "/vm/config", Method::GET, String::new())
            .await?;
        FullVmConfiguration::from_json(&string).map_err(Self::serde(OP))
    }

    // PUT /snapshot/create
    pub async fn create_snapshot(
        &self,
        snapshot_create_params: &SnapshotCreateParams,
    ) -> Result<(), AgentError> {
        const OP: &'static str = "create_snapshot";
        let json = snapshot_create_params.to_json().map_err(Self::serde(OP))?;
        self.send_request(OP, "/snapshot/create", Method::PUT, json)
            .await?;
        Ok(())
    }

    // PUT /snapshot/load
    pub async fn load_snapshot(
        &self,
        snapshot_load_params: &SnapshotLoadParams,
    ) -> Result<(), AgentError> {
        const OP: &'static str = "load_snapshot";
        let json = snapshot_load_params.to_json().map_err(Self::serde(OP))?;
        self.send_request(OP, "/snapshot/load", Method::PUT, json)
            .await?;
        Ok(())
    }

    // PATCH /vm
    pub async fn patch_vm(&self, vm: &Vm) -> Result<(), AgentError> {
        const OP: &'static str = "patch_vm";
        let json = vm.to_json().map_err(Self::serde(OP))?;
        self.send_request(OP, "/vm", Method::PATCH, json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_fault_classification() {
        assert!(Agent::is_temporary_fault(
            StatusCode::TOO_MANY_REQUESTS,
            "slow down"
        ));
        assert!(Agent::is_temporary_fault(
            StatusCode::BAD_REQUEST,
            "The requested resource is busy: Resource busy"
        ));
        assert!(!Agent::is_temporary_fault(
            StatusCode::BAD_REQUEST,
            "Invalid request method and/or path"
        ));
    }

    #[test]
    fn test_error_surface() {
        let err = AgentError::Endpoint {
            op: "put_guest_drive_by_id",
            status: 400,
            fault: "drive path does not exist".to_string(),
            temporary: false,
        };
        assert!(!err.is_temporary());
        assert_eq!(err.operation(), "put_guest_drive_by_id");
        assert!(err.to_string().contains("status 400"));
    }
}
