use std::{
    collections::HashSet,
    os::fd::FromRawFd,
    os::unix::fs::PermissionsExt,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
};

use log::{debug, error, info, warn};
use nix::{
    fcntl::{self, OFlag},
    sys::stat::Mode,
    unistd,
};
use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncReadExt,
    time::{sleep, timeout, Duration, Instant},
};

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
        kernel_args::KernelArgs,
        logger::{LogLevel, Logger},
        machine_configuration::MachineConfiguration,
        memory_backend::MemoryBackend,
        metrics::Metrics,
        mmds_config::{MmdsConfig, MmdsContentsObject, MmdsVersion},
        partial_drive::PartialDrive,
        partial_network_interface::PartialNetworkInterface,
        snapshot_create_params::SnapshotCreateParams,
        snapshot_load_params::SnapshotLoadParams,
        vm::{VM_STATE_PAUSED, VM_STATE_RESUMED},
        vsock::Vsock,
    },
    utils::{
        StdioTypes, DEFAULT_NETNS_DIR, DEFAULT_SOCKET_PATH, DEFAULT_SOCKET_READY_TIMEOUT_SECS,
        DEFAULT_STOP_VMM_TIMEOUT_SECS, SOCKET_POLL_INTERVAL_MS,
    },
};

use super::{
    agent::{Agent, AgentError},
    command_builder::VMMCommandBuilder,
    handlers::{create_balloon_handler, Handlers},
    jailer::{self, link_or_copy, JailerConfig},
    network::{NetworkError, VmNetworkInterfaces},
    signals::{self, Signal, SignalForwarder, DEFAULT_FORWARD_SIGNALS},
    vsock::VsockError,
};

/// Parameters for booting from a snapshot instead of a kernel image. When
/// present on a [`Config`], the init pipeline is replaced by a single
/// load_snapshot step and no InstanceStart action is issued.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SnapshotConfig {
    /// Guest memory file. Mutually exclusive with `mem_backend`.
    pub mem_file_path: Option<PathBuf>,

    /// Memory backend descriptor. Mutually exclusive with `mem_file_path`.
    pub mem_backend: Option<MemoryBackend>,

    /// The microVM state file.
    pub snapshot_path: PathBuf,

    /// Track dirty pages after restore, enabling later diff snapshots.
    pub enable_diff_snapshots: bool,

    /// Issue `PATCH /vm` Resumed right after a successful load.
    pub resume_vm: bool,
}

impl SnapshotConfig {
    fn as_load_params(&self) -> SnapshotLoadParams {
        SnapshotLoadParams {
            enable_diff_snapshots: Some(self.enable_diff_snapshots),
            mem_file_path: self.mem_file_path.to_owned(),
            mem_backend: self.mem_backend.to_owned(),
            resume_vm: Some(self.resume_vm),
            snapshot_path: self.snapshot_path.to_owned(),
        }
    }
}

/// Config is the collection of user-configurable VMM settings describing the
/// microVM.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// socket_path defines the file path where the firecracker control
    /// socket should be created.
    pub socket_path: Option<PathBuf>,

    /// log_path defines the file path where the firecracker log is located.
    pub log_path: Option<PathBuf>,

    /// log_fifo defines the file path where the firecracker log named-pipe
    /// should be located.
    pub log_fifo: Option<PathBuf>,

    /// log_level defines the verbosity of firecracker logging.
    pub log_level: Option<LogLevel>,

    /// metrics_path defines the file path where the firecracker metrics are
    /// located.
    pub metrics_path: Option<PathBuf>,

    /// metrics_fifo defines the file path where the firecracker metrics
    /// named-pipe should be located.
    pub metrics_fifo: Option<PathBuf>,

    /// kernel_image_path defines the file path where the kernel image is
    /// located. The kernel image must be an uncompressed ELF image.
    pub kernel_image_path: Option<PathBuf>,

    /// initrd_path defines the file path where the initrd image is located.
    pub initrd_path: Option<PathBuf>,

    /// kernel_args defines the command-line arguments that should be passed
    /// to the kernel.
    pub kernel_args: Option<String>,

    /// drives specifies block devices that should be made available to the
    /// microVM.
    #[serde(default)]
    pub drives: Vec<Drive>,

    /// network_interfaces specifies the tap devices that should be made
    /// available to the microVM.
    #[serde(default)]
    pub network_interfaces: VmNetworkInterfaces,

    /// vsock_devices specifies the vsock devices that should be made
    /// available to the microVM.
    #[serde(default)]
    pub vsock_devices: Vec<Vsock>,

    /// fifo_log_writer is a sink the log FIFO contents are pumped into.
    /// Takes precedence over log_path for the pump destination.
    pub fifo_log_writer: Option<StdioTypes>,

    /// machine_cfg represents the firecracker microVM process configuration.
    pub machine_cfg: Option<MachineConfiguration>,

    /// disable_validation allows for easier mock testing by disabling the
    /// validation of configuration performed by the crate.
    #[serde(default)]
    pub disable_validation: bool,

    /// jailer_cfg is configuration specific for the jailer process.
    pub jailer_cfg: Option<JailerConfig>,

    /// vmid is a unique identifier for this VM. It's set to a random uuid
    /// if not provided by the user. It's used as the firecracker instance
    /// id, the CNI container id and to build the default netns path.
    pub vmid: Option<String>,

    /// net_ns represents the path to a network namespace handle. If
    /// present, the VMM (or its CNI plugins) will join the associated
    /// network namespace.
    pub net_ns: Option<PathBuf>,

    /// forward_signals is an optional list of signals to catch and forward
    /// to firecracker. An unset list means the default set; an explicitly
    /// empty list disables forwarding.
    pub forward_signals: Option<Vec<Signal>>,

    /// mmds_address is the IPv4 address the guest uses to reach the MMDS.
    /// If not provided, firecracker defaults to 169.254.169.254.
    pub mmds_address: Option<std::net::Ipv4Addr>,

    /// mmds_version selects V1 or V2 of the metadata service.
    pub mmds_version: Option<MmdsVersion>,

    /// mmds_contents seeds the MMDS data store before boot.
    pub mmds_contents: Option<MmdsContentsObject>,

    /// init_metadata is initial metadata published to the MMDS by the
    /// set_metadata handler.
    pub init_metadata: Option<MmdsContentsObject>,

    /// balloon is the balloon device that is to be put to the machine.
    pub balloon: Option<Balloon>,

    /// snapshot_cfg switches start() to the snapshot-load path.
    pub snapshot_cfg: Option<SnapshotConfig>,

    /// stdout specifies the stdout to use when spawning the VMM.
    pub stdout: Option<StdioTypes>,

    /// stderr specifies the stderr to use when spawning the VMM. With
    /// `Piped`, the captured output is attached to socket readiness
    /// failures.
    pub stderr: Option<StdioTypes>,

    /// stdin specifies the stdin to use when spawning the VMM.
    pub stdin: Option<StdioTypes>,
}

impl Config {
    /// called by the validate_config handler
    pub(crate) fn validate(&self) -> Result<(), MachineError> {
        if self.disable_validation {
            return Ok(());
        }

        if self.snapshot_cfg.is_none() {
            let kernel_image_path =
                self.kernel_image_path
                    .as_ref()
                    .ok_or(MachineError::Validation(
                        "no kernel image path provided".to_string(),
                    ))?;
            if let Err(e) = std::fs::metadata(kernel_image_path) {
                return Err(MachineError::Validation(format!(
                    "failed to stat kernel image path, {:#?}: {}",
                    kernel_image_path,
                    e.to_string()
                )));
            }
        }

        if let Some(initrd_path) = &self.initrd_path {
            if let Err(e) = std::fs::metadata(initrd_path) {
                return Err(MachineError::Validation(format!(
                    "failed to stat initrd image path, {:#?}: {}",
                    initrd_path,
                    e.to_string()
                )));
            }
        }

        let socket_path = self.socket_path.as_ref().ok_or(MachineError::Validation(
            "no socket path provided".to_string(),
        ))?;
        if std::fs::metadata(socket_path).is_ok() {
            return Err(MachineError::Validation(format!(
                "socket {:#?} already exists",
                socket_path
            )));
        }
        let socket_dir_parent = socket_path.parent().ok_or(MachineError::Validation(format!(
            "invalid directory where the socket is to be created: {}",
            socket_path.display()
        )))?;
        std::fs::create_dir_all(socket_dir_parent).map_err(|e| {
            MachineError::FileCreation(format!(
                "fail to create socket parent directory {}: {}",
                socket_dir_parent.display(),
                e.to_string()
            ))
        })?;

        let machine_cfg = self.machine_cfg.as_ref().ok_or(MachineError::Validation(
            "no machine configuration provided".to_string(),
        ))?;
        machine_cfg.validate()?;

        let mut drive_ids: HashSet<&str> = HashSet::new();
        let mut root_drives = 0usize;
        for drive in &self.drives {
            drive.validate()?;
            if !drive_ids.insert(drive.drive_id.as_str()) {
                return Err(MachineError::Validation(format!(
                    "duplicated drive id {}",
                    drive.drive_id
                )));
            }
            if drive.is_root_device() {
                root_drives += 1;
            }
        }
        if root_drives > 1 {
            return Err(MachineError::Validation(
                "more than one drive is marked as the root device".to_string(),
            ));
        }

        // network interfaces are validated by the validate_network_cfg handler

        for dev in &self.vsock_devices {
            dev.validate()?;
        }

        Ok(())
    }

    /// called by the validate_network_cfg handler
    pub(crate) fn validate_network(&self) -> Result<(), MachineError> {
        if self.disable_validation {
            return Ok(());
        }
        if self.network_interfaces.is_empty() {
            return Ok(());
        }

        let kernel_args = KernelArgs::from(self.kernel_args.to_owned().unwrap_or_default());
        self.network_interfaces.validate(&kernel_args)?;

        Ok(())
    }

    /// called by the validate_jailer_cfg handler
    pub(crate) fn validate_jailer(&self) -> Result<(), MachineError> {
        if self.disable_validation {
            return Ok(());
        }

        let jailer_cfg = match &self.jailer_cfg {
            None => return Ok(()),
            Some(jailer_cfg) => jailer_cfg,
        };

        let has_root = self.initrd_path.is_some()
            || self.drives.iter().any(|drive| drive.is_root_device());
        if !has_root {
            error!(target: "Config::validate_jailer", "a root drive must be present in the drive list");
            return Err(MachineError::Validation(
                "a root drive must be present in the drive list".to_string(),
            ));
        }

        let exec_file = jailer_cfg
            .exec_file
            .as_ref()
            .ok_or(MachineError::Validation(
                "exec file must be specified when using jailer mode".to_string(),
            ))?;
        let metadata = std::fs::metadata(exec_file).map_err(|e| {
            MachineError::Validation(format!(
                "failed to stat jailer exec file {}: {}",
                exec_file.display(),
                e.to_string()
            ))
        })?;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(MachineError::Validation(format!(
                "jailer exec file {} is not executable",
                exec_file.display()
            )));
        }

        if jailer_cfg.id.as_ref().map(|id| id.len()).unwrap_or(0) == 0 {
            return Err(MachineError::Validation(
                "id must be specified when using jailer mode".to_string(),
            ));
        }

        if jailer_cfg.uid.is_none() {
            return Err(MachineError::Validation(
                "uid must be specified when using jailer mode".to_string(),
            ));
        }

        if jailer_cfg.gid.is_none() {
            return Err(MachineError::Validation(
                "gid must be specified when using jailer mode".to_string(),
            ));
        }

        Ok(())
    }

    #[inline]
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = Some(path.into());
        self
    }

    #[inline]
    pub fn with_log_fifo(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_fifo = Some(path.into());
        self
    }

    #[inline]
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    #[inline]
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = Some(level);
        self
    }

    #[inline]
    pub fn with_metrics_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.metrics_path = Some(path.into());
        self
    }

    #[inline]
    pub fn with_metrics_fifo(mut self, path: impl Into<PathBuf>) -> Self {
        self.metrics_fifo = Some(path.into());
        self
    }

    #[inline]
    pub fn with_kernel_image_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.kernel_image_path = Some(path.into());
        self
    }

    #[inline]
    pub fn with_initrd_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.initrd_path = Some(path.into());
        self
    }

    #[inline]
    pub fn with_kernel_args(mut self, args: impl Into<String>) -> Self {
        self.kernel_args = Some(args.into());
        self
    }

    #[inline]
    pub fn with_drive(mut self, drive: Drive) -> Self {
        self.drives.push(drive);
        self
    }

    #[inline]
    pub fn with_drives(mut self, drives: &mut Vec<Drive>) -> Self {
        self.drives.append(drives);
        self
    }

    #[inline]
    pub fn with_network_interfaces(mut self, network_interfaces: VmNetworkInterfaces) -> Self {
        self.network_interfaces = network_interfaces;
        self
    }

    #[inline]
    pub fn with_vsock(mut self, dev: Vsock) -> Self {
        self.vsock_devices.push(dev);
        self
    }

    #[inline]
    pub fn with_machine_config(mut self, cfg: MachineConfiguration) -> Self {
        self.machine_cfg = Some(cfg);
        self
    }

    #[inline]
    pub fn set_disable_validation(mut self, b: bool) -> Self {
        self.disable_validation = b;
        self
    }

    #[inline]
    pub fn with_jailer_config(mut self, cfg: JailerConfig) -> Self {
        self.jailer_cfg = Some(cfg);
        self
    }

    #[inline]
    pub fn with_vmid(mut self, vmid: impl Into<String>) -> Self {
        self.vmid = Some(vmid.into());
        self
    }

    #[inline]
    pub fn with_net_ns(mut self, net_ns: impl Into<PathBuf>) -> Self {
        self.net_ns = Some(net_ns.into());
        self
    }

    #[inline]
    pub fn with_forward_signals(mut self, signals: Vec<Signal>) -> Self {
        self.forward_signals = Some(signals);
        self
    }

    #[inline]
    pub fn with_mmds_address(mut self, addr: std::net::Ipv4Addr) -> Self {
        self.mmds_address = Some(addr);
        self
    }

    #[inline]
    pub fn with_mmds_version(mut self, version: MmdsVersion) -> Self {
        self.mmds_version = Some(version);
        self
    }

    #[inline]
    pub fn with_mmds_contents(mut self, contents: MmdsContentsObject) -> Self {
        self.mmds_contents = Some(contents);
        self
    }

    #[inline]
    pub fn with_init_metadata(mut self, metadata: MmdsContentsObject) -> Self {
        self.init_metadata = Some(metadata);
        self
    }

    #[inline]
    pub fn with_balloon(mut self, balloon: Balloon) -> Self {
        self.balloon = Some(balloon);
        self
    }

    #[inline]
    pub fn with_snapshot_config(mut self, snapshot_cfg: SnapshotConfig) -> Self {
        self.snapshot_cfg = Some(snapshot_cfg);
        self
    }

    #[inline]
    pub fn with_stdout(mut self, stdout: StdioTypes) -> Self {
        self.stdout = Some(stdout);
        self
    }

    #[inline]
    pub fn with_stderr(mut self, stderr: StdioTypes) -> Self {
        self.stderr = Some(stderr);
        self
    }

    #[inline]
    pub fn with_stdin(mut self, stdin: StdioTypes) -> Self {
        self.stdin = Some(stdin);
        self
    }
}

/// The runtime lifecycle of a machine. Stopped is terminal.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    NotStarted,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
}

#[derive(thiserror::Error, Debug)]
pub enum MachineError {
    /// Failure when validating the configuration before starting the microVM
    #[error("invalid configuration for the machine, reason: {0}")]
    Validation(String),

    /// Failure occurred because of missing arguments
    #[error("missing arguments, reason: {0}")]
    ArgWrong(String),

    /// Failure assembling the machine before anything was spawned
    #[error("could not set up the machine, reason: {0}")]
    Initialize(String),

    #[error("could not create file or directory, reason: {0}")]
    FileCreation(String),

    #[error("unable to access file, reason: {0}")]
    FileAccess(String),

    #[error("could not remove file, reason: {0}")]
    FileRemoving(String),

    /// Inability to fork/exec the hypervisor or jailer
    #[error("could not spawn the VMM process, reason: {0}")]
    Spawn(String),

    /// The child exited before the API socket accepted requests, or the
    /// readiness deadline elapsed
    #[error("API socket was not ready: {0}")]
    SocketReadiness(String),

    /// A control plane request failed
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Vsock(#[from] VsockError),

    /// The operation is not valid in the machine's current state
    #[error("operation {op} is invalid in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: MachineState,
    },

    #[error("machine already started")]
    AlreadyStarted,

    #[error("machine already stopped")]
    AlreadyStopped,

    /// The VMM exited with a non-zero code, observed by wait
    #[error("VMM exited with code {code}")]
    VmmExited { code: i32 },

    /// The VMM was killed by a signal, observed by wait
    #[error("VMM killed by signal {signal}")]
    VmmKilled { signal: i32 },

    /// The process didn't run properly or an error occurred while running it
    #[error("fail to start or run the machine, reason: {0}")]
    Execute(String),

    /// Failure when cleaning up the machine
    #[error("could not clean up the machine properly, reason: {0}")]
    Cleaning(String),
}

/// The child's terminal status, cached so every wait() observes the same
/// result.
#[derive(Debug, Clone, Copy)]
enum TerminalOutcome {
    CleanExit,
    Exited(i32),
    Killed(i32),
}

impl TerminalOutcome {
    fn from_status(status: std::process::ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(0), _) => TerminalOutcome::CleanExit,
            (Some(code), _) => TerminalOutcome::Exited(code),
            (None, Some(signal)) => TerminalOutcome::Killed(signal),
            (None, None) => TerminalOutcome::CleanExit,
        }
    }

    /// A kill by the signals stop_vmm itself sends counts as a clean stop.
    fn absorb_intentional_stop(self) -> Self {
        match self {
            TerminalOutcome::Killed(signal)
                if signal == nix::sys::signal::SIGTERM as i32
                    || signal == nix::sys::signal::SIGKILL as i32 =>
            {
                TerminalOutcome::CleanExit
            }
            other => other,
        }
    }

    fn as_result(&self) -> Result<(), MachineError> {
        match self {
            TerminalOutcome::CleanExit => Ok(()),
            TerminalOutcome::Exited(code) => Err(MachineError::VmmExited { code: *code }),
            TerminalOutcome::Killed(signal) => Err(MachineError::VmmKilled { signal: *signal }),
        }
    }
}

/// Machine supervises one firecracker process and its control socket. One
/// machine maps to one VMM; it cannot be restarted after stopping.
pub struct Machine {
    pub(crate) cfg: Config,

    agent: Agent,

    /// The three handler pipelines. Mutable until start() clones them.
    pub(crate) handlers: Handlers,

    cmd: Option<tokio::process::Command>,

    child_process: Option<tokio::process::Child>,

    pid: Option<u32>,

    state: MachineState,

    /// The actual machine config as reported by firecracker after
    /// create_machine ran, not the one requested by the user.
    machine_config: MachineConfiguration,

    /// Closed exactly once when the VMM reaches its terminal state; every
    /// receiver clone observes the close.
    exit_send: async_channel::Sender<()>,
    exit_recv: async_channel::Receiver<()>,

    terminal: Option<TerminalOutcome>,

    fifo_pumps: Vec<tokio::task::JoinHandle<()>>,

    signal_forwarder: Option<SignalForwarder>,

    /// FIFOs created by create_log_files, removed again on stop.
    created_files: Vec<PathBuf>,
}

impl Machine {
    /// new initializes a new Machine instance and applies the jailer side
    /// effects when a jailer configuration is present. Validation of the
    /// configuration happens at the beginning of start().
    pub fn new(mut cfg: Config) -> Result<Machine, MachineError> {
        if cfg.vmid.is_none() {
            cfg.vmid = Some(uuid::Uuid::new_v4().to_string());
        }
        let vmid = cfg.vmid.to_owned().unwrap_or_default();
        info!(target: "Machine::new", "creating a new machine, vmid: {}", vmid);

        let (exit_send, exit_recv) = async_channel::bounded::<()>(1);
        let handlers = if cfg.snapshot_cfg.is_some() {
            Handlers::for_snapshot_load()
        } else {
            Handlers::default()
        };

        let mut machine = Machine {
            cfg: Config::default(),
            agent: Agent::new(DEFAULT_SOCKET_PATH),
            handlers,
            cmd: None,
            child_process: None,
            pid: None,
            state: MachineState::NotStarted,
            machine_config: MachineConfiguration::default(),
            exit_send,
            exit_recv,
            terminal: None,
            fifo_pumps: Vec::new(),
            signal_forwarder: None,
            created_files: Vec::new(),
        };

        if cfg.jailer_cfg.is_some() {
            debug!(target: "Machine::new", "with jailer configuration: {:#?}", cfg.jailer_cfg);
            jailer::jail(&mut machine, &mut cfg)?;
            info!(target: "Machine::new", "machine {} jailed", vmid);
        } else if cfg.socket_path.is_none() {
            cfg.socket_path = Some(DEFAULT_SOCKET_PATH.into());
        }

        if cfg.balloon.is_some() {
            machine.handlers.init.swappend(create_balloon_handler());
        }

        // a CNI interface needs a netns handle; default it under the
        // conventional directory keyed by vmid
        if cfg.net_ns.is_none()
            && cfg
                .network_interfaces
                .0
                .iter()
                .any(|i| i.cni_configuration.is_some())
        {
            cfg.net_ns = Some(PathBuf::from(DEFAULT_NETNS_DIR).join(&vmid));
        }

        let socket_path = cfg.socket_path.as_ref().ok_or(MachineError::Initialize(
            "no socket_path provided in the config".to_string(),
        ))?;
        machine.agent = Agent::new(socket_path);
        debug!(target: "Machine::new", "machine agent will dial {:#?}", socket_path);

        machine.machine_config = cfg.machine_cfg.to_owned().unwrap_or_default();
        machine.cfg = cfg;

        Ok(machine)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    /// The child's pid, or None when no VMM is running.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn vmid(&self) -> Option<&str> {
        self.cfg.vmid.as_deref()
    }

    pub fn socket_path(&self) -> Option<&PathBuf> {
        self.cfg.socket_path.as_ref()
    }

    /// The machine configuration as captured from the VMM after
    /// create_machine, which may differ from the requested one.
    pub fn reported_machine_config(&self) -> &MachineConfiguration {
        &self.machine_config
    }

    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    /// Pipelines may be reordered or extended until start() begins; later
    /// mutations have no effect on a running start.
    pub fn handlers_mut(&mut self) -> &mut Handlers {
        &mut self.handlers
    }

    /// Overrides the command used to spawn the VMM. Useful for tests and
    /// for wrapping the hypervisor in custom supervision.
    pub fn set_command(&mut self, cmd: tokio::process::Command) {
        self.cmd = Some(cmd);
    }

    /// start brings the VMM up: it runs the validation pipeline, resolves
    /// the network, spawns the process, runs the setup and init pipelines
    /// and issues InstanceStart (or loads the snapshot). It may only be
    /// called once per machine; later calls return AlreadyStarted.
    pub async fn start(&mut self) -> Result<(), MachineError> {
        debug!(target: "Machine::start", "called Machine::start");

        match self.state {
            MachineState::NotStarted => {}
            _ => return Err(MachineError::AlreadyStarted),
        }
        self.state = MachineState::Starting;

        // validation failures leave the machine pristine and startable again
        let validation = self.handlers.validation.to_owned();
        if let Err(e) = validation.run(self).await {
            self.state = MachineState::NotStarted;
            return Err(e);
        }

        if let Err(e) = self.run_start_pipelines().await {
            error!(target: "Machine::start", "start failed: {}", e);
            if let Err(cleanup_err) = self.stop_vmm().await {
                warn!(target: "Machine::start", "cleanup after failed start also failed: {}", cleanup_err);
            }
            return Err(e);
        }

        self.start_fifo_pumps();
        self.state = MachineState::Running;
        info!(target: "Machine::start", "machine {} started", self.cfg.vmid.as_deref().unwrap_or(""));
        Ok(())
    }

    async fn run_start_pipelines(&mut self) -> Result<(), MachineError> {
        self.resolve_network().await?;

        let setup = self.handlers.setup.to_owned();
        setup.run(self).await?;

        let init = self.handlers.init.to_owned();
        init.run(self).await?;

        // a snapshot load replaces the cold boot; InstanceStart is not valid
        // on a restored VM
        if self.cfg.snapshot_cfg.is_none() {
            self.start_instance().await?;
        }
        Ok(())
    }

    /// Resolves CNI interfaces into static ones and rewrites the kernel
    /// args with the ip= boot parameter. Runs before any handler.
    async fn resolve_network(&mut self) -> Result<(), MachineError> {
        if self.cfg.network_interfaces.is_empty() {
            return Ok(());
        }
        let vmid = self.cfg.vmid.to_owned().ok_or(MachineError::ArgWrong(
            "no vmid provided in the config".to_string(),
        ))?;
        let net_ns = self.cfg.net_ns.to_owned();

        let mut kernel_args = KernelArgs::from(self.cfg.kernel_args.to_owned().unwrap_or_default());
        self.cfg
            .network_interfaces
            .setup(&vmid, &net_ns, &mut kernel_args)
            .await?;
        if !kernel_args.is_empty() {
            self.cfg.kernel_args = Some(kernel_args.to_string());
        }
        Ok(())
    }

    /// Spawns the VMM (or jailer) child, installs the signal relay and
    /// waits for the API socket to accept requests.
    pub(crate) async fn start_vmm(&mut self) -> Result<(), MachineError> {
        debug!(target: "Machine::start_vmm", "called Machine::start_vmm");

        let socket_path = self.cfg.socket_path.to_owned().ok_or(MachineError::ArgWrong(
            "no socket path provided in the configuration".to_string(),
        ))?;

        if self.cmd.is_none() {
            let mut builder = VMMCommandBuilder::default()
                .with_socket_path(&socket_path)
                .with_args(vec![
                    "--id".to_string(),
                    self.cfg.vmid.to_owned().unwrap_or_default(),
                ]);
            if let Some(stdout) = &self.cfg.stdout {
                builder = builder.with_stdout(stdout.open_io().map_err(|e| {
                    MachineError::FileAccess(format!("fail to open stdout: {}", e))
                })?);
            }
            if let Some(stderr) = &self.cfg.stderr {
                builder = builder.with_stderr(stderr.open_io().map_err(|e| {
                    MachineError::FileAccess(format!("fail to open stderr: {}", e))
                })?);
            }
            if let Some(stdin) = &self.cfg.stdin {
                builder = builder.with_stdin(stdin.open_io().map_err(|e| {
                    MachineError::FileAccess(format!("fail to open stdin: {}", e))
                })?);
            }
            self.cmd = Some(builder.build().into());
        }

        debug!(target: "Machine::start_vmm", "start command: {:#?}", self.cmd);

        let child = match self.cmd.as_mut() {
            Some(cmd) => cmd.spawn().map_err(|e| {
                error!(target: "Machine::start_vmm", "fail to spawn the VMM process: {}", e);
                MachineError::Spawn(e.to_string())
            })?,
            None => {
                return Err(MachineError::Initialize(
                    "no command assembled for the VMM".to_string(),
                ))
            }
        };
        self.pid = child.id();
        self.child_process = Some(child);
        info!(target: "Machine::start_vmm", "VMM spawned, pid {:?}", self.pid);

        let forward = self
            .cfg
            .forward_signals
            .to_owned()
            .unwrap_or_else(|| DEFAULT_FORWARD_SIGNALS.to_vec());
        if !forward.is_empty() {
            if let Some(pid) = self.pid {
                self.signal_forwarder = Some(signals::register(pid as i32, &forward));
            }
        }

        let deadline = Duration::from_secs(DEFAULT_SOCKET_READY_TIMEOUT_SECS);
        if let Err(e) = self.wait_for_socket(deadline).await {
            error!(target: "Machine::start_vmm", "{}", e);
            return Err(e);
        }

        debug!(target: "Machine::start_vmm", "VMM socket ready at {:#?}", socket_path);
        Ok(())
    }

    /// Polls the API socket until a GET /machine-config answers 2xx, the
    /// child exits, or the deadline elapses.
    pub(crate) async fn wait_for_socket(&mut self, deadline: Duration) -> Result<(), MachineError> {
        let started = Instant::now();
        loop {
            if let Some(child) = self.child_process.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        let stderr_tail = self.child_stderr_tail().await;
                        return Err(MachineError::SocketReadiness(format!(
                            "VMM exited ({}) before the API socket was ready{}",
                            status, stderr_tail
                        )));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        return Err(MachineError::SocketReadiness(format!(
                            "fail to poll the VMM process: {}",
                            e
                        )))
                    }
                }
            }

            if let Some(socket_path) = &self.cfg.socket_path {
                if tokio::fs::metadata(socket_path).await.is_ok()
                    && self.agent.get_machine_configuration().await.is_ok()
                {
                    return Ok(());
                }
            }

            if started.elapsed() >= deadline {
                return Err(MachineError::SocketReadiness(format!(
                    "timed out after {:?}",
                    deadline
                )));
            }

            sleep(Duration::from_millis(SOCKET_POLL_INTERVAL_MS)).await;
        }
    }

    /// Best-effort read of the child's piped stderr, attached to socket
    /// readiness failures.
    async fn child_stderr_tail(&mut self) -> String {
        let Some(child) = self.child_process.as_mut() else {
            return String::new();
        };
        let Some(mut stderr) = child.stderr.take() else {
            return String::new();
        };
        let mut buf = Vec::new();
        let _ = timeout(Duration::from_millis(100), stderr.read_to_end(&mut buf)).await;
        if buf.is_empty() {
            String::new()
        } else {
            format!(", stderr: {}", String::from_utf8_lossy(&buf).trim_end())
        }
    }

    /// Creates the log and metrics FIFOs (or plain files) the VMM will
    /// write to.
    pub(crate) fn create_log_files(&mut self) -> Result<(), MachineError> {
        let targets = [
            (self.cfg.log_fifo.to_owned(), self.cfg.log_path.to_owned()),
            (
                self.cfg.metrics_fifo.to_owned(),
                self.cfg.metrics_path.to_owned(),
            ),
        ];
        for (fifo, path) in targets {
            if let Some(fifo) = fifo {
                unistd::mkfifo(&fifo, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| {
                    MachineError::FileCreation(format!(
                        "cannot make fifo at {}: {}",
                        fifo.display(),
                        e.to_string()
                    ))
                })?;
                self.created_files.push(fifo);
            } else if let Some(path) = path {
                let raw_fd = fcntl::open(
                    &path,
                    OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_APPEND,
                    Mode::S_IRUSR | Mode::S_IWUSR,
                )
                .map_err(|e| {
                    MachineError::FileCreation(format!(
                        "cannot make file at {}: {}",
                        path.display(),
                        e.to_string()
                    ))
                })?;
                unistd::close(raw_fd).map_err(|e| {
                    MachineError::FileCreation(format!(
                        "fail to close file at {}: {}",
                        path.display(),
                        e.to_string()
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Points the VMM's logger and metrics streams at the created FIFOs or
    /// files.
    pub(crate) async fn bootstrap_logging(&mut self) -> Result<(), MachineError> {
        if let Some(log_target) = self.cfg.log_fifo.to_owned().or(self.cfg.log_path.to_owned()) {
            let mut logger = Logger::default().with_log_path(&log_target);
            if let Some(level) = &self.cfg.log_level {
                logger = logger.with_log_level(level);
            }
            self.agent.put_logger(&logger).await?;
            debug!(target: "Machine::bootstrap_logging", "logging set up at {}", log_target.display());
        }

        if let Some(metrics_target) = self
            .cfg
            .metrics_fifo
            .to_owned()
            .or(self.cfg.metrics_path.to_owned())
        {
            let metrics = Metrics::default().with_metrics_path(&metrics_target);
            self.agent.put_metrics(&metrics).await?;
            debug!(target: "Machine::bootstrap_logging", "metrics set up at {}", metrics_target.display());
        }

        Ok(())
    }

    /// PUTs the machine configuration, then mirrors back what firecracker
    /// actually holds.
    pub(crate) async fn create_machine(&mut self) -> Result<(), MachineError> {
        let machine_cfg = self.cfg.machine_cfg.to_owned().ok_or(MachineError::ArgWrong(
            "no machine configuration provided".to_string(),
        ))?;
        self.agent.put_machine_configuration(&machine_cfg).await?;
        self.machine_config = self.agent.get_machine_configuration().await?;
        debug!(target: "Machine::create_machine", "machine config in effect: {:#?}", self.machine_config);
        Ok(())
    }

    pub(crate) async fn create_boot_source(&mut self) -> Result<(), MachineError> {
        let kernel_image_path =
            self.cfg
                .kernel_image_path
                .to_owned()
                .ok_or(MachineError::ArgWrong(
                    "no kernel image path provided".to_string(),
                ))?;
        let mut boot_source = BootSource::from_kernel_image_path(kernel_image_path);
        if let Some(initrd_path) = &self.cfg.initrd_path {
            boot_source = boot_source.with_initrd_path(initrd_path);
        }
        if let Some(kernel_args) = &self.cfg.kernel_args {
            boot_source = boot_source.with_boot_args(kernel_args);
        }
        self.agent.put_guest_boot_source(&boot_source).await?;
        debug!(target: "Machine::create_boot_source", "boot source set");
        Ok(())
    }

    pub(crate) async fn attach_drives(&mut self) -> Result<(), MachineError> {
        for drive in &self.cfg.drives {
            let host_path = drive.get_path_on_host();
            info!(
                target: "Machine::attach_drives",
                "attaching drive {}, slot {}, root {}",
                host_path.display(),
                drive.get_drive_id(),
                drive.is_root_device()
            );
            self.agent.put_guest_drive_by_id(drive).await.map_err(|e| {
                error!(target: "Machine::attach_drives", "attach drive failed: {}: {}", host_path.display(), e);
                e
            })?;
        }
        Ok(())
    }

    pub(crate) async fn create_network_interfaces(&mut self) -> Result<(), MachineError> {
        if self.cfg.network_interfaces.is_empty() {
            return Ok(());
        }
        for iface in self.cfg.network_interfaces.as_wire_interfaces()? {
            self.agent.put_guest_network_interface_by_id(&iface).await?;
            debug!(target: "Machine::create_network_interfaces", "interface {} registered", iface.iface_id);
        }
        Ok(())
    }

    pub(crate) async fn add_vsocks(&mut self) -> Result<(), MachineError> {
        for vsock in &self.cfg.vsock_devices {
            self.agent.put_guest_vsock(vsock).await?;
            info!(target: "Machine::add_vsocks", "attached vsock {}", vsock.uds_path.display());
        }
        Ok(())
    }

    /// Seeds the MMDS data store with the configured initial contents.
    pub(crate) async fn set_mmds_contents(&mut self) -> Result<(), MachineError> {
        if let Some(contents) = self.cfg.mmds_contents.to_owned() {
            self.agent.put_mmds(&contents).await?;
            debug!(target: "Machine::set_mmds_contents", "MMDS seeded");
        }
        Ok(())
    }

    /// PUTs the MMDS configuration when at least one interface allows MMDS.
    pub(crate) async fn set_mmds_config(&mut self) -> Result<(), MachineError> {
        let iface_ids = self.cfg.network_interfaces.mmds_iface_ids();
        if iface_ids.is_empty() {
            return Ok(());
        }

        let mut mmds_config = MmdsConfig::default().with_network_interfaces(iface_ids);
        if let Some(addr) = &self.cfg.mmds_address {
            mmds_config = mmds_config.with_ipv4_address(addr.to_string());
        }
        if let Some(version) = self.cfg.mmds_version {
            mmds_config = mmds_config.with_version(version);
        }
        self.agent.put_mmds_config(&mmds_config).await?;
        debug!(target: "Machine::set_mmds_config", "MMDS config set");
        Ok(())
    }

    /// Publishes the configured init metadata to the MMDS.
    pub(crate) async fn set_init_metadata(&mut self) -> Result<(), MachineError> {
        if let Some(metadata) = self.cfg.init_metadata.to_owned() {
            self.agent.put_mmds(&metadata).await?;
            debug!(target: "Machine::set_init_metadata", "init metadata published");
        }
        Ok(())
    }

    pub(crate) async fn create_balloon(&mut self) -> Result<(), MachineError> {
        if let Some(balloon) = self.cfg.balloon.to_owned() {
            self.agent.put_balloon(&balloon).await?;
            debug!(target: "Machine::create_balloon", "balloon device created");
        }
        Ok(())
    }

    /// Loads the configured snapshot, resuming the VM if requested.
    pub(crate) async fn load_snapshot_from_config(&mut self) -> Result<(), MachineError> {
        let snapshot_cfg = self.cfg.snapshot_cfg.to_owned().ok_or(MachineError::ArgWrong(
            "no snapshot configuration provided".to_string(),
        ))?;
        self.agent
            .load_snapshot(&snapshot_cfg.as_load_params())
            .await?;
        info!(target: "Machine::load_snapshot", "snapshot {} loaded", snapshot_cfg.snapshot_path.display());
        Ok(())
    }

    /// Hard links the kernel image, initrd, drives and FIFOs into the
    /// jailer chroot, hands them to the jailed uid/gid and rewrites the
    /// configured paths to chroot-relative basenames.
    pub(crate) async fn link_files_to_rootfs(&mut self) -> Result<(), MachineError> {
        let jailer_cfg = match &self.cfg.jailer_cfg {
            None => {
                warn!(target: "Machine::link_files_to_rootfs", "jailer config was not set for use");
                return Ok(());
            }
            Some(jailer_cfg) => jailer_cfg.to_owned(),
        };

        let rootfs = jailer_cfg.rootfs_path()?;
        let uid = jailer_cfg.uid.ok_or(MachineError::ArgWrong(
            "no uid provided in jailer config".to_string(),
        ))?;
        let gid = jailer_cfg.gid.ok_or(MachineError::ArgWrong(
            "no gid provided in jailer config".to_string(),
        ))?;

        let chown_into_jail = |target: &PathBuf| -> Result<(), MachineError> {
            unistd::chown(
                target,
                Some(unistd::Uid::from_raw(uid)),
                Some(unistd::Gid::from_raw(gid)),
            )
            .map_err(|e| {
                error!(target: "Machine::link_files_to_rootfs", "fail to chown {}: {}", target.display(), e);
                MachineError::FileAccess(format!("fail to chown {}: {}", target.display(), e))
            })
        };

        let link_into_jail = |from: &PathBuf| -> Result<PathBuf, MachineError> {
            let file_name: PathBuf = from
                .file_name()
                .ok_or(MachineError::ArgWrong(format!(
                    "malformed file path {}",
                    from.display()
                )))?
                .into();
            let target: PathBuf = [&rootfs, &file_name].iter().collect();
            link_or_copy(from, &target).map_err(|e| {
                error!(target: "Machine::link_files_to_rootfs", "fail to link {} into the chroot: {}", from.display(), e);
                MachineError::FileAccess(format!(
                    "fail to link {} into the chroot: {}",
                    from.display(),
                    e
                ))
            })?;
            chown_into_jail(&target)?;
            Ok(file_name)
        };

        let kernel_image_path =
            self.cfg
                .kernel_image_path
                .to_owned()
                .ok_or(MachineError::ArgWrong(
                    "no kernel image path provided".to_string(),
                ))?;
        self.cfg.kernel_image_path = Some(link_into_jail(&kernel_image_path)?);

        if let Some(initrd_path) = self.cfg.initrd_path.to_owned() {
            self.cfg.initrd_path = Some(link_into_jail(&initrd_path)?);
        }

        for i in 0..self.cfg.drives.len() {
            let host_path = self.cfg.drives[i].get_path_on_host();
            let jailed = link_into_jail(&host_path)?;
            self.cfg.drives[i].set_drive_path(jailed);
        }

        if let Some(log_fifo) = self.cfg.log_fifo.to_owned() {
            self.cfg.log_fifo = Some(link_into_jail(&log_fifo)?);
        }
        if let Some(metrics_fifo) = self.cfg.metrics_fifo.to_owned() {
            self.cfg.metrics_fifo = Some(link_into_jail(&metrics_fifo)?);
        }

        Ok(())
    }

    /// start_instance sends the InstanceStart action. Called only by start,
    /// after every pipeline succeeded.
    async fn start_instance(&mut self) -> Result<(), MachineError> {
        self.agent
            .create_sync_action(&InstanceActionInfo::instance_start())
            .await?;
        info!(target: "Machine::start_instance", "instance start sent");
        Ok(())
    }

    /// Pumps each configured FIFO into its sink until EOF or machine stop.
    fn start_fifo_pumps(&mut self) {
        // the pumps must read through the host-visible path even when the
        // config was rewritten to chroot-relative names
        let log_fifo = self
            .created_files
            .iter()
            .find(|p| {
                self.cfg
                    .log_fifo
                    .as_ref()
                    .and_then(|f| f.file_name())
                    .map(|n| p.file_name() == Some(n))
                    .unwrap_or(false)
            })
            .cloned();
        if let Some(fifo) = log_fifo {
            let sink = self
                .cfg
                .fifo_log_writer
                .as_ref()
                .and_then(|w| w.open_writer().ok().flatten())
                .or_else(|| self.log_sink_file(&self.cfg.log_path));
            self.fifo_pumps.push(tokio::spawn(pump_fifo(
                fifo,
                sink,
                self.exit_recv.clone(),
                "vmm-log",
            )));
        }

        let metrics_fifo = self
            .created_files
            .iter()
            .find(|p| {
                self.cfg
                    .metrics_fifo
                    .as_ref()
                    .and_then(|f| f.file_name())
                    .map(|n| p.file_name() == Some(n))
                    .unwrap_or(false)
            })
            .cloned();
        if let Some(fifo) = metrics_fifo {
            let sink = self.log_sink_file(&self.cfg.metrics_path);
            self.fifo_pumps.push(tokio::spawn(pump_fifo(
                fifo,
                sink,
                self.exit_recv.clone(),
                "vmm-metrics",
            )));
        }
    }

    fn log_sink_file(&self, path: &Option<PathBuf>) -> Option<std::fs::File> {
        let path = path.as_ref()?;
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(target: "Machine", "fail to open pump sink {}: {}", path.display(), e);
                None
            }
        }
    }

    /// shutdown requests a clean shutdown of the VM by sending CtrlAltDel on
    /// the virtual keyboard. The guest decides when to exit; observe it with
    /// wait.
    pub async fn shutdown(&mut self) -> Result<(), MachineError> {
        debug!(target: "Machine::shutdown", "called Machine::shutdown");
        self.ensure_state("shutdown", &[MachineState::Running])?;
        self.agent
            .create_sync_action(&InstanceActionInfo::send_ctrl_alt_del())
            .await?;
        self.state = MachineState::Stopping;
        Ok(())
    }

    /// pause pauses the vCPUs of the microVM.
    pub async fn pause(&mut self) -> Result<(), MachineError> {
        debug!(target: "Machine::pause", "called Machine::pause");
        self.ensure_state("pause", &[MachineState::Running, MachineState::Paused])?;
        self.agent.patch_vm(&VM_STATE_PAUSED).await?;
        self.state = MachineState::Paused;
        info!(target: "Machine::pause", "machine {} paused", self.cfg.vmid.as_deref().unwrap_or(""));
        Ok(())
    }

    /// resume resumes the microVM from pause.
    pub async fn resume(&mut self) -> Result<(), MachineError> {
        debug!(target: "Machine::resume", "called Machine::resume");
        self.ensure_state("resume", &[MachineState::Running, MachineState::Paused])?;
        self.agent.patch_vm(&VM_STATE_RESUMED).await?;
        self.state = MachineState::Running;
        info!(target: "Machine::resume", "machine {} resumed", self.cfg.vmid.as_deref().unwrap_or(""));
        Ok(())
    }

    /// create_snapshot writes the guest memory and state to the given
    /// paths. The VM must be paused first.
    pub async fn create_snapshot(
        &mut self,
        mem_file_path: impl Into<PathBuf>,
        snapshot_path: impl Into<PathBuf>,
    ) -> Result<(), MachineError> {
        self.create_snapshot_with_params(&SnapshotCreateParams::new(
            mem_file_path.into(),
            snapshot_path.into(),
        ))
        .await
    }

    pub async fn create_snapshot_with_params(
        &mut self,
        params: &SnapshotCreateParams,
    ) -> Result<(), MachineError> {
        debug!(target: "Machine::create_snapshot", "called Machine::create_snapshot");
        self.ensure_state("create_snapshot", &[MachineState::Paused])?;
        self.agent.create_snapshot(params).await?;
        info!(target: "Machine::create_snapshot", "snapshot written to {}", params.snapshot_path.display());
        Ok(())
    }

    /// update_guest_drive patches a drive's host path or rate limiters
    /// after boot.
    pub async fn update_guest_drive(
        &mut self,
        partial_drive: &PartialDrive,
    ) -> Result<(), MachineError> {
        self.ensure_state(
            "update_guest_drive",
            &[MachineState::Running, MachineState::Paused],
        )?;
        self.agent.patch_guest_drive_by_id(partial_drive).await?;
        Ok(())
    }

    /// update_guest_network_interface_rate_limiters patches an interface's
    /// rate limiters after boot.
    pub async fn update_guest_network_interface_rate_limiters(
        &mut self,
        partial_iface: &PartialNetworkInterface,
    ) -> Result<(), MachineError> {
        self.ensure_state(
            "update_guest_network_interface_rate_limiters",
            &[MachineState::Running, MachineState::Paused],
        )?;
        self.agent
            .patch_guest_network_interface_by_id(partial_iface)
            .await?;
        Ok(())
    }

    /// set_metadata replaces the whole MMDS data store.
    pub async fn set_metadata(&mut self, metadata: &MmdsContentsObject) -> Result<(), MachineError> {
        self.ensure_state("set_metadata", &[MachineState::Running, MachineState::Paused])?;
        self.agent.put_mmds(metadata).await?;
        Ok(())
    }

    /// update_metadata merges the given document into the MMDS data store.
    pub async fn update_metadata(
        &mut self,
        metadata: &MmdsContentsObject,
    ) -> Result<(), MachineError> {
        self.ensure_state(
            "update_metadata",
            &[MachineState::Running, MachineState::Paused],
        )?;
        self.agent.patch_mmds(metadata).await?;
        Ok(())
    }

    pub async fn get_metadata(&mut self) -> Result<MmdsContentsObject, MachineError> {
        self.ensure_state("get_metadata", &[MachineState::Running, MachineState::Paused])?;
        Ok(self.agent.get_mmds().await?)
    }

    /// update_balloon retargets the balloon size. Only the amount is
    /// patched; deflate_on_oom keeps whatever value the device was created
    /// with.
    pub async fn update_balloon(&mut self, amount_mib: i64) -> Result<(), MachineError> {
        self.ensure_state(
            "update_balloon",
            &[MachineState::Running, MachineState::Paused],
        )?;
        self.agent
            .patch_balloon(&BalloonUpdate::new(amount_mib))
            .await?;
        Ok(())
    }

    pub async fn get_balloon_config(&mut self) -> Result<Balloon, MachineError> {
        self.ensure_state(
            "get_balloon_config",
            &[MachineState::Running, MachineState::Paused],
        )?;
        Ok(self.agent.describe_balloon_config().await?)
    }

    pub async fn get_balloon_stats(&mut self) -> Result<BalloonStatistics, MachineError> {
        self.ensure_state(
            "get_balloon_stats",
            &[MachineState::Running, MachineState::Paused],
        )?;
        Ok(self.agent.describe_balloon_stats().await?)
    }

    pub async fn update_balloon_stats_interval(
        &mut self,
        interval_s: i64,
    ) -> Result<(), MachineError> {
        self.ensure_state(
            "update_balloon_stats_interval",
            &[MachineState::Running, MachineState::Paused],
        )?;
        self.agent
            .patch_balloon_stats_interval(&BalloonStatsUpdate::new(interval_s))
            .await?;
        Ok(())
    }

    /// flush_metrics forces the VMM to flush its metrics stream.
    pub async fn flush_metrics(&mut self) -> Result<(), MachineError> {
        self.ensure_state(
            "flush_metrics",
            &[MachineState::Running, MachineState::Paused],
        )?;
        self.agent
            .create_sync_action(&InstanceActionInfo::flush_metrics())
            .await?;
        Ok(())
    }

    pub async fn describe_instance_info(&mut self) -> Result<InstanceInfo, MachineError> {
        self.ensure_running_vmm("describe_instance_info")?;
        Ok(self.agent.describe_instance().await?)
    }

    pub async fn get_firecracker_version(&mut self) -> Result<FirecrackerVersion, MachineError> {
        self.ensure_running_vmm("get_firecracker_version")?;
        Ok(self.agent.get_firecracker_version().await?)
    }

    pub async fn get_export_vm_config(&mut self) -> Result<FullVmConfiguration, MachineError> {
        self.ensure_running_vmm("get_export_vm_config")?;
        Ok(self.agent.get_export_vm_config().await?)
    }

    /// stop_vmm stops the VMM with SIGTERM, escalating to SIGKILL after a
    /// grace period. Idempotent: the second and later calls observe the
    /// already-terminal machine and return Ok.
    pub async fn stop_vmm(&mut self) -> Result<(), MachineError> {
        debug!(target: "Machine::stop_vmm", "called Machine::stop_vmm");

        if self.terminal.is_some() {
            return Ok(());
        }
        self.state = MachineState::Stopping;

        let outcome = match self.child_process.as_mut() {
            None => TerminalOutcome::CleanExit,
            Some(child) => {
                if let Some(pid) = child.id() {
                    debug!(target: "Machine::stop_vmm", "sending SIGTERM to firecracker, pid {}", pid);
                    if let Err(e) = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid as i32),
                        nix::sys::signal::SIGTERM,
                    ) {
                        // ESRCH means the child beat us to the exit
                        if e != nix::errno::Errno::ESRCH {
                            return Err(MachineError::Execute(format!(
                                "fail to send SIGTERM to firecracker process {}: {}",
                                pid, e
                            )));
                        }
                    }
                }

                let grace = Duration::from_secs(DEFAULT_STOP_VMM_TIMEOUT_SECS);
                match timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => TerminalOutcome::from_status(status).absorb_intentional_stop(),
                    Ok(Err(e)) => {
                        return Err(MachineError::Execute(format!(
                            "fail to reap the firecracker process: {}",
                            e
                        )))
                    }
                    Err(_) => {
                        warn!(target: "Machine::stop_vmm", "SIGTERM grace period elapsed, sending SIGKILL");
                        child.kill().await.map_err(|e| {
                            MachineError::Execute(format!(
                                "fail to SIGKILL the firecracker process: {}",
                                e
                            ))
                        })?;
                        TerminalOutcome::CleanExit
                    }
                }
            }
        };

        self.finalize_exit(outcome).await;
        Ok(())
    }

    /// wait blocks until the VMM reaches its terminal state and returns the
    /// translated exit status. Repeated calls return the cached result.
    pub async fn wait(&mut self) -> Result<(), MachineError> {
        debug!(target: "Machine::wait", "called Machine::wait");

        if matches!(self.state, MachineState::NotStarted) {
            return Err(MachineError::Execute(
                "cannot wait before machine starts".to_string(),
            ));
        }

        if let Some(outcome) = self.terminal {
            return outcome.as_result();
        }

        let outcome = match self.child_process.as_mut() {
            Some(child) => match child.wait().await {
                Ok(status) => TerminalOutcome::from_status(status),
                Err(e) => {
                    return Err(MachineError::Execute(format!(
                        "fail to wait for the firecracker process: {}",
                        e
                    )))
                }
            },
            None => {
                // no child to reap here; wait for whoever owns the exit to
                // close the channel
                let recv = self.exit_recv.clone();
                let _ = recv.recv().await;
                self.terminal.unwrap_or(TerminalOutcome::CleanExit)
            }
        };

        self.finalize_exit(outcome).await;
        info!(target: "Machine::wait", "machine {} exited", self.cfg.vmid.as_deref().unwrap_or(""));
        self.terminal
            .unwrap_or(TerminalOutcome::CleanExit)
            .as_result()
    }

    /// Records the terminal outcome exactly once: caches it, closes the
    /// exit channel, tears down the signal relay, joins the pumps and
    /// removes the files this machine created.
    async fn finalize_exit(&mut self, outcome: TerminalOutcome) {
        if self.terminal.is_some() {
            return;
        }
        self.terminal = Some(outcome);
        self.state = MachineState::Stopped;
        self.child_process = None;
        self.pid = None;

        if let Some(forwarder) = self.signal_forwarder.take() {
            forwarder.deregister();
        }

        self.exit_send.close();
        for pump in self.fifo_pumps.drain(..) {
            if let Err(e) = pump.await {
                warn!(target: "Machine::finalize_exit", "fifo pump ended abnormally: {}", e);
            }
        }

        if let Err(e) = self.cfg.network_interfaces.teardown().await {
            warn!(target: "Machine::finalize_exit", "network teardown failed: {}", e);
        }

        let mut leftovers: Vec<PathBuf> = self.created_files.drain(..).collect();
        if let Some(socket_path) = &self.cfg.socket_path {
            leftovers.push(socket_path.to_owned());
        }
        for path in leftovers {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(target: "Machine::finalize_exit", "fail to remove {}: {}", path.display(), e);
                }
            }
        }

        info!(target: "Machine::finalize_exit", "machine {} cleaned", self.cfg.vmid.as_deref().unwrap_or(""));
    }

    fn ensure_state(
        &self,
        op: &'static str,
        allowed: &[MachineState],
    ) -> Result<(), MachineError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(MachineError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    /// Read-only API surfaces stay usable while a VMM process exists at
    /// all, including during Starting and Stopping.
    fn ensure_running_vmm(&self, op: &'static str) -> Result<(), MachineError> {
        match self.state {
            MachineState::NotStarted => Err(MachineError::InvalidState { op, state: self.state }),
            MachineState::Stopped => Err(MachineError::AlreadyStopped),
            _ => Ok(()),
        }
    }
}

/// Copies FIFO contents to the sink until the exit channel closes. The FIFO
/// is opened non-blocking so a missing writer never wedges the pump.
async fn pump_fifo(
    fifo: PathBuf,
    mut sink: Option<std::fs::File>,
    exit: async_channel::Receiver<()>,
    stream_target: &'static str,
) {
    use std::io::Write;

    let raw_fd = match fcntl::open(
        &fifo,
        OFlag::O_RDONLY | OFlag::O_NONBLOCK,
        Mode::empty(),
    ) {
        Ok(fd) => fd,
        Err(e) => {
            warn!(target: "Machine", "fail to open fifo {} for pumping: {}", fifo.display(), e);
            return;
        }
    };
    let std_file = unsafe { std::fs::File::from_raw_fd(raw_fd) };
    let mut file = tokio::fs::File::from_std(std_file);
    let mut buf = [0u8; 4096];

    loop {
        tokio::select! {
            // the sender is closed on stop, which completes this arm
            _ = exit.recv() => break,
            read = file.read(&mut buf) => match read {
                Ok(0) => sleep(Duration::from_millis(50)).await,
                Ok(n) => {
                    if let Some(sink) = sink.as_mut() {
                        if let Err(e) = sink.write_all(&buf[..n]) {
                            warn!(target: "Machine", "fifo pump sink write failed for {}: {}", fifo.display(), e);
                        }
                    } else {
                        for line in String::from_utf8_lossy(&buf[..n]).lines() {
                            debug!(target: "vmm", "[{}] {}", stream_target, line);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    sleep(Duration::from_millis(50)).await;
                }
                Err(e) => {
                    warn!(target: "Machine", "fifo pump read failed for {}: {}", fifo.display(), e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::handlers::{
        CREATE_MACHINE_HANDLER_NAME, LINK_FILES_TO_ROOTFS_HANDLER_NAME, VALIDATE_CFG_HANDLER_NAME,
    };
    use crate::model::cpu_template::CPUTemplate;

    fn basic_machine_cfg() -> MachineConfiguration {
        MachineConfiguration::default()
            .with_vcpu_count(1)
            .with_mem_size_mib(128)
            .with_cpu_template(&CPUTemplate::T2)
    }

    #[test]
    fn test_new_machine() {
        let config = Config::default()
            .with_machine_config(basic_machine_cfg())
            .set_disable_validation(true);
        let m = Machine::new(config).expect("failed to create new machine");
        assert_eq!(m.state(), MachineState::NotStarted);
        assert!(m.pid().is_none());
        assert!(m.vmid().is_some());
        assert_eq!(
            m.handlers().setup.names(),
            vec![
                "start_vmm",
                "create_log_files",
                "bootstrap_logging",
                "create_machine",
                "create_boot_source",
                "attach_drives",
                "create_network_interfaces",
                "add_vsocks",
            ]
        );
    }

    #[test]
    fn test_balloon_appends_init_handler() {
        let config = Config::default()
            .with_machine_config(basic_machine_cfg())
            .with_balloon(Balloon::new().with_amount_mib(64))
            .set_disable_validation(true);
        let m = Machine::new(config).unwrap();
        assert_eq!(
            m.handlers().init.names(),
            vec!["set_mmds", "config_mmds", "set_metadata", "create_balloon"]
        );
    }

    #[test]
    fn test_jailed_machine_rewrites_socket_and_handlers() {
        let config = Config::default()
            .with_machine_config(basic_machine_cfg())
            .with_jailer_config(
                JailerConfig::default()
                    .with_id("test-jail")
                    .with_uid(100)
                    .with_gid(100)
                    .with_exec_file("/usr/bin/firecracker"),
            )
            .set_disable_validation(true);
        let m = Machine::new(config).unwrap();

        assert_eq!(
            m.socket_path().unwrap(),
            &PathBuf::from("/srv/jailer/firecracker/test-jail/root/run/firecracker.socket")
        );
        assert!(!m.handlers().validation.has(VALIDATE_CFG_HANDLER_NAME));

        let names = m.handlers().setup.names();
        let create_machine_idx = names
            .iter()
            .position(|n| *n == CREATE_MACHINE_HANDLER_NAME)
            .unwrap();
        assert_eq!(
            names[create_machine_idx + 1],
            LINK_FILES_TO_ROOTFS_HANDLER_NAME
        );
    }

    #[test]
    fn test_validate_requires_kernel_and_socket() {
        let cfg = Config::default().with_machine_config(basic_machine_cfg());
        assert!(matches!(
            cfg.validate(),
            Err(MachineError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_two_root_drives() {
        let dir = std::env::temp_dir().join(format!("firevisor-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let kernel = dir.join("vmlinux");
        let rootfs_a = dir.join("a.ext4");
        let rootfs_b = dir.join("b.ext4");
        for f in [&kernel, &rootfs_a, &rootfs_b] {
            std::fs::write(f, b"stub").unwrap();
        }

        let cfg = Config::default()
            .with_machine_config(basic_machine_cfg())
            .with_kernel_image_path(&kernel)
            .with_socket_path(dir.join("api.socket"))
            .with_drive(
                Drive::new()
                    .with_drive_id("root-a")
                    .with_drive_path(&rootfs_a)
                    .set_root_device(true),
            )
            .with_drive(
                Drive::new()
                    .with_drive_id("root-b")
                    .with_drive_path(&rootfs_b)
                    .set_root_device(true),
            );
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("more than one drive"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_validate_rejects_duplicate_drive_ids() {
        let dir = std::env::temp_dir().join(format!("firevisor-dup-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let kernel = dir.join("vmlinux");
        let rootfs = dir.join("root.ext4");
        for f in [&kernel, &rootfs] {
            std::fs::write(f, b"stub").unwrap();
        }

        let cfg = Config::default()
            .with_machine_config(basic_machine_cfg())
            .with_kernel_image_path(&kernel)
            .with_socket_path(dir.join("api.socket"))
            .with_drive(
                Drive::new()
                    .with_drive_id("scratch")
                    .with_drive_path(&rootfs),
            )
            .with_drive(
                Drive::new()
                    .with_drive_id("scratch")
                    .with_drive_path(&rootfs),
            );
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicated drive id"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_operations_invalid_before_start() {
        let config = Config::default()
            .with_machine_config(basic_machine_cfg())
            .set_disable_validation(true);
        let mut m = Machine::new(config).unwrap();

        assert!(matches!(
            m.pause().await,
            Err(MachineError::InvalidState { op: "pause", .. })
        ));
        assert!(matches!(
            m.resume().await,
            Err(MachineError::InvalidState { op: "resume", .. })
        ));
        assert!(matches!(
            m.create_snapshot("/tmp/mem", "/tmp/snap").await,
            Err(MachineError::InvalidState { .. })
        ));
        assert!(matches!(m.wait().await, Err(MachineError::Execute(_))));
    }

    #[tokio::test]
    async fn test_socket_readiness_zero_deadline() {
        let config = Config::default()
            .with_machine_config(basic_machine_cfg())
            .with_socket_path("/tmp/firevisor-definitely-missing.socket")
            .set_disable_validation(true);
        let mut m = Machine::new(config).unwrap();
        let started = Instant::now();
        let err = m.wait_for_socket(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, MachineError::SocketReadiness(_)));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_socket_readiness_sub_interval_deadline() {
        let config = Config::default()
            .with_machine_config(basic_machine_cfg())
            .with_socket_path("/tmp/firevisor-definitely-missing.socket")
            .set_disable_validation(true);
        let mut m = Machine::new(config).unwrap();
        let err = m
            .wait_for_socket(Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
