use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::utils::{StdioTypes, DEFAULT_JAILER_PATH, DEFAULT_SOCKET_PATH, ROOTFS_FOLDER_NAME};

use super::{
    handlers::{Handler, HandlerFuture, CREATE_MACHINE_HANDLER_NAME, LINK_FILES_TO_ROOTFS_HANDLER_NAME, VALIDATE_CFG_HANDLER_NAME},
    machine::{Config, Machine, MachineError},
};

const DEFAULT_JAILER_BIN: &'static str = "jailer";

/// Seccomp policy handed to the jailer: the numeric levels of older
/// releases, or a BPF filter file on newer ones.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub enum JailerSeccomp {
    /// 0 disabled, 1 whitelist filtering, 2 whitelist plus parameter checks.
    Level(usize),
    /// Path to a BPF filter file.
    Filter(PathBuf),
}

/// Configuration of the jailer child wrapping the VMM.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct JailerConfig {
    /// GID the jailer switches to as it execs the target binary.
    pub gid: Option<u32>,

    /// UID the jailer switches to as it execs the target binary.
    pub uid: Option<u32>,

    /// ID is the unique VM identification string, which may contain
    /// alphanumeric characters and hyphens. The maximum id length is
    /// currently 64 characters, and it names the chroot directory.
    pub id: Option<String>,

    /// NumaNode represents the NUMA node the process gets assigned to.
    pub numa_node: Option<usize>,

    /// ExecFile is the path to the firecracker binary that will be exec-ed
    /// by the jailer.
    pub exec_file: Option<PathBuf>,

    /// JailerBinary specifies the jailer binary to be used for setting up
    /// the jail. If not specified it defaults to "jailer" and is resolved
    /// through PATH.
    pub jailer_binary: Option<PathBuf>,

    /// ChrootBaseDir represents the base folder where chroot jails are
    /// built. The default is /srv/jailer.
    pub chroot_base_dir: Option<PathBuf>,

    /// When daemonize is set, the jailer calls setsid() and redirects its
    /// stdio to /dev/null.
    pub daemonize: bool,

    /// Seccomp policy to apply to the VMM.
    pub seccomp: Option<JailerSeccomp>,

    /// Stdout specifies the writer to use when spawning the jailer.
    pub stdout: Option<StdioTypes>,

    /// Stderr specifies the writer to use when spawning the jailer.
    pub stderr: Option<StdioTypes>,

    /// Stdin specifies the reader to use when spawning the jailer.
    pub stdin: Option<StdioTypes>,
}

impl JailerConfig {
    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn with_gid(mut self, gid: u32) -> Self {
        self.gid = Some(gid);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_numa_node(mut self, node: usize) -> Self {
        self.numa_node = Some(node);
        self
    }

    pub fn with_exec_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.exec_file = Some(path.into());
        self
    }

    pub fn with_jailer_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.jailer_binary = Some(path.into());
        self
    }

    pub fn with_chroot_base_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.chroot_base_dir = Some(path.into());
        self
    }

    pub fn set_daemonize(mut self, b: bool) -> Self {
        self.daemonize = b;
        self
    }

    pub fn with_seccomp(mut self, seccomp: JailerSeccomp) -> Self {
        self.seccomp = Some(seccomp);
        self
    }

    pub fn with_stdout(mut self, stdout: StdioTypes) -> Self {
        self.stdout = Some(stdout);
        self
    }

    pub fn with_stderr(mut self, stderr: StdioTypes) -> Self {
        self.stderr = Some(stderr);
        self
    }

    pub fn with_stdin(mut self, stdin: StdioTypes) -> Self {
        self.stdin = Some(stdin);
        self
    }

    /// The chroot directory the jailer will build for this configuration:
    /// `<chroot_base>/<exec file basename>/<id>/root`.
    pub fn rootfs_path(&self) -> Result<PathBuf, MachineError> {
        let chroot_base_dir = self
            .chroot_base_dir
            .to_owned()
            .unwrap_or(DEFAULT_JAILER_PATH.into());
        let exec_file_name: PathBuf = self
            .exec_file
            .as_ref()
            .and_then(|p| p.file_name())
            .ok_or(MachineError::ArgWrong(
                "malformed firecracker exec file name".to_string(),
            ))?
            .into();
        let id_string: PathBuf = self
            .id
            .as_ref()
            .ok_or(MachineError::ArgWrong(
                "no id provided in jailer config".to_string(),
            ))?
            .into();

        Ok([
            chroot_base_dir,
            exec_file_name,
            id_string,
            ROOTFS_FOLDER_NAME.into(),
        ]
        .iter()
        .collect())
    }
}

/// Assembles the jailer child's argv. Field order in `args` is fixed by the
/// jailer CLI contract.
pub struct JailerCommandBuilder {
    bin: PathBuf,
    id: String,
    uid: u32,
    gid: u32,
    exec_file: PathBuf,
    node: usize,

    // optional params
    chroot_base_dir: Option<PathBuf>,
    net_ns: Option<PathBuf>,
    daemonize: bool,
    cgroups: Vec<String>,
    seccomp: Option<JailerSeccomp>,
    firecracker_args: Option<Vec<String>>,

    stdin: Option<std::process::Stdio>,
    stdout: Option<std::process::Stdio>,
    stderr: Option<std::process::Stdio>,
}

impl JailerCommandBuilder {
    /// new returns a new jailer command builder with the proper default
    /// values initialized.
    pub fn new() -> Self {
        Self {
            bin: DEFAULT_JAILER_BIN.into(),
            id: "".into(),
            uid: 0,
            gid: 0,
            exec_file: "".into(),
            node: 0,
            chroot_base_dir: None,
            net_ns: None,
            daemonize: false,
            cgroups: Vec::new(),
            seccomp: None,
            firecracker_args: None,
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    /// args returns the specified set of args to be used in command
    /// construction.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--id".into(),
            self.id.clone(),
            "--uid".into(),
            self.uid.to_string(),
            "--gid".into(),
            self.gid.to_string(),
            "--exec-file".into(),
            self.exec_file.to_string_lossy().to_string(),
            "--node".into(),
            self.node.to_string(),
        ];

        if let Some(chroot_base_dir) = &self.chroot_base_dir {
            args.push("--chroot-base-dir".into());
            args.push(chroot_base_dir.to_string_lossy().to_string());
        }

        if let Some(net_ns) = &self.net_ns {
            args.push("--netns".into());
            args.push(net_ns.to_string_lossy().to_string());
        }

        if self.daemonize {
            args.push("--daemonize".into());
        }

        for cgroup in &self.cgroups {
            args.push("--cgroup".into());
            args.push(cgroup.to_string());
        }

        match &self.seccomp {
            Some(JailerSeccomp::Level(level)) => {
                args.push("--seccomp-level".into());
                args.push(level.to_string());
            }
            Some(JailerSeccomp::Filter(path)) => {
                args.push("--seccomp-filter".into());
                args.push(path.to_string_lossy().to_string());
            }
            None => {}
        }

        if let Some(firecracker_args) = &self.firecracker_args {
            args.push("--".into());
            args.append(&mut firecracker_args.clone());
        }

        args
    }

    pub fn bin(&self) -> PathBuf {
        self.bin.clone()
    }

    /// with_bin will set the specific jailer binary to exec.
    pub fn with_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.bin = bin.into();
        self
    }

    /// with_id will set the specified id to the builder.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// with_uid will set the specified uid to the builder.
    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    /// with_gid will set the specified gid to the builder.
    pub fn with_gid(mut self, gid: u32) -> Self {
        self.gid = gid;
        self
    }

    /// with_exec_file will set the specified path to the builder. This
    /// represents the firecracker binary exec-ed by the jailer.
    pub fn with_exec_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.exec_file = path.into();
        self
    }

    /// with_numa_node sets the numa node that the process gets assigned to.
    pub fn with_numa_node(mut self, node: usize) -> Self {
        self.node = node;
        self
    }

    /// with_chroot_base_dir will set the given path as the chroot base
    /// directory. This specifies where chroot jails are built, and defaults
    /// to /srv/jailer.
    pub fn with_chroot_base_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.chroot_base_dir = Some(path.into());
        self
    }

    /// with_net_ns will set the path to the network namespace handle the
    /// jailed process joins.
    pub fn with_net_ns(mut self, path: impl Into<PathBuf>) -> Self {
        self.net_ns = Some(path.into());
        self
    }

    /// with_daemonize specifies whether the jailer calls setsid() and
    /// redirects stdio to /dev/null.
    pub fn with_daemonize(mut self, daemonize: bool) -> Self {
        self.daemonize = daemonize;
        self
    }

    /// with_cgroup appends a cgroup `file=value` assignment passed through
    /// to the jailer.
    pub fn with_cgroup(mut self, cgroup: impl Into<String>) -> Self {
        self.cgroups.push(cgroup.into());
        self
    }

    pub fn with_seccomp(mut self, seccomp: JailerSeccomp) -> Self {
        self.seccomp = Some(seccomp);
        self
    }

    /// with_stdin specifies which reader to use for the jailer's stdin.
    pub fn with_stdin(mut self, stdin: impl Into<std::process::Stdio>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// with_stdout specifies which writer to use for the jailer's stdout.
    pub fn with_stdout(mut self, stdout: impl Into<std::process::Stdio>) -> Self {
        self.stdout = Some(stdout.into());
        self
    }

    /// with_stderr specifies which writer to use for the jailer's stderr.
    pub fn with_stderr(mut self, stderr: impl Into<std::process::Stdio>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }

    /// with_firecracker_args adds arguments after the trailing "--", which
    /// the jailer passes on to firecracker.
    pub fn with_firecracker_args(mut self, args: impl Into<Vec<String>>) -> Self {
        self.firecracker_args = Some(args.into());
        self
    }

    pub fn build(self) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.bin);
        cmd.args(self.args());
        if let Some(stdin) = self.stdin {
            cmd.stdin(stdin);
        }
        if let Some(stdout) = self.stdout {
            cmd.stdout(stdout);
        }
        if let Some(stderr) = self.stderr {
            cmd.stderr(stderr);
        }
        cmd
    }
}

/// jail rewires a machine to spawn through the jailer: the API socket moves
/// under the chroot, file-existence validation is dropped (paths become
/// chroot-relative), and a link_files_to_rootfs handler is inserted right
/// after create_machine.
pub fn jail(m: &mut Machine, cfg: &mut Config) -> Result<(), MachineError> {
    let jailer_cfg = cfg.jailer_cfg.as_ref().ok_or(MachineError::Initialize(
        "jailer config was not set for use".to_string(),
    ))?;

    let machine_socket_path: PathBuf = cfg
        .socket_path
        .to_owned()
        .unwrap_or(DEFAULT_SOCKET_PATH.into());

    let rootfs = jailer_cfg.rootfs_path()?;

    // the socket the VMM sees is chroot-relative; the one the agent dials is
    // the same file through the chroot prefix
    let relative_socket = machine_socket_path
        .strip_prefix("/")
        .unwrap_or(&machine_socket_path)
        .to_path_buf();
    cfg.socket_path = Some(rootfs.join(&relative_socket));

    let mut stdout = std::process::Stdio::inherit();
    if let Some(sink) = &jailer_cfg.stdout {
        stdout = sink.open_io().map_err(|e| {
            MachineError::FileAccess(format!("fail to open stdout field {:#?}: {}", sink, e))
        })?;
    }

    let mut stderr = std::process::Stdio::inherit();
    if let Some(sink) = &jailer_cfg.stderr {
        stderr = sink.open_io().map_err(|e| {
            MachineError::FileAccess(format!("fail to open stderr field {:#?}: {}", sink, e))
        })?;
    }

    let mut stdin = std::process::Stdio::inherit();
    if let Some(source) = &jailer_cfg.stdin {
        stdin = source.open_io().map_err(|e| {
            MachineError::FileAccess(format!("fail to open stdin field {:#?}: {}", source, e))
        })?;
    }

    let mut builder = JailerCommandBuilder::new()
        .with_id(jailer_cfg.id.as_ref().ok_or(MachineError::ArgWrong(
            "no id provided in jailer config".to_string(),
        ))?)
        .with_uid(jailer_cfg.uid.ok_or(MachineError::ArgWrong(
            "no uid provided in jailer config".to_string(),
        ))?)
        .with_gid(jailer_cfg.gid.ok_or(MachineError::ArgWrong(
            "no gid provided in jailer config".to_string(),
        ))?)
        .with_numa_node(jailer_cfg.numa_node.unwrap_or(0))
        .with_exec_file(jailer_cfg.exec_file.as_ref().ok_or(
            MachineError::ArgWrong("no exec file provided in jailer config".to_string()),
        )?)
        .with_chroot_base_dir(
            jailer_cfg
                .chroot_base_dir
                .to_owned()
                .unwrap_or(DEFAULT_JAILER_PATH.into()),
        )
        .with_daemonize(jailer_cfg.daemonize)
        .with_firecracker_args(vec![
            "--api-sock".to_string(),
            machine_socket_path.to_string_lossy().to_string(),
        ])
        .with_stdout(stdout)
        .with_stderr(stderr)
        .with_stdin(stdin);

    if let Some(seccomp) = &jailer_cfg.seccomp {
        builder = builder.with_seccomp(seccomp.to_owned());
    }

    if let Some(jailer_binary) = &jailer_cfg.jailer_binary {
        builder = builder.with_bin(jailer_binary);
    }

    if let Some(net_ns) = &cfg.net_ns {
        builder = builder.with_net_ns(net_ns);
    }

    debug!(target: "jailer", "jailer argv: {:?}", builder.args());
    m.set_command(builder.build().into());

    // paths turn chroot-relative once linked, so stat-based validation of
    // the original paths has to go
    m.handlers.validation.remove(VALIDATE_CFG_HANDLER_NAME);
    m.handlers
        .setup
        .append_after(CREATE_MACHINE_HANDLER_NAME, link_files_handler());

    Ok(())
}

/// The handler that hard links the kernel image, initrd, drives and FIFOs
/// into the chroot rootfs, hands them to the jailed uid/gid and rewrites the
/// configured paths to their chroot-relative basenames.
pub fn link_files_handler() -> Handler {
    fn run(m: &mut Machine) -> HandlerFuture<'_> {
        Box::pin(m.link_files_to_rootfs())
    }
    Handler::new(LINK_FILES_TO_ROOTFS_HANDLER_NAME, run)
}

/// Hard link `from` to `to`, falling back to a copy when the link cannot
/// cross a filesystem boundary.
pub(crate) fn link_or_copy(from: &Path, to: &Path) -> std::io::Result<()> {
    match std::fs::hard_link(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(nix::libc::EXDEV) => {
            std::fs::copy(from, to).map(|_| ())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jailer_argv_order() {
        let builder = JailerCommandBuilder::new()
            .with_id("vm-1")
            .with_uid(123)
            .with_gid(456)
            .with_exec_file("/usr/bin/firecracker")
            .with_numa_node(0)
            .with_chroot_base_dir("/srv/jailer")
            .with_net_ns("/var/run/netns/vm-1")
            .with_daemonize(true)
            .with_seccomp(JailerSeccomp::Level(2))
            .with_firecracker_args(vec![
                "--api-sock".to_string(),
                "/run/firecracker.socket".to_string(),
            ]);

        assert_eq!(
            builder.args(),
            vec![
                "--id",
                "vm-1",
                "--uid",
                "123",
                "--gid",
                "456",
                "--exec-file",
                "/usr/bin/firecracker",
                "--node",
                "0",
                "--chroot-base-dir",
                "/srv/jailer",
                "--netns",
                "/var/run/netns/vm-1",
                "--daemonize",
                "--seccomp-level",
                "2",
                "--",
                "--api-sock",
                "/run/firecracker.socket",
            ]
        );
    }

    #[test]
    fn test_seccomp_filter_argv() {
        let builder = JailerCommandBuilder::new()
            .with_id("vm-1")
            .with_uid(1)
            .with_gid(1)
            .with_exec_file("firecracker")
            .with_seccomp(JailerSeccomp::Filter("/etc/fc/filter.bpf".into()));
        let args = builder.args();
        let pos = args.iter().position(|a| a == "--seccomp-filter").unwrap();
        assert_eq!(args[pos + 1], "/etc/fc/filter.bpf");
        assert!(!args.contains(&"--seccomp-level".to_string()));
    }

    #[test]
    fn test_rootfs_path() {
        let cfg = JailerConfig::default()
            .with_id("vm-1")
            .with_exec_file("/usr/local/bin/firecracker");
        assert_eq!(
            cfg.rootfs_path().unwrap(),
            PathBuf::from("/srv/jailer/firecracker/vm-1/root")
        );

        let cfg = cfg.with_chroot_base_dir("/jails");
        assert_eq!(
            cfg.rootfs_path().unwrap(),
            PathBuf::from("/jails/firecracker/vm-1/root")
        );
    }
}
