use std::path::PathBuf;

pub const DEFAULT_FC_BIN: &'static str = "firecracker";

/// Builds the argv for a bare (unjailed) firecracker process.
pub struct VMMCommandBuilder {
    bin: Option<PathBuf>,
    args: Option<Vec<String>>,
    socket_path: Option<PathBuf>,
    stdin: Option<std::process::Stdio>,
    stdout: Option<std::process::Stdio>,
    stderr: Option<std::process::Stdio>,
}

impl Default for VMMCommandBuilder {
    fn default() -> Self {
        Self::new()
            .with_bin(DEFAULT_FC_BIN)
            .with_stdin(std::process::Stdio::inherit())
            .with_stdout(std::process::Stdio::inherit())
            .with_stderr(std::process::Stdio::inherit())
    }
}

impl VMMCommandBuilder {
    /// new returns a blank Builder with all fields set to None
    pub fn new() -> Self {
        Self {
            bin: None,
            args: None,
            socket_path: None,
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    /// with_args specifies with arguments to pass through to the
    /// firecracker Command
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = Some(args);
        self
    }

    /// add_args will append the provided args to the given Command
    pub fn add_args(&mut self, mut args: Vec<String>) {
        if self.args.is_none() {
            self.args = Some(args);
        } else {
            self.args.as_mut().unwrap().append(&mut args);
        }
    }

    /// bin returns the bin that was set. If bin had not been set, then the
    /// default value will be returned
    pub fn bin(&self) -> PathBuf {
        self.bin.to_owned().unwrap_or(DEFAULT_FC_BIN.into())
    }

    /// with_bin specifies which binary for firecracker to use
    pub fn with_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.bin = Some(bin.into());
        self
    }

    /// with_socket_path specifies the socket path to be used when
    /// creating the firecracker Command
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = Some(path.into());
        self
    }

    /// with_stdin specifies which reader to use in place of the inherited
    /// stdin when spawning firecracker.
    pub fn with_stdin(mut self, stdin: impl Into<std::process::Stdio>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// with_stdout specifies which writer to use in place of the inherited
    /// stdout when spawning firecracker.
    pub fn with_stdout(mut self, stdout: impl Into<std::process::Stdio>) -> Self {
        self.stdout = Some(stdout.into());
        self
    }

    /// with_stderr specifies which writer to use in place of the inherited
    /// stderr when spawning firecracker.
    pub fn with_stderr(mut self, stderr: impl Into<std::process::Stdio>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }

    /// build will build a firecracker command using the specific arguments
    /// specified in the builder.
    pub fn build(self) -> std::process::Command {
        let mut cmd = std::process::Command::new(self.bin());
        if let Some(socket_path) = &self.socket_path {
            cmd.arg("--api-sock");
            cmd.arg(socket_path);
        }
        if let Some(args) = &self.args {
            cmd.args(args);
        }
        if let Some(stdout) = self.stdout {
            cmd.stdout(stdout);
        }
        if let Some(stderr) = self.stderr {
            cmd.stderr(stderr);
        }
        if let Some(stdin) = self.stdin {
            cmd.stdin(stdin);
        }

        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vmm_command_argv() {
        let cmd = VMMCommandBuilder::new()
            .with_bin("firecracker")
            .with_socket_path("/tmp/firecracker.socket")
            .with_args(vec!["--id".to_string(), "test-vm".to_string()])
            .build();
        let argv: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            argv,
            vec!["--api-sock", "/tmp/firecracker.socket", "--id", "test-vm"]
        );
        assert_eq!(cmd.get_program(), "firecracker");
    }
}
