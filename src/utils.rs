use std::{
    os::{fd::FromRawFd, unix::fs::OpenOptionsExt},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};

/// Default path the API socket is created at when the user supplies none.
/// With a jailer this path is interpreted relative to the chroot rootfs.
pub const DEFAULT_SOCKET_PATH: &'static str = "/run/firecracker.socket";

/// Base folder where jailer chroots are built when the user supplies none.
pub const DEFAULT_JAILER_PATH: &'static str = "/srv/jailer";

pub const ROOTFS_FOLDER_NAME: &'static str = "root";

/// Directory where named network namespace handles live.
pub const DEFAULT_NETNS_DIR: &'static str = "/var/run/netns";

/// Interval between successive probes of the API socket during start.
pub const SOCKET_POLL_INTERVAL_MS: u64 = 10;

/// Budget for the API socket to come up before start is aborted.
pub const DEFAULT_SOCKET_READY_TIMEOUT_SECS: u64 = 3;

/// Grace period between SIGTERM and SIGKILL when stopping the VMM.
pub const DEFAULT_STOP_VMM_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_FIRECRACKER_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Serialization helper implemented by every wire model type.
pub trait Json<'a> {
    type Item;

    fn from_json(s: &'a str) -> serde_json::Result<Self::Item>
    where
        <Self as Json<'a>>::Item: Deserialize<'a>,
    {
        let b: Self::Item = serde_json::from_str(s)?;
        Ok(b)
    }

    fn to_json(&self) -> serde_json::Result<String>
    where
        Self: Serialize,
    {
        let s: String = serde_json::to_string(self)?;
        Ok(s)
    }

    fn into_json(self) -> serde_json::Result<String>
    where
        Self: Serialize + Sized,
    {
        let s: String = serde_json::to_string(&self)?;
        Ok(s)
    }
}

/// Serializable stand-in for `std::process::Stdio`, which cannot be stored in
/// a configuration struct directly.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub enum StdioTypes {
    Null,
    Piped,
    Inherit,
    /// Opened from the file at `path`, created if missing.
    From { path: PathBuf },
    /// Adopted from an already-open file descriptor.
    FromRawFd { fd: i32 },
}

impl StdioTypes {
    pub fn open_io(&self) -> std::io::Result<std::process::Stdio> {
        match self {
            StdioTypes::Null => Ok(std::process::Stdio::null()),
            StdioTypes::Piped => Ok(std::process::Stdio::piped()),
            StdioTypes::Inherit => Ok(std::process::Stdio::inherit()),
            StdioTypes::From { path } => Ok(std::process::Stdio::from({
                let mut options = std::fs::OpenOptions::new();
                options.mode(0o644);
                options.write(true).create(true).append(true);
                options.open(&path)?
            })),
            StdioTypes::FromRawFd { fd } => {
                Ok(unsafe { std::process::Stdio::from_raw_fd(fd.to_owned()) })
            }
        }
    }

    /// Opens the variant as a plain writable file where that makes sense.
    /// Used by the FIFO pumps, which need a `File` rather than a `Stdio`.
    pub fn open_writer(&self) -> std::io::Result<Option<std::fs::File>> {
        match self {
            StdioTypes::From { path } => {
                let mut options = std::fs::OpenOptions::new();
                options.mode(0o644);
                options.write(true).create(true).append(true);
                Ok(Some(options.open(&path)?))
            }
            StdioTypes::FromRawFd { fd } => {
                Ok(Some(unsafe { std::fs::File::from_raw_fd(fd.to_owned()) }))
            }
            _ => Ok(None),
        }
    }
}
