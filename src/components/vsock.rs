use std::path::{Path, PathBuf};

use log::{debug, trace, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
    time::{sleep, timeout, Duration, Instant},
};

/// Per-attempt budget for connecting the UNIX socket.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(100);
/// Pause between successive dial attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
/// Overall budget for the whole dial loop.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(20);
/// Budget for writing the CONNECT line once connected.
pub const DEFAULT_CONNECT_MSG_TIMEOUT: Duration = Duration::from_millis(100);
/// Budget for the hypervisor's acknowledgement line.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(1);

const ACK_PREFIX: &'static str = "OK ";

#[derive(thiserror::Error, Debug)]
pub enum VsockError {
    /// The CONNECT line could not be written. Not retried: once connected,
    /// a write failure means the proxy went away.
    #[error("fail to write CONNECT to vsock at {0}: {1}")]
    ConnectMsg(PathBuf, String),

    /// The hypervisor answered something other than `OK <port>`. Retried.
    #[error("bad ack from vsock at {0}: {1}")]
    Ack(PathBuf, String),

    /// No dial attempt succeeded within the retry budget. Retried attempts
    /// exhausted.
    #[error("dialing vsock at {0} timed out after {1:?}")]
    DialTimeout(PathBuf, Duration),

    #[error("vsock listener on port {0} failed: {1}")]
    Listen(u32, String),
}

impl VsockError {
    pub fn is_temporary(&self) -> bool {
        match self {
            VsockError::ConnectMsg(..) => false,
            VsockError::Ack(..) => true,
            VsockError::DialTimeout(..) => true,
            VsockError::Listen(..) => true,
        }
    }
}

/// Knobs for [`dial_with_config`]. The defaults match the hypervisor's
/// observed connect latency; tests shrink them.
#[derive(Debug, Clone)]
pub struct DialConfig {
    pub dial_timeout: Duration,
    pub retry_interval: Duration,
    pub retry_timeout: Duration,
    pub connect_msg_timeout: Duration,
    pub ack_timeout: Duration,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            connect_msg_timeout: DEFAULT_CONNECT_MSG_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

/// Connects to the guest-side vsock `port` through the hypervisor's UNIX
/// socket at `path`, performing the `CONNECT <port>` / `OK <host port>`
/// handshake. Temporary failures (socket not yet bound, ack timeout, bad
/// ack) are retried until the overall budget runs out.
pub async fn dial(path: impl AsRef<Path>, port: u32) -> Result<UnixStream, VsockError> {
    dial_with_config(path, port, DialConfig::default()).await
}

pub async fn dial_with_config(
    path: impl AsRef<Path>,
    port: u32,
    config: DialConfig,
) -> Result<UnixStream, VsockError> {
    let path = path.as_ref();
    let deadline = Instant::now() + config.retry_timeout;
    let mut last_err: Option<VsockError> = None;

    loop {
        if Instant::now() >= deadline {
            return Err(last_err
                .unwrap_or_else(|| VsockError::DialTimeout(path.into(), config.retry_timeout)));
        }

        match try_dial(path, port, &config).await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.is_temporary() => {
                trace!(target: "vsock", "dial attempt on {} failed: {}", path.display(), e);
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }

        sleep(config.retry_interval).await;
    }
}

async fn try_dial(path: &Path, port: u32, config: &DialConfig) -> Result<UnixStream, VsockError> {
    // connect failures (socket missing, nothing accepting yet) and per-attempt
    // timeouts all land in DialTimeout, which the outer loop retries
    let mut stream = match timeout(config.dial_timeout, UnixStream::connect(path)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(_)) | Err(_) => {
            return Err(VsockError::DialTimeout(path.into(), config.dial_timeout))
        }
    };

    let connect_msg = format!("CONNECT {}\n", port);
    timeout(
        config.connect_msg_timeout,
        stream.write_all(connect_msg.as_bytes()),
    )
    .await
    .map_err(|_| VsockError::ConnectMsg(path.into(), "write timed out".to_string()))?
    .map_err(|e| VsockError::ConnectMsg(path.into(), e.to_string()))?;

    let line = timeout(config.ack_timeout, read_ack_line(&mut stream))
        .await
        .map_err(|_| VsockError::Ack(path.into(), "ack timed out".to_string()))?
        .map_err(|e| VsockError::Ack(path.into(), e))?;

    if !line.starts_with(ACK_PREFIX) {
        return Err(VsockError::Ack(path.into(), line));
    }

    debug!(target: "vsock", "connected to port {} via {}: {}", port, path.display(), line.trim_end());
    Ok(stream)
}

/// Reads the acknowledgement byte by byte up to the newline. The stream
/// carries guest traffic right after the ack, so nothing past `\n` may be
/// consumed.
async fn read_ack_line(stream: &mut UnixStream) -> Result<String, String> {
    let mut line = String::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.map_err(|e| e.to_string())?;
        if n == 0 {
            return Err(format!("connection closed mid-ack: {:?}", line));
        }
        if byte[0] == b'\n' {
            return Ok(line);
        }
        line.push(byte[0] as char);
    }
}

/// Guest-side accept wrapper over an AF_VSOCK listener. Transient accept
/// errors are retried on the same tick as the host dialer.
pub struct VsockListener {
    inner: tokio_vsock::VsockListener,
    port: u32,
}

/// Binds a listener on the guest-side vsock `port`, accepting connections
/// from any CID.
pub fn listen(port: u32) -> Result<VsockListener, VsockError> {
    let addr = tokio_vsock::VsockAddr::new(tokio_vsock::VMADDR_CID_ANY, port);
    let inner = tokio_vsock::VsockListener::bind(addr)
        .map_err(|e| VsockError::Listen(port, e.to_string()))?;
    Ok(VsockListener { inner, port })
}

impl VsockListener {
    pub async fn accept(
        &mut self,
    ) -> Result<(tokio_vsock::VsockStream, tokio_vsock::VsockAddr), VsockError> {
        loop {
            match self.inner.accept().await {
                Ok(conn) => return Ok(conn),
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionAborted
                            | std::io::ErrorKind::ConnectionReset
                            | std::io::ErrorKind::Interrupted
                            | std::io::ErrorKind::WouldBlock
                    ) =>
                {
                    warn!(target: "vsock", "transient accept failure on port {}: {}", self.port, e);
                    sleep(DEFAULT_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(VsockError::Listen(self.port, e.to_string())),
            }
        }
    }

    pub fn local_port(&self) -> u32 {
        self.port
    }
}
