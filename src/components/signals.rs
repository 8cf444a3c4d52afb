use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, OnceLock,
    },
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{signal, SignalKind};

/// Host signals that can be forwarded to the VMM child process.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    SIGHUP,
    SIGINT,
    SIGQUIT,
    SIGTERM,
    SIGUSR1,
    SIGUSR2,
}

/// Signals relayed when the configuration does not name its own set.
pub const DEFAULT_FORWARD_SIGNALS: [Signal; 5] = [
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

impl Signal {
    fn kind(&self) -> SignalKind {
        match self {
            Signal::SIGHUP => SignalKind::hangup(),
            Signal::SIGINT => SignalKind::interrupt(),
            Signal::SIGQUIT => SignalKind::quit(),
            Signal::SIGTERM => SignalKind::terminate(),
            Signal::SIGUSR1 => SignalKind::user_defined1(),
            Signal::SIGUSR2 => SignalKind::user_defined2(),
        }
    }

    fn as_nix(&self) -> nix::sys::signal::Signal {
        match self {
            Signal::SIGHUP => nix::sys::signal::SIGHUP,
            Signal::SIGINT => nix::sys::signal::SIGINT,
            Signal::SIGQUIT => nix::sys::signal::SIGQUIT,
            Signal::SIGTERM => nix::sys::signal::SIGTERM,
            Signal::SIGUSR1 => nix::sys::signal::SIGUSR1,
            Signal::SIGUSR2 => nix::sys::signal::SIGUSR2,
        }
    }

    const ALL: [Signal; 6] = [
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGQUIT,
        Signal::SIGTERM,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
    ];
}

struct Registration {
    pid: i32,
    signals: Vec<Signal>,
}

/// Signal handlers are per process, not per machine, so a single registry
/// fans every received signal out to all live machines whose forward set
/// contains it. Listener tasks are installed once, on first registration.
static REGISTRY: OnceLock<Mutex<HashMap<u64, Registration>>> = OnceLock::new();
static LISTENERS_INSTALLED: OnceLock<()> = OnceLock::new();
static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static Mutex<HashMap<u64, Registration>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn fan_out(sig: Signal) {
    let reg = registry().lock().expect("signal registry poisoned");
    for r in reg.values() {
        if !r.signals.contains(&sig) {
            continue;
        }
        debug!(target: "signals", "relaying {:?} to pid {}", sig, r.pid);
        if let Err(e) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(r.pid), sig.as_nix()) {
            warn!(target: "signals", "fail to relay {:?} to pid {}: {}", sig, r.pid, e);
        }
    }
}

fn install_listeners() {
    LISTENERS_INSTALLED.get_or_init(|| {
        for sig in Signal::ALL {
            match signal(sig.kind()) {
                Ok(mut stream) => {
                    tokio::spawn(async move {
                        while stream.recv().await.is_some() {
                            fan_out(sig);
                        }
                    });
                }
                Err(e) => {
                    warn!(target: "signals", "fail to install listener for {:?}: {}", sig, e)
                }
            }
        }
    });
}

/// Handle for one machine's slot in the process-wide relay. Dropping or
/// deregistering removes the machine from the fan-out.
#[derive(Debug)]
pub(crate) struct SignalForwarder {
    key: u64,
}

/// Registers `pid` for relaying of `signals`. Must be called from within a
/// tokio runtime.
pub(crate) fn register(pid: i32, signals: &[Signal]) -> SignalForwarder {
    install_listeners();
    let key = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
    registry().lock().expect("signal registry poisoned").insert(
        key,
        Registration {
            pid,
            signals: signals.to_vec(),
        },
    );
    debug!(target: "signals", "registered pid {} for {:?}", pid, signals);
    SignalForwarder { key }
}

impl SignalForwarder {
    pub(crate) fn deregister(&self) {
        registry()
            .lock()
            .expect("signal registry poisoned")
            .remove(&self.key);
    }
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        self.deregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_deregister() {
        let fwd = register(std::process::id() as i32, &[Signal::SIGUSR1]);
        assert!(registry().lock().unwrap().contains_key(&fwd.key));
        let key = fwd.key;
        drop(fwd);
        assert!(!registry().lock().unwrap().contains_key(&key));
    }
}
