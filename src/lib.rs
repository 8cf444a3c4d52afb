//! firevisor is a host-side library for launching and supervising a single
//! firecracker microVM. It owns the hypervisor child process, drives the
//! HTTP-over-UNIX-socket control plane to assemble the machine (boot source,
//! drives, network interfaces, vsock devices, MMDS metadata) and exposes the
//! runtime lifecycle: start, pause, resume, snapshot, update, shutdown, stop.
//!
//! The central type is [`components::machine::Machine`], created from a
//! [`components::machine::Config`]. Configuration is pushed to the hypervisor
//! by an ordered list of named handlers which callers may reorder, remove or
//! extend before calling `start`. The machine may optionally be wrapped in a
//! jailer child which applies chroot, uid/gid, numa and seccomp isolation.

pub mod components;
pub mod model;
pub mod utils;

pub use components::agent::{Agent, AgentError};
pub use components::handlers::{Handler, HandlerFuture, HandlerList, Handlers};
pub use components::jailer::{JailerCommandBuilder, JailerConfig, JailerSeccomp};
pub use components::machine::{Config, Machine, MachineError, MachineState, SnapshotConfig};
pub use components::network::{
    CNIConfiguration, IPConfiguration, StaticNetworkConfiguration, VmNetworkInterface,
    VmNetworkInterfaces,
};
pub use components::signals::Signal;
pub use components::vsock::{dial, DialConfig, VsockError};
