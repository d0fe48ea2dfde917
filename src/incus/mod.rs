mod client;
mod models;

pub use client::{BackendOp, ExecResult, IncusClient, ProgressCallback};
pub use models::{
    ContainerStatus, Envelope, IncusOperation, Instance, InstancePut, InstanceSource,
    InstanceStatePut, InstancesPost, ResponseType, Server, StateAction,
};

/// Default path of the Incus API socket.
pub const DEFAULT_SOCKET: &str = "/var/lib/incus/unix.socket";

/// CLI binary referenced in the exec arguments handed back to clients.
pub const INCUS_CLI: &str = "incus";
