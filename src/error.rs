use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the daemon's layers.
///
/// Asynchronous operations record these on their Failed transition; the
/// synchronous D-Bus methods map them into method error replies.
#[derive(Error, Debug)]
pub enum KapsuleError {
    #[error("container '{0}' does not exist")]
    ContainerNotFound(String),

    #[error("container '{0}' already exists")]
    ContainerAlreadyExists(String),

    #[error("container '{0}' is running; use force to remove it anyway")]
    ContainerRunning(String),

    #[error("container '{name}' is {status}; cannot {action}")]
    ContainerInvalidState {
        name: String,
        status: String,
        action: &'static str,
    },

    #[error("incus error ({code}): {message}")]
    Backend { code: u16, message: String },

    #[error("cannot reach incus: {0}")]
    BackendUnavailable(String),

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("could not identify caller: {0}")]
    UnknownCaller(String),

    #[error("caller process is gone: {0}")]
    CallerGone(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, KapsuleError>;

impl KapsuleError {
    /// True for a backend 404, which upper layers reclassify per target.
    pub fn is_not_found(&self) -> bool {
        matches!(self, KapsuleError::Backend { code: 404, .. })
    }
}

impl From<KapsuleError> for zbus::fdo::Error {
    fn from(err: KapsuleError) -> Self {
        match &err {
            KapsuleError::InvalidArgument(_) => zbus::fdo::Error::InvalidArgs(err.to_string()),
            KapsuleError::UnknownCaller(_) | KapsuleError::CallerGone(_) => {
                zbus::fdo::Error::AccessDenied(err.to_string())
            }
            _ => zbus::fdo::Error::Failed(err.to_string()),
        }
    }
}
