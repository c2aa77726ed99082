use thiserror::Error;

pub type Result<T> = std::result::Result<T, HubError>;

/// Failures reported by a [`crate::transport::HostController`] for a single transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("endpoint stalled")]
    Stall,
    #[error("transfer timed out")]
    Timeout,
    #[error("device is gone")]
    NoDevice,
    #[error("host controller is shutting down")]
    Shutdown,
    #[error("protocol error on the wire")]
    Protocol,
    #[error("device returned more data than requested")]
    Overflow,
    #[error("host controller I/O error")]
    Io,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("device registration failed: {reason}")]
pub struct RegistrationError {
    pub reason: String,
}

impl RegistrationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("transport error: {0}")]
    Transport(#[from] TransferError),

    #[error("timed out: {0}")]
    Timeout(&'static str),

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(&'static str),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("resource busy")]
    Busy,

    #[error("no such device")]
    NoDevice,

    #[error("port not connected")]
    NotConnected,

    #[error("invalid request: {0}")]
    Invalid(&'static str),

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

impl HubError {
    /// True when the failure means the device itself has disappeared.
    pub fn is_no_device(&self) -> bool {
        matches!(
            self,
            HubError::NoDevice | HubError::NotConnected | HubError::Transport(TransferError::NoDevice)
        )
    }

    /// True for failures a status read should retry (timeouts and stalls).
    pub(crate) fn is_retryable_status(&self) -> bool {
        matches!(
            self,
            HubError::Timeout(_)
                | HubError::Transport(TransferError::Timeout)
                | HubError::Transport(TransferError::Stall)
        )
    }
}
