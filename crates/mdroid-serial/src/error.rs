use std::time::Duration;

use mdroid_types::HookError;
use thiserror::Error;

/// Errors from the serial transport layer.
///
/// `NoWriter` and `AckTimeout` are deliberately distinct: the first means the
/// command never left the hub, the second that it was queued but the vehicle
/// never confirmed it.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("No serial link currently holds the writer role")]
    NoWriter,

    #[error("No acknowledgment on {key} within {timeout:?}")]
    AckTimeout { key: String, timeout: Duration },

    #[error("Failed to open serial device {device}: {details}")]
    Open { device: String, details: String },

    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial device {0} is already supervised")]
    AlreadyOpen(String),

    #[error("Link manager is shut down")]
    Closed,
}

impl From<LinkError> for HookError {
    fn from(e: LinkError) -> Self {
        HookError::Failed(e.to_string())
    }
}
