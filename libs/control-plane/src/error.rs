use thiserror::Error;

/// Errors returned by control plane collaborators.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// The request never produced a response.
    #[error("request to control plane failed: {0}")]
    Transport(String),

    /// The control plane answered with a non-success status.
    #[error("control plane returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The response body could not be decoded.
    #[error("invalid response from control plane: {0}")]
    Decode(String),

    /// The client was configured with unusable settings.
    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl ControlPlaneError {
    /// Returns true if retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ControlPlaneError::Transport(_) => true,
            ControlPlaneError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ControlPlaneError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ControlPlaneError::Decode(err.to_string())
        } else {
            ControlPlaneError::Transport(err.to_string())
        }
    }
}
