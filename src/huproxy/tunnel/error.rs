use axum::http::StatusCode;
use thiserror::Error;

/// Reasons a tunnel request is rejected before any relaying starts.
///
/// These are the only failures that can still be reported through the HTTP response; everything
/// that happens after the upgrade is only visible as the tunnel closing.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("missing host or port")]
    MissingTarget,
    #[error("websocket upgrade failed: {0}")]
    UpgradeFailed(String),
    #[error("dial {target} failed: {source}")]
    DialFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

impl SetupError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SetupError::MissingTarget => StatusCode::BAD_REQUEST,
            SetupError::UpgradeFailed(_) => StatusCode::BAD_GATEWAY,
            SetupError::DialFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            SetupError::MissingTarget => "missing_target",
            SetupError::UpgradeFailed(_) => "upgrade_failed",
            SetupError::DialFailed { .. } => "dial_failed",
        }
    }
}

/// Faults that abort an established session.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("received non-binary {0} message")]
    ProtocolViolation(&'static str),
    #[error("{context}: {source}")]
    UnexpectedIo {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl RelayError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        RelayError::UnexpectedIo { context, source }
    }
}
