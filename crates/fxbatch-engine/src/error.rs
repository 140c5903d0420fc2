use std::time::Duration;

use fxbatch_contracts::runs::{FailureReason, GenerationFailure, RequestError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    Timeout,
    ConnectionFailed,
    Unauthorized,
    RateLimited,
    ServerError,
    ClientError,
}

/// Failure of one call to the generation endpoint, before any decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("rate limited by service ({status})")]
    RateLimited {
        status: u16,
        retry_after: Option<Duration>,
        body: String,
    },
    #[error("service error ({status})")]
    ServerError { status: u16, body: String },
    #[error("request rejected ({status})")]
    ClientError { status: u16, body: String },
    /// Refused locally before any network I/O.
    #[error("invalid request: {0}")]
    Rejected(#[from] RequestError),
}

impl TransportError {
    pub fn kind(&self) -> TransportErrorKind {
        match self {
            TransportError::Timeout(_) => TransportErrorKind::Timeout,
            TransportError::ConnectionFailed(_) => TransportErrorKind::ConnectionFailed,
            TransportError::Unauthorized(_) => TransportErrorKind::Unauthorized,
            TransportError::RateLimited { .. } => TransportErrorKind::RateLimited,
            TransportError::ServerError { .. } => TransportErrorKind::ServerError,
            TransportError::ClientError { .. } | TransportError::Rejected(_) => {
                TransportErrorKind::ClientError
            }
        }
    }

    pub fn failure_reason(&self) -> FailureReason {
        if let TransportError::Rejected(_) = self {
            return FailureReason::InvalidRequest;
        }
        match self.kind() {
            TransportErrorKind::Timeout => FailureReason::Timeout,
            TransportErrorKind::ConnectionFailed => FailureReason::ConnectionFailed,
            TransportErrorKind::Unauthorized => FailureReason::Unauthorized,
            TransportErrorKind::RateLimited => FailureReason::RateLimited,
            TransportErrorKind::ServerError => FailureReason::ServerError,
            TransportErrorKind::ClientError => FailureReason::ClientError,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            TransportError::RateLimited { body, .. }
            | TransportError::ServerError { body, .. }
            | TransportError::ClientError { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn to_failure(&self) -> GenerationFailure {
        let failure = GenerationFailure::new(self.failure_reason(), self.to_string());
        match self.body() {
            Some(body) => failure.with_excerpt(body),
            None => failure,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let message = error_chain_text(&err);
        if err.is_timeout() {
            return TransportError::Timeout(message);
        }
        if let Some(status) = err.status() {
            let code = status.as_u16();
            if code == 401 || code == 403 {
                return TransportError::Unauthorized(message);
            }
        }
        TransportError::ConnectionFailed(message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PackagingError {
    #[error("no successful images to package")]
    EmptyArchive,
    #[error("failed to serialize manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("failed to write archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("archive i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

fn error_chain_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(String::as_str) != Some(trimmed) {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    parts.join(" | caused by: ")
}
