//! Error taxonomy for chat requests and the alternate chat-service client.

use crate::request::Headers;

/// Errors surfaced to callers of `make_request` and to the lifecycle code.
///
/// Callers of [`ConnectionManager::make_request`](crate::ConnectionManager::make_request)
/// only ever observe `InvalidAppState`, `InvalidRequest`, `NetworkFailure` and
/// `Http`. `Deregistered` and `AppExpired` describe process-wide conditions and
/// are escalated through [`FatalStateSink`](crate::FatalStateSink) instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid app state: {0}")]
    InvalidAppState(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("request failed with status {status}")]
    Http {
        status: u16,
        headers: Headers,
        body: Option<Vec<u8>>,
    },

    #[error("device deregistered")]
    Deregistered,

    #[error("app expired")]
    AppExpired,
}

impl TransportError {
    pub fn network(reason: impl Into<String>) -> Self {
        Self::NetworkFailure(reason.into())
    }

    /// HTTP status code, if the server actually answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_network_failure(&self) -> bool {
        matches!(self, Self::NetworkFailure(_))
    }
}

/// Failures reported by an alternate [`ChatService`](crate::ChatService) client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("app expired")]
    AppExpired,

    #[error("device deregistered")]
    DeviceDeregistered,

    /// The client has no live connection to send through.
    #[error("chat service inactive")]
    ServiceInactive,

    #[error("chat service request timed out")]
    TimedOut,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ServiceError {
    /// Fatal errors describe the whole process, not one connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AppExpired | Self::DeviceDeregistered)
    }
}

impl From<ServiceError> for TransportError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::AppExpired => TransportError::AppExpired,
            ServiceError::DeviceDeregistered => TransportError::Deregistered,
            other => TransportError::NetworkFailure(other.to_string()),
        }
    }
}
