//! Transport error types

use thiserror::Error;

use crate::streams::FetchError;

/// Errors that can occur when talking to the dashboard REST backend
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Dashboard backend unavailable")]
    Unavailable,

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Request timeout")]
    Timeout,

    /// Rejected before any request was sent
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl ClientError {
    /// Classify a reqwest send failure
    pub(crate) fn from_send(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout
        } else if e.is_connect() {
            ClientError::Unavailable
        } else {
            ClientError::Request(e)
        }
    }
}

impl From<ClientError> for FetchError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Unavailable => FetchError::Unavailable,
            ClientError::Timeout => FetchError::Timeout,
            ClientError::Api { status, message } => FetchError::Status { status, message },
            ClientError::Request(e) if e.is_decode() => FetchError::Decode(e.to_string()),
            ClientError::Request(e) => FetchError::Request(e.to_string()),
            ClientError::InvalidArgument(msg) => FetchError::Request(msg),
        }
    }
}

/// Errors raised by the push channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebSocket connect failed: {0}")]
    Connect(String),

    #[error("WebSocket read failed: {0}")]
    Read(String),

    /// Frame is not a recognizable event envelope
    #[error("Malformed push frame: {0}")]
    Frame(String),

    #[error("Unknown push event: {0}")]
    UnknownEvent(String),

    #[error("A message handler is already attached")]
    HandlerAttached,
}

/// Result type alias for REST client calls
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_into_fetch_error() {
        let fetch: FetchError = ClientError::Api {
            status: 404,
            message: "no such stream".to_string(),
        }
        .into();
        assert_eq!(
            fetch,
            FetchError::Status {
                status: 404,
                message: "no such stream".to_string()
            }
        );

        assert_eq!(FetchError::from(ClientError::Timeout), FetchError::Timeout);
        assert_eq!(FetchError::from(ClientError::Unavailable), FetchError::Unavailable);
    }

    #[test]
    fn test_transport_error_display() {
        assert_eq!(
            TransportError::HandlerAttached.to_string(),
            "A message handler is already attached"
        );
        assert_eq!(
            TransportError::UnknownEvent("ping".to_string()).to_string(),
            "Unknown push event: ping"
        );
    }
}
