//! Data-stream error types
//!
//! Errors raised while parsing topics, normalizing data points and
//! fetching historical data.

use thiserror::Error;

/// Errors in the topic grammar (stream identifiers and templates)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// Stream identifier is not of the form `<device_id>/<topic>`
    #[error("Malformed stream identifier: {0:?}")]
    MalformedStreamId(String),

    /// Topic template references a field the widget does not define
    #[error("Template field not found: {0}")]
    MissingField(String),

    /// Template field has a value that cannot be substituted (object, array, null)
    #[error("Template field {0} is not a scalar")]
    NonScalarField(String),
}

/// Errors that cause a single raw item to be dropped during normalization
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PointError {
    /// Raw item is not a JSON object
    #[error("Data point is not an object")]
    NotAnObject,

    /// A required field is absent
    #[error("Data point is missing field: {0}")]
    MissingField(&'static str),

    /// Value is an object, array or null
    #[error("Unsupported value type: {0}")]
    UnsupportedValue(String),

    /// Timestamp could not be read as an integer
    #[error("Couldn't parse timestamp: {0}")]
    BadTimestamp(String),
}

/// Failure of a historical-data fetch
///
/// Cloneable so a single failure can be handed to every waiter of a
/// de-duplicated request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Request timeout")]
    Timeout,

    #[error("Service unavailable")]
    Unavailable,

    #[error("API error {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response body: {0}")]
    Decode(String),

    #[error("Request failed: {0}")]
    Request(String),
}

/// Errors surfaced to callers of `Dispatcher::get_initial_data`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The shared history fetch failed
    #[error("History fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// The fetch task panicked or was aborted by the runtime
    #[error("History fetch task failed: {0}")]
    Join(String),
}

/// Result type alias for data-stream operations
pub type StreamResult<T> = Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TopicError::MalformedStreamId("nodevice".to_string());
        assert_eq!(err.to_string(), "Malformed stream identifier: \"nodevice\"");

        let err = PointError::BadTimestamp("aa".to_string());
        assert_eq!(err.to_string(), "Couldn't parse timestamp: aa");

        let err = StreamError::from(FetchError::Status {
            status: 502,
            message: "bad gateway".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "History fetch failed: API error 502: bad gateway"
        );
    }

    #[test]
    fn test_fetch_error_is_shareable() {
        let err = StreamError::Fetch(FetchError::Timeout);
        let copy = err.clone();
        assert_eq!(err, copy);
    }
}
