//! Live-view error types
//!
//! Every variant is reported to the offending viewer as an `error` message;
//! none of them close the connection.

/// Error type for viewer requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// Requested camera is not configured
    UnknownCamera(String),
    /// Message was not valid JSON (or not text)
    InvalidMessage,
    /// JSON without a recognised action
    UnknownAction,
    /// Live view is shutting down
    NotAvailable(String),
}

impl HubError {
    /// Camera the error refers to, if any
    pub fn camera(&self) -> Option<&str> {
        match self {
            HubError::UnknownCamera(camera) | HubError::NotAvailable(camera) => Some(camera),
            HubError::InvalidMessage | HubError::UnknownAction => None,
        }
    }
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HubError::UnknownCamera(camera) => write!(f, "Configuration not found for {}", camera),
            HubError::InvalidMessage => write!(f, "Invalid message format, expected JSON."),
            HubError::UnknownAction => write!(f, "Unknown action."),
            HubError::NotAvailable(camera) => write!(f, "Stream {} is not available.", camera),
        }
    }
}

impl std::error::Error for HubError {}
