//! Error types for the compute and container REST clients.

use core::error::Error;

use derive_more::Display;
use error_stack::Report;

/// Result type for cloud API calls.
pub type CloudResult<T> = Result<T, Report<CloudError>>;

/// Errors that can occur while talking to the cloud APIs.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum CloudError {
    /// Network connectivity issues or per-call deadline
    #[display("Network error: {message}")]
    Transport { message: String },

    /// Non-success HTTP status other than 404
    #[display("HTTP error: {status} - {message}")]
    Api { status: u16, message: String },

    /// 404 on a managed instance group lookup
    #[display("node group {group} does not exist")]
    GroupDoesNotExist { group: String },

    /// 404 on any other resource
    #[display("resource not found: {resource}")]
    NotFound { resource: String },

    /// Serialization/deserialization errors
    #[display("Serialization error: {message}")]
    Serialization { message: String },

    /// Long-running operation finished with an error payload
    #[display("error while getting operation {operation} on {target}: {payload}")]
    OperationFailed {
        operation: String,
        target: String,
        payload: String,
    },

    /// Long-running operation did not reach a terminal state before the deadline
    #[display("timeout while waiting for operation {operation} on {target} to complete.")]
    OperationTimeout { operation: String, target: String },

    /// Credentials could not be obtained
    #[display("Authentication error: {message}")]
    Auth { message: String },

    /// Configuration errors
    #[display("Configuration error: {message}")]
    Configuration { message: String },
}

impl Error for CloudError {}
