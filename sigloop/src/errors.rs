//! Public error types for sigloop.

use sigloop_signature::{ExtractionError, SignatureError};
use thiserror::Error;

/// Failures reported by an [`crate::ai::AiService`].
///
/// Every variant keeps the context needed to diagnose the call without
/// re-running it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The service answered with a non-success status code.
    #[error("HTTP {status} from {url}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Endpoint that was called.
        url: String,
        /// Short description of the failure.
        message: String,
        /// Serialized request, if available.
        request_body: Option<String>,
        /// Raw response body, if available.
        response_body: Option<String>,
    },

    /// The request never completed at the transport level.
    #[error("Network error calling {url}: {message}")]
    Network {
        /// Endpoint that was called.
        url: String,
        /// Transport error message.
        message: String,
    },

    /// The request exceeded its deadline.
    #[error("Request to {url} timed out after {timeout_ms} ms")]
    Timeout {
        /// Endpoint that was called.
        url: String,
        /// Deadline in milliseconds.
        timeout_ms: u64,
    },

    /// Credentials were rejected.
    #[error("Authentication failed for {url}: {message}")]
    Authentication {
        /// Endpoint that was called.
        url: String,
        /// Provider message.
        message: String,
    },

    /// A response stream ended before the turn was complete.
    #[error("Response stream terminated unexpectedly: {message}")]
    StreamTerminated {
        /// What was observed.
        message: String,
    },

    /// Any other service failure.
    #[error("{0}")]
    Other(String),
}

impl ServiceError {
    /// Shorthand for a status-coded failure without bodies.
    #[must_use]
    pub fn status(status: u16, url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            url: url.into(),
            message: message.into(),
            request_body: None,
            response_body: None,
        }
    }

    /// The HTTP status code, when the failure carries one.
    #[must_use]
    pub const fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Failures while dispatching tool calls.
#[derive(Debug, Error)]
pub enum FunctionError {
    /// The model called a function that is not registered.
    #[error("Function '{name}' is not registered")]
    NotFound {
        /// Requested name.
        name: String,
    },

    /// Arguments did not decode or did not match the parameter schema.
    #[error("Invalid arguments for function '{name}': {}", errors.join("; "))]
    InvalidArguments {
        /// Function name.
        name: String,
        /// One message per problem.
        errors: Vec<String>,
        /// Raw arguments as received.
        arguments: String,
    },

    /// The function itself returned an error.
    #[error("Function '{name}' failed: {source}")]
    Execution {
        /// Function name.
        name: String,
        /// Error returned by the handler.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Errors surfaced by a generation call.
#[derive(Debug, Error)]
pub enum GenerateError {
    /// The AI service failed and retries did not help (or were not allowed).
    #[error("AI service error after {retries} retries: {source}")]
    Service {
        /// The last service error, unchanged.
        #[source]
        source: ServiceError,
        /// Number of retries performed before giving up.
        retries: u32,
    },

    /// The caller's cancellation token fired.
    #[error("Generation cancelled")]
    Cancelled,

    /// The model stopped because it hit its output limit.
    #[error("Response for candidate {index} was truncated (finish reason: length)")]
    Truncated {
        /// Candidate index.
        index: usize,
        /// Text received before truncation.
        partial_content: String,
    },

    /// Model text could not be mapped onto the output fields.
    #[error("Extraction failed for candidate {index}: {source}")]
    Extraction {
        /// Candidate index.
        index: usize,
        /// Underlying extraction error.
        #[source]
        source: ExtractionError,
        /// Content that was being extracted.
        content: String,
    },

    /// A registered assertion rejected the extracted values.
    #[error("Assertion failed for candidate {index}: {message}")]
    Assertion {
        /// Candidate index.
        index: usize,
        /// Field the assertion was registered on, if any.
        field: Option<String>,
        /// Message returned by the assertion.
        message: String,
    },

    /// Corrective re-prompting did not produce valid output.
    #[error("Validation failed after {attempts} attempts: {last}")]
    ValidationRetriesExhausted {
        /// Number of attempts made.
        attempts: usize,
        /// The error from the final attempt.
        #[source]
        last: Box<GenerateError>,
    },

    /// A tool call failed.
    #[error(transparent)]
    Function(#[from] FunctionError),

    /// The loop ran out of steps.
    #[error("Reached the maximum of {max_steps} steps without a final answer")]
    MaxStepsReached {
        /// Configured step limit.
        max_steps: usize,
    },

    /// Input values do not satisfy the signature.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The service returned a result for a candidate that was not requested.
    #[error("Unknown candidate index {index} (expected fewer than {count})")]
    UnknownCandidate {
        /// Index received.
        index: usize,
        /// Number of candidates requested.
        count: usize,
    },

    /// The signature itself is invalid.
    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),

    /// The final values did not decode into the requested type.
    #[error("Failed to decode output: {0}")]
    Decode(#[from] serde_json::Error),
}

impl GenerateError {
    /// Whether a corrective re-prompt may fix this error.
    #[must_use]
    pub const fn is_correctable(&self) -> bool {
        matches!(
            self,
            Self::Extraction { .. }
                | Self::Assertion { .. }
                | Self::Service {
                    source: ServiceError::StreamTerminated { .. },
                    ..
                }
        )
    }
}
