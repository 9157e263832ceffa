use thiserror::Error;

/// Error outputs from the pseudonymization client.
///
/// The variants partition failures by recovery strategy: bad input is fixed
/// by the caller, an invalid session is recovered by creating a new one, and
/// network or protocol failures are fatal to the operation that hit them.
#[derive(Debug, Error)]
pub enum PseudokitError {
    /// The caller passed a value that fails local validation. Returned
    /// before any request is made; not retryable.
    #[error("invalid_argument: {attribute}: {reason}")]
    InvalidArgument {
        /// Name of the offending argument or configuration item.
        attribute: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// The service reported 404 for a session-scoped resource: the session
    /// has expired or was deleted. Recover by creating a new session.
    #[error("invalid_session")]
    InvalidSession,
    /// Transport failure, an unexpected HTTP status, or a response body that
    /// is not parseable as JSON. Fatal to the operation; the status and body
    /// are preserved for diagnostics.
    #[error("network_error: {url}: {error}")]
    NetworkError {
        /// URL of the failed request.
        url: String,
        /// HTTP status code, if a response was received at all.
        status: Option<u16>,
        /// Error detail or response body.
        error: String,
    },
    /// The service answered with a success status but the body lacks a field
    /// the protocol guarantees (e.g. the id of a created token). This is a
    /// compatibility error, not a transient one; not retryable.
    #[error("protocol_violation: {url}: {error}")]
    ProtocolViolation {
        /// URL of the offending request.
        url: String,
        /// Description of the contract violation.
        error: String,
    },
}
