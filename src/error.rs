use thiserror::Error;

/// Type alias for Result with TriageError
pub type Result<T> = std::result::Result<T, TriageError>;

/// Error types for the triage pipeline
#[derive(Error, Debug)]
pub enum TriageError {
    /// A rule condition referenced a field the email record does not have
    #[error("Unknown field '{field}' in rule '{rule}'")]
    UnknownField { rule: String, field: String },

    /// A `regex:` pattern failed to compile
    #[error("Invalid pattern '{pattern}' in rule '{rule}': {reason}")]
    InvalidPattern {
        rule: String,
        pattern: String,
        reason: String,
    },

    /// Structurally malformed rule (bad arity, missing fields, out-of-range values)
    #[error("Invalid rule definition '{rule}': {reason}")]
    InvalidRuleDefinition { rule: String, reason: String },

    /// A rate limiter request that can never be satisfied
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The state store could not durably record sync progress
    #[error("State persistence failed for user {user_id}: {message}")]
    StatePersistence { user_id: String, message: String },

    /// Compare-and-set lost against a concurrent writer
    #[error("State conflict for user {user_id}: expected version {expected}, found {found}")]
    StateConflict {
        user_id: String,
        expected: u64,
        found: u64,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Gmail API returned an error
    #[error("Gmail API error: {0}")]
    Api(String),

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    Network(String),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    /// Resource not found (404)
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Message could not be normalized
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Inbound queue payload could not be decoded
    #[error("Invalid queue payload: {0}")]
    QueuePayload(String),

    /// Downstream publisher rejected a result
    #[error("Failed to publish result: {0}")]
    Publish(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TriageError {
    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TriageError::RateLimitExceeded { .. }
                | TriageError::Server { .. }
                | TriageError::Network(_)
                | TriageError::StatePersistence { .. }
                | TriageError::StateConflict { .. }
        )
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Configuration-class errors are raised while loading rules and must
    /// stop the process instead of being retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TriageError::UnknownField { .. }
                | TriageError::InvalidPattern { .. }
                | TriageError::InvalidRuleDefinition { .. }
                | TriageError::Config(_)
        )
    }
}

/// Parse the Retry-After header from an HTTP response
///
/// Accepts delay-seconds ("120") or an HTTP-date. Falls back to 5 seconds
/// when the header is missing, invalid or in the past.
fn parse_retry_after_header<B>(response: &hyper::Response<B>) -> u64 {
    const DEFAULT_RETRY_AFTER: u64 = 5;

    let Some(value) = response
        .headers()
        .get(hyper::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
    else {
        return DEFAULT_RETRY_AFTER;
    };

    value
        .trim()
        .parse::<u64>()
        .ok()
        .or_else(|| {
            httpdate::parse_http_date(value)
                .ok()
                .and_then(|at| at.duration_since(std::time::SystemTime::now()).ok())
                .map(|wait| wait.as_secs())
        })
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

impl From<google_gmail1::Error> for TriageError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let status_code = status.as_u16();
                let message = format!(
                    "HTTP {}: {}",
                    status_code,
                    status.canonical_reason().unwrap_or("Unknown")
                );

                match status_code {
                    429 => TriageError::RateLimitExceeded {
                        retry_after: parse_retry_after_header(response),
                    },
                    404 => TriageError::MessageNotFound("Resource not found".to_string()),
                    500..=599 => TriageError::Server {
                        status: status_code,
                        message,
                    },
                    _ => TriageError::Api(message),
                }
            }
            google_gmail1::Error::BadRequest(ref err) => TriageError::Api(format!("Bad request: {}", err)),
            google_gmail1::Error::HttpError(ref err) => {
                TriageError::Network(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => TriageError::Network(err.to_string()),
            _ => TriageError::Api(error.to_string()),
        }
    }
}
