//! Error Taxonomy
//!
//! Every backend failure is reduced to one of a closed set of [`ErrorCode`]s.
//! The code is derived from the raw failure text by keyword matching, and it
//! is the only thing the routing layer looks at when deciding whether a
//! failure is worth retrying.
//!
//! ```text
//! raw failure text ──► ErrorCode::classify ──► is_retryable()
//!                                               │
//!                          RateLimit | Network | Timeout | ServerError  → retry
//!                          Auth | InvalidInput | Unknown                → fail
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, Role};
use crate::routing::retry::RetryError;
use crate::routing::validator::ValidationError;

// ============================================================================
// Error Codes
// ============================================================================

/// Closed classification of backend failures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Credentials missing, invalid or lacking permission
    Auth,
    /// Vendor-side throttling or quota exhaustion
    RateLimit,
    /// The request itself was rejected as malformed
    InvalidInput,
    /// Vendor-side 5xx or overload
    ServerError,
    /// The call did not finish in time
    Timeout,
    /// Transport-level failure (DNS, connection reset, ...)
    Network,
    /// Anything unrecognized
    Unknown,
}

/// Keyword table, checked in order. First code with a matching keyword wins.
/// All-digit keywords are status codes and only match a whole token.
const CLASSIFICATION_RULES: &[(ErrorCode, &[&str])] = &[
    (
        ErrorCode::Auth,
        &[
            "unauthorized",
            "authentication",
            "api key",
            "api_key",
            "forbidden",
            "permission denied",
            "401",
            "403",
        ],
    ),
    (
        ErrorCode::RateLimit,
        &[
            "rate limit",
            "rate_limit",
            "ratelimit",
            "too many requests",
            "quota",
            "429",
        ],
    ),
    (
        ErrorCode::InvalidInput,
        &[
            "invalid",
            "bad request",
            "malformed",
            "validation",
            "400",
        ],
    ),
    (
        ErrorCode::ServerError,
        &[
            "internal server error",
            "server error",
            "bad gateway",
            "service unavailable",
            "overloaded",
            "500",
            "502",
            "503",
        ],
    ),
    (
        ErrorCode::Timeout,
        &["timeout", "timed out", "deadline exceeded"],
    ),
    (
        ErrorCode::Network,
        &[
            "connection",
            "network",
            "dns",
            "unreachable",
            "reset by peer",
            "broken pipe",
            "eof",
        ],
    ),
];

impl ErrorCode {
    /// Classify raw failure text (case-insensitive keyword match)
    #[must_use]
    pub fn classify(text: &str) -> Self {
        let lowered = text.to_lowercase();
        CLASSIFICATION_RULES
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| keyword_matches(&lowered, k)))
            .map_or(Self::Unknown, |(code, _)| *code)
    }

    /// Whether a failure with this code may succeed on a later attempt
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Network | Self::Timeout | Self::ServerError
        )
    }

    /// Stable lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::InvalidInput => "invalid_input",
            Self::ServerError => "server_error",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }
}

fn keyword_matches(lowered: &str, keyword: &str) -> bool {
    if keyword.bytes().all(|b| b.is_ascii_digit()) {
        lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| token == keyword)
    } else {
        lowered.contains(keyword)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Backend Errors
// ============================================================================

/// A failure reported by (or on behalf of) a backend
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct BackendError {
    /// Classified failure code
    pub code: ErrorCode,
    /// Raw failure text
    pub message: String,
}

impl BackendError {
    /// Create an error with an explicit code
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create an error whose code is derived from the message text
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            code: ErrorCode::classify(&message),
            message,
        }
    }

    /// Shorthand for [`ErrorCode::is_retryable`]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors surfaced by the [`Registry`](crate::routing::registry::Registry)
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Configuration failed validation
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No constructor is registered for the descriptor's backend type
    #[error("Backend {id}: no constructor registered for backend type '{kind}'")]
    UnknownBackendType {
        /// Descriptor id
        id: String,
        /// Requested backend type
        kind: String,
    },

    /// A constructor rejected its descriptor
    #[error("Backend {id}: construction failed: {source}")]
    Construction {
        /// Descriptor id
        id: String,
        /// Constructor failure
        source: BackendError,
    },

    /// One or more backends failed startup validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Neither primary, fallbacks nor default resolved for a role
    #[error("No backend available for role '{role}'")]
    NoBackendAvailable {
        /// Role that could not be served
        role: Role,
    },

    /// The selected backend failed after retries
    #[error("Backend {backend_id} failed: {source}")]
    Execution {
        /// Backend that served the request
        backend_id: String,
        /// Retry outcome
        source: RetryError<BackendError>,
    },

    /// Shutdown finished but some steps failed
    #[error("Shutdown completed with {} failure(s): {}", .failures.len(), format_failures(.failures))]
    Shutdown {
        /// `(component, reason)` pairs
        failures: Vec<(String, String)>,
    },
}

pub(crate) fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(id, reason)| format!("{id}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_keywords() {
        assert_eq!(ErrorCode::classify("401 Unauthorized"), ErrorCode::Auth);
        assert_eq!(ErrorCode::classify("Invalid API key provided"), ErrorCode::Auth);
        assert_eq!(ErrorCode::classify("Rate limit reached"), ErrorCode::RateLimit);
        assert_eq!(ErrorCode::classify("HTTP 429 Too Many Requests"), ErrorCode::RateLimit);
        assert_eq!(ErrorCode::classify("bad request: missing field"), ErrorCode::InvalidInput);
        assert_eq!(ErrorCode::classify("503 Service Unavailable"), ErrorCode::ServerError);
        assert_eq!(ErrorCode::classify("request timed out"), ErrorCode::Timeout);
        assert_eq!(ErrorCode::classify("connection reset by peer"), ErrorCode::Network);
        assert_eq!(ErrorCode::classify("something odd happened"), ErrorCode::Unknown);
    }

    #[test]
    fn test_classify_is_case_insensitive_and_ordered() {
        assert_eq!(ErrorCode::classify("RATE LIMIT"), ErrorCode::RateLimit);
        // "connection timed out" hits Timeout before Network
        assert_eq!(ErrorCode::classify("Connection timed out"), ErrorCode::Timeout);
    }

    #[test]
    fn test_status_codes_match_whole_tokens_only() {
        assert_eq!(
            ErrorCode::classify("upstream timed out after 4000ms"),
            ErrorCode::Timeout
        );
        assert_eq!(ErrorCode::classify("read timeout after 1401ms"), ErrorCode::Timeout);
        assert_eq!(
            ErrorCode::classify("connection reset after 2500 bytes"),
            ErrorCode::Network
        );
        assert_eq!(ErrorCode::classify("status=403"), ErrorCode::Auth);
        assert_eq!(ErrorCode::classify("upstream returned (500)"), ErrorCode::ServerError);
        assert!(ErrorCode::classify("request 4000 timed out").is_retryable());
    }

    #[test]
    fn test_retryable_split() {
        for code in [
            ErrorCode::RateLimit,
            ErrorCode::Network,
            ErrorCode::Timeout,
            ErrorCode::ServerError,
        ] {
            assert!(code.is_retryable(), "{code} should be retryable");
        }
        for code in [ErrorCode::Auth, ErrorCode::InvalidInput, ErrorCode::Unknown] {
            assert!(!code.is_retryable(), "{code} should not be retryable");
        }
    }

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::classify("upstream overloaded");
        assert_eq!(err.code, ErrorCode::ServerError);
        assert_eq!(err.to_string(), "server_error: upstream overloaded");
    }
}
