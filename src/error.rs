//! Unified error handling for the ondol crate
//!
//! Domain-specific errors (fetch, parse, sweep) are consolidated into a single
//! [`Error`] enum so they can cross module boundaries without losing detail,
//! while the scheduler and commands classify them through a common trait.
//!
//! # Architecture
//!
//! - [`OndolErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors

use std::io;
use thiserror::Error;

/// Block response classification reported by the fetch layer
///
/// The remote site expresses displeasure in several shapes; the governor
/// escalates pacing differently for each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// 429 Too Many Requests
    RateLimit,
    /// 403, or a 200 interstitial ("access denied" style) page
    Forbidden,
    /// CAPTCHA challenge detected in a 200 body
    Captcha,
    /// 200 with an implausibly short body (client-side rendered shell)
    Skeleton,
    /// 503 Service Unavailable
    ServerError,
}

impl BlockKind {
    /// Stable string form used in logs and metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Forbidden => "forbidden",
            Self::Captcha => "captcha",
            Self::Skeleton => "skeleton",
            Self::ServerError => "server_error",
        }
    }
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can occur during HTTP fetching operations
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Request timeout
    #[error("Request timeout")]
    Timeout,

    /// Remote anti-bot response detected
    #[error("Blocked by remote host: {0}")]
    Blocked(BlockKind),

    /// Non-success status that is not a recognized block shape
    #[error("Server returned status {0}")]
    Status(u16),

    /// Response body could not be decoded as JSON
    #[error("Decoding error: {0}")]
    Decode(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Errors that can occur while extracting data from remote payloads
#[derive(Error, Debug)]
pub enum ParseError {
    /// No listing entries found in a search payload
    #[error("No listings found in search payload")]
    ListingsNotFound,

    /// No calendar days found in a calendar payload
    #[error("No calendar days found in payload")]
    CalendarNotFound,

    /// Date field did not parse
    #[error("Invalid date: {0}")]
    InvalidDate(String),

    /// Price field did not parse
    #[error("Invalid price: {0}")]
    InvalidPrice(String),
}

/// Common trait for all ondol error types
///
/// Enables consistent error processing strategies across modules: the
/// scheduler uses `is_recoverable` to decide retry vs. permanent failure.
pub trait OndolErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network-related errors (HTTP, timeout, rate limit)
    Network,
    /// Parsing and data extraction errors
    Parsing,
    /// Storage and I/O errors
    Storage,
    /// Configuration and validation errors
    Config,
    /// Scheduler and timing errors
    Scheduler,
    /// Other/unknown errors
    Other,
}

impl OndolErrorTrait for FetchError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout | Self::Decode(_) => true,
            // Blocked is requeued through the governor, not retried in place
            Self::Blocked(_) => true,
            Self::Status(code) => matches!(code, 500 | 502 | 504),
            Self::InvalidUrl(_) => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Network
    }
}

impl OndolErrorTrait for ParseError {
    fn is_recoverable(&self) -> bool {
        // A changed payload shape will not fix itself on retry
        false
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Parsing
    }
}

/// Unified error type for the ondol crate
#[derive(Error, Debug)]
pub enum Error {
    /// Fetch-specific errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Payload parse errors
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[source] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Scheduler errors (queue state, task bookkeeping)
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl OndolErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_recoverable(),
            Self::Parse(e) => e.is_recoverable(),
            Self::Database(_) => false,
            Self::Io(_) => true, // I/O errors are often transient
            Self::Json(_) => false,
            Self::Config(_) => false,
            Self::Scheduler(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Fetch(_) => ErrorCategory::Network,
            Self::Parse(_) | Self::Json(_) => ErrorCategory::Parsing,
            Self::Database(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Config(_) => ErrorCategory::Config,
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Whether this error is a governor-level block (requeue, not retry)
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Fetch(FetchError::Blocked(_)))
    }

    /// The block kind, if this error is a block
    pub fn blocked_kind(&self) -> Option<BlockKind> {
        match self {
            Self::Fetch(FetchError::Blocked(kind)) => Some(*kind),
            _ => None,
        }
    }
}

// Conversion from rusqlite::Error
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err)
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        let fetch_err = Error::Fetch(FetchError::Timeout);
        assert_eq!(fetch_err.category(), ErrorCategory::Network);

        let parse_err = Error::Parse(ParseError::ListingsNotFound);
        assert_eq!(parse_err.category(), ErrorCategory::Parsing);
    }

    #[test]
    fn test_is_recoverable() {
        let fetch_err = Error::Fetch(FetchError::Timeout);
        assert!(fetch_err.is_recoverable());

        let parse_err = Error::Parse(ParseError::CalendarNotFound);
        assert!(!parse_err.is_recoverable());
    }

    #[test]
    fn test_status_recoverability() {
        assert!(FetchError::Status(502).is_recoverable());
        assert!(!FetchError::Status(404).is_recoverable());
        assert!(!FetchError::Status(401).is_recoverable());
    }

    #[test]
    fn test_blocked_kind_extraction() {
        let err = Error::Fetch(FetchError::Blocked(BlockKind::Captcha));
        assert!(err.is_blocked());
        assert_eq!(err.blocked_kind(), Some(BlockKind::Captcha));

        let err = Error::Fetch(FetchError::Timeout);
        assert!(!err.is_blocked());
        assert_eq!(err.blocked_kind(), None);
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("invalid tier");
        assert_eq!(err.category(), ErrorCategory::Config);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_block_kind_labels() {
        assert_eq!(BlockKind::RateLimit.as_str(), "rate_limit");
        assert_eq!(BlockKind::Captcha.as_str(), "captcha");
        assert_eq!(BlockKind::Skeleton.to_string(), "skeleton");
    }
}
