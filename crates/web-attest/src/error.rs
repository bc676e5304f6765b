//! Error taxonomy for the capture pipeline.

use std::fmt;
use std::time::Duration;

/// Stable error codes surfaced alongside each error message.
pub mod error_codes {
    pub const PARSE_ERROR: &str = "PARSE_ERROR";
    pub const INVALID_METHOD: &str = "INVALID_METHOD";
    pub const FETCH_ERROR: &str = "FETCH_ERROR";
    pub const CAPTURE_FAILURE: &str = "CAPTURE_FAILURE";
    pub const EXTRACTION_ERROR: &str = "EXTRACTION_ERROR";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const UNSUPPORTED_PLATFORM: &str = "UNSUPPORTED_PLATFORM";
    pub const MISSING_INPUT: &str = "MISSING_INPUT";
}

/// Why a variable could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionReason {
    /// The rule's pattern found nothing in its source text.
    NoMatch,
    /// The extracted value is longer than the rule allows.
    TooLong { max: usize, actual: usize },
    /// A `{{name}}` reference has no extracted value.
    UnresolvedPlaceholder,
    /// The rule's pattern does not compile.
    InvalidPattern(String),
    /// No source text exists for the variable (missing cookie, or a DOM
    /// variable without a pattern).
    MissingSource,
    /// Two header names resolve to the same name.
    HeaderCollision,
}

impl fmt::Display for ExtractionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionReason::NoMatch => write!(f, "no match"),
            ExtractionReason::TooLong { max, actual } => {
                write!(f, "value too long ({actual} chars, max {max})")
            }
            ExtractionReason::UnresolvedPlaceholder => write!(f, "unresolved placeholder"),
            ExtractionReason::InvalidPattern(e) => write!(f, "invalid pattern: {e}"),
            ExtractionReason::MissingSource => write!(f, "no source text"),
            ExtractionReason::HeaderCollision => write!(f, "header name produced twice"),
        }
    }
}

/// All errors the pipeline can report to its caller.
#[derive(thiserror::Error, Debug)]
pub enum AttestError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("Failed to fetch {url}: {cause}")]
    Fetch { url: String, cause: String },

    #[error("Capture failure: {0}")]
    CaptureFailure(String),

    #[error("Extraction failed for `{variable}`: {reason}")]
    Extraction {
        variable: String,
        reason: ExtractionReason,
    },

    #[error("Operation timed out after {}ms", after.as_millis())]
    Timeout { after: Duration },

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Either a manifest or a manifest URL must be provided")]
    MissingInput,

    #[error("Prover error [{code}]: {message}")]
    Prover { code: String, message: String },
}

impl AttestError {
    /// The stable code for this error.
    pub fn code(&self) -> &str {
        use error_codes::*;
        match self {
            AttestError::Parse(_) => PARSE_ERROR,
            AttestError::InvalidMethod(_) => INVALID_METHOD,
            AttestError::Fetch { .. } => FETCH_ERROR,
            AttestError::CaptureFailure(_) => CAPTURE_FAILURE,
            AttestError::Extraction { .. } => EXTRACTION_ERROR,
            AttestError::Timeout { .. } => TIMEOUT,
            AttestError::UnsupportedPlatform(_) => UNSUPPORTED_PLATFORM,
            AttestError::MissingInput => MISSING_INPUT,
            AttestError::Prover { code, .. } => code,
        }
    }

    pub(crate) fn extraction(variable: impl Into<String>, reason: ExtractionReason) -> Self {
        AttestError::Extraction {
            variable: variable.into(),
            reason,
        }
    }
}

impl From<serde_json::Error> for AttestError {
    fn from(e: serde_json::Error) -> Self {
        AttestError::Parse(e.to_string())
    }
}

/// Convenience result type.
pub type AttestResult<T> = Result<T, AttestError>;
