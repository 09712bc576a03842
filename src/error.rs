//! Error types for the storage gateway
//!
//! Every failure is classified into an [`ErrorKind`] so that the CLI and the
//! REST API can map it to an exit status or HTTP status without inspecting
//! messages. Wrapping an error with [`ResultExt::context`] adds the phase that
//! failed but never changes its kind.

use thiserror::Error;

/// Unified error type for the gateway
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    // =========================================================================
    // Storage Controller Errors
    // =========================================================================
    #[error("resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("controller request failed: {method} {path} returned {status}: {message}")]
    ControllerApi {
        method: String,
        path: String,
        status: u16,
        message: String,
    },

    #[error("no reachable controller among: {0}")]
    NoController(String),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // HA Configuration Errors
    // =========================================================================
    #[error("unknown promoter config: {0}")]
    PromoterDecode(String),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML render error: {0}")]
    TomlRender(#[from] toml::ser::Error),

    // =========================================================================
    // Wait Errors
    // =========================================================================
    #[error("timed out waiting for resource {resource}: {reason}")]
    Timeout { resource: String, reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, rejected before any external call
    Validation,
    /// Existing state is incompatible with the request
    Conflict,
    /// A named object does not exist
    NotFound,
    /// A wait deadline elapsed or was cancelled
    Timeout,
    /// Failure reported by one of the external collaborators
    Backend,
    /// Bug or local misconfiguration
    Internal,
}

impl Error {
    /// Classify this error, looking through any context wrappers
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::ResourceNotFound { .. } => ErrorKind::NotFound,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::ControllerApi { .. }
            | Error::NoController(_)
            | Error::Http(_)
            | Error::PromoterDecode(_)
            | Error::TomlParse(_) => ErrorKind::Backend,
            Error::TomlRender(_) | Error::Internal(_) | Error::Configuration(_) => {
                ErrorKind::Internal
            }
            Error::Context { source, .. } => source.kind(),
        }
    }

    /// Whether this is the distinguished "does not exist" condition
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) | Error::NoController(_) => true,
            Error::ControllerApi { status, .. } => *status >= 500,
            Error::Context { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Process exit status used by the CLI for this error
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Validation => 2,
            ErrorKind::Conflict => 3,
            ErrorKind::NotFound => 4,
            ErrorKind::Timeout => 5,
            ErrorKind::Backend => 6,
            ErrorKind::Internal => 1,
        }
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// Attach the failing phase to an error
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|source| Error::Context {
            context: context.into(),
            source: Box::new(source),
        })
    }
}

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;
