//! Error types for routebeacon.

use thiserror::Error;

/// Errors surfaced at component boundaries.
#[derive(Debug, Error)]
pub enum Error {
    /// Create or Rename target collision in the index.
    #[error("domain already exists: {0}")]
    AlreadyExists(String),

    /// Delete or Rename source missing from the index.
    #[error("domain not found: {0}")]
    NotFound(String),

    /// Domain failed syntax validation at the API boundary.
    #[error("invalid domain name {name:?}: {reason}")]
    InvalidDomain {
        /// The rejected input.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// DNS protocol error from message encoding or parsing.
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// HTTP client error while fetching the bootstrap list.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A BGP UPDATE could not be rendered into wire format.
    #[error("update encoding failed: {0}")]
    Encode(String),
}

impl Error {
    /// Shorthand for an [`Error::InvalidDomain`].
    pub fn invalid_domain(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDomain {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
