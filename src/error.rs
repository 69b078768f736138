//! Error types shared across the facade

use std::io;
use thiserror::Error;

/// Errors raised by the package-index facade
#[derive(Debug, Error)]
pub enum FacadeError {
    /// A listing filename could not be decomposed into package/version parts
    #[error("invalid package filename '{filename}': {reason}")]
    InvalidName { filename: String, reason: &'static str },

    /// Neither the cache nor any upstream index could produce the file
    #[error("{package}/{filename} is not available from any index or the cache")]
    NotAvailable { package: String, filename: String },

    /// Contradictory or malformed startup options
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network or HTTP failure against a single upstream index
    #[error("upstream fetch of {url} failed: {reason}")]
    UpstreamFetch { url: String, reason: String },

    /// The client went away while a response was being streamed
    #[error("client disconnected")]
    ClientDisconnected,

    /// Key or certificate generation, loading, or signing failed
    #[error("certificate error: {0}")]
    Certificate(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FacadeError {
    pub fn invalid_name(filename: &str, reason: &'static str) -> Self {
        FacadeError::InvalidName {
            filename: filename.to_string(),
            reason,
        }
    }

    pub fn upstream(url: impl ToString, reason: impl ToString) -> Self {
        FacadeError::UpstreamFetch {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<rcgen::RcgenError> for FacadeError {
    fn from(err: rcgen::RcgenError) -> Self {
        FacadeError::Certificate(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FacadeError>;
