// ABOUTME: Errors returned by cloud provider clients.
// ABOUTME: Classifies HTTP and SSH failures as transient or fatal.

use crate::retry::Transient;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider rate limit hit")]
    RateLimited,

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("remote execution on {node} failed: {source}")]
    Ssh {
        node: String,
        #[source]
        source: crate::ssh::Error,
    },

    #[error("node {node} has no public address yet")]
    NoAddress { node: String },

    #[error("unexpected provider response: {0}")]
    Decode(String),

    #[error("provider misconfigured: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl Transient for ProviderError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::RateLimited | Self::NoAddress { .. } => true,
            Self::Ssh { source, .. } => source.is_transient(),
            Self::NotFound { .. } | Self::Rejected { .. } | Self::Decode(_) | Self::Config(_) => {
                false
            }
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Unavailable(e.to_string())
        }
    }
}
