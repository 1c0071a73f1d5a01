//! Errors returned by the resolver and its collaborators

use reqwest::StatusCode;

use crate::digest::DigestError;
use crate::reference::ParseError;

/// Result type for resolver operations
pub type Result<T> = std::result::Result<T, ResolveError>;

// Error priorities used by the resolver's failover loop. The error created
// furthest through the resolution pipeline is the one returned: a 404 from
// a registry that answered is more actionable than a TCP error from the
// first host tried, an unexpected status (e.g. a 500) beats a 404, and a
// size-ceiling rejection outranks everything because it means the content
// exists but is pathological.
pub(crate) const PRIORITY_TRANSPORT: u8 = 1;
pub(crate) const PRIORITY_NOT_FOUND: u8 = 2;
pub(crate) const PRIORITY_UNEXPECTED_STATUS: u8 = 3;
pub(crate) const PRIORITY_SIZE_LIMIT: u8 = 4;

/// The error type returned by [`Resolver`](crate::Resolver) operations
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The image reference could not be parsed
    #[error(transparent)]
    InvalidReference(#[from] ParseError),

    /// The reference carries neither a tag nor a digest
    #[error("object required in reference")]
    ObjectRequired,

    /// Content was not found on any configured host
    #[error("{0}: not found")]
    NotFound(String),

    /// The registry or token endpoint rejected the configured credentials
    #[error("authorization failed: {0}")]
    AuthenticationFailure(String),

    /// Authorization failed while resolving; carries the underlying auth error
    #[error("pull access denied, repository does not exist or may require authorization: {source}")]
    Denied {
        /// The authorization error that triggered the denial
        #[source]
        source: Box<ResolveError>,
    },

    /// Functionality the resolver refuses to provide, such as schema 1
    /// manifests or authentication challenges no handler understands
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The registry answered with a status outside the handled set
    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus {
        /// Status code returned by the registry
        status: StatusCode,
        /// URL of the failed request
        url: String,
    },

    /// Sentinel: a ranged request was served as full content. Callers may
    /// fall back to a sequential read.
    #[error("content range requests ignored")]
    ContentRangeIgnored,

    /// The server honored a byte range other than the one requested
    #[error("unhandled content range in response: {0}")]
    ContentRangeMismatch(String),

    /// Network, TLS, DNS or timeout failure below the HTTP layer
    #[error("failed to do request: {0}")]
    Transport(#[from] reqwest::Error),

    /// The redirect chain exceeded the limit
    #[error("stopped after {0} redirects")]
    TooManyRedirects(usize),

    /// A request URL could not be assembled
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        /// The offending URL
        url: String,
        /// Parse failure
        #[source]
        source: url::ParseError,
    },

    /// A digest failed to parse or verify
    #[error(transparent)]
    Digest(#[from] DigestError),
}

impl ResolveError {
    /// Returns true when the error represents missing content, including
    /// the size-ceiling rejection which masquerades as not-found so callers
    /// stop trying.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ResolveError::NotFound(_))
    }

    /// Returns true for functionality the resolver declines to provide
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, ResolveError::NotImplemented(_))
    }

    /// Returns true when credentials were rejected
    pub fn is_unauthorized(&self) -> bool {
        match self {
            ResolveError::AuthenticationFailure(_) => true,
            ResolveError::Denied { .. } => true,
            _ => false,
        }
    }

    /// Returns true for statuses the resolver did not expect
    pub fn is_unexpected_status(&self) -> bool {
        matches!(self, ResolveError::UnexpectedStatus { .. })
    }
}

/// Builds the error for a response status outside the handled set
pub(crate) fn unexpected_response(resp: &reqwest::Response) -> ResolveError {
    ResolveError::UnexpectedStatus {
        status: resp.status(),
        url: resp.url().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_are_ordered() {
        assert!(PRIORITY_TRANSPORT < PRIORITY_NOT_FOUND);
        assert!(PRIORITY_NOT_FOUND < PRIORITY_UNEXPECTED_STATUS);
        assert!(PRIORITY_UNEXPECTED_STATUS < PRIORITY_SIZE_LIMIT);
    }

    #[test]
    fn denial_wraps_auth_failure() {
        let err = ResolveError::Denied {
            source: Box::new(ResolveError::AuthenticationFailure(
                "bad credentials".to_string(),
            )),
        };
        assert!(err.is_unauthorized());
        assert!(err.to_string().contains("pull access denied"));
        assert!(err.to_string().contains("bad credentials"));
    }
}
