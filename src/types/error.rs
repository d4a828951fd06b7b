use std::io;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::types::EndpointKey;

/// The result type used throughout this crate
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Kinds of dispatch errors
///
/// Note: The error messages can change over time, so don't match on the output
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Network error while executing a request.
    /// Transport-native errors are passed through unmodified.
    #[error("Network error")]
    NetworkRequest(#[source] reqwest::Error),

    /// Cannot read the body of the received response
    #[error("Error reading response body: {0}")]
    ReadResponseBody(#[source] reqwest::Error),

    /// The network client backing a transport cannot be created
    #[error("Error creating transport client: {0}")]
    BuildTransport(#[source] reqwest::Error),

    /// No transport handle could be constructed for the given request URL
    #[error("No transport available for {0}")]
    NoTransport(Url),

    /// The configured request timeout elapsed before the transport produced
    /// a terminal event. The timeout is enforced by the dispatcher, not the
    /// transport; the underlying error is synthesized with
    /// [`std::io::ErrorKind::TimedOut`].
    #[error("Request to {url} timed out")]
    Timeout {
        /// The URL of the timed-out request
        url: Url,
        /// Synthesized underlying error, kind [`std::io::ErrorKind::TimedOut`]
        #[source]
        source: io::Error,
    },

    /// The per-endpoint quota for long-lived requests is already in use
    #[error("Too many long-lived requests for endpoint {0}")]
    ResourceExhausted(EndpointKey),

    /// The operation was cancelled before reaching another terminal state.
    /// Only surfaced to synchronous callers; delegates observe cancellation
    /// as a clean `on_finish`.
    #[error("Request to {0} was cancelled")]
    RequestCancelled(Url),

    /// The given string can not be parsed into a valid URL
    #[error("Cannot parse string `{1}` as URL: {0}")]
    ParseUrl(#[source] url::ParseError, String),

    /// An URL with an invalid host was found
    #[error("URL is missing a host")]
    InvalidUrlHost,

    /// The URL scheme has no well-known port and none was given explicitly
    #[error("Unsupported URL scheme: `{0}`")]
    UnsupportedScheme(String),

    /// A submission arrived after the pool was disposed
    #[error("Worker pool `{0}` is disposed")]
    PoolDisposed(String),
}

impl ErrorKind {
    /// Synthesize the timeout error surfaced when the dispatcher-enforced
    /// request timeout fires
    #[must_use]
    pub fn timeout(url: Url, after: Duration) -> Self {
        let source = io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no terminal transport event within {}ms", after.as_millis()),
        );
        ErrorKind::Timeout { url, source }
    }

    /// Returns `true` iff this is the dispatcher-enforced timeout error
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, ErrorKind::Timeout { .. })
    }
}

#[allow(clippy::match_same_arms)]
impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::NetworkRequest(e1), Self::NetworkRequest(e2)) => {
                e1.to_string() == e2.to_string()
            }
            (Self::ReadResponseBody(e1), Self::ReadResponseBody(e2)) => {
                e1.to_string() == e2.to_string()
            }
            (Self::BuildTransport(e1), Self::BuildTransport(e2)) => {
                e1.to_string() == e2.to_string()
            }
            (Self::NoTransport(u1), Self::NoTransport(u2)) => u1 == u2,
            (Self::Timeout { url: u1, .. }, Self::Timeout { url: u2, .. }) => u1 == u2,
            (Self::ResourceExhausted(e1), Self::ResourceExhausted(e2)) => e1 == e2,
            (Self::RequestCancelled(u1), Self::RequestCancelled(u2)) => u1 == u2,
            (Self::ParseUrl(e1, s1), Self::ParseUrl(e2, s2)) => e1 == e2 && s1 == s2,
            (Self::InvalidUrlHost, Self::InvalidUrlHost) => true,
            (Self::UnsupportedScheme(s1), Self::UnsupportedScheme(s2)) => s1 == s2,
            (Self::PoolDisposed(n1), Self::PoolDisposed(n2)) => n1 == n2,
            _ => false,
        }
    }
}

impl Eq for ErrorKind {}
