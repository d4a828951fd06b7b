use std::fmt::Display;
use std::time::Duration;

use bytes::Bytes;
use http::header::HeaderMap;
use http::Method;
use url::Url;

use crate::config::DEFAULT_TIMEOUT_SECS;
use crate::types::{EndpointKey, ErrorKind, Result};

/// The transport request descriptor for a single dispatched operation.
///
/// The `timeout` is enforced by the dispatcher itself, never handed to the
/// transport (whose own timer is not trusted; see the crate documentation).
#[derive(Debug, Clone)]
pub struct Request {
    /// The request URL; its `(scheme, host, port)` triple selects the
    /// admission slot the request competes for
    pub url: Url,

    /// HTTP method, `GET` by default
    pub method: Method,

    /// Additional request headers
    pub headers: HeaderMap,

    /// Optional request body
    pub body: Option<Bytes>,

    /// Caller-visible request timeout, enforced by the dispatcher
    pub timeout: Duration,

    /// When set, the operation retains the concatenated response body, which
    /// can be read back through the operation handle after the terminal
    /// transition. Synchronous dispatch turns this on unconditionally.
    pub gather_body: bool,
}

impl Request {
    /// Create a `GET` request for the given URL with default settings
    #[must_use]
    pub fn new(url: Url) -> Self {
        Request {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            gather_body: false,
        }
    }

    /// Replace the request timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable body gathering on the operation
    #[must_use]
    pub const fn with_gather_body(mut self, gather: bool) -> Self {
        self.gather_body = gather;
        self
    }

    /// The endpoint key this request competes for admission on
    ///
    /// # Errors
    ///
    /// Returns an error if the URL has no host, or carries a scheme without
    /// a well-known port and no explicit port.
    pub fn endpoint(&self) -> Result<EndpointKey> {
        EndpointKey::try_from(&self.url)
    }
}

impl TryFrom<Url> for Request {
    type Error = ErrorKind;

    fn try_from(url: Url) -> Result<Self> {
        // Reject URLs without admission identity up front, so dispatch
        // surfaces invalid arguments synchronously
        EndpointKey::try_from(&url)?;
        Ok(Request::new(url))
    }
}

impl TryFrom<&str> for Request {
    type Error = ErrorKind;

    fn try_from(s: &str) -> Result<Self> {
        let url = Url::parse(s).map_err(|e| ErrorKind::ParseUrl(e, s.to_string()))?;
        Request::try_from(url)
    }
}

impl TryFrom<String> for Request {
    type Error = ErrorKind;

    fn try_from(s: String) -> Result<Self> {
        Request::try_from(s.as_str())
    }
}

impl Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}
