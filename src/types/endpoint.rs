use serde::{Deserialize, Serialize};
use std::fmt;

use url::Url;

use crate::types::{ErrorKind, Result};

/// A canonical `(scheme, host, port)` triple derived from a request URL.
///
/// Two requests share admission capacity iff their endpoint keys are equal.
/// Scheme and host are normalized to lowercase; the port defaults to the
/// scheme's well-known port when the URL does not carry one explicitly.
///
/// # Examples
///
/// ```
/// use urlgate::EndpointKey;
/// use url::Url;
///
/// let url = Url::parse("HTTPS://Example.com/some/path").unwrap();
/// let key = EndpointKey::try_from(&url).unwrap();
/// assert_eq!(key.to_string(), "https://example.com:443");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointKey {
    scheme: String,
    host: String,
    port: u16,
}

impl EndpointKey {
    /// The normalized URL scheme
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The normalized hostname
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The effective port (explicit, or the scheme's well-known default)
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl TryFrom<&Url> for EndpointKey {
    type Error = ErrorKind;

    fn try_from(url: &Url) -> Result<Self> {
        let host = url.host_str().ok_or(ErrorKind::InvalidUrlHost)?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ErrorKind::UnsupportedScheme(url.scheme().to_string()))?;

        // `Url` already lowercases scheme and registered-name hosts, but the
        // normalization must not depend on that detail
        Ok(EndpointKey {
            scheme: url.scheme().to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
        })
    }
}

impl TryFrom<Url> for EndpointKey {
    type Error = ErrorKind;

    fn try_from(url: Url) -> Result<Self> {
        EndpointKey::try_from(&url)
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}
