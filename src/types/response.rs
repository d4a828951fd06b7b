use http::header::HeaderMap;
use http::StatusCode;
use url::Url;

/// Response metadata retained by an operation and delivered to the delegate
/// before any body data.
///
/// The body itself is streamed through `Delegate::on_data`; when the
/// operation gathers data, the concatenation is also kept on the operation
/// and readable after the terminal transition.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// HTTP status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// The final URL the response was served from
    pub url: Url,
}

impl ResponseHead {
    /// Whether the response carries an authentication challenge the
    /// dispatcher may offer to a capable delegate
    #[must_use]
    pub fn is_auth_challenge(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
            || self.status == StatusCode::PROXY_AUTHENTICATION_REQUIRED
    }
}
