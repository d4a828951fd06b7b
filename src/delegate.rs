//! The client-facing callback surface of a dispatched operation.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use url::Url;

use crate::operation::Operation;
use crate::types::{ErrorKind, ResponseHead};

/// Basic credentials a delegate can supply in response to an
/// authentication challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    /// Username for basic authentication
    pub username: String,
    /// Password for basic authentication
    pub password: String,
}

/// An authentication challenge extracted from a `401`/`407` response head
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    /// The URL that issued the challenge
    pub url: Url,
    /// The challenging status code
    pub status: StatusCode,
    /// The challenge scheme from `WWW-Authenticate`, lowercased, if present
    pub scheme: Option<String>,
}

/// A delegate's answer to an authentication challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeAction {
    /// Let the transport's default handling stand; the challenging response
    /// is delivered to the delegate unchanged
    Default,
    /// Re-issue the request once with the given basic credentials
    UseCredentials(BasicCredentials),
}

/// Receives the lifecycle callbacks of an operation.
///
/// For a single operation the callbacks are serialized on the operation's
/// leased worker and totally ordered: an optional `on_response`, then zero or
/// more `on_data`, then exactly one of `on_finish` or `on_fail`. After the
/// terminal callback no further callbacks fire. Between different operations
/// sharing a delegate there is no ordering guarantee.
///
/// Cancellation is a clean terminal: a cancelled operation receives
/// `on_finish`, not `on_fail`.
///
/// All callbacks have default empty implementations, so a delegate only
/// implements what it observes.
#[async_trait]
pub trait Delegate: Send + Sync + 'static {
    /// Called at most once, before any `on_data`
    async fn on_response(&self, _operation: &Arc<Operation>, _response: &ResponseHead) {}

    /// Called zero or more times with incremental body bytes
    async fn on_data(&self, _operation: &Arc<Operation>, _chunk: &Bytes) {}

    /// Clean terminal callback: the operation completed or was cancelled
    async fn on_finish(&self, _operation: &Arc<Operation>) {}

    /// Failing terminal callback, carrying the terminal error
    async fn on_fail(&self, _operation: &Arc<Operation>, _error: &ErrorKind) {}

    /// Declares the optional authentication-challenge capability. Resolved
    /// once at operation construction; when `false`, `on_auth_challenge` is
    /// never consulted and challenges get default handling.
    fn handles_auth_challenge(&self) -> bool {
        false
    }

    /// Called when a response head carries an authentication challenge and
    /// [`handles_auth_challenge`](Delegate::handles_auth_challenge) is `true`
    async fn on_auth_challenge(
        &self,
        _operation: &Arc<Operation>,
        _challenge: &AuthChallenge,
    ) -> ChallengeAction {
        ChallengeAction::Default
    }
}

impl AuthChallenge {
    pub(crate) fn from_head(head: &ResponseHead) -> Self {
        let scheme = head
            .headers
            .get(http::header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split_whitespace().next())
            .map(str::to_ascii_lowercase);
        AuthChallenge {
            url: head.url.clone(),
            status: head.status,
            scheme,
        }
    }
}
