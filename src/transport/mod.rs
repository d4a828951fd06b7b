//! The transport seam.
//!
//! The dispatcher owns *admission*; a [`Transport`] owns sockets, TLS and
//! request execution. Two implementations are provided: a session-based one
//! sharing a single [`reqwest::Client`] across operations, and a
//! per-connection one creating a single-use client per operation. Which one
//! serves an operation is a dispatcher configuration choice with fallback to
//! per-connection when the session transport is unavailable.
//!
//! A transport never enforces the caller-visible request timeout: prepared
//! requests deliberately carry no transport-level timeout, and the
//! dispatcher's timer fails stalled operations instead.

mod connection;
mod session;

use async_trait::async_trait;
use bytes::Bytes;

use crate::delegate::BasicCredentials;
use crate::types::{ErrorKind, Request, ResponseHead, Result};

pub use connection::ConnectionTransport;
pub use session::SessionTransport;

/// One transport-level event for a single operation
#[derive(Debug)]
pub enum TransportEvent {
    /// Response metadata arrived; sent at most once, before any chunk
    Head(ResponseHead),
    /// A chunk of incremental body bytes
    Chunk(Bytes),
    /// The request finished cleanly; no further events follow
    Finished,
    /// The request failed; no further events follow
    Failed(ErrorKind),
}

/// Executes prepared requests. Implementations must be cheap to share.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Begin executing `request`, optionally with basic credentials attached
    /// in answer to an authentication challenge.
    ///
    /// Dropping the returned stream cancels any in-flight transport work.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NoTransport`] when no handle could be
    /// constructed for the request.
    async fn start(
        &self,
        request: &Request,
        credentials: Option<&BasicCredentials>,
    ) -> Result<Box<dyn TransportStream>>;
}

/// The in-flight side of one transport request
#[async_trait]
pub trait TransportStream: Send {
    /// The next event. After `Finished` or `Failed` the stream is exhausted
    /// and keeps returning `Finished`.
    async fn next_event(&mut self) -> TransportEvent;
}

/// Build the wire-level request handed to reqwest.
///
/// The request timeout is intentionally not propagated: stalled connections
/// have been observed to defeat the transport's own timer, so the dispatcher
/// enforces timeouts via its timer service instead.
pub(crate) fn prepare(
    client: &reqwest::Client,
    request: &Request,
    credentials: Option<&BasicCredentials>,
) -> Result<reqwest::Request> {
    let mut builder = client
        .request(request.method.clone(), request.url.clone())
        .headers(request.headers.clone());
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }
    if let Some(credentials) = credentials {
        builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
    }
    builder.build().map_err(ErrorKind::BuildTransport)
}

enum StreamState {
    Head(futures::future::BoxFuture<'static, reqwest::Result<reqwest::Response>>),
    Body(reqwest::Response),
    Exhausted,
}

/// Event stream over one reqwest request, shared by both transports
struct ReqwestStream {
    state: StreamState,
}

impl ReqwestStream {
    fn new(client: &reqwest::Client, request: reqwest::Request) -> Self {
        ReqwestStream {
            state: StreamState::Head(Box::pin(client.execute(request))),
        }
    }
}

#[async_trait]
impl TransportStream for ReqwestStream {
    async fn next_event(&mut self) -> TransportEvent {
        match &mut self.state {
            StreamState::Head(pending) => {
                let awaited = pending.await;
                match awaited {
                    Ok(response) => {
                        let head = ResponseHead {
                            status: response.status(),
                            headers: response.headers().clone(),
                            url: response.url().clone(),
                        };
                        self.state = StreamState::Body(response);
                        TransportEvent::Head(head)
                    }
                    Err(e) => {
                        self.state = StreamState::Exhausted;
                        TransportEvent::Failed(ErrorKind::NetworkRequest(e))
                    }
                }
            }
            StreamState::Body(response) => {
                let chunk = response.chunk().await;
                match chunk {
                    Ok(Some(chunk)) => TransportEvent::Chunk(chunk),
                    Ok(None) => {
                        self.state = StreamState::Exhausted;
                        TransportEvent::Finished
                    }
                    Err(e) => {
                        self.state = StreamState::Exhausted;
                        TransportEvent::Failed(ErrorKind::ReadResponseBody(e))
                    }
                }
            }
            StreamState::Exhausted => TransportEvent::Finished,
        }
    }
}
