use std::time::Duration;

use async_trait::async_trait;

use super::{prepare, ReqwestStream, Transport, TransportStream};
use crate::delegate::BasicCredentials;
use crate::types::{ErrorKind, Request, Result};

/// A timeout for only the connect phase of the shared client.
const CONNECT_TIMEOUT: u64 = 10;
/// TCP keepalive interval for pooled connections.
/// See <https://tldp.org/HOWTO/TCP-Keepalive-HOWTO/overview.html> for more info
const TCP_KEEPALIVE: u64 = 60;
/// How long the shared client keeps idle connections around.
const POOL_IDLE_TIMEOUT: u64 = 90;

/// The session-based transport: one shared [`reqwest::Client`] dispatches a
/// task per operation, reusing connections across operations.
///
/// Note that the client carries no request timeout; see the module
/// documentation.
#[derive(Debug)]
pub struct SessionTransport {
    client: reqwest::Client,
}

impl SessionTransport {
    /// Build the shared session client.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::BuildTransport`] if the underlying client cannot
    /// be constructed; the dispatcher then falls back to the per-connection
    /// transport.
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT))
            .tcp_keepalive(Duration::from_secs(TCP_KEEPALIVE))
            .pool_idle_timeout(Duration::from_secs(POOL_IDLE_TIMEOUT))
            .build()
            .map_err(ErrorKind::BuildTransport)?;
        Ok(SessionTransport { client })
    }
}

#[async_trait]
impl Transport for SessionTransport {
    async fn start(
        &self,
        request: &Request,
        credentials: Option<&BasicCredentials>,
    ) -> Result<Box<dyn TransportStream>> {
        let prepared = prepare(&self.client, request, credentials)?;
        Ok(Box::new(ReqwestStream::new(&self.client, prepared)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;
    use bytes::BytesMut;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_streams_head_chunks_and_finish() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
            .mount(&server)
            .await;

        let transport = SessionTransport::new("urlgate-test").unwrap();
        let request = Request::try_from(server.uri().as_str()).unwrap();
        let mut stream = transport.start(&request, None).await.unwrap();

        let TransportEvent::Head(head) = stream.next_event().await else {
            panic!("expected response head first");
        };
        assert_eq!(head.status, 200);

        let mut body = BytesMut::new();
        loop {
            match stream.next_event().await {
                TransportEvent::Chunk(chunk) => body.extend_from_slice(&chunk),
                TransportEvent::Finished => break,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn test_connection_failure_surfaces_as_network_error() {
        // Nothing listens on this port
        let transport = SessionTransport::new("urlgate-test").unwrap();
        let request = Request::try_from("http://127.0.0.1:1/unreachable").unwrap();
        let mut stream = transport.start(&request, None).await.unwrap();
        match stream.next_event().await {
            TransportEvent::Failed(ErrorKind::NetworkRequest(_)) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_prepared_request_carries_no_transport_timeout() {
        let transport = SessionTransport::new("urlgate-test").unwrap();
        let request = Request::try_from("https://example.com/")
            .unwrap()
            .with_timeout(Duration::from_millis(200));
        let prepared = prepare(&transport.client, &request, None).unwrap();
        assert!(prepared.timeout().is_none());
    }
}
