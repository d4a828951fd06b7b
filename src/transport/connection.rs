use std::time::Duration;

use async_trait::async_trait;

use super::{prepare, ReqwestStream, Transport, TransportStream};
use crate::delegate::BasicCredentials;
use crate::logging::{trace_src, LogSource};
use crate::types::{ErrorKind, Request, Result};

/// A timeout for only the connect phase of a per-operation client.
const CONNECT_TIMEOUT: u64 = 10;

/// The per-connection transport: a fresh single-use client per operation,
/// scheduled directly on the operation's leased worker. No connections are
/// reused across operations.
#[derive(Debug, Default)]
pub struct ConnectionTransport {
    user_agent: String,
}

impl ConnectionTransport {
    /// Create the per-connection transport factory
    #[must_use]
    pub fn new(user_agent: &str) -> Self {
        ConnectionTransport {
            user_agent: user_agent.to_string(),
        }
    }
}

#[async_trait]
impl Transport for ConnectionTransport {
    async fn start(
        &self,
        request: &Request,
        credentials: Option<&BasicCredentials>,
    ) -> Result<Box<dyn TransportStream>> {
        let client = reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT))
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| {
                trace_src!(
                    LogSource::Dispatcher,
                    "per-connection client build failed for {}: {e}",
                    request.url
                );
                ErrorKind::NoTransport(request.url.clone())
            })?;
        let prepared = prepare(&client, request, credentials)?;
        Ok(Box::new(ReqwestStream::new(&client, prepared)))
    }
}
