use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::HeaderMap;
use http::StatusCode;
use url::Url;

use crate::delegate::Delegate;
use crate::operation::Operation;
use crate::transport::{Transport, TransportEvent, TransportStream};
use crate::types::{ErrorKind, Request, ResponseHead, Result};

#[macro_export]
/// Creates a mock web server, which responds with a predefined status when
/// handling a matching request
macro_rules! mock_server {
    ($status:expr $(, $func:tt ($($arg:expr),*))*) => {{
        let mock_server = wiremock::MockServer::start().await;
        let response_template = wiremock::ResponseTemplate::new(http::StatusCode::from($status));
        let template = response_template$(.$func($($arg),*))*;
        wiremock::Mock::given(wiremock::matchers::method("GET")).respond_with(template).mount(&mock_server).await;
        mock_server
    }};
}

/// A deterministic in-crate transport for admission and timeout tests.
///
/// Completion is delayed by a configurable interval; URLs whose path
/// contains the configured stall marker never produce any event. The
/// transport tracks how many streams are live at once, so tests can assert
/// the dispatcher's concurrency ceiling.
#[derive(Debug)]
pub(crate) struct FakeTransport {
    delay: Duration,
    stall_marker: Option<String>,
    body: Bytes,
    fail_start: bool,
    started: Arc<AtomicUsize>,
    concurrent: Arc<AtomicUsize>,
    max_concurrent: Arc<AtomicUsize>,
    start_order: Arc<Mutex<Vec<String>>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        FakeTransport {
            delay: Duration::ZERO,
            stall_marker: None,
            body: Bytes::from_static(b"payload"),
            fail_start: false,
            started: Arc::new(AtomicUsize::new(0)),
            concurrent: Arc::new(AtomicUsize::new(0)),
            max_concurrent: Arc::new(AtomicUsize::new(0)),
            start_order: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Delay stream completion by `delay`
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn with_body(mut self, body: &'static [u8]) -> Self {
        self.body = Bytes::from_static(body);
        self
    }

    /// Streams for URLs whose path contains `marker` never respond
    pub(crate) fn stalling(mut self, marker: &str) -> Self {
        self.stall_marker = Some(marker.to_string());
        self
    }

    /// Every `start` call fails as if no handle could be constructed
    pub(crate) fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub(crate) fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// The highest number of simultaneously live streams observed
    pub(crate) fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    /// URL paths in the order their streams were started
    pub(crate) fn start_order(&self) -> Vec<String> {
        self.start_order.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn start(
        &self,
        request: &Request,
        _credentials: Option<&crate::delegate::BasicCredentials>,
    ) -> Result<Box<dyn TransportStream>> {
        if self.fail_start {
            return Err(ErrorKind::NoTransport(request.url.clone()));
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        self.start_order
            .lock()
            .unwrap()
            .push(request.url.path().to_string());
        let live = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(live, Ordering::SeqCst);
        let stalled = self
            .stall_marker
            .as_ref()
            .is_some_and(|marker| request.url.path().contains(marker));
        Ok(Box::new(FakeStream {
            phase: FakePhase::Connecting,
            url: request.url.clone(),
            delay: self.delay,
            stalled,
            body: self.body.clone(),
            concurrent: self.concurrent.clone(),
        }))
    }
}

enum FakePhase {
    Connecting,
    Streaming,
    Exhausted,
}

struct FakeStream {
    phase: FakePhase,
    url: Url,
    delay: Duration,
    stalled: bool,
    body: Bytes,
    concurrent: Arc<AtomicUsize>,
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportStream for FakeStream {
    async fn next_event(&mut self) -> TransportEvent {
        match self.phase {
            FakePhase::Connecting => {
                if self.stalled {
                    // A pathological connection: nothing ever arrives
                    std::future::pending::<()>().await;
                }
                tokio::time::sleep(self.delay).await;
                self.phase = FakePhase::Streaming;
                TransportEvent::Head(ResponseHead {
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                    url: self.url.clone(),
                })
            }
            FakePhase::Streaming => {
                self.phase = FakePhase::Exhausted;
                TransportEvent::Chunk(self.body.clone())
            }
            FakePhase::Exhausted => TransportEvent::Finished,
        }
    }
}

/// What a delegate observed, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DelegateEvent {
    Response(u16),
    Data(Bytes),
    Finish,
    Fail { timeout: bool },
}

impl DelegateEvent {
    pub(crate) const fn is_terminal(&self) -> bool {
        matches!(self, DelegateEvent::Finish | DelegateEvent::Fail { .. })
    }
}

/// Records every callback it receives, for ordering assertions
#[derive(Debug, Default)]
pub(crate) struct RecordingDelegate {
    events: Mutex<Vec<DelegateEvent>>,
}

impl RecordingDelegate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(RecordingDelegate::default())
    }

    pub(crate) fn events(&self) -> Vec<DelegateEvent> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: DelegateEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Delegate for RecordingDelegate {
    async fn on_response(&self, _operation: &Arc<Operation>, response: &ResponseHead) {
        self.push(DelegateEvent::Response(response.status.as_u16()));
    }

    async fn on_data(&self, _operation: &Arc<Operation>, chunk: &Bytes) {
        self.push(DelegateEvent::Data(chunk.clone()));
    }

    async fn on_finish(&self, _operation: &Arc<Operation>) {
        self.push(DelegateEvent::Finish);
    }

    async fn on_fail(&self, _operation: &Arc<Operation>, error: &ErrorKind) {
        self.push(DelegateEvent::Fail {
            timeout: error.is_timeout(),
        });
    }
}
