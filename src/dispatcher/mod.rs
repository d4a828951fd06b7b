//! The URL dispatcher: per-endpoint admission control over outbound HTTP.
//!
//! This module defines [`Dispatcher`] and [`DispatcherBuilder`]. The
//! dispatcher partitions concurrency by `(scheme, host, port)` endpoint,
//! keeps separate quotas for short and long request classes, and enforces
//! caller-visible request timeouts through the shared [`TimerService`]
//! instead of trusting the transport's own timer.
//!
//! A note on deployment: per-endpoint admission is only meaningful if all
//! traffic to an endpoint flows through one dispatcher instance. Multiple
//! instances aimed at the same endpoint each enforce their own limits and
//! defeat the purpose; use [`Dispatcher::shared`] unless the embedding
//! application has a reason not to.
#![allow(clippy::module_name_repetitions)]

mod endpoint;

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use futures::FutureExt;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use typed_builder::TypedBuilder;

use crate::config::{
    ConfigHandle, COLLECTOR_INTERVAL_SECS, DEFAULT_MAX_CONNECTIONS_PER_ENDPOINT,
    DEFAULT_MAX_LONG_RUNNING_PER_ENDPOINT, WAIT_POOL_SIZE,
};
use crate::delegate::{AuthChallenge, ChallengeAction, Delegate};
use crate::logging::{trace_src, LogSource};
use crate::operation::{AbortReason, Operation, OperationPhase, Outcome};
use crate::pool::WorkerPool;
use crate::timer::{InvocationKey, TimerService};
use crate::transport::{ConnectionTransport, SessionTransport, Transport, TransportEvent};
use crate::types::{EndpointKey, ErrorKind, Request, RequestClass, ResponseHead, Result};
use crate::worker::Worker;

use endpoint::{EndpointState, Pop};

/// Default user agent, `urlgate-<PKG_VERSION>`.
pub const DEFAULT_USER_AGENT: &str = concat!("urlgate/", env!("CARGO_PKG_VERSION"));

/// The timer selector under which operation timeouts are scheduled.
const TIMEOUT_SELECTOR: &str = "timeout";

/// How an operation was handed to the dispatcher; decides the admission
/// behavior when no slot is free at call time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchMode {
    /// Queue, then resolve the caller's future at terminal transition
    Sync,
    /// Queue; the caller returns immediately with an operation handle
    Short,
    /// Reject immediately when the long quota is full
    Long,
}

/// Builder for [`Dispatcher`].
///
/// See crate-level documentation for usage example.
#[derive(TypedBuilder, Debug, Clone)]
#[builder(field_defaults(setter(into)))]
pub struct DispatcherBuilder {
    /// Hard cap of concurrent connections per endpoint, all classes combined
    #[builder(default = DEFAULT_MAX_CONNECTIONS_PER_ENDPOINT)]
    max_connections_per_endpoint: usize,

    /// Per-endpoint quota for the `Long` request class.
    ///
    /// The difference to `max_connections_per_endpoint` is the guaranteed
    /// minimum of slots reserved for short requests: long admissions are
    /// always checked against this quota, never against spare hard-cap room.
    #[builder(default = DEFAULT_MAX_LONG_RUNNING_PER_ENDPOINT)]
    max_long_running_per_endpoint: usize,

    /// Prefer the session-based transport; fall back to per-connection when
    /// it is unavailable
    #[builder(default = true)]
    use_shared_transport: bool,

    /// Whether the per-connection transport is available as a fallback. When
    /// disabled and no other transport is selectable, dispatch fails
    /// synchronously with [`ErrorKind::NoTransport`].
    #[builder(default = true)]
    connection_fallback: bool,

    /// User agent sent by the built-in transports
    #[builder(default = DEFAULT_USER_AGENT.to_string())]
    user_agent: String,

    /// Replace the built-in transports entirely; used by embedders with
    /// their own transport stack and by tests
    #[builder(default)]
    transport: Option<Arc<dyn Transport>>,

    /// Timer service for timeout enforcement; the process-wide shared
    /// instance unless overridden
    #[builder(default)]
    timer: Option<TimerService>,

    /// Size bound of the background pool servicing admission waits
    #[builder(default = WAIT_POOL_SIZE)]
    wait_pool_size: usize,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        DispatcherBuilder::builder().build()
    }
}

impl DispatcherBuilder {
    /// Build the dispatcher. Must be called within a tokio runtime; the
    /// dispatcher spawns its reclamation collector on the current runtime.
    #[must_use]
    pub fn dispatcher(self) -> Dispatcher {
        let config = Arc::new(ConfigHandle::new(
            self.max_connections_per_endpoint,
            self.max_long_running_per_endpoint,
            self.use_shared_transport,
        ));
        let session: Option<Arc<dyn Transport>> = if self.transport.is_some() {
            None
        } else {
            match SessionTransport::new(&self.user_agent) {
                Ok(transport) => Some(Arc::new(transport)),
                Err(e) => {
                    log::warn!(
                        target: "urlgate::dispatcher",
                        "session transport unavailable ({e}); falling back to per-connection"
                    );
                    None
                }
            }
        };
        let connection: Option<Arc<dyn Transport>> = self
            .connection_fallback
            .then(|| Arc::new(ConnectionTransport::new(&self.user_agent)) as Arc<dyn Transport>);
        let timer = self
            .timer
            .unwrap_or_else(|| TimerService::shared().clone());

        let shared = Arc::new(DispatcherShared {
            config,
            endpoints: DashMap::new(),
            wait_pool: WorkerPool::new("urlgate-admission", self.wait_pool_size),
            session,
            connection,
            override_transport: self.transport,
            timer,
            collector: Mutex::new(None),
        });
        let collector = spawn_collector(&shared);
        *shared
            .collector
            .lock()
            .expect("collector lock poisoned") = Some(collector);
        Dispatcher { shared }
    }
}

/// Admission controller for outbound HTTP requests; see the module
/// documentation
#[derive(Debug, Clone)]
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
}

#[derive(Debug)]
struct DispatcherShared {
    config: Arc<ConfigHandle>,
    endpoints: DashMap<EndpointKey, Arc<EndpointState>>,
    wait_pool: WorkerPool,
    session: Option<Arc<dyn Transport>>,
    connection: Option<Arc<dyn Transport>>,
    override_transport: Option<Arc<dyn Transport>>,
    timer: TimerService,
    collector: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// The process-wide dispatcher with default configuration, created on
    /// first use
    pub fn shared() -> &'static Dispatcher {
        static SHARED: OnceLock<Dispatcher> = OnceLock::new();
        SHARED.get_or_init(|| DispatcherBuilder::default().dispatcher())
    }

    /// Dispatch a short request and wait for its terminal transition.
    ///
    /// The response body is gathered in memory and returned together with
    /// the response metadata. The future resolves only once the operation is
    /// terminal; excess concurrency towards the endpoint is absorbed by
    /// waiting for a slot, never by failing.
    ///
    /// # Errors
    ///
    /// - the terminal error of a failed or timed-out operation
    /// - [`ErrorKind::RequestCancelled`] if the operation was cancelled
    /// - an invalid-argument error if the URL has no admission identity
    pub async fn dispatch_sync(&self, mut request: Request) -> Result<(Bytes, ResponseHead)> {
        struct SyncDelegate;
        impl Delegate for SyncDelegate {}

        request.gather_body = true;
        let url = request.url.clone();
        let timeout = request.timeout;
        let operation = self
            .start(request, RequestClass::Short, Arc::new(SyncDelegate), DispatchMode::Sync)
            .await?;
        operation.done().await;
        match operation.phase() {
            OperationPhase::Completed => {
                let Some(head) = operation.response() else {
                    return Err(ErrorKind::NoTransport(url));
                };
                Ok((operation.take_gathered(), head))
            }
            OperationPhase::Cancelled => Err(ErrorKind::RequestCancelled(url)),
            OperationPhase::TimedOut => Err(operation
                .take_error()
                .unwrap_or_else(|| ErrorKind::timeout(url, timeout))),
            _ => Err(operation
                .take_error()
                .unwrap_or(ErrorKind::NoTransport(url))),
        }
    }

    /// Dispatch an asynchronous short request.
    ///
    /// Returns an operation handle immediately. When the endpoint is at
    /// capacity the operation waits in the endpoint's short queue; admission
    /// never fails for capacity reasons.
    ///
    /// # Errors
    ///
    /// Synchronous invalid-argument and no-transport failures only; see
    /// [`ErrorKind::NoTransport`] for the latter's delegate contract.
    pub async fn dispatch_short(
        &self,
        request: Request,
        delegate: Arc<dyn Delegate>,
    ) -> Result<Arc<Operation>> {
        self.start(request, RequestClass::Short, delegate, DispatchMode::Short)
            .await
    }

    /// Dispatch an asynchronous long (streaming) request.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::ResourceExhausted`] when the endpoint's long quota is
    /// already in use at call time; the delegate is not consulted in that
    /// case. Otherwise as [`Dispatcher::dispatch_short`].
    pub async fn dispatch_long(
        &self,
        request: Request,
        delegate: Arc<dyn Delegate>,
    ) -> Result<Arc<Operation>> {
        self.start(request, RequestClass::Long, delegate, DispatchMode::Long)
            .await
    }

    /// Advisory check whether [`Dispatcher::dispatch_long`] would currently
    /// pass admission. Not a reservation; the answer can be stale by the
    /// time a dispatch call is made.
    #[must_use]
    pub fn is_long_request_allowed(&self, request: &Request) -> bool {
        let Ok(key) = request.endpoint() else {
            return false;
        };
        match self.shared.endpoints.get(&key) {
            Some(state) => state.can_admit_now(RequestClass::Long),
            None => {
                self.shared.config.max_long_running_per_endpoint() > 0
                    && self.shared.config.max_connections_per_endpoint() > 0
            }
        }
    }

    /// Cancel an operation.
    ///
    /// Cancellation is asynchronous for running operations: the intent is
    /// posted and the operation's worker performs the teardown. The delegate
    /// observes a clean `on_finish`. Cancelling an already-terminal
    /// operation is a no-op, and repeated cancels have the effect of one.
    pub async fn cancel(&self, operation: &Arc<Operation>) {
        if operation.phase().is_terminal() {
            return;
        }
        let state = self
            .shared
            .endpoints
            .get(operation.endpoint())
            .map(|entry| entry.value().clone());
        if let Some(state) = state {
            if state.remove_waiting(operation) {
                // Still queued: no slot, no worker, terminal right here
                if operation.finalize(Outcome::Cancelled).is_some() {
                    deliver(operation, operation.delegate().on_finish(operation)).await;
                }
                return;
            }
        }
        if operation.request_abort(AbortReason::Cancelled) {
            trace_src!(
                LogSource::Dispatcher,
                "cancel posted for operation {}",
                operation.id()
            );
        }
    }

    /// Change the per-endpoint hard cap; applies to subsequent admissions
    pub fn set_max_connections_per_endpoint(&self, value: usize) {
        self.shared.config.set_max_connections_per_endpoint(value);
    }

    /// Change the per-endpoint long-running quota; applies to subsequent
    /// admissions
    pub fn set_max_long_running_per_endpoint(&self, value: usize) {
        self.shared.config.set_max_long_running_per_endpoint(value);
    }

    /// Toggle the preference for the session-based transport
    pub fn set_use_shared_transport(&self, value: bool) {
        self.shared.config.set_use_shared_transport(value);
    }

    /// Tear the dispatcher down: cancel waiting operations, drain the
    /// admission pool, stop idle workers. Running operations finish on
    /// their leased workers.
    pub async fn dispose(&self) {
        if let Some(collector) = self
            .shared
            .collector
            .lock()
            .expect("collector lock poisoned")
            .take()
        {
            collector.abort();
        }

        let states: Vec<Arc<EndpointState>> = self
            .shared
            .endpoints
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for state in states {
            for operation in state.drain_waiting() {
                if operation.finalize(Outcome::Cancelled).is_some() {
                    deliver(&operation, operation.delegate().on_finish(&operation)).await;
                }
            }
            state.stop_free_workers();
        }

        self.shared.wait_pool.dispose().await;
        self.shared.endpoints.clear();
        trace_src!(LogSource::Dispatcher, "dispatcher disposed");
    }

    async fn start(
        &self,
        request: Request,
        class: RequestClass,
        delegate: Arc<dyn Delegate>,
        mode: DispatchMode,
    ) -> Result<Arc<Operation>> {
        let operation = Operation::new(request, class, delegate)?;

        if self.shared.transport_for().is_none() {
            // No transport handle can be constructed: fail the operation and
            // deliver the terminal callback before this call returns
            let url = operation.request().url.clone();
            if let Some(error) =
                operation.finalize(Outcome::Failed(ErrorKind::NoTransport(url.clone())))
            {
                if let Some(error) = error {
                    deliver(&operation, operation.delegate().on_fail(&operation, &error)).await;
                }
            }
            return Err(ErrorKind::NoTransport(url));
        }

        let state = self.shared.endpoint_state(operation.endpoint());
        if let Some(worker) = state.try_admit(class) {
            self.shared.launch(operation.clone(), state, worker);
            return Ok(operation);
        }
        if mode == DispatchMode::Long {
            // Admission failures for long requests never reach the delegate
            return Err(ErrorKind::ResourceExhausted(operation.endpoint().clone()));
        }
        trace_src!(
            LogSource::Dispatcher,
            "operation {} waiting on {} ({class})",
            operation.id(),
            operation.endpoint()
        );
        if state.enqueue(operation.clone()) {
            self.shared.spawn_admission_task(state, class);
        }
        Ok(operation)
    }
}

impl DispatcherShared {
    /// The transport serving new operations under the current configuration
    fn transport_for(&self) -> Option<Arc<dyn Transport>> {
        if let Some(transport) = &self.override_transport {
            return Some(transport.clone());
        }
        if self.config.use_shared_transport() {
            if let Some(session) = &self.session {
                return Some(session.clone());
            }
        }
        self.connection.clone()
    }

    fn endpoint_state(&self, key: &EndpointKey) -> Arc<EndpointState> {
        if let Some(state) = self.endpoints.get(key) {
            return state.value().clone();
        }
        match self.endpoints.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(entry) => entry
                .insert(Arc::new(EndpointState::new(key.clone(), self.config.clone())))
                .clone(),
        }
    }

    /// Bind an admitted operation to its leased worker: arm the timeout
    /// timer and post the transport drive onto the worker's event loop
    fn launch(
        self: &Arc<Self>,
        operation: Arc<Operation>,
        state: Arc<EndpointState>,
        worker: Arc<Worker>,
    ) {
        operation.mark_running();
        trace_src!(
            LogSource::Dispatcher,
            "operation {} running on worker {} ({})",
            operation.id(),
            worker.id(),
            operation.endpoint()
        );

        let timeout_key = InvocationKey {
            target: operation.timer_target(),
            selector: TIMEOUT_SELECTOR,
            arg: Some(operation.id()),
        };
        let timed_out = Arc::downgrade(&operation);
        self.timer
            .schedule_after(timeout_key, operation.request().timeout, move || {
                if let Some(operation) = timed_out.upgrade() {
                    if operation.request_abort(AbortReason::TimedOut) {
                        trace_src!(
                            LogSource::Dispatcher,
                            "operation {} timed out",
                            operation.id()
                        );
                    }
                }
            });

        let shared = Arc::downgrade(self);
        let posted = worker.post(drive(
            operation.clone(),
            shared,
            state.clone(),
            worker.clone(),
        ));
        if !posted {
            // The leased worker refused the job; fail the operation and give
            // the slot back
            self.timer
                .cancel_matching(operation.timer_target(), None, None);
            worker.stop();
            state.discard_worker();
            if let Some(Some(error)) = operation.finalize(Outcome::Failed(ErrorKind::NoTransport(
                operation.request().url.clone(),
            ))) {
                let failed = operation.clone();
                tokio::spawn(async move {
                    deliver(&failed, failed.delegate().on_fail(&failed, &error)).await;
                });
            }
            state.release(operation.class(), None);
        }
    }

    /// One admission task per endpoint and class services that class's wait
    /// queue in FIFO order, blocking on the endpoint's condition variable
    /// while no slot is free
    fn spawn_admission_task(self: &Arc<Self>, state: Arc<EndpointState>, class: RequestClass) {
        let shared = Arc::downgrade(self);
        let task_state = state.clone();
        let submitted = self.wait_pool.submit(async move {
            let state = task_state;
            loop {
                let released = state.slot_released(class);
                match state.pop_admissible(class) {
                    Pop::Admitted(operation, worker) => {
                        let Some(dispatcher) = shared.upgrade() else {
                            // Dispatcher dropped mid-wait: don't strand the
                            // admitted operation without a terminal
                            worker.stop();
                            if operation.finalize(Outcome::Cancelled).is_some() {
                                deliver(&operation, operation.delegate().on_finish(&operation))
                                    .await;
                            }
                            return;
                        };
                        dispatcher.launch(operation, state.clone(), worker);
                    }
                    Pop::Empty => return,
                    Pop::Blocked => released.await,
                }
            }
        });
        if submitted.is_err() {
            trace_src!(
                LogSource::Dispatcher,
                "admission task for {} rejected; dispatcher disposed",
                state.key()
            );
        }
    }
}

fn spawn_collector(shared: &Arc<DispatcherShared>) -> JoinHandle<()> {
    let shared = Arc::downgrade(shared);
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(COLLECTOR_INTERVAL_SECS));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let now = Instant::now();
            shared.endpoints.retain(|_, state| !state.collect(now));
        }
    })
}

/// The whole transport lifetime of one admitted operation, run on its leased
/// worker: create the transport handle, pump events into the delegate,
/// perform the terminal transition, release the slot
async fn drive(
    operation: Arc<Operation>,
    shared: Weak<DispatcherShared>,
    state: Arc<EndpointState>,
    worker: Arc<Worker>,
) {
    let outcome = run_transport(&operation, &shared).await;

    if let Some(dispatcher) = shared.upgrade() {
        dispatcher
            .timer
            .cancel_matching(operation.timer_target(), None, None);
    }

    if let Some(error) = operation.finalize(outcome) {
        match error {
            None => deliver(&operation, operation.delegate().on_finish(&operation)).await,
            Some(error) => {
                deliver(&operation, operation.delegate().on_fail(&operation, &error)).await;
            }
        }
    }

    // The slot is freed only after the terminal callback has returned
    state.release(operation.class(), Some(worker));
}

async fn run_transport(operation: &Arc<Operation>, shared: &Weak<DispatcherShared>) -> Outcome {
    // A cancel that raced admission wins before any transport work starts
    if let Some(reason) = operation.abort_reason() {
        return abort_outcome(operation, reason);
    }

    let transport = {
        let Some(dispatcher) = shared.upgrade() else {
            return Outcome::Cancelled;
        };
        match dispatcher.transport_for() {
            Some(transport) => transport,
            None => {
                return Outcome::Failed(ErrorKind::NoTransport(operation.request().url.clone()))
            }
        }
    };

    let mut stream = match transport.start(operation.request(), None).await {
        Ok(stream) => stream,
        Err(error) => return Outcome::Failed(error),
    };
    let mut retried_auth = false;

    loop {
        tokio::select! {
            biased;
            reason = operation.aborted() => {
                // Dropping the stream cancels any in-flight transport work
                drop(stream);
                return abort_outcome(operation, reason);
            }
            event = stream.next_event() => match event {
                TransportEvent::Head(head) => {
                    if head.is_auth_challenge() && operation.handles_auth() && !retried_auth {
                        let challenge = AuthChallenge::from_head(&head);
                        let action = AssertUnwindSafe(
                            operation.delegate().on_auth_challenge(operation, &challenge),
                        )
                        .catch_unwind()
                        .await
                        .unwrap_or(ChallengeAction::Default);
                        if let ChallengeAction::UseCredentials(credentials) = action {
                            retried_auth = true;
                            stream = match transport
                                .start(operation.request(), Some(&credentials))
                                .await
                            {
                                Ok(stream) => stream,
                                Err(error) => return Outcome::Failed(error),
                            };
                            continue;
                        }
                    }
                    if !operation.may_deliver() {
                        continue;
                    }
                    operation.store_response(head.clone());
                    if operation.class() == RequestClass::Long {
                        // A long operation that produced a response is
                        // healthy; only its admission is long-lived
                        if let Some(dispatcher) = shared.upgrade() {
                            dispatcher.timer.cancel_matching(
                                operation.timer_target(),
                                Some(TIMEOUT_SELECTOR),
                                None,
                            );
                        }
                    }
                    deliver(operation, operation.delegate().on_response(operation, &head)).await;
                }
                TransportEvent::Chunk(chunk) => {
                    if !operation.may_deliver() {
                        continue;
                    }
                    operation.append_data(&chunk);
                    deliver(operation, operation.delegate().on_data(operation, &chunk)).await;
                }
                TransportEvent::Finished => return Outcome::Completed,
                TransportEvent::Failed(error) => return Outcome::Failed(error),
            }
        }
    }
}

/// Delegate code must not unwind into the dispatcher: a panicking callback
/// is caught at this boundary, logged and suppressed, so the operation still
/// reaches its terminal transition and the slot is still released
async fn deliver<F>(operation: &Arc<Operation>, callback: F)
where
    F: std::future::Future<Output = ()>,
{
    if AssertUnwindSafe(callback).catch_unwind().await.is_err() {
        log::error!(
            target: "urlgate::dispatcher",
            "delegate callback for operation {} panicked",
            operation.id()
        );
    }
}

fn abort_outcome(operation: &Arc<Operation>, reason: AbortReason) -> Outcome {
    match reason {
        AbortReason::Cancelled => Outcome::Cancelled,
        AbortReason::TimedOut => Outcome::TimedOut(ErrorKind::timeout(
            operation.request().url.clone(),
            operation.request().timeout,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{DelegateEvent, FakeTransport, RecordingDelegate};
    use bytes::Bytes;
    use tokio::time;

    fn request(url: &str) -> Request {
        Request::try_from(url).unwrap()
    }

    /// A dispatcher wired to a fake transport and its own timer; the shared
    /// timer must not be used in tests, its worker would outlive the first
    /// test's runtime
    fn dispatcher_with(fake: Arc<FakeTransport>, max_connections: usize) -> Dispatcher {
        DispatcherBuilder::builder()
            .transport(Some(fake as Arc<dyn Transport>))
            .timer(Some(TimerService::new()))
            .max_connections_per_endpoint(max_connections)
            .build()
            .dispatcher()
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_cap_is_enforced_under_load() {
        let fake = Arc::new(FakeTransport::new().with_delay(Duration::from_millis(500)));
        let dispatcher = dispatcher_with(fake.clone(), 4);
        let started_at = time::Instant::now();

        let mut operations = Vec::new();
        let mut delegates = Vec::new();
        for i in 0..10 {
            let delegate = RecordingDelegate::new();
            let operation = dispatcher
                .dispatch_short(
                    request(&format!("https://example.com/file/{i}")),
                    delegate.clone(),
                )
                .await
                .unwrap();
            operations.push(operation);
            delegates.push(delegate);
        }

        for operation in &operations {
            assert_eq!(operation.done().await, OperationPhase::Completed);
        }

        // Never more than 4 concurrent transport streams, and the queue
        // drains in ceil(10 / 4) = 3 waves of 500ms each
        assert_eq!(fake.max_concurrent(), 4);
        let elapsed = started_at.elapsed();
        assert!(
            elapsed >= Duration::from_millis(1400) && elapsed <= Duration::from_millis(2000),
            "expected ~1500ms of wall time, got {elapsed:?}"
        );

        // Callback ordering per operation: response, data, then one finish
        for delegate in &delegates {
            let events = delegate.events();
            assert_eq!(events[0], DelegateEvent::Response(200));
            assert_eq!(*events.last().unwrap(), DelegateEvent::Finish);
            assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_quota_rejects_at_call_time() {
        let fake = Arc::new(FakeTransport::new().stalling("/long"));
        let dispatcher = dispatcher_with(fake.clone(), 4);
        let probe = request("https://example.com/long/probe");
        assert!(dispatcher.is_long_request_allowed(&probe));

        let streaming = dispatcher
            .dispatch_long(request("https://example.com/long/1"), RecordingDelegate::new())
            .await
            .unwrap();
        let _second = dispatcher
            .dispatch_long(request("https://example.com/long/2"), RecordingDelegate::new())
            .await
            .unwrap();
        time::sleep(Duration::from_millis(10)).await;

        // The long quota (2) is exhausted: rejection is synchronous and the
        // delegate is never consulted
        let rejected_delegate = RecordingDelegate::new();
        let rejected = dispatcher
            .dispatch_long(
                request("https://example.com/long/3"),
                rejected_delegate.clone(),
            )
            .await;
        assert!(matches!(
            rejected.unwrap_err(),
            ErrorKind::ResourceExhausted(_)
        ));
        assert!(rejected_delegate.events().is_empty());
        assert!(!dispatcher.is_long_request_allowed(&probe));

        // Slots 3 and 4 remain reserved for short requests
        let short_delegate = RecordingDelegate::new();
        let short = dispatcher
            .dispatch_short(request("https://example.com/short"), short_delegate.clone())
            .await
            .unwrap();
        assert_eq!(short.done().await, OperationPhase::Completed);
        assert_eq!(short_delegate.events()[0], DelegateEvent::Response(200));
        assert_eq!(streaming.phase(), OperationPhase::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_preempts_stalled_transport() {
        let fake = Arc::new(FakeTransport::new().stalling("/stall"));
        let dispatcher = dispatcher_with(fake.clone(), 1);
        let started_at = time::Instant::now();

        let stalled_delegate = RecordingDelegate::new();
        let stalled = dispatcher
            .dispatch_short(
                request("https://example.com/stall").with_timeout(Duration::from_millis(200)),
                stalled_delegate.clone(),
            )
            .await
            .unwrap();
        let queued_delegate = RecordingDelegate::new();
        let queued = dispatcher
            .dispatch_short(request("https://example.com/next"), queued_delegate.clone())
            .await
            .unwrap();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queued.phase(), OperationPhase::Waiting);

        assert_eq!(stalled.done().await, OperationPhase::TimedOut);
        assert_eq!(
            stalled_delegate.events(),
            vec![DelegateEvent::Fail { timeout: true }]
        );
        assert!(stalled.error().unwrap().is_timeout());

        // The released slot admits the queued operation promptly
        assert_eq!(queued.done().await, OperationPhase::Completed);
        let elapsed = started_at.elapsed();
        assert!(
            elapsed < Duration::from_millis(300),
            "queued operation should run right after the timeout, got {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_is_fifo_within_class() {
        let fake = Arc::new(FakeTransport::new().with_delay(Duration::from_millis(100)));
        let dispatcher = dispatcher_with(fake.clone(), 4);

        let mut operations = Vec::new();
        for i in 0..8 {
            let operation = dispatcher
                .dispatch_short(
                    request(&format!("https://example.com/{i}")),
                    RecordingDelegate::new(),
                )
                .await
                .unwrap();
            operations.push(operation);
        }
        for operation in &operations {
            assert_eq!(operation.done().await, OperationPhase::Completed);
        }

        let order = fake.start_order();
        // The first four were admitted immediately, in any interleaving
        let mut head: Vec<_> = order[..4].to_vec();
        head.sort();
        assert_eq!(head, vec!["/0", "/1", "/2", "/3"]);
        // The queued tail is admitted strictly in submission order
        assert_eq!(&order[4..], ["/4", "/5", "/6", "/7"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_completion_is_noop() {
        let fake = Arc::new(FakeTransport::new().with_delay(Duration::from_millis(10)));
        let dispatcher = dispatcher_with(fake, 4);
        let delegate = RecordingDelegate::new();
        let operation = dispatcher
            .dispatch_short(request("https://example.com/fast"), delegate.clone())
            .await
            .unwrap();
        assert_eq!(operation.done().await, OperationPhase::Completed);

        time::sleep(Duration::from_millis(100)).await;
        // Cancelling k times has the effect of cancelling once, and
        // cancelling a terminal operation has no effect at all
        for _ in 0..3 {
            dispatcher.cancel(&operation).await;
        }
        time::sleep(Duration::from_millis(100)).await;

        assert_eq!(operation.phase(), OperationPhase::Completed);
        let events = delegate.events();
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(*events.last().unwrap(), DelegateEvent::Finish);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_workers_are_reclaimed() {
        let fake = Arc::new(FakeTransport::new());
        let dispatcher = dispatcher_with(fake, 4);
        let operation = dispatcher
            .dispatch_short(request("https://example.com/one"), RecordingDelegate::new())
            .await
            .unwrap();
        assert_eq!(operation.done().await, OperationPhase::Completed);

        let key = operation.endpoint().clone();
        assert_eq!(
            dispatcher
                .shared
                .endpoints
                .get(&key)
                .map(|state| state.worker_count()),
            Some(1)
        );

        // Past the worker TTL the collector stops the worker and drops the
        // idle endpoint entry
        time::sleep(Duration::from_secs(21)).await;
        assert!(
            dispatcher
                .shared
                .endpoints
                .get(&key)
                .is_none_or(|state| state.worker_count() == 0)
        );

        // A fresh dispatch spawns a new worker and completes normally
        let operation = dispatcher
            .dispatch_short(request("https://example.com/two"), RecordingDelegate::new())
            .await
            .unwrap();
        assert_eq!(operation.done().await, OperationPhase::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_dispatch_gathers_the_body() {
        let fake = Arc::new(
            FakeTransport::new()
                .with_body(b"hello world")
                .with_delay(Duration::from_millis(10)),
        );
        let dispatcher = dispatcher_with(fake, 4);
        let (data, head) = dispatcher
            .dispatch_sync(request("https://example.com/file"))
            .await
            .unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(data, Bytes::from_static(b"hello world"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_dispatch_surfaces_the_timeout() {
        let fake = Arc::new(FakeTransport::new().stalling("/stall"));
        let dispatcher = dispatcher_with(fake, 4);
        let error = dispatcher
            .dispatch_sync(
                request("https://example.com/stall").with_timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert!(error.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_of_waiting_operation_never_starts_it() {
        let fake = Arc::new(FakeTransport::new().stalling("/stall"));
        let dispatcher = dispatcher_with(fake.clone(), 1);

        let running = dispatcher
            .dispatch_short(
                request("https://example.com/stall").with_timeout(Duration::from_secs(60)),
                RecordingDelegate::new(),
            )
            .await
            .unwrap();
        let waiting_delegate = RecordingDelegate::new();
        let waiting = dispatcher
            .dispatch_short(
                request("https://example.com/queued"),
                waiting_delegate.clone(),
            )
            .await
            .unwrap();
        time::sleep(Duration::from_millis(10)).await;

        dispatcher.cancel(&waiting).await;
        assert_eq!(waiting.phase(), OperationPhase::Cancelled);
        assert_eq!(waiting_delegate.events(), vec![DelegateEvent::Finish]);
        assert_eq!(fake.started(), 1);

        // Cancelling the running operation tears down its stalled stream
        dispatcher.cancel(&running).await;
        assert_eq!(running.done().await, OperationPhase::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_handle_construction_fails_the_operation() {
        let fake = Arc::new(FakeTransport::new().failing_start());
        let dispatcher = dispatcher_with(fake, 4);
        let delegate = RecordingDelegate::new();
        let operation = dispatcher
            .dispatch_short(request("https://example.com/x"), delegate.clone())
            .await
            .unwrap();
        assert_eq!(operation.done().await, OperationPhase::Failed);
        assert_eq!(delegate.events(), vec![DelegateEvent::Fail { timeout: false }]);
        assert!(matches!(
            operation.error().as_deref(),
            Some(ErrorKind::NoTransport(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_delegate_does_not_leak_the_slot() {
        struct PanickyDelegate;
        #[async_trait::async_trait]
        impl Delegate for PanickyDelegate {
            async fn on_response(&self, _operation: &Arc<Operation>, _response: &ResponseHead) {
                panic!("delegate panic");
            }
        }

        let fake = Arc::new(FakeTransport::new());
        let dispatcher = dispatcher_with(fake, 1);
        let panicky = dispatcher
            .dispatch_short(request("https://example.com/boom"), Arc::new(PanickyDelegate))
            .await
            .unwrap();
        assert_eq!(panicky.done().await, OperationPhase::Completed);

        // The single slot must have been released despite the panic
        let delegate = RecordingDelegate::new();
        let follow_up = dispatcher
            .dispatch_short(request("https://example.com/after"), delegate.clone())
            .await
            .unwrap();
        assert_eq!(follow_up.done().await, OperationPhase::Completed);
        assert_eq!(*delegate.events().last().unwrap(), DelegateEvent::Finish);
    }

    #[tokio::test]
    async fn test_missing_transport_fails_before_dispatch_returns() {
        let dispatcher = DispatcherBuilder::builder()
            .use_shared_transport(false)
            .connection_fallback(false)
            .timer(Some(TimerService::new()))
            .build()
            .dispatcher();
        let delegate = RecordingDelegate::new();
        let result = dispatcher
            .dispatch_short(request("https://example.com/x"), delegate.clone())
            .await;
        assert!(matches!(result.unwrap_err(), ErrorKind::NoTransport(_)));
        // The failing terminal callback has already fired by the time the
        // dispatch call returns
        assert_eq!(delegate.events(), vec![DelegateEvent::Fail { timeout: false }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_settable_limits_apply_to_new_admissions() {
        let fake = Arc::new(FakeTransport::new().stalling("/stall"));
        let dispatcher = dispatcher_with(fake, 4);
        dispatcher.set_max_long_running_per_endpoint(0);
        let rejected = dispatcher
            .dispatch_long(request("https://example.com/long"), RecordingDelegate::new())
            .await;
        assert!(matches!(
            rejected.unwrap_err(),
            ErrorKind::ResourceExhausted(_)
        ));

        dispatcher.set_max_long_running_per_endpoint(1);
        let admitted = dispatcher
            .dispatch_long(
                request("https://example.com/long/stall"),
                RecordingDelegate::new(),
            )
            .await;
        assert!(admitted.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_waiting_operations() {
        let fake = Arc::new(FakeTransport::new().stalling("/stall"));
        let dispatcher = dispatcher_with(fake, 1);
        let _running = dispatcher
            .dispatch_short(
                request("https://example.com/stall").with_timeout(Duration::from_secs(60)),
                RecordingDelegate::new(),
            )
            .await
            .unwrap();
        let waiting_delegate = RecordingDelegate::new();
        let waiting = dispatcher
            .dispatch_short(
                request("https://example.com/queued"),
                waiting_delegate.clone(),
            )
            .await
            .unwrap();
        time::sleep(Duration::from_millis(10)).await;

        dispatcher.dispose().await;
        assert_eq!(waiting.phase(), OperationPhase::Cancelled);
        assert_eq!(waiting_delegate.events(), vec![DelegateEvent::Finish]);
    }

    mod session {
        use super::*;
        use std::sync::atomic::{AtomicBool, Ordering};
        use async_trait::async_trait;
        use wiremock::matchers::{basic_auth, method};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        #[derive(Debug, Default)]
        struct CredentialDelegate {
            challenged: AtomicBool,
            statuses: Mutex<Vec<u16>>,
        }

        #[async_trait]
        impl Delegate for CredentialDelegate {
            async fn on_response(&self, _operation: &Arc<Operation>, response: &ResponseHead) {
                self.statuses.lock().unwrap().push(response.status.as_u16());
            }

            fn handles_auth_challenge(&self) -> bool {
                true
            }

            async fn on_auth_challenge(
                &self,
                _operation: &Arc<Operation>,
                _challenge: &AuthChallenge,
            ) -> ChallengeAction {
                self.challenged.store(true, Ordering::SeqCst);
                ChallengeAction::UseCredentials(crate::delegate::BasicCredentials {
                    username: "user".to_string(),
                    password: "secret".to_string(),
                })
            }
        }

        #[tokio::test]
        async fn test_end_to_end_against_a_mock_server() {
            let server =
                crate::mock_server!(http::StatusCode::OK, set_body_bytes(b"response payload".to_vec()));
            let dispatcher = DispatcherBuilder::builder()
                .timer(Some(TimerService::new()))
                .build()
                .dispatcher();
            let (data, head) = dispatcher
                .dispatch_sync(request(&server.uri()))
                .await
                .unwrap();
            assert_eq!(head.status, 200);
            assert_eq!(data, Bytes::from_static(b"response payload"));
        }

        #[tokio::test]
        async fn test_auth_challenge_is_retried_with_credentials() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(basic_auth("user", "secret"))
                .respond_with(ResponseTemplate::new(200))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .respond_with(
                    ResponseTemplate::new(401)
                        .insert_header("www-authenticate", "Basic realm=\"test\""),
                )
                .mount(&server)
                .await;

            let dispatcher = DispatcherBuilder::builder()
                .timer(Some(TimerService::new()))
                .build()
                .dispatcher();
            let delegate = Arc::new(CredentialDelegate::default());
            let operation = dispatcher
                .dispatch_short(request(&server.uri()), delegate.clone())
                .await
                .unwrap();
            assert_eq!(operation.done().await, OperationPhase::Completed);

            assert!(delegate.challenged.load(Ordering::SeqCst));
            // The challenging 401 is consumed by the retry; the delegate
            // only observes the authenticated response
            assert_eq!(*delegate.statuses.lock().unwrap(), vec![200]);
        }
    }
}
