//! One logical request and its lifecycle.
//!
//! An [`Operation`] is created by the dispatcher's dispatch methods, moves
//! through admission (`Pending` → `Waiting` → `Running`) and reaches exactly
//! one terminal phase. The dispatcher holds the only strong registration of a
//! live operation; callers get the same `Arc` as an opaque handle with
//! read-only accessors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::delegate::Delegate;
use crate::timer::TimerTarget;
use crate::types::{EndpointKey, ErrorKind, Request, RequestClass, ResponseHead, Result};

/// The lifecycle phase of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPhase {
    /// Created, not yet past admission
    Pending,
    /// Parked in an endpoint wait queue awaiting a slot
    Waiting,
    /// Admitted and bound to a worker; transport work in progress
    Running,
    /// Terminal: the transport finished the request
    Completed,
    /// Terminal: cancelled by the caller
    Cancelled,
    /// Terminal: the dispatcher-enforced timeout fired
    TimedOut,
    /// Terminal: the transport reported an error, or none could be built
    Failed,
}

impl OperationPhase {
    /// Whether this phase is terminal; an operation reaches exactly one
    /// terminal phase and never leaves it
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationPhase::Completed
                | OperationPhase::Cancelled
                | OperationPhase::TimedOut
                | OperationPhase::Failed
        )
    }
}

/// Why a running operation is being torn down before transport completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AbortReason {
    Cancelled,
    TimedOut,
}

/// The terminal result of an operation's transport work
#[derive(Debug)]
pub(crate) enum Outcome {
    Completed,
    Cancelled,
    TimedOut(ErrorKind),
    Failed(ErrorKind),
}

#[derive(Debug)]
struct Inner {
    phase: OperationPhase,
    abort: Option<AbortReason>,
    response: Option<ResponseHead>,
    gathered: Vec<u8>,
    error: Option<Arc<ErrorKind>>,
}

/// One logical request: its descriptor, admission identity, delegate and
/// mutable lifecycle state
pub struct Operation {
    id: u64,
    timer_target: TimerTarget,
    request: Request,
    endpoint: EndpointKey,
    class: RequestClass,
    gather: bool,
    delegate: Arc<dyn Delegate>,
    handles_auth: bool,
    inner: Mutex<Inner>,
    terminal_notify: Notify,
    abort_notify: Notify,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("class", &self.class)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl Operation {
    pub(crate) fn new(
        request: Request,
        class: RequestClass,
        delegate: Arc<dyn Delegate>,
    ) -> Result<Arc<Operation>> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        let endpoint = request.endpoint()?;
        let gather = request.gather_body;
        // Capability presence is resolved once, here, not per callback
        let handles_auth = delegate.handles_auth_challenge();
        Ok(Arc::new(Operation {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            timer_target: TimerTarget::next(),
            request,
            endpoint,
            class,
            gather,
            delegate,
            handles_auth,
            inner: Mutex::new(Inner {
                phase: OperationPhase::Pending,
                abort: None,
                response: None,
                gathered: Vec::new(),
                error: None,
            }),
            terminal_notify: Notify::new(),
            abort_notify: Notify::new(),
        }))
    }

    /// Process-unique operation id, used in diagnostics
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The request this operation was created from
    #[must_use]
    pub const fn request(&self) -> &Request {
        &self.request
    }

    /// The endpoint the operation competes for admission on
    #[must_use]
    pub const fn endpoint(&self) -> &EndpointKey {
        &self.endpoint
    }

    /// The admission class
    #[must_use]
    pub const fn class(&self) -> RequestClass {
        self.class
    }

    /// Current lifecycle phase
    #[must_use]
    pub fn phase(&self) -> OperationPhase {
        self.lock().phase
    }

    /// Response metadata, available once `on_response` has been delivered
    #[must_use]
    pub fn response(&self) -> Option<ResponseHead> {
        self.lock().response.clone()
    }

    /// The terminal error of a `Failed` or `TimedOut` operation
    #[must_use]
    pub fn error(&self) -> Option<Arc<ErrorKind>> {
        self.lock().error.clone()
    }

    /// The gathered response body. Empty unless the request enabled
    /// `gather_body`; complete only after the terminal transition.
    #[must_use]
    pub fn data(&self) -> Bytes {
        Bytes::copy_from_slice(&self.lock().gathered)
    }

    pub(crate) const fn timer_target(&self) -> TimerTarget {
        self.timer_target
    }

    pub(crate) fn delegate(&self) -> &Arc<dyn Delegate> {
        &self.delegate
    }

    pub(crate) const fn handles_auth(&self) -> bool {
        self.handles_auth
    }

    /// Phase transition into the wait queue; admission only parks
    /// non-terminal, unstarted operations
    pub(crate) fn mark_waiting(&self) {
        let mut inner = self.lock();
        if inner.phase == OperationPhase::Pending {
            inner.phase = OperationPhase::Waiting;
        }
    }

    /// Phase transition out of admission onto a leased worker
    pub(crate) fn mark_running(&self) {
        let mut inner = self.lock();
        if !inner.phase.is_terminal() {
            inner.phase = OperationPhase::Running;
        }
    }

    /// Request teardown of a not-yet-terminal operation. The first caller
    /// wins; late callers observe `false` and take no action.
    pub(crate) fn request_abort(&self, reason: AbortReason) -> bool {
        {
            let mut inner = self.lock();
            if inner.phase.is_terminal() || inner.abort.is_some() {
                return false;
            }
            inner.abort = Some(reason);
        }
        self.abort_notify.notify_waiters();
        true
    }

    pub(crate) fn abort_reason(&self) -> Option<AbortReason> {
        self.lock().abort
    }

    /// Resolves once teardown has been requested; used by the transport
    /// drive to interrupt a stalled stream
    pub(crate) async fn aborted(&self) -> AbortReason {
        loop {
            let notified = self.abort_notify.notified();
            if let Some(reason) = self.lock().abort {
                return reason;
            }
            notified.await;
        }
    }

    /// Whether a transport event may still be delivered to the delegate.
    /// Checked under the operation lock before every callback; events
    /// arriving after an abort claim or terminal transition are dropped.
    pub(crate) fn may_deliver(&self) -> bool {
        let inner = self.lock();
        inner.abort.is_none() && !inner.phase.is_terminal()
    }

    pub(crate) fn store_response(&self, head: ResponseHead) {
        self.lock().response = Some(head);
    }

    pub(crate) fn append_data(&self, chunk: &Bytes) {
        if self.gather {
            self.lock().gathered.extend_from_slice(chunk);
        }
    }

    pub(crate) fn take_gathered(&self) -> Bytes {
        std::mem::take(&mut self.lock().gathered).into()
    }

    /// Take ownership of the terminal error for a synchronous caller.
    /// Returns `None` when another handle still shares the error; it then
    /// stays readable through [`Operation::error`].
    pub(crate) fn take_error(&self) -> Option<ErrorKind> {
        let shared = self.lock().error.take()?;
        match Arc::try_unwrap(shared) {
            Ok(error) => Some(error),
            Err(shared) => {
                self.lock().error = Some(shared);
                None
            }
        }
    }

    /// Perform the terminal transition. Returns the stored error (for the
    /// terminal delegate callback) wrapped in `Some` on success, or `None`
    /// if another path already terminated the operation.
    ///
    /// The operation mutex is released before any delegate code runs.
    pub(crate) fn finalize(&self, outcome: Outcome) -> Option<Option<Arc<ErrorKind>>> {
        let error = {
            let mut inner = self.lock();
            if inner.phase.is_terminal() {
                return None;
            }
            let (phase, error) = match outcome {
                Outcome::Completed => (OperationPhase::Completed, None),
                Outcome::Cancelled => (OperationPhase::Cancelled, None),
                Outcome::TimedOut(e) => (OperationPhase::TimedOut, Some(Arc::new(e))),
                Outcome::Failed(e) => (OperationPhase::Failed, Some(Arc::new(e))),
            };
            inner.phase = phase;
            inner.error = error;
            inner.error.clone()
        };
        self.terminal_notify.notify_waiters();
        Some(error)
    }

    /// Resolves once the operation has reached its terminal phase; the
    /// completion condition of synchronous dispatch
    pub async fn done(&self) -> OperationPhase {
        loop {
            let notified = self.terminal_notify.notified();
            let phase = self.phase();
            if phase.is_terminal() {
                return phase;
            }
            notified.await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("operation lock poisoned")
    }
}
