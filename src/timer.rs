//! A shared single-worker timer service.
//!
//! [`TimerService`] executes one-shot delayed invocations on a dedicated
//! worker task, decoupled from the scheduling caller. Scheduled invocations
//! are keyed for later cancellation by `(target, selector, arg)` prefix.
//! The dispatcher uses it to enforce request timeouts off the request path.
//!
//! All scheduled invocations run serialized on the timer worker and are
//! expected to be short; a long-running invocation delays every other timer.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::config::TIMER_ANCHOR_SECS;
use crate::logging::{trace_src, LogSource};

/// An opaque cancellation scope for scheduled invocations.
///
/// Every owner of timed work allocates one target and keys its invocations
/// with it; cancelling the target cancels all of the owner's pending
/// invocations at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerTarget(u64);

impl TimerTarget {
    /// Allocate a fresh, process-unique target
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TimerTarget(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identifies one scheduled invocation for matching-based cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvocationKey {
    /// The owning cancellation scope
    pub target: TimerTarget,
    /// The name of the scheduled action
    pub selector: &'static str,
    /// Optional discriminator between invocations of the same selector
    pub arg: Option<u64>,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Schedule {
        key: InvocationKey,
        due: Instant,
        job: Job,
    },
    Cancel {
        target: TimerTarget,
        selector: Option<&'static str>,
        arg: Option<u64>,
    },
    Shutdown,
}

/// Handle to the timer worker. Cheap to clone; all clones address the same
/// worker.
#[derive(Debug, Clone)]
pub struct TimerService {
    tx: mpsc::UnboundedSender<Command>,
    running: Arc<AtomicBool>,
}

impl TimerService {
    /// Spawn a new timer worker.
    ///
    /// Must be called from within a tokio runtime. Most callers want
    /// [`TimerService::shared`] instead.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        tokio::spawn(run(rx, running.clone()));
        TimerService { tx, running }
    }

    /// The process-wide timer instance, created on first use
    pub fn shared() -> &'static TimerService {
        static SHARED: OnceLock<TimerService> = OnceLock::new();
        SHARED.get_or_init(TimerService::new)
    }

    /// Schedule `job` to run on the timer worker after `delay`.
    ///
    /// Invocations with equal deadlines run in scheduling order. A job that
    /// is already executing can no longer be cancelled.
    pub fn schedule_after<F>(&self, key: InvocationKey, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let due = Instant::now() + delay;
        if self
            .tx
            .send(Command::Schedule {
                key,
                due,
                job: Box::new(job),
            })
            .is_err()
        {
            trace_src!(
                LogSource::Timer,
                "dropping invocation {:?} scheduled after shutdown",
                key
            );
        }
    }

    /// Schedule an anonymous block; it cannot be cancelled selectively
    pub fn schedule_block_after<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let key = InvocationKey {
            target: TimerTarget::next(),
            selector: "block",
            arg: None,
        };
        self.schedule_after(key, delay, job);
    }

    /// Cancel all pending invocations matching the given prefix: the target
    /// alone, the target plus selector, or the target plus selector plus
    /// argument. Invocations already executing or executed are unaffected.
    pub fn cancel_matching(
        &self,
        target: TimerTarget,
        selector: Option<&'static str>,
        arg: Option<u64>,
    ) {
        let _ = self.tx.send(Command::Cancel {
            target,
            selector,
            arg,
        });
    }

    /// Stop the timer worker after its current iteration. Pending
    /// invocations are dropped without running.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        let _ = self.tx.send(Command::Shutdown);
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

fn matches(key: &InvocationKey, target: TimerTarget, selector: Option<&'static str>, arg: Option<u64>) -> bool {
    if key.target != target {
        return false;
    }
    match selector {
        None => true,
        Some(selector) if key.selector != selector => false,
        Some(_) => match arg {
            None => true,
            Some(arg) => key.arg == Some(arg),
        },
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>, running: Arc<AtomicBool>) {
    // Ordered by deadline, ties broken by insertion sequence
    let mut queue: BTreeMap<(Instant, u64), (InvocationKey, Job)> = BTreeMap::new();
    let mut seq: u64 = 0;

    while running.load(Ordering::Relaxed) {
        let anchor = Instant::now() + Duration::from_secs(TIMER_ANCHOR_SECS);
        let wake = queue
            .keys()
            .next()
            .map_or(anchor, |&(due, _)| due.min(anchor));

        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Schedule { key, due, job }) => {
                    queue.insert((due, seq), (key, job));
                    seq += 1;
                }
                Some(Command::Cancel { target, selector, arg }) => {
                    let before = queue.len();
                    queue.retain(|_, (key, _)| !matches(key, target, selector, arg));
                    trace_src!(
                        LogSource::Timer,
                        "cancelled {} invocation(s) for {:?}",
                        before - queue.len(),
                        target
                    );
                }
                Some(Command::Shutdown) | None => break,
            },
            () = time::sleep_until(wake) => {}
        }

        let now = Instant::now();
        loop {
            let due_key = queue
                .keys()
                .next()
                .copied()
                .filter(|&(due, _)| due <= now);
            let Some(due_key) = due_key else { break };
            let (key, job) = queue
                .remove(&due_key)
                .expect("due entry vanished from timer queue");
            trace_src!(LogSource::Timer, "firing {key:?}");
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                log::error!(
                    target: "urlgate::timer",
                    "scheduled invocation {key:?} panicked; timer worker continues"
                );
            }
        }
    }
    trace_src!(LogSource::Timer, "timer worker stopped");
}
