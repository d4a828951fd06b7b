//! Per-endpoint admission state.
//!
//! Every live endpoint key owns an [`EndpointState`]: the per-class running
//! counts, the per-class FIFO wait queues, and the free list of leasable
//! workers. All fields sit behind one per-endpoint mutex; the mutex is never
//! held across delegate code. The per-class [`Notify`] values are the
//! condition variables admission tasks block on between slot releases.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::{ConfigHandle, WORKER_IDLE_TTL_SECS, WORKER_REUSE_SECS};
use crate::logging::{trace_src, LogSource};
use crate::operation::Operation;
use crate::types::{EndpointKey, RequestClass};
use crate::worker::Worker;

const fn class_index(class: RequestClass) -> usize {
    match class {
        RequestClass::Short => 0,
        RequestClass::Long => 1,
    }
}

/// Result of one admission attempt against the head of a class queue
pub(crate) enum Pop {
    /// The queue head was admitted: slot counted, worker leased
    Admitted(Arc<Operation>, Arc<Worker>),
    /// The queue is empty; the admission task may exit
    Empty,
    /// The queue head exists but no slot is available right now
    Blocked,
}

#[derive(Debug)]
struct EndpointInner {
    running: [usize; 2],
    queues: [VecDeque<Arc<Operation>>; 2],
    /// Whether an admission task is currently servicing the class queue
    admission_active: [bool; 2],
    free_workers: Vec<Arc<Worker>>,
    /// Leased plus free workers owned by this endpoint
    worker_count: usize,
    last_activity: Instant,
}

/// Admission bookkeeping for one endpoint key
#[derive(Debug)]
pub(crate) struct EndpointState {
    key: EndpointKey,
    config: Arc<ConfigHandle>,
    inner: Mutex<EndpointInner>,
    /// Per-class condition variables, signalled on every slot release
    slots: [Notify; 2],
}

impl EndpointState {
    pub(crate) fn new(key: EndpointKey, config: Arc<ConfigHandle>) -> Self {
        EndpointState {
            key,
            config,
            inner: Mutex::new(EndpointInner {
                running: [0, 0],
                queues: [VecDeque::new(), VecDeque::new()],
                admission_active: [false, false],
                free_workers: Vec::new(),
                worker_count: 0,
                last_activity: Instant::now(),
            }),
            slots: [Notify::new(), Notify::new()],
        }
    }

    pub(crate) fn key(&self) -> &EndpointKey {
        &self.key
    }

    /// A future resolving when a slot of interest to `class` is released
    pub(crate) fn slot_released(&self, class: RequestClass) -> Notified<'_> {
        self.slots[class_index(class)].notified()
    }

    /// Immediate admission: count the slot and lease a worker if the class
    /// quota and the endpoint hard cap both permit it right now
    pub(crate) fn try_admit(&self, class: RequestClass) -> Option<Arc<Worker>> {
        let mut inner = self.lock();
        if !self.can_admit_locked(&inner, class) {
            return None;
        }
        inner.running[class_index(class)] += 1;
        inner.last_activity = Instant::now();
        Some(self.lease_worker(&mut inner))
    }

    /// Park an operation at the tail of its class wait queue. Returns `true`
    /// if the caller must start an admission task for this class.
    pub(crate) fn enqueue(&self, operation: Arc<Operation>) -> bool {
        operation.mark_waiting();
        let class = operation.class();
        let mut inner = self.lock();
        inner.queues[class_index(class)].push_back(operation);
        inner.last_activity = Instant::now();
        if inner.admission_active[class_index(class)] {
            false
        } else {
            inner.admission_active[class_index(class)] = true;
            true
        }
    }

    /// One admission-task step: admit the queue head if possible
    pub(crate) fn pop_admissible(&self, class: RequestClass) -> Pop {
        let index = class_index(class);
        let mut inner = self.lock();
        // Operations cancelled while waiting are removed by the cancel path
        // under this same lock, so the head is always live
        if inner.queues[index].is_empty() {
            inner.admission_active[index] = false;
            return Pop::Empty;
        }
        if !self.can_admit_locked(&inner, class) {
            return Pop::Blocked;
        }
        inner.running[index] += 1;
        inner.last_activity = Instant::now();
        let worker = self.lease_worker(&mut inner);
        let operation = inner.queues[index]
            .pop_front()
            .expect("endpoint queue emptied under lock");
        Pop::Admitted(operation, worker)
    }

    /// Release one slot of `class` and return its worker to the free list,
    /// then signal both class condition variables: freed total capacity can
    /// unblock either class.
    pub(crate) fn release(&self, class: RequestClass, worker: Option<Arc<Worker>>) {
        {
            let mut inner = self.lock();
            let index = class_index(class);
            debug_assert!(inner.running[index] > 0, "slot release without admission");
            inner.running[index] = inner.running[index].saturating_sub(1);
            inner.last_activity = Instant::now();
            if let Some(worker) = worker {
                worker.touch();
                inner.free_workers.push(worker);
            }
        }
        self.slots[0].notify_one();
        self.slots[1].notify_one();
    }

    /// Remove a waiting operation from its class queue. Returns `true` if it
    /// was still queued (and therefore holds no slot and no worker).
    pub(crate) fn remove_waiting(&self, operation: &Arc<Operation>) -> bool {
        let removed = {
            let mut inner = self.lock();
            let queue = &mut inner.queues[class_index(operation.class())];
            let before = queue.len();
            queue.retain(|queued| queued.id() != operation.id());
            before != queue.len()
        };
        if removed {
            // Wake the admission task so it can observe an emptied queue
            // rather than blocking on a release that may never come
            self.slots[class_index(operation.class())].notify_one();
        }
        removed
    }

    /// Forget one worker that was leased but never serviced its operation
    pub(crate) fn discard_worker(&self) {
        let mut inner = self.lock();
        inner.worker_count = inner.worker_count.saturating_sub(1);
    }

    /// Empty both wait queues, waking the admission tasks so they can
    /// observe the drained state and exit. Used on dispose.
    pub(crate) fn drain_waiting(&self) -> Vec<Arc<Operation>> {
        let drained = {
            let mut inner = self.lock();
            inner
                .queues
                .iter_mut()
                .flat_map(|queue| queue.drain(..))
                .collect::<Vec<_>>()
        };
        self.slots[0].notify_one();
        self.slots[1].notify_one();
        drained
    }

    /// Stop every free-list worker immediately. Leased workers are stopped
    /// by their endpoints once released and collected.
    pub(crate) fn stop_free_workers(&self) {
        let mut inner = self.lock();
        let stopped = inner.free_workers.len();
        for worker in inner.free_workers.drain(..) {
            worker.stop();
        }
        inner.worker_count -= stopped;
    }

    /// Advisory quota probe, racy by design
    pub(crate) fn can_admit_now(&self, class: RequestClass) -> bool {
        let inner = self.lock();
        self.can_admit_locked(&inner, class)
    }

    /// Stop workers idle past their TTL. Returns `true` when the endpoint
    /// state holds nothing worth keeping and may be dropped from the map.
    pub(crate) fn collect(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        let ttl = Duration::from_secs(WORKER_IDLE_TTL_SECS);
        let mut stopped = 0;
        inner.free_workers.retain(|worker| {
            if worker.idle_for(now) >= ttl {
                worker.stop();
                stopped += 1;
                false
            } else {
                true
            }
        });
        inner.worker_count -= stopped;
        if stopped > 0 {
            trace_src!(
                LogSource::Dispatcher,
                "endpoint {}: collected {stopped} idle worker(s)",
                self.key
            );
        }
        inner.worker_count == 0
            && inner.running == [0, 0]
            && inner.queues.iter().all(VecDeque::is_empty)
            && inner.admission_active == [false, false]
            && now.saturating_duration_since(inner.last_activity) >= ttl
    }

    /// Number of workers currently owned by this endpoint (leased + free)
    #[cfg(test)]
    pub(crate) fn worker_count(&self) -> usize {
        self.lock().worker_count
    }

    fn can_admit_locked(&self, inner: &EndpointInner, class: RequestClass) -> bool {
        let cap = self.config.max_connections_per_endpoint();
        let total = inner.running[0] + inner.running[1];
        match class {
            RequestClass::Short => total < cap,
            // Long admissions check the long quota, never the spare hard-cap
            // room: the difference stays reserved for short requests
            RequestClass::Long => {
                total < cap && inner.running[1] < self.config.max_long_running_per_endpoint()
            }
        }
    }

    /// Lease a worker for one admitted operation. Stale free workers are
    /// stopped rather than reused; a fresh worker is spawned when the free
    /// list yields nothing.
    fn lease_worker(&self, inner: &mut EndpointInner) -> Arc<Worker> {
        let reuse_window = Duration::from_secs(WORKER_REUSE_SECS);
        let now = Instant::now();
        while let Some(worker) = inner.free_workers.pop() {
            if worker.idle_for(now) > reuse_window {
                worker.stop();
                inner.worker_count -= 1;
                continue;
            }
            worker.touch();
            return worker;
        }
        inner.worker_count += 1;
        trace_src!(
            LogSource::Dispatcher,
            "endpoint {}: spawning worker ({} total)",
            self.key,
            inner.worker_count
        );
        Worker::spawn()
    }

    fn lock(&self) -> MutexGuard<'_, EndpointInner> {
        self.inner.lock().expect("endpoint lock poisoned")
    }
}
