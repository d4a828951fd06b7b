//! A generic bounded worker pool with idle-worker reclamation.
//!
//! Workers pull from one shared FIFO queue, so any idle worker may pick up
//! any queued task. The pool grows lazily up to its configured size and
//! workers that stay idle self-terminate, so the size is an upper bound, not
//! a commitment. Panics inside submitted tasks are caught at the worker
//! boundary and logged; the worker continues.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;

use crate::config::POOL_IDLE_TTL_SECS;
use crate::logging::{trace_src, LogSource};
use crate::types::{ErrorKind, Result};
use crate::waiter::{WaitGroup, WaitGuard};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A named, bounded pool of worker tasks executing arbitrary submissions.
///
/// Submissions from a single caller enter the queue in submission order, but
/// may execute in any interleaving across workers; there is no per-submitter
/// execution FIFO.
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    size: usize,
    tx: async_channel::Sender<Task>,
    rx: async_channel::Receiver<Task>,
    idle: Arc<AtomicUsize>,
    spawned: Arc<AtomicUsize>,
    next_worker_id: AtomicU64,
    /// Cloned into every worker; dropped guards let `dispose` detect drain
    guard: Mutex<Option<WaitGuard>>,
    wait: Mutex<Option<WaitGroup>>,
}

impl WorkerPool {
    /// Create a pool that grows lazily up to `size` workers (at least 1)
    #[must_use]
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let (tx, rx) = async_channel::unbounded();
        let (wait, guard) = WaitGroup::new();
        WorkerPool {
            name: name.into(),
            size: size.max(1),
            tx,
            rx,
            idle: Arc::new(AtomicUsize::new(0)),
            spawned: Arc::new(AtomicUsize::new(0)),
            next_worker_id: AtomicU64::new(0),
            guard: Mutex::new(Some(guard)),
            wait: Mutex::new(Some(wait)),
        }
    }

    /// Enqueue a task onto the pool's shared queue.
    ///
    /// Spawns a new worker when no worker is idle and the pool is below its
    /// size bound.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::PoolDisposed`] if [`WorkerPool::dispose`] was
    /// already called.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tx.is_closed() {
            return Err(ErrorKind::PoolDisposed(self.name.clone()));
        }
        if self.idle.load(Ordering::Acquire) == 0 && self.spawned.load(Ordering::Acquire) < self.size
        {
            self.spawn_worker();
        }
        self.tx
            .try_send(Box::pin(task))
            .map_err(|_| ErrorKind::PoolDisposed(self.name.clone()))
    }

    /// Drain the pool: stop accepting submissions, let queued and in-flight
    /// tasks finish, then wait for every worker to exit
    pub async fn dispose(&self) {
        self.tx.close();
        // Drop the template guard so only live workers keep the group open
        drop(self.guard.lock().expect("pool guard lock poisoned").take());
        let wait = self.wait.lock().expect("pool wait lock poisoned").take();
        if let Some(wait) = wait {
            wait.wait().await;
        }
        trace_src!(LogSource::Pool, "pool `{}` disposed", self.name);
    }

    /// Number of currently live workers
    #[must_use]
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Acquire)
    }

    /// Number of workers currently waiting for a task
    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    /// The pool's name, used in diagnostics
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn spawn_worker(&self) {
        let Some(guard) = self
            .guard
            .lock()
            .expect("pool guard lock poisoned")
            .clone()
        else {
            return;
        };
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        self.spawned.fetch_add(1, Ordering::AcqRel);
        let rx = self.rx.clone();
        let idle = self.idle.clone();
        let spawned = self.spawned.clone();
        let name = self.name.clone();
        trace_src!(LogSource::Pool, "pool `{name}` spawning worker {worker_id}");

        tokio::spawn(async move {
            let _guard = guard;
            let idle_ttl = Duration::from_secs(POOL_IDLE_TTL_SECS);
            idle.fetch_add(1, Ordering::AcqRel);
            loop {
                let task = match tokio::time::timeout(idle_ttl, rx.recv()).await {
                    Ok(Ok(task)) => task,
                    // Queue closed and drained
                    Ok(Err(_)) => break,
                    // Idle too long; a task that raced the timeout is
                    // picked up before exiting
                    Err(_) => match rx.try_recv() {
                        Ok(task) => task,
                        Err(_) => {
                            trace_src!(
                                LogSource::Pool,
                                "pool `{name}` worker {worker_id} idle, terminating"
                            );
                            break;
                        }
                    },
                };
                idle.fetch_sub(1, Ordering::AcqRel);
                if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                    log::error!(
                        target: "urlgate::pool",
                        "pool `{name}` worker {worker_id}: submitted task panicked"
                    );
                }
                idle.fetch_add(1, Ordering::AcqRel);
            }
            idle.fetch_sub(1, Ordering::AcqRel);
            spawned.fetch_sub(1, Ordering::AcqRel);
        });
    }
}
