//! Leasable worker tasks for the dispatcher.
//!
//! A [`Worker`] wraps a dedicated event-loop task with its own job queue.
//! Workers are not bound to a specific endpoint; the dispatcher leases them
//! from an endpoint-scoped free list, one operation per worker at a time, so
//! everything posted for one operation runs serialized on its worker.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::logging::{trace_src, LogSource};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum WorkerJob {
    Run(Task),
    Stop,
}

/// A live event-loop task, leased to service one operation at a time
#[derive(Debug)]
pub(crate) struct Worker {
    id: u64,
    tx: mpsc::UnboundedSender<WorkerJob>,
    last_activity: Mutex<Instant>,
    stopping: AtomicBool,
}

impl Worker {
    /// Spawn a new worker task. Must be called within a tokio runtime.
    pub(crate) fn spawn() -> Arc<Worker> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Arc::new(Worker {
            id,
            tx,
            last_activity: Mutex::new(Instant::now()),
            stopping: AtomicBool::new(false),
        });
        // The event loop only holds a weak back-reference: dropping the last
        // strong handle closes the job channel and lets the loop exit
        tokio::spawn(Worker::run(id, Arc::downgrade(&worker), rx));
        worker
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    /// Post a job onto the worker's event loop. Returns `false` if the
    /// worker is stopping and will not run it.
    pub(crate) fn post<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.stopping.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(WorkerJob::Run(Box::pin(task))).is_ok()
    }

    /// Stop the worker after the jobs already queued have run
    pub(crate) fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        trace_src!(LogSource::Dispatcher, "stopping worker {}", self.id);
        let _ = self.tx.send(WorkerJob::Stop);
    }

    /// Record activity on this worker, resetting its idle clock
    pub(crate) fn touch(&self) {
        *self
            .last_activity
            .lock()
            .expect("worker activity lock poisoned") = Instant::now();
    }

    /// How long the worker has been without activity
    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        let last = *self
            .last_activity
            .lock()
            .expect("worker activity lock poisoned");
        now.saturating_duration_since(last)
    }

    async fn run(id: u64, worker: Weak<Worker>, mut rx: mpsc::UnboundedReceiver<WorkerJob>) {
        while let Some(job) = rx.recv().await {
            match job {
                WorkerJob::Run(task) => {
                    if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                        log::error!(
                            target: "urlgate::dispatcher",
                            "job on worker {id} panicked; worker continues"
                        );
                    }
                    if let Some(worker) = worker.upgrade() {
                        worker.touch();
                    }
                }
                WorkerJob::Stop => break,
            }
        }
        trace_src!(LogSource::Dispatcher, "worker {id} exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_jobs_run_in_post_order() {
        let worker = Worker::spawn();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            assert!(worker.post(async move {
                order.lock().unwrap().push(i);
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_post_after_stop_is_rejected() {
        let worker = Worker::spawn();
        worker.stop();
        assert!(!worker.post(async {}));
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_the_worker() {
        let worker = Worker::spawn();
        worker.post(async {
            panic!("job panic");
        });
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        worker.post(async move {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_clock() {
        let worker = Worker::spawn();
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(worker.idle_for(Instant::now()) >= Duration::from_secs(12));
        worker.touch();
        assert!(worker.idle_for(Instant::now()) < Duration::from_secs(1));
    }
}
