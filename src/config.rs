//! Defaults and the runtime-settable dispatcher configuration.
//!
//! All limits can be changed while the dispatcher is live; changes apply to
//! subsequent admission decisions and never revoke already-admitted work.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Default hard cap of concurrent connections per endpoint, all classes
/// combined, 4.
pub const DEFAULT_MAX_CONNECTIONS_PER_ENDPOINT: usize = 4;
/// Default per-endpoint quota for long-running requests, 2.
pub const DEFAULT_MAX_LONG_RUNNING_PER_ENDPOINT: usize = 2;
/// Default request timeout in seconds before the dispatcher fails an
/// operation, 20.
pub const DEFAULT_TIMEOUT_SECS: u64 = 20;

// Constants currently not configurable by the user.
/// Size of the shared pool servicing admission waits.
pub(crate) const WAIT_POOL_SIZE: usize = 16;
/// Seconds an idle endpoint worker stays eligible for lease reuse.
pub(crate) const WORKER_REUSE_SECS: u64 = 10;
/// Seconds of inactivity after which the collector stops an endpoint worker.
pub(crate) const WORKER_IDLE_TTL_SECS: u64 = 15;
/// Seconds of inactivity after which a pool worker self-terminates.
pub(crate) const POOL_IDLE_TTL_SECS: u64 = 15;
/// Cadence of the dispatcher's reclamation collector, in seconds.
pub(crate) const COLLECTOR_INTERVAL_SECS: u64 = 5;
/// The timer worker wakes at least this often even with an empty queue.
pub(crate) const TIMER_ANCHOR_SECS: u64 = 5;

/// Runtime-settable admission limits, shared between the dispatcher and its
/// endpoint states
#[derive(Debug)]
pub(crate) struct ConfigHandle {
    max_connections_per_endpoint: AtomicUsize,
    max_long_running_per_endpoint: AtomicUsize,
    use_shared_transport: AtomicBool,
}

impl ConfigHandle {
    pub(crate) fn new(
        max_connections_per_endpoint: usize,
        max_long_running_per_endpoint: usize,
        use_shared_transport: bool,
    ) -> Self {
        Self {
            max_connections_per_endpoint: AtomicUsize::new(max_connections_per_endpoint.max(1)),
            max_long_running_per_endpoint: AtomicUsize::new(max_long_running_per_endpoint),
            use_shared_transport: AtomicBool::new(use_shared_transport),
        }
    }

    pub(crate) fn max_connections_per_endpoint(&self) -> usize {
        self.max_connections_per_endpoint.load(Ordering::Relaxed)
    }

    pub(crate) fn set_max_connections_per_endpoint(&self, value: usize) {
        self.max_connections_per_endpoint
            .store(value.max(1), Ordering::Relaxed);
    }

    pub(crate) fn max_long_running_per_endpoint(&self) -> usize {
        self.max_long_running_per_endpoint.load(Ordering::Relaxed)
    }

    pub(crate) fn set_max_long_running_per_endpoint(&self, value: usize) {
        self.max_long_running_per_endpoint
            .store(value, Ordering::Relaxed);
    }

    pub(crate) fn use_shared_transport(&self) -> bool {
        self.use_shared_transport.load(Ordering::Relaxed)
    }

    pub(crate) fn set_use_shared_transport(&self, value: bool) {
        self.use_shared_transport.store(value, Ordering::Relaxed);
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_CONNECTIONS_PER_ENDPOINT,
            DEFAULT_MAX_LONG_RUNNING_PER_ENDPOINT,
            true,
        )
    }
}
