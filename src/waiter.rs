//! Facility to wait for a dynamic set of workers to finish, with a single
//! waiter and multiple waitees.
//!
//! The implementation is a thin wrapper around [`tokio::sync::mpsc::channel`]:
//! the [`WaitGroup`] holds the unique receiver and every [`WaitGuard`] holds a
//! sender. Once all guards are dropped, the receiver observes the closed
//! channel and the wait completes. The pool hands one guard to each worker it
//! spawns and waits on the group during dispose.

use futures::never::Never;
use tokio::sync::mpsc::{channel, Receiver, Sender};

/// Manager for a wait group. Single-use: waiting consumes the group.
#[derive(Debug)]
pub(crate) struct WaitGroup {
    /// Held to detect when all [`Sender`]s have closed. The [`Never`] type
    /// means no value is ever received through the channel.
    recv: Receiver<Never>,
}

/// RAII guard held by a worker that is being waited for. Cloning a guard
/// registers additional outstanding work.
#[derive(Clone, Debug)]
pub(crate) struct WaitGuard {
    /// Held only to keep the receiver open until dropped
    _send: Sender<Never>,
}

impl WaitGroup {
    /// Creates a new [`WaitGroup`] and its first associated [`WaitGuard`].
    /// Further guards are created by cloning the returned one.
    pub(crate) fn new() -> (Self, WaitGuard) {
        let (send, recv) = channel(1);
        (Self { recv }, WaitGuard { _send: send })
    }

    /// Waits until all associated [`WaitGuard`]s have been dropped
    pub(crate) async fn wait(mut self) {
        let None = self.recv.recv().await;
    }
}
