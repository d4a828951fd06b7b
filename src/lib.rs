//! `urlgate` is a per-endpoint admission-control core for outbound HTTP
//! requests.
//!
//! Network stacks can behave pathologically when more than a handful of
//! concurrent connections target the same endpoint: excess connections stall
//! silently and eventually time out without ever transmitting. This crate
//! queues excess work internally and dispatches only as many simultaneous
//! requests per `(scheme, host, port)` endpoint as the configured admission
//! quotas permit. It owns *admission*; the transport owns sockets.
//!
//! Requests come in two classes: `Short` (ordinary downloads, the default)
//! and `Long` (streaming connections), each with its own per-endpoint quota.
//! Long requests are rejected synchronously when their quota is full, so
//! they can never starve short requests of capacity. Request timeouts are
//! enforced by the dispatcher's own timer service rather than the
//! transport's timer, which is precisely what fails in stalled-connection
//! scenarios.
//!
//! "Hello world" example:
//!
//! ```no_run
//! use urlgate::{Dispatcher, Request, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let request = Request::try_from("https://example.com/file")?;
//!     let (body, response) = Dispatcher::shared().dispatch_sync(request).await?;
//!     println!("{}: {} bytes", response.status, body.len());
//!     Ok(())
//! }
//! ```
//!
//! For asynchronous dispatch, implement [`Delegate`] and hand it to
//! [`Dispatcher::dispatch_short`] or [`Dispatcher::dispatch_long`]; the
//! delegate receives the response head, body chunks and exactly one terminal
//! callback, all serialized per operation. A dispatcher with custom limits
//! is built via [`DispatcherBuilder`]:
//!
//! ```no_run
//! use urlgate::DispatcherBuilder;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let dispatcher = DispatcherBuilder::builder()
//!     .max_connections_per_endpoint(2usize)
//!     .build()
//!     .dispatcher();
//! # }
//! ```
#![warn(clippy::all, clippy::pedantic)]
#![warn(
    absolute_paths_not_starting_with_crate,
    rustdoc::invalid_html_tags,
    missing_copy_implementations,
    missing_debug_implementations,
    semicolon_in_expressions_from_macros,
    unreachable_pub,
    unused_crate_dependencies,
    unused_extern_crates,
    variant_size_differences,
    clippy::missing_const_for_fn
)]
#![deny(anonymous_parameters, macro_use_extern_crate)]
#![deny(missing_docs)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod delegate;
mod dispatcher;
mod operation;
mod timer;
mod waiter;
mod worker;

/// Component-scoped diagnostics: per-source toggles and sink registration
pub mod logging;

/// A generic bounded worker pool with idle-thread reclamation
pub mod pool;

/// The transport seam and the built-in reqwest-based transports
pub mod transport;

mod types;

#[cfg(test)]
mod test_utils;

#[doc(inline)]
pub use crate::{
    // Constants get exposed so that embedders can share the library defaults
    config::{
        DEFAULT_MAX_CONNECTIONS_PER_ENDPOINT, DEFAULT_MAX_LONG_RUNNING_PER_ENDPOINT,
        DEFAULT_TIMEOUT_SECS,
    },
    delegate::{AuthChallenge, BasicCredentials, ChallengeAction, Delegate},
    dispatcher::{Dispatcher, DispatcherBuilder, DEFAULT_USER_AGENT},
    logging::{register_sink, set_source_enabled, source_enabled, LogSink, LogSource},
    operation::{Operation, OperationPhase},
    pool::WorkerPool,
    timer::{InvocationKey, TimerService, TimerTarget},
    transport::{ConnectionTransport, SessionTransport, Transport, TransportEvent, TransportStream},
    types::{EndpointKey, ErrorKind, Request, RequestClass, ResponseHead, Result},
};
