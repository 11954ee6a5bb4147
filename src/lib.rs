#![cfg_attr(docsrs, feature(doc_cfg))]
//! Wall-clock deadlines for work running on a specific thread.
//!
//! A [`DeadlineGuard`] binds a duration, a cancellation type and the thread that
//! created it. Once activated, a background monitor thread watches the clock and,
//! if the deadline passes before the protected work finishes, delivers a
//! cancellation into that thread. The protected work observes it at its next
//! suspension point as an `Err` of exactly the configured type.
//!
//! Protected work is written as a future and driven on the guarded thread by
//! [`Activation::block_on`]. Every `.await` that returns `Pending` is a safe
//! interruption point. Code between two suspension points is never preempted:
//! a long blocking call defers the cancellation until it returns.
//!
//! # Scoped form
//! ```no_run
//! use deadline_guard::{DeadlineGuard, yield_now};
//! use std::time::{Duration, Instant};
//!
//! let guard = DeadlineGuard::new(Duration::from_secs(1)).expect("config");
//! let result = guard
//!     .activate()
//!     .expect("monitor")
//!     .block_on(async {
//!         let start = Instant::now();
//!         while start.elapsed() < Duration::from_secs(2) {
//!             yield_now().await;
//!         }
//!     });
//! assert!(result.is_err());
//! ```
//!
//! # Wrapped callables
//! Every call of a wrapped callable gets a fresh guard, anchored at the call and
//! bound to the calling thread.
//! ```no_run
//! use deadline_guard::Deadline;
//! use std::time::Duration;
//!
//! let fetch = Deadline::new(Duration::from_millis(250))
//!     .expect("config")
//!     .wrap(|| async { 42 });
//! assert_eq!(fetch.call().expect("monitor").ok(), Some(42));
//! ```
//!
//! # Cancellation types
//! The error raised on expiry is a type parameter implementing [`Cancellation`],
//! [`TimedOut`] by default. It is chosen by type, never by value:
//! ```compile_fail
//! use deadline_guard::{Cancellation, DeadlineGuard, Expired};
//! use std::time::Duration;
//!
//! #[derive(Debug)]
//! struct Overrun;
//!
//! impl Cancellation for Overrun {
//!     fn deadline_exceeded(_expired: Expired) -> Self {
//!         Overrun
//!     }
//! }
//!
//! let guard = DeadlineGuard::new(Duration::from_secs(1)).expect("config");
//! // An instance is not a cancellation kind.
//! let guard = guard.raising(Overrun);
//! ```
//!
//! # Errors and logging
//! Configuration problems surface as [`ConfigError`] when a guard is built, before
//! any clock work starts. Failing to start the monitor thread surfaces as
//! [`ActivationError`]. Delivery problems inside the monitor are handled there and
//! never reach the caller.
//!
//! The crate uses the `log` facade for internal diagnostics. Provide a logger
//! implementation in your application to see them.
//!
//! # Chrono feature
//! Enable the `chrono` feature to build deadlines from `chrono::TimeDelta` via
//! [`Deadline::from_time_delta`] and [`DeadlineGuard::from_time_delta`].

mod guard;
mod handshake;
pub mod interrupt;
mod monitor;

pub use guard::*;
pub use interrupt::{ActivationId, Expired, catch_expiry, yield_now};
