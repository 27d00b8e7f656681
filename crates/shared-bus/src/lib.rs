//! # Shared Bus - Controller Signals
//!
//! Synchronous, typed notifications emitted by the controller while it
//! processes blocks and transactions.
//!
//! ```text
//! ┌──────────────┐   emit(&value)   ┌───────────┐   handler(&value)
//! │  Controller  │ ───────────────► │ Signal<T> │ ──► boundary ──► observer
//! └──────────────┘                  └───────────┘ ──► broadcast ──► Subscription<T>
//! ```
//!
//! ## Error Boundaries
//!
//! - Every handler runs in its own boundary: returned errors and panics are
//!   logged and never change the emitter's control flow.
//! - A handler returning `HandlerError::Fatal` (resource exhaustion) stops
//!   dispatch and is handed back to the emitter.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod signal;
pub mod subscriber;

pub use signal::{HandlerError, Signal};
pub use subscriber::{Subscription, SubscriptionError};

/// Maximum values buffered per channel subscriber before lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;
