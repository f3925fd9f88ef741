//! # Compute Broker - Request/response plumbing for an out-of-thread engine
//!
//! Moves `(operation, args)` calls from callers to a compute implementation
//! running on the far side of an asynchronous, unordered message channel:
//! - Correlated request/response with per-call timeout and cancellation
//! - Bounded server-side admission (running slots plus a FIFO queue)
//! - A caching decorator with in-flight dedup, LRU bound and TTL
//! - Deterministic teardown: every outstanding call settles exactly once
//!
//! ## Architecture
//!
//! ```text
//!   caller ─→ CachingTransport ─→ RequestBroker ──channel──→ Dispatcher ─→ handler
//!            (optional)           (client)        frames      (server)    (Transport)
//! ```
//!
//! Every component speaks the same [`Transport`] contract, so decorators and
//! handlers compose freely.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod cache;
pub mod channel;
pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod types;

// Internal utilities
pub mod observability;

pub use cache::{CachePolicy, CachingTransport};
pub use client::{RequestBroker, SubmitOptions};
pub use server::{Dispatcher, DispatcherHandle};
pub use transport::Transport;
pub use types::{Config, Error, ErrorKind, RemoteError, Result};
