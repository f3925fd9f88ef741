//! Core types shared by every component.
//!
//! - **IDs**: request correlation ids and their allocator
//! - **Errors**: the failure taxonomy surfaced to callers
//! - **Config**: construction-time options for broker, dispatcher and cache

mod config;
mod errors;
mod ids;

pub use config::{
    BrokerConfig, CacheConfig, Config, DispatcherConfig, StreamConfig, DEFAULT_QUEUE_MULTIPLE,
};
pub use errors::{
    Error, ErrorKind, RemoteError, Result, DISPOSED_NAME, OVERFLOW_NAME, PROTOCOL_VIOLATION_NAME,
};
pub use ids::{IdAllocator, RequestId};
