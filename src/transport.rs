//! The single call contract every component implements or wraps.
//!
//! A [`Transport`] takes an operation name and an ordered list of opaque
//! arguments and eventually yields a value or a typed failure. The client
//! broker implements it over a channel, the caching decorator wraps one, and
//! the server dispatcher calls one as the real implementation.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::types::Result;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Invoke `op` with `args`.
    async fn submit(&self, op: &str, args: Vec<Value>) -> Result<Value>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn submit(&self, op: &str, args: Vec<Value>) -> Result<Value> {
        (**self).submit(op, args).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn submit(&self, op: &str, args: Vec<Value>) -> Result<Value> {
        (**self).submit(op, args).await
    }
}

/// Adapt an async closure into a [`Transport`].
///
/// The closure receives owned copies of the operation name and arguments.
pub fn from_fn<F>(f: F) -> FnTransport<F>
where
    F: Fn(String, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync,
{
    FnTransport { f }
}

/// Transport backed by a closure. See [`from_fn`].
pub struct FnTransport<F> {
    f: F,
}

impl<F> fmt::Debug for FnTransport<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> Transport for FnTransport<F>
where
    F: Fn(String, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync,
{
    async fn submit(&self, op: &str, args: Vec<Value>) -> Result<Value> {
        (self.f)(op.to_string(), args).await
    }
}
