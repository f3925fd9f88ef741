//! Server request dispatcher.
//!
//! Receives `Request` messages, runs them against the real implementation
//! under bounded concurrency and bounded queueing, and answers each with
//! exactly one `Response` carrying the same id.
//!
//! Admission on receipt:
//! - under `max_concurrent_requests` running: start now
//! - else under the queue bound: append to the FIFO queue
//! - else: answer `Overflow` without touching the implementation
//!
//! Disposal (a `Dispose` message, a local [`DispatcherHandle::dispose`] or
//! the channel closing) answers every queued call with `Disposed`, lets
//! running calls finish but suppresses their responses, and answers any
//! later request with `Disposed`.

use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelEvent, Port, PortReceiver, PortSender};
use crate::protocol::{Message, Request, Response};
use crate::transport::Transport;
use crate::types::{DispatcherConfig, Error, RemoteError, RequestId, Result};

/// Error name reported when the implementation panics.
pub const PANIC_NAME: &str = "Panic";

/// Counters describing dispatcher activity.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatcherStats {
    pub started: u64,
    pub completed: u64,
    pub overflowed: u64,
    /// Calls answered with `Disposed` (queued at disposal or arriving after).
    pub rejected_disposed: u64,
    /// Responses withheld because disposal happened while running.
    pub suppressed: u64,
    pub running: usize,
    pub queued: usize,
}

/// A call that has been started and has not finished yet.
#[derive(Debug)]
struct InFlight {
    id: RequestId,
    op: String,
}

#[derive(Debug, Default)]
struct DispatcherState {
    disposed: bool,
    next_task: u64,
    running: HashMap<u64, InFlight>,
    queue: VecDeque<Request>,
    stats: DispatcherStats,
}

impl DispatcherState {
    fn begin(&mut self, request: &Request) -> u64 {
        let task = self.next_task;
        self.next_task += 1;
        self.running.insert(
            task,
            InFlight {
                id: request.id,
                op: request.op.clone(),
            },
        );
        self.stats.started += 1;
        task
    }
}

enum Admission {
    Start(u64, Request),
    Queued,
    Overflow(RequestId),
    Disposed(RequestId),
}

struct DispatcherInner {
    handler: Arc<dyn Transport>,
    sender: PortSender,
    concurrency_limit: usize,
    queue_limit: usize,
    terminate_on_dispose: bool,
    state: Mutex<DispatcherState>,
    stopped: CancellationToken,
}

impl fmt::Debug for DispatcherInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherInner")
            .field("concurrency_limit", &self.concurrency_limit)
            .field("queue_limit", &self.queue_limit)
            .field("terminate_on_dispose", &self.terminate_on_dispose)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Entry point for serving a channel.
#[derive(Debug)]
pub struct Dispatcher;

impl Dispatcher {
    /// Serve `port` with `handler` on a background task.
    pub fn spawn(
        port: Port,
        handler: Arc<dyn Transport>,
        config: DispatcherConfig,
    ) -> Result<DispatcherHandle> {
        config.validate()?;
        let (sender, receiver) = port.split();
        let inner = Arc::new(DispatcherInner {
            handler,
            sender,
            concurrency_limit: config.concurrency_limit(),
            queue_limit: config.queue_limit(),
            terminate_on_dispose: config.terminate_on_dispose,
            state: Mutex::new(DispatcherState::default()),
            stopped: CancellationToken::new(),
        });

        tracing::debug!(
            "Dispatcher started (max_concurrent={}, max_queued={})",
            inner.concurrency_limit,
            inner.queue_limit,
        );
        tokio::spawn(receive_loop(Arc::clone(&inner), receiver));

        Ok(DispatcherHandle { inner })
    }
}

/// Handle to a running dispatcher. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    inner: Arc<DispatcherInner>,
}

impl DispatcherHandle {
    /// Stop admitting work. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state().disposed
    }

    pub fn stats(&self) -> DispatcherStats {
        let state = self.inner.state();
        DispatcherStats {
            running: state.running.len(),
            queued: state.queue.len(),
            ..state.stats.clone()
        }
    }

    /// Resolves once the receive loop has exited (the channel closed).
    pub async fn closed(&self) {
        self.inner.stopped.cancelled().await
    }
}

impl DispatcherInner {
    fn state(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn respond(&self, response: Response) {
        let id = response.id;
        if let Err(e) = self.sender.post(Message::Response(response).encode()) {
            tracing::debug!("Response for request {} not delivered: {}", id, e);
        }
    }

    fn admit(self: &Arc<Self>, request: Request) {
        let admission = {
            let mut state = self.state();
            if state.disposed {
                state.stats.rejected_disposed += 1;
                Admission::Disposed(request.id)
            } else if state.running.len() < self.concurrency_limit {
                let task = state.begin(&request);
                Admission::Start(task, request)
            } else if state.queue.len() < self.queue_limit {
                state.queue.push_back(request);
                Admission::Queued
            } else {
                state.stats.overflowed += 1;
                Admission::Overflow(request.id)
            }
        };

        match admission {
            Admission::Start(task, request) => self.start(task, request),
            Admission::Queued => {}
            Admission::Overflow(id) => {
                tracing::warn!("Request {} rejected: admission queue full", id);
                let err = Error::overflow(format!(
                    "admission queue full ({} running, {} queued)",
                    self.concurrency_limit, self.queue_limit
                ));
                self.respond(Response::err(id, err.to_remote()));
            }
            Admission::Disposed(id) => {
                let err = Error::disposed("dispatcher disposed");
                self.respond(Response::err(id, err.to_remote()));
            }
        }
    }

    fn start(self: &Arc<Self>, task: u64, request: Request) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let response = inner.execute(request).await;
            if let Some((next_task, next)) = inner.complete(task, response) {
                inner.start(next_task, next);
            }
        });
    }

    /// Run one call against the implementation. Never fails: errors and
    /// panics become error responses.
    async fn execute(&self, request: Request) -> Response {
        let Request { id, op, args } = request;
        tracing::trace!("Executing request {} ({})", id, op);

        let outcome = AssertUnwindSafe(self.handler.submit(&op, args))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => Response::ok(id, value),
            Ok(Err(e)) => {
                tracing::debug!("Request {} ({}) failed: {}", id, op, e);
                Response::err(id, e.to_remote())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!("Request {} ({}) panicked: {}", id, op, message);
                Response::err(id, RemoteError::named(PANIC_NAME, message))
            }
        }
    }

    /// Retire a finished task and pick the next queued call, if any.
    fn complete(&self, task: u64, response: Response) -> Option<(u64, Request)> {
        let (disposed, next) = {
            let mut state = self.state();
            state.running.remove(&task);
            state.stats.completed += 1;
            if state.disposed {
                state.stats.suppressed += 1;
                (true, None)
            } else {
                let next = state.queue.pop_front().map(|request| {
                    let task = state.begin(&request);
                    (task, request)
                });
                (false, next)
            }
        };

        if disposed {
            tracing::debug!("Suppressing response for request {} after disposal", response.id);
        } else {
            self.respond(response);
        }
        next
    }

    fn dispose(&self) {
        let (queued, running) = {
            let mut state = self.state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            let queued: Vec<Request> = state.queue.drain(..).collect();
            state.stats.rejected_disposed += queued.len() as u64;
            let running: Vec<String> = state
                .running
                .values()
                .map(|task| format!("{}:{}", task.id, task.op))
                .collect();
            (queued, running)
        };

        for request in &queued {
            let err = Error::disposed(format!("dispatcher disposed before {} started", request.op));
            self.respond(Response::err(request.id, err.to_remote()));
        }
        if self.terminate_on_dispose {
            self.sender.close();
        }
        tracing::info!(
            "Dispatcher disposed ({} queued rejected, still running: {:?})",
            queued.len(),
            running
        );
    }

    fn on_frame(self: &Arc<Self>, frame: Value) {
        match Message::decode(frame) {
            Ok(Message::Request(request)) => self.admit(request),
            Ok(Message::Dispose) => self.dispose(),
            Ok(Message::Response(response)) => {
                tracing::warn!("Ignoring server-bound response {}", response.id);
            }
            Err(violation) => match violation.id {
                Some(id) => {
                    tracing::warn!("Malformed request {}: {}", id, violation.reason);
                    let err: Error = violation.into();
                    self.respond(Response::err(id, err.to_remote()));
                }
                None => tracing::warn!("Dropping malformed message: {}", violation.reason),
            },
        }
    }
}

async fn receive_loop(inner: Arc<DispatcherInner>, mut receiver: PortReceiver) {
    while let Some(event) = receiver.recv().await {
        match event {
            ChannelEvent::Message(frame) => inner.on_frame(frame),
            ChannelEvent::Error(reason) => {
                tracing::warn!("Dropping undecodable message: {}", reason);
            }
        }
    }
    inner.dispose();
    inner.stopped.cancel();
    tracing::debug!("Dispatcher receive loop stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
