//! Client request broker.
//!
//! Issues `Request` messages over a channel and correlates `Response`
//! messages back to the caller by id. Settlement happens in two phases:
//!
//! ```text
//!   response arrives ──▶ pending entry removed (sync) ──▶ queued
//!                                                          │
//!                          next scheduler tick ◀───────────┘
//!                                 │
//!                      flush: settle queued entries in arrival order
//!                             (or as Disposed if dispose() ran first)
//! ```
//!
//! The synchronous removal means a racing timeout or cancellation can never
//! fire for a request whose response is already in hand. The deferred flush
//! means a `dispose()` issued in the same turn as a response always wins.

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{self, ChannelEvent, Port, PortReceiver, PortSender};
use crate::protocol::Message;
use crate::server::{Dispatcher, DispatcherHandle};
use crate::transport::Transport;
use crate::types::{BrokerConfig, DispatcherConfig, Error, IdAllocator, RequestId, Result};

/// Per-call options for [`RequestBroker::submit_with`].
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Withdraws local interest in the call when cancelled.
    pub cancellation: Option<CancellationToken>,
    /// Overrides the broker's default timeout.
    pub timeout: Option<Duration>,
}

impl SubmitOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancellation: Some(token),
            ..Default::default()
        }
    }
}

/// Counters describing broker activity.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BrokerStats {
    pub submitted: u64,
    pub resolved: u64,
    /// Requests rejected by the remote side, the channel or disposal.
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Requests awaiting a response.
    pub pending: usize,
    /// Responses received but not yet delivered.
    pub queued: usize,
}

#[derive(Debug)]
struct PendingRequest {
    op: String,
    settle: oneshot::Sender<Result<Value>>,
}

#[derive(Debug)]
struct QueuedSettlement {
    pending: PendingRequest,
    outcome: Result<Value>,
}

#[derive(Debug, Default)]
struct BrokerState {
    disposed: bool,
    pending: HashMap<RequestId, PendingRequest>,
    queued: Vec<QueuedSettlement>,
    flush: Option<JoinHandle<()>>,
    stats: BrokerStats,
}

#[derive(Debug)]
struct BrokerInner {
    ids: IdAllocator,
    sender: PortSender,
    config: BrokerConfig,
    terminate_on_dispose: bool,
    state: Mutex<BrokerState>,
    shutdown: CancellationToken,
}

/// Client side of the channel. See the module docs for settlement rules.
///
/// Construct inside a tokio runtime: a background task reads the channel.
/// Dropping the broker disposes it.
#[derive(Debug)]
pub struct RequestBroker {
    inner: Arc<BrokerInner>,
    dispatcher: Option<DispatcherHandle>,
}

impl RequestBroker {
    /// Adopt an existing channel. The channel is left open on dispose unless
    /// `terminate_on_dispose` is set.
    pub fn new(port: Port, config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        let terminate = config.terminate_on_dispose.unwrap_or(false);
        Ok(Self::start(port, config, terminate, None))
    }

    /// Create a channel, run a [`Dispatcher`] for `handler` on its far end and
    /// return a broker owning the channel. The channel is closed on dispose
    /// unless `terminate_on_dispose` is explicitly false.
    pub fn in_process(
        handler: Arc<dyn Transport>,
        config: BrokerConfig,
        dispatcher_config: DispatcherConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (client, server) = channel::pair();
        let dispatcher = Dispatcher::spawn(server, handler, dispatcher_config)?;
        let terminate = config.terminate_on_dispose.unwrap_or(true);
        Ok(Self::start(client, config, terminate, Some(dispatcher)))
    }

    fn start(
        port: Port,
        config: BrokerConfig,
        terminate_on_dispose: bool,
        dispatcher: Option<DispatcherHandle>,
    ) -> Self {
        let (sender, receiver) = port.split();
        let inner = Arc::new(BrokerInner {
            ids: IdAllocator::new(),
            sender,
            config,
            terminate_on_dispose,
            state: Mutex::new(BrokerState::default()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(receive_loop(
            Arc::downgrade(&inner),
            receiver,
            inner.shutdown.clone(),
        ));

        Self { inner, dispatcher }
    }

    /// Submit `op` with the broker's default options.
    pub async fn submit(&self, op: &str, args: Vec<Value>) -> Result<Value> {
        self.submit_with(op, args, SubmitOptions::default()).await
    }

    /// Submit `op`, racing the response against `options`' timeout and
    /// cancellation token.
    pub async fn submit_with(
        &self,
        op: &str,
        args: Vec<Value>,
        options: SubmitOptions,
    ) -> Result<Value> {
        if self.is_disposed() {
            return Err(Error::disposed(format!("broker disposed; {} not submitted", op)));
        }
        if options
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Err(Error::cancelled(format!("{} cancelled before submission", op)));
        }

        let (id, mut settled) = self.inner.register(op)?;
        let mut guard = PendingGuard {
            inner: &self.inner,
            id,
            armed: true,
        };

        if let Err(e) = self.inner.sender.post(Message::request(id, op, args).encode()) {
            tracing::debug!("Request {} ({}) could not be posted: {}", id, op, e);
            self.inner.withdraw(id);
            guard.armed = false;
            self.inner.record_failure();
            return Err(e);
        }
        tracing::trace!("Request {} ({}) posted", id, op);

        let timeout = options.timeout.or(self.inner.config.timeout);
        let deadline = optional(timeout.map(tokio::time::sleep));
        let cancelled = optional(options.cancellation.as_ref().map(|t| t.cancelled()));

        tokio::select! {
            outcome = &mut settled => {
                guard.armed = false;
                return delivered(outcome);
            }
            _ = deadline => {
                if self.inner.withdraw(id) {
                    guard.armed = false;
                    self.inner.record(|s| s.timed_out += 1);
                    let waited = timeout.unwrap_or_default();
                    tracing::debug!("Request {} ({}) timed out after {:?}", id, op, waited);
                    return Err(Error::timeout(format!("{} timed out after {:?}", op, waited)));
                }
            }
            _ = cancelled => {
                if self.inner.withdraw(id) {
                    guard.armed = false;
                    self.inner.record(|s| s.cancelled += 1);
                    tracing::debug!("Request {} ({}) cancelled", id, op);
                    return Err(Error::cancelled(format!("{} cancelled", op)));
                }
            }
        }

        // The id was already unregistered: a settlement is queued for it.
        guard.armed = false;
        delivered(settled.await)
    }

    /// Tear down the broker. Idempotent.
    ///
    /// Every pending request and every received-but-undelivered response
    /// rejects with `Disposed`.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state().disposed
    }

    pub fn stats(&self) -> BrokerStats {
        let state = self.inner.state();
        BrokerStats {
            pending: state.pending.len(),
            queued: state.queued.len(),
            ..state.stats.clone()
        }
    }

    /// The dispatcher serving this broker, when created with [`Self::in_process`].
    pub fn dispatcher(&self) -> Option<&DispatcherHandle> {
        self.dispatcher.as_ref()
    }
}

impl Drop for RequestBroker {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

#[async_trait::async_trait]
impl Transport for RequestBroker {
    async fn submit(&self, op: &str, args: Vec<Value>) -> Result<Value> {
        self.submit_with(op, args, SubmitOptions::default()).await
    }
}

impl BrokerInner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, f: impl FnOnce(&mut BrokerStats)) {
        f(&mut self.state().stats);
    }

    fn record_failure(&self) {
        self.record(|s| s.failed += 1);
    }

    fn register(&self, op: &str) -> Result<(RequestId, oneshot::Receiver<Result<Value>>)> {
        let mut state = self.state();
        if state.disposed {
            return Err(Error::disposed(format!("broker disposed; {} not submitted", op)));
        }
        let id = self.ids.allocate();
        let (settle, settled) = oneshot::channel();
        state.pending.insert(
            id,
            PendingRequest {
                op: op.to_string(),
                settle,
            },
        );
        state.stats.submitted += 1;
        Ok((id, settled))
    }

    /// Remove a still-pending request. Returns false if it was already
    /// settled, queued or disposed.
    fn withdraw(&self, id: RequestId) -> bool {
        self.state().pending.remove(&id).is_some()
    }

    /// Phase one of settlement: unregister and queue.
    fn accept(self: &Arc<Self>, id: RequestId, outcome: Result<Value>) {
        let mut state = self.state();
        if state.disposed {
            return;
        }
        let Some(pending) = state.pending.remove(&id) else {
            tracing::debug!("Ignoring response for unknown request {}", id);
            return;
        };
        tracing::trace!("Response for request {} ({}) queued", id, pending.op);
        state.queued.push(QueuedSettlement { pending, outcome });

        if state.flush.is_none() {
            let weak = Arc::downgrade(self);
            state.flush = Some(tokio::spawn(async move {
                tokio::task::yield_now().await;
                if let Some(inner) = weak.upgrade() {
                    inner.flush();
                }
            }));
        }
    }

    /// Phase two of settlement: deliver queued outcomes in arrival order.
    ///
    /// Disposal drains the queue and aborts this task, so anything still
    /// queued here settles with its received outcome.
    fn flush(&self) {
        let queued = {
            let mut state = self.state();
            state.flush = None;
            let queued = std::mem::take(&mut state.queued);
            for entry in &queued {
                match entry.outcome {
                    Ok(_) => state.stats.resolved += 1,
                    Err(_) => state.stats.failed += 1,
                }
            }
            queued
        };

        for entry in queued {
            let _ = entry.pending.settle.send(entry.outcome);
        }
    }

    /// Reject everything outstanding with `err`. Used for channel-fatal
    /// conditions, where correlation can no longer be trusted.
    fn fail_all(&self, err: Error) {
        self.reject_outstanding(err, true);
    }

    /// Reject requests still awaiting a response. Responses already received
    /// were correlated intact and go out with the scheduled flush.
    fn fail_pending(&self, err: Error) {
        self.reject_outstanding(err, false);
    }

    fn reject_outstanding(&self, err: Error, include_queued: bool) {
        let (pending, queued) = {
            let mut state = self.state();
            let queued = if include_queued {
                if let Some(flush) = state.flush.take() {
                    flush.abort();
                }
                std::mem::take(&mut state.queued)
            } else {
                Vec::new()
            };
            let pending: Vec<_> = state.pending.drain().map(|(_, p)| p).collect();
            state.stats.failed += (pending.len() + queued.len()) as u64;
            (pending, queued)
        };

        if !pending.is_empty() || !queued.is_empty() {
            tracing::warn!(
                "Rejecting {} outstanding requests: {}",
                pending.len() + queued.len(),
                err
            );
        }
        for p in pending.into_iter().chain(queued.into_iter().map(|q| q.pending)) {
            let _ = p.settle.send(Err(err.clone()));
        }
    }

    fn dispose(&self) {
        let (pending, queued) = {
            let mut state = self.state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            if let Some(flush) = state.flush.take() {
                flush.abort();
            }
            let pending: Vec<_> = state.pending.drain().map(|(_, p)| p).collect();
            let queued = std::mem::take(&mut state.queued);
            state.stats.failed += (pending.len() + queued.len()) as u64;
            (pending, queued)
        };

        let abandoned = pending.len() + queued.len();
        for p in pending.into_iter().chain(queued.into_iter().map(|q| q.pending)) {
            let _ = p
                .settle
                .send(Err(Error::disposed(format!("broker disposed; {} abandoned", p.op))));
        }

        if let Err(e) = self.sender.post(Message::Dispose.encode()) {
            tracing::debug!("Dispose notice not delivered: {}", e);
        }
        self.shutdown.cancel();
        if self.terminate_on_dispose {
            self.sender.close();
        }
        tracing::info!("Request broker disposed ({} requests abandoned)", abandoned);
    }

    fn on_undecodable(&self, reason: &str) {
        self.fail_all(Error::protocol(format!("undecodable message: {}", reason)));
    }

    fn on_frame(self: &Arc<Self>, frame: Value) {
        match Message::decode(frame) {
            Ok(Message::Response(response)) => {
                let outcome = response.outcome.map_err(Error::from_remote);
                self.accept(response.id, outcome);
            }
            Ok(other) => {
                tracing::warn!("Ignoring unexpected client-bound message: {:?}", other);
            }
            Err(violation) => match violation.id {
                Some(id) if self.state().pending.contains_key(&id) => {
                    tracing::warn!("Malformed response for request {}: {}", id, violation.reason);
                    self.accept(id, Err(violation.into()));
                }
                Some(id) => {
                    tracing::debug!("Ignoring malformed message for unknown request {}", id);
                }
                None => self.fail_all(violation.into()),
            },
        }
    }
}

async fn receive_loop(
    inner: Weak<BrokerInner>,
    mut receiver: PortReceiver,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = receiver.recv() => event,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            Some(ChannelEvent::Message(frame)) => inner.on_frame(frame),
            Some(ChannelEvent::Error(reason)) => inner.on_undecodable(&reason),
            None => {
                let err = Error::channel_closed("channel closed with requests outstanding");
                inner.fail_pending(err);
                break;
            }
        }
    }
    tracing::debug!("Broker receive loop stopped");
}

/// Unregisters the request if the submit future is dropped mid-flight.
struct PendingGuard<'a> {
    inner: &'a BrokerInner,
    id: RequestId,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.withdraw(self.id);
        }
    }
}

fn delivered(
    outcome: std::result::Result<Result<Value>, oneshot::error::RecvError>,
) -> Result<Value> {
    outcome.unwrap_or_else(|_| Err(Error::disposed("broker dropped before settlement")))
}

/// Await `fut` if present, otherwise never resolve.
async fn optional<F: Future>(fut: Option<F>) {
    match fut {
        Some(fut) => {
            fut.await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, Response};
    use crate::types::{ErrorKind, RemoteError};
    use serde_json::json;
    use tracing_test::traced_test;

    /// Broker on one end of a pair; the test plays the server on the other.
    fn adopted() -> (Arc<RequestBroker>, PortSender, PortReceiver) {
        let (client, server) = channel::pair();
        let broker = RequestBroker::new(client, BrokerConfig::default()).unwrap();
        let (tx, rx) = server.split();
        (Arc::new(broker), tx, rx)
    }

    async fn next_request(rx: &mut PortReceiver) -> Request {
        loop {
            match rx.recv().await {
                Some(ChannelEvent::Message(frame)) => {
                    if let Ok(Message::Request(req)) = Message::decode(frame) {
                        return req;
                    }
                }
                other => panic!("channel ended: {other:?}"),
            }
        }
    }

    fn spawn_submit(
        broker: &Arc<RequestBroker>,
        op: &'static str,
        options: SubmitOptions,
    ) -> JoinHandle<Result<Value>> {
        let broker = Arc::clone(broker);
        tokio::spawn(async move { broker.submit_with(op, vec![json!(1)], options).await })
    }

    fn respond(tx: &PortSender, id: RequestId, value: Value) {
        tx.post(Message::Response(Response::ok(id, value)).encode()).unwrap();
    }

    #[tokio::test]
    async fn test_response_resolves_matching_request() {
        let (broker, tx, mut rx) = adopted();
        let call = spawn_submit(&broker, "bodvrd", SubmitOptions::default());

        let req = next_request(&mut rx).await;
        assert_eq!(req.id, RequestId::new(1));
        assert_eq!(req.op, "bodvrd");
        respond(&tx, req.id, json!([6378.1]));

        assert_eq!(call.await.unwrap().unwrap(), json!([6378.1]));
        let stats = broker.stats();
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_submit_stays_pending_until_response_is_flushed() {
        let (broker, tx, mut rx) = adopted();
        let mut call = tokio_test::task::spawn(broker.submit("spkpos", vec![]));
        tokio_test::assert_pending!(call.poll());

        let req = next_request(&mut rx).await;
        tokio_test::assert_pending!(call.poll());
        respond(&tx, req.id, json!("done"));

        let outcome = loop {
            if let std::task::Poll::Ready(outcome) = call.poll() {
                break outcome;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(outcome.unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_out_of_order_responses_correlate_by_id() {
        let (broker, tx, mut rx) = adopted();
        let first = spawn_submit(&broker, "a", SubmitOptions::default());
        let a = next_request(&mut rx).await;
        let second = spawn_submit(&broker, "b", SubmitOptions::default());
        let b = next_request(&mut rx).await;

        respond(&tx, b.id, json!("b"));
        respond(&tx, a.id, json!("a"));

        assert_eq!(first.await.unwrap().unwrap(), json!("a"));
        assert_eq!(second.await.unwrap().unwrap(), json!("b"));
    }

    #[tokio::test]
    async fn test_remote_error_reconstructed() {
        let (broker, tx, mut rx) = adopted();
        let call = spawn_submit(&broker, "spkezr", SubmitOptions::default());
        let req = next_request(&mut rx).await;
        tx.post(
            Message::Response(Response::err(
                req.id,
                RemoteError::named("SpiceError", "SPICE(NOLOADEDFILES)"),
            ))
            .encode(),
        )
        .unwrap();

        match call.await.unwrap() {
            Err(Error::RemoteFailure(remote)) => {
                assert_eq!(remote.name.as_deref(), Some("SpiceError"));
                assert_eq!(remote.message, "SPICE(NOLOADEDFILES)");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispose_in_same_turn_as_response_wins() {
        let (broker, _tx, mut rx) = adopted();
        let call = spawn_submit(&broker, "et2utc", SubmitOptions::default());
        let req = next_request(&mut rx).await;

        // Response received and queued, then disposed before the flush tick.
        broker.inner.accept(req.id, Ok(json!("2000 JAN 01")));
        assert_eq!(broker.stats().queued, 1);
        broker.dispose();

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Disposed);
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_ids_ignored() {
        let (broker, tx, mut rx) = adopted();
        let call = spawn_submit(&broker, "x", SubmitOptions::default());
        let req = next_request(&mut rx).await;

        respond(&tx, RequestId::new(999), json!("stray"));
        respond(&tx, req.id, json!("first"));
        respond(&tx, req.id, json!("second"));

        assert_eq!(call.await.unwrap().unwrap(), json!("first"));

        // The broker is still healthy afterwards.
        let again = spawn_submit(&broker, "y", SubmitOptions::default());
        let req = next_request(&mut rx).await;
        assert_eq!(req.id, RequestId::new(2));
        respond(&tx, req.id, json!("ok"));
        assert_eq!(again.await.unwrap().unwrap(), json!("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_response_ignored() {
        let (broker, tx, mut rx) = adopted();
        let call = spawn_submit(
            &broker,
            "gfdist",
            SubmitOptions::with_timeout(Duration::from_millis(50)),
        );
        let req = next_request(&mut rx).await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_retryable());

        respond(&tx, req.id, json!("late"));
        tokio::task::yield_now().await;
        let stats = broker.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.resolved, 0);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn test_cancellation_rejects_locally() {
        let (broker, tx, mut rx) = adopted();
        let token = CancellationToken::new();
        let call = spawn_submit(&broker, "x", SubmitOptions::with_cancellation(token.clone()));
        let req = next_request(&mut rx).await;

        token.cancel();
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        respond(&tx, req.id, json!("ignored"));
        tokio::task::yield_now().await;
        assert_eq!(broker.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_precancelled_token_never_posts() {
        let (broker, _tx, mut rx) = adopted();
        let token = CancellationToken::new();
        token.cancel();

        let err = broker
            .submit_with("x", vec![], SubmitOptions::with_cancellation(token))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        broker.dispose();
        // Only the dispose notice went out.
        match rx.recv().await {
            Some(ChannelEvent::Message(frame)) => {
                assert_eq!(Message::decode(frame).unwrap(), Message::Dispose)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disposed_broker_rejects_before_checking_cancellation() {
        let (broker, _tx, _rx) = adopted();
        broker.dispose();
        let token = CancellationToken::new();
        token.cancel();

        let err = broker
            .submit_with("x", vec![], SubmitOptions::with_cancellation(token))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Disposed);
    }

    #[tokio::test]
    async fn test_dispose_counts_abandoned_requests_as_failed() {
        let (broker, _tx, mut rx) = adopted();
        let call = spawn_submit(&broker, "x", SubmitOptions::default());
        next_request(&mut rx).await;

        broker.dispose();
        assert_eq!(call.await.unwrap().unwrap_err().kind(), ErrorKind::Disposed);
        let stats = broker.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_dispose_rejects_pending_and_later_submits() {
        let (broker, _tx, mut rx) = adopted();
        let call = spawn_submit(&broker, "x", SubmitOptions::default());
        next_request(&mut rx).await;

        broker.dispose();
        assert_eq!(call.await.unwrap().unwrap_err().kind(), ErrorKind::Disposed);
        assert_eq!(
            broker.submit("y", vec![]).await.unwrap_err().kind(),
            ErrorKind::Disposed
        );
    }

    #[tokio::test]
    async fn test_double_dispose_is_noop() {
        let (broker, _tx, mut rx) = adopted();
        broker.dispose();
        let after_first = broker.stats();
        broker.dispose();
        assert_eq!(broker.stats(), after_first);
        assert!(broker.is_disposed());

        // Exactly one dispose notice.
        assert!(matches!(rx.recv().await, Some(ChannelEvent::Message(_))));
        broker.inner.sender.close();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_adopted_channel_left_open_on_dispose() {
        let (broker, tx, _rx) = adopted();
        broker.dispose();
        assert!(!tx.is_closed());
    }

    #[tokio::test]
    async fn test_terminate_on_dispose_closes_channel() {
        let (client, server) = channel::pair();
        let broker = RequestBroker::new(
            client,
            BrokerConfig {
                terminate_on_dispose: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        broker.dispose();
        assert!(server.sender().is_closed());
    }

    #[tokio::test]
    async fn test_undecodable_frame_rejects_everything() {
        let (client, server) = channel::pair();
        let broker = Arc::new(RequestBroker::new(client, BrokerConfig::default()).unwrap());
        let (tx, mut rx) = server.split();

        let first = spawn_submit(&broker, "a", SubmitOptions::default());
        next_request(&mut rx).await;
        let second = spawn_submit(&broker, "b", SubmitOptions::default());
        next_request(&mut rx).await;

        tx.post_event(ChannelEvent::Error("bad frame".into())).unwrap();

        assert_eq!(first.await.unwrap().unwrap_err().kind(), ErrorKind::ProtocolViolation);
        assert_eq!(second.await.unwrap().unwrap_err().kind(), ErrorKind::ProtocolViolation);
    }

    #[tokio::test]
    async fn test_undecodable_frame_rejects_queued_settlements() {
        let (broker, _tx, mut rx) = adopted();
        let call = spawn_submit(&broker, "spkezr", SubmitOptions::default());
        let req = next_request(&mut rx).await;

        // Response received and queued, then the channel turns fatal before
        // the flush tick.
        broker.inner.accept(req.id, Ok(json!([1.0, 2.0, 3.0])));
        assert_eq!(broker.stats().queued, 1);
        broker.inner.on_undecodable("truncated frame");

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        let stats = broker.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.resolved, 0);
    }

    #[tokio::test]
    async fn test_malformed_response_rejects_only_its_request() {
        let (broker, tx, mut rx) = adopted();
        let bad = spawn_submit(&broker, "a", SubmitOptions::default());
        let a = next_request(&mut rx).await;
        let good = spawn_submit(&broker, "b", SubmitOptions::default());
        let b = next_request(&mut rx).await;

        tx.post(json!({"type": "response", "id": a.id, "ok": true})).unwrap();
        respond(&tx, b.id, json!(2));

        assert_eq!(bad.await.unwrap().unwrap_err().kind(), ErrorKind::ProtocolViolation);
        assert_eq!(good.await.unwrap().unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_channel_close_is_fatal() {
        let (broker, tx, mut rx) = adopted();
        let call = spawn_submit(&broker, "a", SubmitOptions::default());
        next_request(&mut rx).await;

        tx.close();
        assert_eq!(call.await.unwrap().unwrap_err().kind(), ErrorKind::ChannelClosed);
    }

    #[tokio::test]
    async fn test_channel_close_delivers_responses_already_received() {
        let (broker, tx, mut rx) = adopted();
        let answered = spawn_submit(&broker, "a", SubmitOptions::default());
        let a = next_request(&mut rx).await;
        let unanswered = spawn_submit(&broker, "b", SubmitOptions::default());
        next_request(&mut rx).await;

        respond(&tx, a.id, json!("a-done"));
        tx.close();

        assert_eq!(answered.await.unwrap().unwrap(), json!("a-done"));
        assert_eq!(
            unanswered.await.unwrap().unwrap_err().kind(),
            ErrorKind::ChannelClosed
        );
    }

    #[tokio::test]
    async fn test_send_failure_rejects_only_that_request() {
        let (client, server) = channel::pair();
        let broker = RequestBroker::new(client, BrokerConfig::default()).unwrap();
        let (_tx, rx) = server.split();
        drop(rx);

        let err = broker.submit("a", vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Send);
        assert_eq!(broker.stats().pending, 0);
        assert!(!broker.is_disposed());
    }

    #[tokio::test]
    async fn test_dropped_submit_unregisters() {
        let (broker, _tx, mut rx) = adopted();
        let call = spawn_submit(&broker, "a", SubmitOptions::default());
        next_request(&mut rx).await;
        assert_eq!(broker.stats().pending, 1);

        call.abort();
        let _ = call.await;
        assert_eq!(broker.stats().pending, 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unknown_response_is_logged() {
        let (broker, _tx, _rx) = adopted();
        broker
            .inner
            .on_frame(Message::Response(Response::ok(RequestId::new(42), json!(null))).encode());
        assert!(logs_contain("Ignoring response for unknown request 42"));
    }
}
