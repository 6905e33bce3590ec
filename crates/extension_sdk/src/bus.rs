//! Request/response correlation and event pub/sub over one envelope channel.
//!
//! The same [`MessageBus`] runs on both sides of a session boundary. The host
//! side wires its outbound sink to the Session Manager, the context side wires
//! it to whatever carries envelopes out of the execution context. Inbound
//! traffic is pushed in with [`MessageBus::dispatch`] (or [`MessageBus::pump`]).
//!
//! A bus is owned by exactly one execution context; there is no process-wide
//! instance. Clones share state.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use dashmap::{mapref::entry::Entry, DashMap};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::envelope::{Envelope, Event, Request, Response, ACTION_NOT_FOUND};

/// What a subscriber sees. `request_id` is set when the traffic is a request
/// the subscriber may answer with [`MessageBus::respond`].
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub action: String,
    pub payload: Value,
    pub request_id: Option<String>,
}

pub type Callback = Arc<dyn Fn(&Incoming) + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BusError {
    #[error("request `{action}` timed out after {timeout_ms} ms")]
    Timeout { action: String, timeout_ms: u64 },
    #[error("request `{action}` failed ({code}): {message}")]
    Remote {
        action: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("message bus is closed")]
    Closed,
    #[error("response to `{action}` could not be decoded: {reason}")]
    Decode { action: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    /// Reject the future when the response carries an error. When unset the
    /// future resolves with the payload, or with the error body if there is no
    /// payload.
    pub reject_on_error: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self { timeout: None, reject_on_error: true }
    }
}

impl RequestOptions {
    pub fn timeout_ms(ms: u64) -> Self {
        Self { timeout: Some(Duration::from_millis(ms)), ..Default::default() }
    }

    pub fn reject_on_error(mut self, reject: bool) -> Self {
        self.reject_on_error = reject;
        self
    }
}

struct PendingRequest {
    action: String,
    reject_on_error: bool,
    settle: oneshot::Sender<Result<Value, BusError>>,
    timeout: Option<JoinHandle<()>>,
}

struct Registration {
    id: u64,
    callback: Callback,
}

struct BusInner {
    outbound: mpsc::UnboundedSender<Envelope>,
    pending: DashMap<String, PendingRequest>,
    subscriptions: DashMap<String, Vec<Registration>>,
    next_registration: AtomicU64,
    closed: AtomicBool,
}

impl BusInner {
    /// Removes the pending entry and settles it. Whoever removes the entry
    /// settles it, so a request can never be settled twice.
    fn settle(&self, id: &str, outcome: impl FnOnce(&PendingRequest) -> Result<Value, BusError>) -> bool {
        let Some((_, pending)) = self.pending.remove(id) else {
            return false;
        };
        if let Some(timer) = &pending.timeout {
            timer.abort();
        }
        let result = outcome(&pending);
        let _ = pending.settle.send(result);
        true
    }
}

#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("pending", &self.inner.pending.len())
            .field("subscribed_types", &self.inner.subscriptions.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MessageBus {
    pub fn new(outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                outbound,
                pending: DashMap::new(),
                subscriptions: DashMap::new(),
                next_registration: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Bus plus the receiving end of its outbound channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    // ---------------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------------

    /// Send a request and wait for its response.
    ///
    /// A timeout only abandons local waiting; the remote side is not told.
    pub async fn request(&self, action: &str, payload: Value, options: RequestOptions) -> Result<Value, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let request = Request::new(action, payload);
        let id = request.id.clone();
        let (settle, settled) = oneshot::channel();

        self.inner.pending.insert(
            id.clone(),
            PendingRequest {
                action: action.to_string(),
                reject_on_error: options.reject_on_error,
                settle,
                timeout: None,
            },
        );
        let guard = PendingGuard { bus: Arc::downgrade(&self.inner), id: id.clone() };
        // `close` may have drained the table between the check above and the
        // insert.
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        if let Some(after) = options.timeout {
            let timer = spawn_timeout(Arc::downgrade(&self.inner), id.clone(), action.to_string(), after);
            match self.inner.pending.get_mut(&id) {
                Some(mut entry) => entry.timeout = Some(timer),
                None => timer.abort(),
            }
        }

        if self.inner.outbound.send(request.into()).is_err() {
            debug!(action, request_id = %id, "outbound channel closed before request was sent");
            return Err(BusError::Closed);
        }

        let result = settled.await.unwrap_or(Err(BusError::Closed));
        drop(guard);
        result
    }

    /// [`request`](Self::request) and deserialize the payload.
    pub async fn request_as<T: DeserializeOwned>(&self, action: &str, payload: Value, options: RequestOptions) -> Result<T, BusError> {
        let value = self.request(action, payload, options).await?;
        serde_json::from_value(value).map_err(|err| BusError::Decode { action: action.to_string(), reason: err.to_string() })
    }

    /// Fire-and-forget event.
    pub fn emit(&self, action: &str, payload: Value) {
        if self.inner.outbound.send(Event::new(action, payload).into()).is_err() {
            debug!(action, "outbound channel closed, event dropped");
        }
    }

    pub fn respond(&self, request_id: &str, payload: Value) {
        if self.inner.outbound.send(Response::success(request_id, payload).into()).is_err() {
            debug!(request_id, "outbound channel closed, response dropped");
        }
    }

    pub fn respond_error(&self, request_id: &str, code: i64, message: impl Into<String>) {
        if self.inner.outbound.send(Response::fail(request_id, code, message, None).into()).is_err() {
            debug!(request_id, "outbound channel closed, error response dropped");
        }
    }

    // ---------------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------------

    pub fn subscribe<F>(&self, action: &str, callback: F) -> Subscription
    where
        F: Fn(&Incoming) + Send + Sync + 'static,
    {
        let id = self.inner.next_registration.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscriptions
            .entry(action.to_string())
            .or_default()
            .push(Registration { id, callback: Arc::new(callback) });
        Subscription { bus: Arc::downgrade(&self.inner), action: action.to_string(), id }
    }

    /// Makes `callback` invocable by the host through an opaque handler id.
    /// The host invokes it by emitting an event whose action is the id.
    pub fn register_handler<F>(&self, callback: F) -> HandlerRegistration
    where
        F: Fn(&Incoming) + Send + Sync + 'static,
    {
        let id = HandlerId(format!("handler:{}", Uuid::new_v4()));
        let subscription = self.subscribe(id.as_str(), callback);
        HandlerRegistration { id, subscription }
    }

    pub fn subscription_count(&self, action: &str) -> usize {
        self.inner.subscriptions.get(action).map(|regs| regs.len()).unwrap_or(0)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    pub fn dispatch(&self, envelope: Envelope) {
        match envelope {
            Envelope::Response(response) => self.settle_response(response),
            Envelope::Event(event) => {
                let action = event.action.clone();
                let delivered = self.fan_out(Incoming { action: event.action, payload: event.payload, request_id: None });
                if delivered == 0 {
                    debug!(action = %action, "event without subscribers");
                }
            }
            Envelope::Request(request) => {
                let id = request.id.clone();
                let action = request.action.clone();
                let delivered = self.fan_out(Incoming {
                    action: request.action,
                    payload: request.payload,
                    request_id: Some(request.id),
                });
                if delivered == 0 {
                    warn!(action = %action, request_id = %id, "no subscriber for request");
                    self.respond_error(&id, ACTION_NOT_FOUND, format!("Action not found: {action}"));
                }
            }
        }
    }

    /// Dispatch everything from `inbound` until it closes, then close the bus.
    pub async fn pump(&self, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = inbound.recv().await {
            self.dispatch(envelope);
        }
        self.close();
    }

    /// Rejects every outstanding request with [`BusError::Closed`]; later
    /// requests fail immediately.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.inner.settle(&id, |_| Err(BusError::Closed));
        }
    }

    fn settle_response(&self, response: Response) {
        let Response { id, payload, error, .. } = response;
        let settled = self.inner.settle(&id, |pending| match error {
            Some(err) if pending.reject_on_error => Err(BusError::Remote {
                action: pending.action.clone(),
                code: err.code,
                message: err.message,
                data: err.data,
            }),
            Some(err) => Ok(payload.unwrap_or_else(|| serde_json::to_value(err).unwrap_or(Value::Null))),
            None => Ok(payload.unwrap_or(Value::Null)),
        });
        if !settled {
            // Expected after a timeout already rejected the request.
            debug!(request_id = %id, "dropping response for unknown request");
        }
    }

    fn fan_out(&self, incoming: Incoming) -> usize {
        // Clone the callbacks out so none run while the map shard is locked;
        // a callback may subscribe or unsubscribe.
        let callbacks: Vec<Callback> = match self.inner.subscriptions.get(&incoming.action) {
            Some(regs) => regs.iter().map(|r| r.callback.clone()).collect(),
            None => return 0,
        };
        for callback in &callbacks {
            callback(&incoming);
        }
        callbacks.len()
    }
}

fn spawn_timeout(bus: Weak<BusInner>, id: String, action: String, after: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let Some(bus) = bus.upgrade() else { return };
        let timeout_ms = after.as_millis() as u64;
        if bus.settle(&id, |_| Err(BusError::Timeout { action: action.clone(), timeout_ms })) {
            warn!(action = %action, request_id = %id, timeout_ms, "request timed out");
        }
    })
}

/// Drops the pending entry if the caller abandons the request future.
struct PendingGuard {
    bus: Weak<BusInner>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            if let Some((_, pending)) = bus.pending.remove(&self.id) {
                if let Some(timer) = pending.timeout {
                    timer.abort();
                }
            }
        }
    }
}

/// Handle returned by [`MessageBus::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<BusInner>,
    action: String,
    id: u64,
}

impl Subscription {
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Removes exactly this registration. Returns `false` if it was already
    /// gone. The type entry is pruned once its last registration leaves.
    pub fn unsubscribe(&self) -> bool {
        let Some(bus) = self.bus.upgrade() else {
            return false;
        };
        match bus.subscriptions.entry(self.action.clone()) {
            Entry::Occupied(mut entry) => {
                let before = entry.get().len();
                entry.get_mut().retain(|r| r.id != self.id);
                let removed = entry.get().len() != before;
                if entry.get().is_empty() {
                    entry.remove();
                }
                removed
            }
            Entry::Vacant(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId(String);

impl HandlerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub struct HandlerRegistration {
    id: HandlerId,
    subscription: Subscription,
}

impl HandlerRegistration {
    pub fn id(&self) -> &HandlerId {
        &self.id
    }

    pub fn unregister(&self) -> bool {
        self.subscription.unsubscribe()
    }
}

impl Drop for HandlerRegistration {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}
