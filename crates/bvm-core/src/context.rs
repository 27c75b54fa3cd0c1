//! Per-connection request correlation and session state.
//!
//! Every connection gets one [`RequestContext`]. Outgoing requests take an ID
//! from the context's counter and park a single-use [`ResponseSlot`] under it;
//! the response handler later resolves the slot by the reply's request ID.

use crate::connection::{Connection, Delivery};
use crate::dtos;
use crate::envelope::{Envelope, Payload, RequestId};
use crate::registry::TypeRegistry;
use crate::{BvmError, Result};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Outbound side of a connection as seen by handlers.
#[async_trait::async_trait]
pub trait EnvelopeSender: Send + Sync + 'static {
    async fn send(&self, envelope: Envelope) -> Delivery;

    fn close(&self);
}

#[async_trait::async_trait]
impl EnvelopeSender for Connection {
    async fn send(&self, envelope: Envelope) -> Delivery {
        Connection::send(self, envelope).await
    }

    fn close(&self) {
        Connection::close(self)
    }
}

/// Future resolving to the response for one outgoing request.
///
/// Dropping the slot before its response arrives removes the parked entry, so
/// callers may race it against a timer.
#[must_use = "a ResponseSlot does nothing unless awaited"]
pub struct ResponseSlot {
    request_id: RequestId,
    rx: oneshot::Receiver<Envelope>,
    pending: Weak<Mutex<PendingRequests>>,
}

impl ResponseSlot {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

impl Future for ResponseSlot {
    type Output = Result<Envelope>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let request_id = self.request_id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| BvmError::Abandoned(request_id)))
    }
}

impl Drop for ResponseSlot {
    fn drop(&mut self) {
        let Some(pending) = self.pending.upgrade() else {
            return;
        };
        let mut pending = lock_pending(&pending);
        if let Some(slots) = pending.slots.as_mut() {
            if slots.remove(&self.request_id).is_some() {
                trace!("Request {} dropped before its response", self.request_id);
            }
        }
    }
}

/// A parked slot taken out of the pending map by [`RequestContext::resolve`].
pub struct PendingResponse {
    request_id: RequestId,
    tx: oneshot::Sender<Envelope>,
}

impl PendingResponse {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Hand the response to the waiting caller. Returns `false` if the caller
    /// stopped waiting.
    pub fn deliver(self, envelope: Envelope) -> bool {
        self.tx.send(envelope).is_ok()
    }
}

struct PendingRequests {
    next_id: RequestId,
    /// `None` once the connection has closed.
    slots: Option<HashMap<RequestId, oneshot::Sender<Envelope>>>,
}

fn lock_pending(pending: &Mutex<PendingRequests>) -> MutexGuard<'_, PendingRequests> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

type SessionValue = Box<dyn Any + Send + Sync>;

/// Correlation and session state for one connection.
pub struct RequestContext {
    sender: Arc<dyn EnvelopeSender>,
    registry: Arc<TypeRegistry>,
    pending: Arc<Mutex<PendingRequests>>,
    session: RwLock<HashMap<String, SessionValue>>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.pending();
        f.debug_struct("RequestContext")
            .field("next_id", &pending.next_id)
            .field("closed", &pending.slots.is_none())
            .finish()
    }
}

impl RequestContext {
    pub fn new(sender: Arc<dyn EnvelopeSender>, registry: Arc<TypeRegistry>) -> Self {
        Self {
            sender,
            registry,
            pending: Arc::new(Mutex::new(PendingRequests {
                next_id: 0,
                slots: Some(HashMap::new()),
            })),
            session: RwLock::new(HashMap::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingRequests> {
        lock_pending(&self.pending)
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Allocate the next request ID and park a response slot under it.
    ///
    /// After the connection closed the returned slot is already abandoned.
    pub fn new_request(&self) -> (RequestId, ResponseSlot) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending();
        let request_id = pending.next_id;
        pending.next_id += 1;
        if let Some(slots) = pending.slots.as_mut() {
            slots.insert(request_id, tx);
        }
        drop(pending);

        trace!("Allocated request {}", request_id);
        let slot = ResponseSlot {
            request_id,
            rx,
            pending: Arc::downgrade(&self.pending),
        };
        (request_id, slot)
    }

    /// Remove and return the slot parked under `request_id`.
    pub fn resolve(&self, request_id: RequestId) -> Option<PendingResponse> {
        let tx = self.pending().slots.as_mut()?.remove(&request_id)?;
        Some(PendingResponse { request_id, tx })
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending().slots.as_ref().map_or(0, HashMap::len)
    }

    /// Abandon every open slot. Called once the connection has gone away.
    pub fn on_close(&self) {
        let abandoned = self.pending().slots.take();
        if let Some(slots) = abandoned {
            if !slots.is_empty() {
                debug!("Abandoning {} pending requests", slots.len());
            }
        }
    }

    /// Store a session value, replacing any previous one under `key`.
    pub fn set<T>(&self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), Box::new(value));
    }

    /// Read a session value. `None` if absent or stored with another type.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Any + Clone,
    {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Remove a session value. Returns whether anything was stored.
    pub fn remove(&self, key: &str) -> bool {
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Queue an envelope on this context's connection.
    pub async fn send(&self, envelope: Envelope) -> Delivery {
        self.sender.send(envelope).await
    }

    /// Close this context's connection.
    pub fn close(&self) {
        self.sender.close();
    }

    /// Send `payload` as the response to `request_id` and wait until written.
    pub async fn reply<T: Payload>(&self, request_id: RequestId, payload: T) -> Result<()> {
        let envelope = self.registry.envelope(request_id, payload)?;
        self.send(envelope).await.await
    }

    /// Report `error` to the peer as an `Error` payload.
    pub async fn reply_error(&self, request_id: RequestId, error: &BvmError) -> Result<()> {
        self.reply(request_id, dtos::Error::from(error)).await
    }

    /// Send a request and wait for its response.
    ///
    /// An `Error` reply is returned as [`BvmError::Remote`].
    pub async fn call<T: Payload>(&self, payload: T) -> Result<Envelope> {
        let (request_id, slot) = self.new_request();

        let envelope = match self.registry.envelope(request_id, payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.resolve(request_id);
                return Err(e);
            }
        };
        if let Err(e) = self.send(envelope).await.await {
            self.resolve(request_id);
            return Err(e);
        }

        let response = slot.await?;
        if let Some(error) = response.payload_as::<dtos::Error>() {
            return Err(BvmError::Remote {
                subsystem: error.subsystem.clone(),
                details: error.details.clone(),
            });
        }
        Ok(response)
    }
}
