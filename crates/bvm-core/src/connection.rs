//! One live transport connection.
//!
//! Two tasks serve each connection:
//!
//! - the **read task** (run by [`Connection::serve`] itself) reads frames under
//!   a liveness deadline, answers pings and decodes messages onto the inbound
//!   channel in arrival order;
//! - the **write task** is the only writer. It drains the bounded outbound
//!   queue in FIFO order, sends keepalive pings and performs teardown.
//!
//! The tasks coordinate through the outbound queue and a `watch` channel
//! carrying [`ConnectionState`]. `close()` only flips that state, so it never
//! blocks and is safe to call from handlers.

use crate::codec::MessageCodec;
use crate::config::ConnectionConfig;
use crate::envelope::Envelope;
use crate::transport::{Frame, FrameSink, FrameSource};
use crate::{BvmError, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

/// Lifecycle of a connection. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Created,
    Serving,
    Closing,
    Closed,
}

type ClosedCallback = Box<dyn FnOnce() + Send>;

struct OutboundFrame {
    frame: Frame,
    done: Option<oneshot::Sender<Result<()>>>,
}

impl OutboundFrame {
    fn resolve(mut self, result: Result<()>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }
}

struct ServeParts {
    source: Box<dyn FrameSource>,
    sink: Box<dyn FrameSink>,
    queue: mpsc::Receiver<OutboundFrame>,
    inbound: mpsc::Sender<Envelope>,
}

/// Completion of a single [`Connection::send`].
///
/// Resolves to `Ok(())` once the frame is written, to the transport or
/// encoding error, or to `ConnectionClosed` if the connection went away first.
#[must_use = "a Delivery does nothing unless awaited"]
pub struct Delivery {
    inner: DeliveryInner,
}

enum DeliveryInner {
    Ready(Option<Result<()>>),
    Pending(oneshot::Receiver<Result<()>>),
}

impl Delivery {
    /// An already resolved delivery.
    pub fn ready(result: Result<()>) -> Self {
        Self {
            inner: DeliveryInner::Ready(Some(result)),
        }
    }

    fn pending(rx: oneshot::Receiver<Result<()>>) -> Self {
        Self {
            inner: DeliveryInner::Pending(rx),
        }
    }
}

impl Future for Delivery {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            DeliveryInner::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(BvmError::ConnectionClosed)))
            }
            DeliveryInner::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or(Err(BvmError::ConnectionClosed))),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait until the observed state reaches `target` or the sender goes away.
async fn reached(state: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
    loop {
        if *state.borrow_and_update() >= target {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

/// A transport connection with a bounded outbound queue.
pub struct Connection {
    peer: String,
    codec: Arc<dyn MessageCodec>,
    config: ConnectionConfig,
    queue: mpsc::Sender<OutboundFrame>,
    close_requested: AtomicBool,
    state: watch::Sender<ConnectionState>,
    on_closed: Mutex<Option<Vec<ClosedCallback>>>,
    parts: Mutex<Option<ServeParts>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Create a connection over the given transport halves.
    ///
    /// Returns the connection and the receiver of decoded inbound envelopes.
    /// Nothing is read or written until [`serve`](Self::serve) runs.
    pub fn new<Src, Snk>(
        source: Src,
        sink: Snk,
        codec: Arc<dyn MessageCodec>,
        config: ConnectionConfig,
        peer: impl Into<String>,
    ) -> (Arc<Self>, mpsc::Receiver<Envelope>)
    where
        Src: FrameSource,
        Snk: FrameSink,
    {
        let (queue_tx, queue_rx) = mpsc::channel(config.write_queue_size.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.read_queue_size.max(1));
        let (state, _) = watch::channel(ConnectionState::Created);

        let connection = Arc::new(Self {
            peer: peer.into(),
            codec,
            config,
            queue: queue_tx,
            close_requested: AtomicBool::new(false),
            state,
            on_closed: Mutex::new(Some(Vec::new())),
            parts: Mutex::new(Some(ServeParts {
                source: Box::new(source),
                sink: Box::new(sink),
                queue: queue_rx,
                inbound: inbound_tx,
            })),
        });

        (connection, inbound_rx)
    }

    /// Human-readable peer description used in logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until teardown has completed.
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        reached(&mut state, ConnectionState::Closed).await;
    }

    /// Encode `envelope` and queue it for writing.
    ///
    /// Waits only while the outbound queue is full. The returned [`Delivery`]
    /// resolves once the frame has actually been written.
    pub async fn send(&self, envelope: Envelope) -> Delivery {
        let bytes = match self.codec.marshal(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("{}: failed to encode {}: {}", self.peer, envelope, e);
                return Delivery::ready(Err(e));
            }
        };
        trace!("{}: queueing {}", self.peer, envelope);

        let frame = if self.codec.is_text() {
            match String::from_utf8(bytes) {
                Ok(text) => Frame::Text(text),
                Err(e) => Frame::Binary(e.into_bytes()),
            }
        } else {
            Frame::Binary(bytes)
        };
        self.enqueue(frame).await
    }

    async fn enqueue(&self, frame: Frame) -> Delivery {
        if self.close_requested.load(Ordering::Acquire) {
            return Delivery::ready(Err(BvmError::ConnectionClosed));
        }

        let (done_tx, done_rx) = oneshot::channel();
        let item = OutboundFrame {
            frame,
            done: Some(done_tx),
        };
        let mut state = self.state.subscribe();

        tokio::select! {
            biased;
            _ = reached(&mut state, ConnectionState::Closing) => {
                Delivery::ready(Err(BvmError::ConnectionClosed))
            }
            result = self.queue.send(item) => match result {
                Ok(()) => Delivery::pending(done_rx),
                Err(_) => Delivery::ready(Err(BvmError::ConnectionClosed)),
            },
        }
    }

    /// Queue a control frame without waiting; dropped if the queue is full.
    fn try_enqueue(&self, frame: Frame) {
        if self.close_requested.load(Ordering::Acquire) {
            return;
        }
        if self
            .queue
            .try_send(OutboundFrame { frame, done: None })
            .is_err()
        {
            trace!("{}: outbound queue full, skipping control frame", self.peer);
        }
    }

    /// Request teardown. Idempotent and non-blocking.
    pub fn close(&self) {
        if self.close_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("{}: close requested", self.peer);

        // Never served: nothing else will tear the transport down.
        let unserved = lock(&self.parts).take();
        if let Some(parts) = unserved {
            drop(parts);
            self.state.send_replace(ConnectionState::Closed);
            self.fire_on_closed();
            return;
        }

        self.state.send_if_modified(|state| {
            if *state < ConnectionState::Closing {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
    }

    /// Register a callback fired once teardown completes.
    ///
    /// Fires immediately if the connection is already closed.
    pub fn on_closed<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callbacks = lock(&self.on_closed);
        match callbacks.as_mut() {
            Some(pending) => pending.push(Box::new(callback)),
            None => {
                drop(callbacks);
                callback();
            }
        }
    }

    fn fire_on_closed(&self) {
        let callbacks = lock(&self.on_closed).take();
        for callback in callbacks.into_iter().flatten() {
            callback();
        }
    }

    /// Serve the connection until it is torn down.
    ///
    /// Spawns the write task, runs the read task on the caller and returns
    /// once both have finished.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let parts = lock(&self.parts).take();
        let Some(parts) = parts else {
            return Err(if self.close_requested.load(Ordering::Acquire) {
                BvmError::ConnectionClosed
            } else {
                BvmError::AlreadyServing
            });
        };

        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Created {
                *state = ConnectionState::Serving;
                true
            } else {
                false
            }
        });
        debug!("{}: serving", self.peer);

        let writer = tokio::spawn(Arc::clone(&self).write_loop(parts.sink, parts.queue));
        self.read_loop(parts.source, parts.inbound).await;

        if let Err(e) = writer.await {
            error!("{}: write task failed: {}", self.peer, e);
        }
        debug!("{}: connection finished", self.peer);
        Ok(())
    }

    async fn read_loop(&self, mut source: Box<dyn FrameSource>, inbound: mpsc::Sender<Envelope>) {
        let mut state = self.state.subscribe();
        let mut deadline = Instant::now() + self.config.pong_timeout;

        loop {
            let next = tokio::select! {
                _ = reached(&mut state, ConnectionState::Closed) => break,
                next = timeout_at(deadline, source.next_frame()) => next,
            };

            let frame = match next {
                Err(_) => {
                    warn!(
                        "{}: no keepalive within {:?}, closing",
                        self.peer, self.config.pong_timeout
                    );
                    break;
                }
                Ok(None) => {
                    debug!("{}: peer disconnected", self.peer);
                    break;
                }
                Ok(Some(Err(e))) => {
                    debug!("{}: read failed: {}", self.peer, e);
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            let bytes = match frame {
                Frame::Ping(data) => {
                    deadline = Instant::now() + self.config.pong_timeout;
                    self.try_enqueue(Frame::Pong(data));
                    continue;
                }
                Frame::Pong(_) => {
                    deadline = Instant::now() + self.config.pong_timeout;
                    continue;
                }
                Frame::Close => {
                    debug!("{}: peer sent close", self.peer);
                    break;
                }
                Frame::Text(text) => text.into_bytes(),
                Frame::Binary(data) => data,
            };

            let envelope = match self.codec.unmarshal(&bytes) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("{}: dropping undecodable message: {}", self.peer, e);
                    continue;
                }
            };
            trace!("{}: received {}", self.peer, envelope);

            let delivered = tokio::select! {
                _ = reached(&mut state, ConnectionState::Closed) => break,
                result = inbound.send(envelope) => result.is_ok(),
            };
            if !delivered {
                debug!("{}: inbound receiver gone", self.peer);
                break;
            }
        }

        self.close();
    }

    async fn write_loop(
        self: Arc<Self>,
        mut sink: Box<dyn FrameSink>,
        mut queue: mpsc::Receiver<OutboundFrame>,
    ) {
        let mut state = self.state.subscribe();
        let mut ticker = interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut healthy = true;

        loop {
            tokio::select! {
                _ = reached(&mut state, ConnectionState::Closing) => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.write(sink.as_mut(), Frame::Ping(Vec::new())).await {
                        warn!("{}: keepalive ping failed: {}", self.peer, e);
                        healthy = false;
                        break;
                    }
                }
                item = queue.recv() => {
                    let Some(mut item) = item else { break };
                    let frame = std::mem::replace(&mut item.frame, Frame::Close);
                    let result = self.write(sink.as_mut(), frame).await;
                    if let Err(e) = &result {
                        warn!("{}: write failed: {}", self.peer, e);
                        healthy = false;
                    }
                    item.resolve(result);
                    if !healthy {
                        break;
                    }
                }
            }
        }

        self.close();
        queue.close();

        let mut dropped = 0usize;
        while let Some(mut item) = queue.recv().await {
            if healthy {
                let frame = std::mem::replace(&mut item.frame, Frame::Close);
                let result = self.write(sink.as_mut(), frame).await;
                healthy = result.is_ok();
                item.resolve(result);
            } else {
                dropped += 1;
                item.resolve(Err(BvmError::ConnectionClosed));
            }
        }
        if dropped > 0 {
            debug!("{}: dropped {} queued frames", self.peer, dropped);
        }

        if healthy {
            if let Err(e) = self.write(sink.as_mut(), Frame::Close).await {
                debug!("{}: failed to send close frame: {}", self.peer, e);
            }
        }
        if let Err(e) = sink.shutdown().await {
            debug!("{}: transport shutdown failed: {}", self.peer, e);
        }

        self.state.send_replace(ConnectionState::Closed);
        debug!("{}: closed", self.peer);
        self.fire_on_closed();
    }

    async fn write(&self, sink: &mut dyn FrameSink, frame: Frame) -> Result<()> {
        match timeout(self.config.write_timeout, sink.send_frame(frame)).await {
            Ok(result) => result,
            Err(_) => Err(BvmError::Timeout(self.config.write_timeout)),
        }
    }
}
