//! Message dispatch by type tag.
//!
//! The router is assembled during wiring (controllers add their handlers
//! through [`HandlerExporter`]) and then shared as `Arc<Router>` by every
//! connection. Each connection gets one dispatch task, so its messages are
//! handled strictly in arrival order while different connections run in
//! parallel.

use crate::context::{EnvelopeSender, RequestContext};
use crate::envelope::{Envelope, MessageType};
use crate::registry::TypeRegistry;
use crate::{BvmError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// Boxed message handler.
pub type Handler =
    Arc<dyn Fn(Arc<RequestContext>, Envelope) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handler run once when a connection goes away.
pub type CloseHandler = Arc<dyn Fn(&RequestContext) + Send + Sync>;

/// What to do with a decoded message no handler is registered for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownMessagePolicy {
    /// Log and drop.
    #[default]
    Drop,
    /// Log and answer with an `Error` payload.
    ReplyError,
}

/// Something that registers its handlers on a router.
pub trait HandlerExporter {
    fn export_handlers(self: &Arc<Self>, router: &mut Router);
}

pub struct Router {
    registry: Arc<TypeRegistry>,
    handlers: HashMap<MessageType, Handler>,
    on_close: Vec<CloseHandler>,
    unknown_policy: UnknownMessagePolicy,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<&MessageType> = self.handlers.keys().collect();
        tags.sort_unstable();
        f.debug_struct("Router")
            .field("handlers", &tags)
            .field("on_close", &self.on_close.len())
            .field("unknown_policy", &self.unknown_policy)
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

impl Router {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            handlers: HashMap::new(),
            on_close: Vec::new(),
            unknown_policy: UnknownMessagePolicy::default(),
        }
    }

    pub fn with_unknown_policy(mut self, policy: UnknownMessagePolicy) -> Self {
        self.unknown_policy = policy;
        self
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn has_handler(&self, message_type: MessageType) -> bool {
        self.handlers.contains_key(&message_type)
    }

    /// Register the handler for `message_type`.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for that tag.
    pub fn add_handler<F, Fut>(&mut self, message_type: MessageType, handler: F)
    where
        F: Fn(Arc<RequestContext>, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if let Err(e) = self.try_add_handler(message_type, handler) {
            panic!("Invalid router configuration: {}", e);
        }
    }

    pub fn try_add_handler<F, Fut>(&mut self, message_type: MessageType, handler: F) -> Result<()>
    where
        F: Fn(Arc<RequestContext>, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.handlers.contains_key(&message_type) {
            return Err(BvmError::DuplicateHandler(message_type));
        }
        if !self.registry.contains(message_type) {
            warn!(
                "Handler registered for message type {} which the registry cannot decode",
                message_type
            );
        }

        let handler: Handler = Arc::new(move |ctx, envelope| handler(ctx, envelope).boxed());
        self.handlers.insert(message_type, handler);
        Ok(())
    }

    /// Register a handler run when any connection closes, in registration order.
    pub fn add_on_close_handler<F>(&mut self, handler: F)
    where
        F: Fn(&RequestContext) + Send + Sync + 'static,
    {
        self.on_close.push(Arc::new(handler));
    }

    /// Run the handler for one envelope.
    ///
    /// Handler errors are logged. Panics are caught and logged too, so a
    /// broken handler cannot take the dispatch task down.
    pub async fn dispatch(&self, ctx: Arc<RequestContext>, envelope: Envelope) {
        let message_type = envelope.message_type();
        let request_id = envelope.request_id;

        let Some(handler) = self.handlers.get(&message_type).cloned() else {
            warn!(
                "No handler for message type {} (request {})",
                message_type, request_id
            );
            if self.unknown_policy == UnknownMessagePolicy::ReplyError {
                let err = BvmError::UnknownMessageType(message_type);
                if let Err(e) = ctx.reply_error(request_id, &err).await {
                    debug!("Failed to report unknown message type: {}", e);
                }
            }
            return;
        };

        trace!("Dispatching {}", envelope);
        let outcome = AssertUnwindSafe(async move { handler(ctx, envelope).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                "Handler for message type {} (request {}) failed: {}",
                message_type, request_id, e
            ),
            Err(panic) => error!(
                "Handler for message type {} (request {}) panicked: {}",
                message_type,
                request_id,
                panic_message(panic.as_ref())
            ),
        }
    }

    /// Attach a connection: create its context and spawn its dispatch task.
    ///
    /// When `inbound` ends the on-close handlers run, then every pending
    /// request on the context is abandoned.
    pub fn on_new_connection(
        self: &Arc<Self>,
        sender: Arc<dyn EnvelopeSender>,
        inbound: mpsc::Receiver<Envelope>,
    ) -> Arc<RequestContext> {
        let ctx = Arc::new(RequestContext::new(sender, Arc::clone(&self.registry)));
        let router = Arc::clone(self);
        let task_ctx = Arc::clone(&ctx);
        tokio::spawn(async move { router.run(task_ctx, inbound).await });
        ctx
    }

    async fn run(&self, ctx: Arc<RequestContext>, mut inbound: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = inbound.recv().await {
            self.dispatch(Arc::clone(&ctx), envelope).await;
        }

        debug!("Connection inbound ended, running {} close handlers", self.on_close.len());
        for handler in &self.on_close {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&ctx)));
            if let Err(panic) = outcome {
                error!("Close handler panicked: {}", panic_message(panic.as_ref()));
            }
        }
        ctx.on_close();
    }
}

/// Resolve the pending request a response belongs to.
///
/// Responses nobody is waiting for are dropped.
pub async fn default_response_handler(ctx: Arc<RequestContext>, envelope: Envelope) -> Result<()> {
    let request_id = envelope.request_id;
    match ctx.resolve(request_id) {
        Some(pending) => {
            if !pending.deliver(envelope) {
                debug!("Caller of request {} stopped waiting", request_id);
            }
        }
        None => debug!("Dropping response to unknown request {}", request_id),
    }
    Ok(())
}
