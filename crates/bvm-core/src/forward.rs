//! Forwarding of agent-scoped requests from clients to storage agents.
//!
//! Request IDs are only meaningful on the connection that issued them, so a
//! forwarded request is rewritten twice: to a fresh agent-side ID on the way
//! out and back to the client's original ID on the way back.

use crate::context::RequestContext;
use crate::dtos::{self, AgentScoped};
use crate::envelope::{Envelope, MessageType};
use crate::router::{default_response_handler, Router};
use crate::tracker::AgentTracker;
use crate::{BvmError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Subsystem named in errors synthesized by the forwarder.
const SUBSYSTEM: &str = "forwarder";

pub struct Forwarder {
    tracker: Arc<AgentTracker>,
}

impl Forwarder {
    pub fn new(tracker: Arc<AgentTracker>) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &Arc<AgentTracker> {
        &self.tracker
    }

    /// Relay a `T` request from `client` to the agent it names.
    ///
    /// Returns once the request is queued on the agent connection; the reply
    /// is relayed back by a background task. Fails with
    /// [`BvmError::UnknownAgent`] without forwarding anything if the agent
    /// is not tracked.
    pub async fn forward<T>(
        &self,
        client: Arc<RequestContext>,
        mut envelope: Envelope,
    ) -> Result<()>
    where
        T: AgentScoped + 'static,
    {
        let server_id = envelope.expect_payload::<T>()?.server_id();
        let agent = self
            .tracker
            .get_agent_context(server_id)
            .ok_or(BvmError::UnknownAgent(server_id))?;

        let client_request_id = envelope.request_id;
        let (agent_request_id, slot) = agent.new_request();
        envelope.request_id = agent_request_id;
        debug!(
            "Forwarding request {} to storage server {} as {}",
            client_request_id, server_id, agent_request_id
        );

        let delivery = agent.send(envelope).await;

        tokio::spawn(async move {
            let outcome = match delivery.await {
                Ok(()) => slot.await,
                Err(e) => {
                    agent.resolve(agent_request_id);
                    Err(e)
                }
            };

            let sent = match outcome {
                Ok(mut reply) => {
                    reply.request_id = client_request_id;
                    client.send(reply).await.await
                }
                Err(e) => {
                    warn!(
                        "Forwarded request {} to storage server {} failed: {}",
                        client_request_id, server_id, e
                    );
                    let error = dtos::Error {
                        subsystem: SUBSYSTEM.to_string(),
                        details: e.to_string(),
                    };
                    client.reply(client_request_id, error).await
                }
            };
            if let Err(e) = sent {
                debug!(
                    "Could not relay reply for request {} to client: {}",
                    client_request_id, e
                );
            }
        });

        Ok(())
    }

    /// Register forwarding for one request/response pair.
    ///
    /// The request handler answers forwarding failures with an `Error`
    /// payload; responses from agents go through the default response handler.
    pub fn export<T>(
        self: &Arc<Self>,
        router: &mut Router,
        request_type: MessageType,
        response_type: MessageType,
    ) where
        T: AgentScoped + Send + Sync + 'static,
    {
        let forwarder = Arc::clone(self);
        router.add_handler(request_type, move |ctx: Arc<RequestContext>, envelope: Envelope| {
            let forwarder = Arc::clone(&forwarder);
            async move {
                let request_id = envelope.request_id;
                if let Err(e) = forwarder.forward::<T>(Arc::clone(&ctx), envelope).await {
                    warn!("Cannot forward request {}: {}", request_id, e);
                    ctx.reply_error(request_id, &e).await?;
                }
                Ok(())
            }
        });
        router.add_handler(response_type, default_response_handler);
    }
}
