//! Storage server registration, listing and deregistration.

use bvm_core::dtos::{
    message_type, StorageServer, StorageServerId, StorageServerListRequest,
    StorageServerListResponse, StorageServerRegistrationRequest,
    StorageServerRegistrationResponse,
};
use bvm_core::{
    AgentTracker, Envelope, HandlerExporter, RequestContext, Result, Router, SessionConfig,
};
use std::sync::Arc;
use tracing::{debug, info};

const UNKNOWN: &str = "unknown";

/// What a storage server told us about itself, kept in its session.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StorageServerDetails {
    id: StorageServerId,
    name: String,
    slave_version: String,
    os_version: String,
}

pub struct StorageServerController {
    tracker: Arc<AgentTracker>,
}

impl StorageServerController {
    pub fn new(tracker: Arc<AgentTracker>) -> Self {
        Self { tracker }
    }

    async fn on_registration_request(
        &self,
        ctx: Arc<RequestContext>,
        envelope: Envelope,
    ) -> Result<()> {
        let request = envelope.expect_payload::<StorageServerRegistrationRequest>()?;

        // A connection registers at most once.
        if let Some(existing) = ctx.get::<StorageServerDetails>(SessionConfig::STORAGE_SERVER_KEY) {
            debug!(
                "Storage server {} registered again, keeping id {}",
                existing.name, existing.id
            );
            return ctx
                .reply(
                    envelope.request_id,
                    StorageServerRegistrationResponse {
                        assigned_id: existing.id,
                    },
                )
                .await;
        }

        let id = self
            .tracker
            .register_agent(request.server_name.clone(), Arc::clone(&ctx));
        let details = StorageServerDetails {
            id,
            name: request.server_name.clone(),
            slave_version: request
                .slave_version
                .clone()
                .unwrap_or_else(|| UNKNOWN.to_string()),
            os_version: request
                .os_version
                .clone()
                .unwrap_or_else(|| UNKNOWN.to_string()),
        };
        ctx.set(SessionConfig::STORAGE_SERVER_ID_KEY, id);
        ctx.set(SessionConfig::STORAGE_SERVER_KEY, details);

        ctx.reply(
            envelope.request_id,
            StorageServerRegistrationResponse { assigned_id: id },
        )
        .await
    }

    async fn on_list_request(&self, ctx: Arc<RequestContext>, envelope: Envelope) -> Result<()> {
        envelope.expect_payload::<StorageServerListRequest>()?;

        let servers = self
            .tracker
            .list_agents()
            .into_iter()
            .map(|agent| {
                let details = agent
                    .context
                    .get::<StorageServerDetails>(SessionConfig::STORAGE_SERVER_KEY);
                let (slave_version, os_version) = match details {
                    Some(details) => (details.slave_version, details.os_version),
                    None => (UNKNOWN.to_string(), UNKNOWN.to_string()),
                };
                StorageServer {
                    id: agent.id,
                    name: agent.name,
                    slave_version,
                    os_version,
                    connected_at: agent.registered_at.to_rfc3339(),
                }
            })
            .collect();

        ctx.reply(envelope.request_id, StorageServerListResponse { servers })
            .await
    }

    fn on_connection_close(&self, ctx: &RequestContext) {
        if let Some(id) = ctx.get::<StorageServerId>(SessionConfig::STORAGE_SERVER_ID_KEY) {
            if self.tracker.remove_agent(id) {
                info!("Storage server {} disconnected", id);
            }
        }
    }
}

impl HandlerExporter for StorageServerController {
    fn export_handlers(self: &Arc<Self>, router: &mut Router) {
        let this = Arc::clone(self);
        router.add_handler(
            message_type::STORAGE_SERVER_REGISTRATION_REQUEST,
            move |ctx, envelope| {
                let this = Arc::clone(&this);
                async move { this.on_registration_request(ctx, envelope).await }
            },
        );

        let this = Arc::clone(self);
        router.add_handler(message_type::STORAGE_SERVER_LIST_REQUEST, move |ctx, envelope| {
            let this = Arc::clone(&this);
            async move { this.on_list_request(ctx, envelope).await }
        });

        let this = Arc::clone(self);
        router.add_on_close_handler(move |ctx| this.on_connection_close(ctx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{client_router, connect, test_state, wait_until};

    fn registration(name: &str) -> StorageServerRegistrationRequest {
        StorageServerRegistrationRequest {
            server_name: name.to_string(),
            slave_version: Some("0.3.0".to_string()),
            os_version: Some("Linux 6.1".to_string()),
        }
    }

    async fn list(ctx: &RequestContext) -> Vec<StorageServer> {
        ctx.call(StorageServerListRequest {})
            .await
            .unwrap()
            .into_payload::<StorageServerListResponse>()
            .unwrap()
            .servers
    }

    #[tokio::test]
    async fn test_registration_is_listed() {
        let state = test_state();
        let (_agent_connection, agent) = connect(&state, client_router());
        let (_client_connection, client) = connect(&state, client_router());

        let response = agent.call(registration("alpha")).await.unwrap();
        let id = response
            .into_payload::<StorageServerRegistrationResponse>()
            .unwrap()
            .assigned_id;
        assert_eq!(id, 0);

        let servers = list(&client).await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, 0);
        assert_eq!(servers[0].name, "alpha");
        assert_eq!(servers[0].slave_version, "0.3.0");
        assert_eq!(servers[0].os_version, "Linux 6.1");
        assert!(!servers[0].connected_at.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_registration_keeps_id() {
        let state = test_state();
        let (_connection, agent) = connect(&state, client_router());

        let first = agent.call(registration("alpha")).await.unwrap();
        let second = agent.call(registration("alpha")).await.unwrap();
        let id = |e: Envelope| {
            e.into_payload::<StorageServerRegistrationResponse>()
                .unwrap()
                .assigned_id
        };
        assert_eq!(id(first), id(second));
        assert_eq!(state.tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_deregisters() {
        let state = test_state();
        let (agent_connection, agent) = connect(&state, client_router());
        let (_client_connection, client) = connect(&state, client_router());

        agent.call(registration("alpha")).await.unwrap();
        assert_eq!(list(&client).await.len(), 1);

        agent_connection.close();
        let tracker = state.tracker.clone();
        wait_until(move || tracker.is_empty()).await;
        assert!(list(&client).await.is_empty());
    }
}
