//! Agent session bootstrap: authenticate against the master and register.

use bvm_core::dtos::{
    message_type, AuthenticationRequest, AuthenticationResponse, StorageServerId,
    StorageServerRegistrationRequest, StorageServerRegistrationResponse,
};
use bvm_core::{
    default_response_handler, BvmError, HandlerExporter, RequestContext, Result, Router,
    SessionConfig,
};
use std::sync::Arc;
use tracing::info;

/// Version reported to the master at registration.
pub const SLAVE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Resolves the responses to requests the agent itself sends.
pub struct SessionResponses;

impl HandlerExporter for SessionResponses {
    fn export_handlers(self: &Arc<Self>, router: &mut Router) {
        router.add_handler(message_type::ERROR, default_response_handler);
        router.add_handler(message_type::AUTHENTICATION_RESPONSE, default_response_handler);
        router.add_handler(
            message_type::STORAGE_SERVER_REGISTRATION_RESPONSE,
            default_response_handler,
        );
    }
}

/// Log in to the master. A rejected login is `BvmError::Authentication`.
pub async fn authenticate(ctx: &RequestContext, username: &str, password: &str) -> Result<()> {
    let response = ctx
        .call(AuthenticationRequest {
            username: username.to_string(),
            password: password.to_string(),
        })
        .await?
        .into_payload::<AuthenticationResponse>()?;

    if response.result != SessionConfig::AUTH_OK {
        return Err(BvmError::Authentication(format!(
            "master rejected user '{}' ({})",
            username, response.result
        )));
    }
    ctx.set(SessionConfig::USERNAME_KEY, username.to_string());
    info!("Authenticated as {}", username);
    Ok(())
}

/// Register this agent and remember the id the master assigned.
pub async fn register(
    ctx: &RequestContext,
    server_name: &str,
    os_version: String,
) -> Result<StorageServerId> {
    let assigned_id = ctx
        .call(StorageServerRegistrationRequest {
            server_name: server_name.to_string(),
            slave_version: Some(SLAVE_VERSION.to_string()),
            os_version: Some(os_version),
        })
        .await?
        .into_payload::<StorageServerRegistrationResponse>()?
        .assigned_id;

    ctx.set(SessionConfig::STORAGE_SERVER_ID_KEY, assigned_id);
    info!("Registered as storage server {} ({})", assigned_id, server_name);
    Ok(assigned_id)
}
