//! Authentication handlers.

use bvm_core::dtos::{
    message_type, AuthenticationRequest, AuthenticationResponse, ReauthenticationRequest,
};
use bvm_core::{BvmError, Envelope, HandlerExporter, RequestContext, Result, Router, SessionConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Checks user credentials.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// `Err(BvmError::Authentication)` on bad credentials.
    async fn authenticate(&self, credentials: &AuthenticationRequest) -> Result<()>;
}

/// Fixed set of users given on the command line.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    users: HashMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new(users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            users: users.into_iter().collect(),
        }
    }
}

#[async_trait::async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, credentials: &AuthenticationRequest) -> Result<()> {
        match self.users.get(&credentials.username) {
            Some(password) if *password == credentials.password => Ok(()),
            _ => Err(BvmError::Authentication(
                "Invalid username or password".to_string(),
            )),
        }
    }
}

/// Parse a `name:password` pair.
pub fn parse_user(spec: &str) -> std::result::Result<(String, String), String> {
    match spec.split_once(':') {
        Some((name, password)) if !name.is_empty() => {
            Ok((name.to_string(), password.to_string()))
        }
        _ => Err(format!("expected name:password, got '{}'", spec)),
    }
}

fn response(result: &str, user_details: String) -> AuthenticationResponse {
    AuthenticationResponse {
        result: result.to_string(),
        user_details,
    }
}

pub struct AuthController {
    authenticator: Arc<dyn Authenticator>,
}

impl AuthController {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { authenticator }
    }

    async fn on_authentication_request(
        &self,
        ctx: Arc<RequestContext>,
        envelope: Envelope,
    ) -> Result<()> {
        let credentials = envelope.expect_payload::<AuthenticationRequest>()?;

        let reply = match self.authenticator.authenticate(credentials).await {
            Ok(()) => {
                info!("User {} authenticated", credentials.username);
                ctx.set(SessionConfig::USERNAME_KEY, credentials.username.clone());
                response(SessionConfig::AUTH_OK, credentials.username.clone())
            }
            Err(e) => {
                warn!("Authentication of {} failed: {}", credentials.username, e);
                ctx.remove(SessionConfig::USERNAME_KEY);
                response(SessionConfig::AUTH_WRONG, String::new())
            }
        };
        ctx.reply(envelope.request_id, reply).await
    }

    async fn on_logout_request(&self, ctx: Arc<RequestContext>, _envelope: Envelope) -> Result<()> {
        if let Some(username) = ctx.get::<String>(SessionConfig::USERNAME_KEY) {
            info!("User {} logged out", username);
        }
        ctx.remove(SessionConfig::USERNAME_KEY);
        ctx.close();
        Ok(())
    }

    async fn on_reauthentication_request(
        &self,
        ctx: Arc<RequestContext>,
        envelope: Envelope,
    ) -> Result<()> {
        let request = envelope.expect_payload::<ReauthenticationRequest>()?;

        // Browsers reconnect on a fresh connection and resend the user
        // details they kept from the last login as the token.
        let username = ctx
            .get::<String>(SessionConfig::USERNAME_KEY)
            .or_else(|| Some(request.token.trim().to_string()).filter(|t| !t.is_empty()));
        let reply = match username {
            Some(username) => {
                info!("User {} reauthenticated", username);
                ctx.set(SessionConfig::USERNAME_KEY, username.clone());
                response(SessionConfig::AUTH_OK, username)
            }
            None => response(SessionConfig::AUTH_WRONG, String::new()),
        };
        ctx.reply(envelope.request_id, reply).await
    }
}

impl HandlerExporter for AuthController {
    fn export_handlers(self: &Arc<Self>, router: &mut Router) {
        let this = Arc::clone(self);
        router.add_handler(message_type::AUTHENTICATION_REQUEST, move |ctx, envelope| {
            let this = Arc::clone(&this);
            async move { this.on_authentication_request(ctx, envelope).await }
        });

        let this = Arc::clone(self);
        router.add_handler(message_type::LOGOUT_REQUEST, move |ctx, envelope| {
            let this = Arc::clone(&this);
            async move { this.on_logout_request(ctx, envelope).await }
        });

        let this = Arc::clone(self);
        router.add_handler(message_type::REAUTHENTICATION_REQUEST, move |ctx, envelope| {
            let this = Arc::clone(&this);
            async move { this.on_reauthentication_request(ctx, envelope).await }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{client_router, connect, test_state};
    use bvm_core::dtos::LogoutRequest;
    use bvm_core::ConnectionState;

    fn credentials(username: &str, password: &str) -> AuthenticationRequest {
        AuthenticationRequest {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn test_parse_user() {
        assert_eq!(
            parse_user("admin:s3cr:et").unwrap(),
            ("admin".to_string(), "s3cr:et".to_string())
        );
        assert!(parse_user("admin").is_err());
        assert!(parse_user(":password").is_err());
    }

    #[tokio::test]
    async fn test_static_authenticator() {
        let auth = StaticAuthenticator::new([("admin".to_string(), "admin".to_string())]);
        assert!(auth.authenticate(&credentials("admin", "admin")).await.is_ok());
        assert!(matches!(
            auth.authenticate(&credentials("admin", "nope")).await,
            Err(BvmError::Authentication(_))
        ));
        assert!(auth.authenticate(&credentials("root", "admin")).await.is_err());
    }

    #[tokio::test]
    async fn test_authentication_flow() {
        let state = test_state();
        let (_connection, ctx) = connect(&state, client_router());

        let wrong = ctx.call(credentials("admin", "wrong")).await.unwrap();
        let wrong = wrong.into_payload::<AuthenticationResponse>().unwrap();
        assert_eq!(wrong.result, "auth_wrong");
        assert_eq!(wrong.user_details, "");

        let ok = ctx.call(credentials("admin", "admin")).await.unwrap();
        let ok = ok.into_payload::<AuthenticationResponse>().unwrap();
        assert_eq!(ok.result, "auth_ok");
        assert_eq!(ok.user_details, "admin");
    }

    #[tokio::test]
    async fn test_reauthentication_on_fresh_connection() {
        let state = test_state();
        let (_connection, ctx) = connect(&state, client_router());

        let reply = ctx
            .call(ReauthenticationRequest {
                token: "admin".to_string(),
            })
            .await
            .unwrap()
            .into_payload::<AuthenticationResponse>()
            .unwrap();
        assert_eq!(reply.result, "auth_ok");
        assert_eq!(reply.user_details, "admin");
    }

    #[tokio::test]
    async fn test_reauthentication_without_token_or_session() {
        let state = test_state();
        let (_connection, ctx) = connect(&state, client_router());
        let reauth = || ReauthenticationRequest {
            token: String::new(),
        };

        let before = ctx.call(reauth()).await.unwrap();
        assert_eq!(
            before.into_payload::<AuthenticationResponse>().unwrap().result,
            "auth_wrong"
        );

        ctx.call(credentials("admin", "admin")).await.unwrap();
        let after = ctx
            .call(reauth())
            .await
            .unwrap()
            .into_payload::<AuthenticationResponse>()
            .unwrap();
        assert_eq!(after.result, "auth_ok");
        assert_eq!(after.user_details, "admin");
    }

    #[tokio::test]
    async fn test_logout_closes_connection() {
        let state = test_state();
        let (connection, ctx) = connect(&state, client_router());

        let envelope = ctx.registry().envelope(0, LogoutRequest {}).unwrap();
        ctx.send(envelope).await.await.unwrap();

        connection.closed().await;
        assert_eq!(connection.state(), ConnectionState::Closed);
    }
}
