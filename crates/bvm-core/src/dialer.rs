//! Outbound WebSocket connections.

use crate::codec::MessageCodec;
use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::context::RequestContext;
use crate::router::Router;
use crate::transport::websocket;
use crate::{BvmError, Result};
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tracing::{debug, info};
use url::Url;

/// Opens client connections and attaches them to a router.
pub struct Dialer {
    codec: Arc<dyn MessageCodec>,
    config: ConnectionConfig,
}

/// A dialed connection: its correlation context and the connection itself.
#[derive(Debug, Clone)]
pub struct DialedConnection {
    pub context: Arc<RequestContext>,
    pub connection: Arc<Connection>,
}

impl Dialer {
    pub fn new(codec: Arc<dyn MessageCodec>, config: ConnectionConfig) -> Self {
        Self { codec, config }
    }

    /// Connect to `url`, attach the connection to `router` and start serving.
    pub async fn dial(&self, url: &str, router: &Arc<Router>) -> Result<DialedConnection> {
        let url = parse_ws_url(url)?;

        let (stream, _response) = connect_async(url.as_str()).await?;
        info!("Connected to {}", url);

        let (source, sink) = websocket::split(stream);
        let (connection, inbound) = Connection::new(
            source,
            sink,
            Arc::clone(&self.codec),
            self.config.clone(),
            url.to_string(),
        );
        let context = router.on_new_connection(connection.clone(), inbound);

        let serving = Arc::clone(&connection);
        tokio::spawn(async move {
            let peer = serving.peer().to_string();
            if let Err(e) = serving.serve().await {
                debug!("{}: serve ended with error: {}", peer, e);
            }
        });

        Ok(DialedConnection {
            context,
            connection,
        })
    }
}

/// Parse and check a WebSocket URL.
pub fn parse_ws_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| BvmError::Validation {
        field: "url".to_string(),
        message: format!("{}: {}", url, e),
    })?;

    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(BvmError::Validation {
            field: "url".to_string(),
            message: format!("unsupported scheme '{}', expected ws or wss", other),
        }),
    }
}
