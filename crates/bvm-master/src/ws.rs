//! WebSocket endpoint: upgrades HTTP requests and serves them as connections.

use crate::server::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use bvm_core::{BvmError, Connection, Frame, FrameSink, FrameSource, TransportConfig};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Read half of an axum WebSocket.
pub struct AxumSource(SplitStream<WebSocket>);

/// Write half of an axum WebSocket.
pub struct AxumSink(SplitSink<WebSocket, Message>);

fn transport_error(err: axum::Error) -> BvmError {
    BvmError::Transport {
        message: err.to_string(),
    }
}

#[async_trait::async_trait]
impl FrameSource for AxumSource {
    async fn next_frame(&mut self) -> Option<bvm_core::Result<Frame>> {
        let message = match self.0.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(transport_error(e))),
        };
        Some(Ok(match message {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(data) => Frame::Binary(data),
            Message::Ping(data) => Frame::Ping(data),
            Message::Pong(data) => Frame::Pong(data),
            Message::Close(_) => Frame::Close,
        }))
    }
}

#[async_trait::async_trait]
impl FrameSink for AxumSink {
    async fn send_frame(&mut self, frame: Frame) -> bvm_core::Result<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(Some(CloseFrame {
                code: TransportConfig::NORMAL_CLOSURE,
                reason: "".into(),
            })),
        };
        self.0.send(message).await.map_err(transport_error)
    }

    async fn shutdown(&mut self) -> bvm_core::Result<()> {
        // Closing an already closed socket is not an error here.
        if let Err(e) = self.0.close().await {
            debug!("WebSocket close: {}", e);
        }
        Ok(())
    }
}

/// `GET /ws` handler.
pub async fn handle_ws(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| serve_socket(state, socket, peer))
}

async fn serve_socket(state: Arc<AppState>, socket: WebSocket, peer: SocketAddr) {
    let (sink, source) = socket.split();
    let (connection, inbound) = Connection::new(
        AxumSource(source),
        AxumSink(sink),
        Arc::clone(&state.codec),
        state.connection_config.clone(),
        peer.to_string(),
    );
    state.router.on_new_connection(connection.clone(), inbound);

    info!("Client connected from {}", peer);
    if let Err(e) = connection.serve().await {
        debug!("{}: serve failed: {}", peer, e);
    }
    info!("Client {} disconnected", peer);
}
