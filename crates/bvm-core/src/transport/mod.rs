//! Frame-level transport boundary.
//!
//! A [`Connection`](crate::connection::Connection) owns one [`FrameSource`] and
//! one [`FrameSink`]. Adapters exist for tokio-tungstenite streams
//! ([`websocket`]) and for an in-process pair ([`memory`]); the master brings
//! its own adapter for axum sockets.

pub mod memory;
pub mod websocket;

use crate::Result;

/// A single WebSocket-style frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl Frame {
    /// Whether this frame carries an application message.
    pub fn is_data(&self) -> bool {
        matches!(self, Frame::Text(_) | Frame::Binary(_))
    }
}

/// Read half of a transport.
#[async_trait::async_trait]
pub trait FrameSource: Send + 'static {
    /// Next frame from the peer. `None` means the transport reached EOF.
    ///
    /// Must be cancel-safe: the read loop races it against its deadline.
    async fn next_frame(&mut self) -> Option<Result<Frame>>;
}

/// Write half of a transport.
#[async_trait::async_trait]
pub trait FrameSink: Send + 'static {
    async fn send_frame(&mut self, frame: Frame) -> Result<()>;

    /// Flush and release the underlying transport.
    async fn shutdown(&mut self) -> Result<()>;
}
