//! tokio-tungstenite adapter, used by the dialer and by tests that stand up a
//! raw WebSocket peer.

use super::{Frame, FrameSink, FrameSource};
use crate::config::TransportConfig;
use crate::{BvmError, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

/// Read half over any stream of tungstenite messages.
pub struct WsSource<S>(S);

/// Write half over any sink of tungstenite messages.
pub struct WsSink<S>(S);

/// Split a WebSocket stream into transport halves.
#[allow(clippy::type_complexity)]
pub fn split<S>(
    stream: WebSocketStream<S>,
) -> (
    WsSource<SplitStream<WebSocketStream<S>>>,
    WsSink<SplitSink<WebSocketStream<S>, Message>>,
)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, source) = stream.split();
    (WsSource(source), WsSink(sink))
}

fn into_frame(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text)),
        Message::Binary(data) => Some(Frame::Binary(data)),
        Message::Ping(data) => Some(Frame::Ping(data)),
        Message::Pong(data) => Some(Frame::Pong(data)),
        Message::Close(_) => Some(Frame::Close),
        // Raw frames never surface from a read.
        Message::Frame(_) => None,
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close => Message::Close(Some(CloseFrame {
            code: CloseCode::from(TransportConfig::NORMAL_CLOSURE),
            reason: "".into(),
        })),
    }
}

#[async_trait::async_trait]
impl<S> FrameSource for WsSource<S>
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            match self.0.next().await? {
                Ok(message) => {
                    if let Some(frame) = into_frame(message) {
                        return Some(Ok(frame));
                    }
                }
                Err(tungstenite::Error::ConnectionClosed) => return None,
                Err(e) => return Some(Err(BvmError::from(e))),
            }
        }
    }
}

#[async_trait::async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        self.0.send(into_message(frame)).await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        match self.0.close().await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
