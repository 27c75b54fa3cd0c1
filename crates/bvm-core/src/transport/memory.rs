//! In-process transport pair.
//!
//! Both ends speak [`Frame`]s over bounded channels, so a test can run a real
//! [`Connection`](crate::connection::Connection) against a hand-driven peer
//! and observe pings, close frames and backpressure.

use super::{Frame, FrameSink, FrameSource};
use crate::{BvmError, Result};
use tokio::sync::mpsc;

/// Read half of an in-process transport.
#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::Receiver<Frame>,
}

/// Write half of an in-process transport.
#[derive(Debug)]
pub struct MemorySink {
    tx: Option<mpsc::Sender<Frame>>,
}

/// One end of a pair: what it reads and what it writes.
pub type MemoryEnd = (MemorySource, MemorySink);

/// Two connected ends with room for `capacity` in-flight frames each way.
pub fn pair(capacity: usize) -> (MemoryEnd, MemoryEnd) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        (MemorySource { rx: a_rx }, MemorySink { tx: Some(b_tx) }),
        (MemorySource { rx: b_rx }, MemorySink { tx: Some(a_tx) }),
    )
}

impl MemorySource {
    /// Receive the next frame directly, for test peers.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Next frame that carries an application message, skipping control frames.
    pub async fn recv_data(&mut self) -> Option<Frame> {
        while let Some(frame) = self.rx.recv().await {
            if frame.is_data() || frame == Frame::Close {
                return Some(frame);
            }
        }
        None
    }
}

impl MemorySink {
    /// Send a frame directly, for test peers.
    pub async fn send(&mut self, frame: Frame) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(BvmError::ConnectionClosed)?;
        tx.send(frame).await.map_err(|_| BvmError::Transport {
            message: "in-process peer went away".to_string(),
        })
    }

    /// Drop the write side; the peer's source reaches EOF.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

#[async_trait::async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        self.rx.recv().await.map(Ok)
    }
}

#[async_trait::async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        self.send(frame).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_is_crossed() {
        let ((mut a_source, mut a_sink), (mut b_source, mut b_sink)) = pair(4);

        a_sink.send(Frame::Text("to b".into())).await.unwrap();
        b_sink.send(Frame::Text("to a".into())).await.unwrap();

        assert_eq!(b_source.recv().await, Some(Frame::Text("to b".into())));
        assert_eq!(a_source.recv().await, Some(Frame::Text("to a".into())));
    }

    #[tokio::test]
    async fn test_shutdown_reaches_eof() {
        let ((_a_source, mut a_sink), (mut b_source, _b_sink)) = pair(4);
        a_sink.shutdown().await.unwrap();

        assert!(b_source.next_frame().await.is_none());
        assert!(matches!(
            a_sink.send_frame(Frame::Close).await,
            Err(BvmError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_recv_data_skips_control_frames() {
        let ((mut a_source, _a_sink), (_b_source, mut b_sink)) = pair(4);
        b_sink.send(Frame::Ping(Vec::new())).await.unwrap();
        b_sink.send(Frame::Text("x".into())).await.unwrap();

        assert_eq!(a_source.recv_data().await, Some(Frame::Text("x".into())));
    }
}
