//! BVM Core - messaging core for the btrfs volume manager.
//!
//! The master and the storage agents (slaves) exchange typed envelopes over
//! WebSockets. This crate holds everything both sides share:
//!
//! - [`registry`] and [`codec`]: message type tags and the JSON envelope encoding
//! - [`connection`]: the per-connection read/write tasks with keepalive
//! - [`context`]: request correlation and per-connection session data
//! - [`router`]: handler dispatch by message type
//! - [`tracker`] and [`forward`]: the master's agent registry and request relay
//! - [`dialer`]: outbound connections
//!
//! # Example
//!
//! ```rust,ignore
//! use bvm_core::{dtos, Dialer, JsonCodec, Router};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(dtos::standard_registry());
//! let router = Arc::new(Router::new(registry.clone()));
//! let dialer = Dialer::new(Arc::new(JsonCodec::new(registry)), Default::default());
//! let dialed = dialer.dial("ws://127.0.0.1:8080/ws", &router).await?;
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod dialer;
pub mod dtos;
pub mod envelope;
pub mod error;
pub mod forward;
pub mod registry;
pub mod router;
pub mod tracker;
pub mod transport;

// Re-export commonly used types
pub use codec::{JsonCodec, MessageCodec};
pub use config::{ConnectionConfig, SessionConfig, TransportConfig};
pub use connection::{Connection, ConnectionState, Delivery};
pub use context::{EnvelopeSender, PendingResponse, RequestContext, ResponseSlot};
pub use dialer::{DialedConnection, Dialer};
pub use envelope::{Envelope, MessageType, Payload, RequestId};
pub use error::{BvmError, Result};
pub use forward::Forwarder;
pub use registry::{TypeRegistry, TypeRegistryBuilder};
pub use router::{default_response_handler, HandlerExporter, Router, UnknownMessagePolicy};
pub use tracker::{AgentTracker, TrackedAgent};
pub use transport::{Frame, FrameSink, FrameSource};
