//! Error types for the messaging core.
//!
//! Errors fall into a few families: wiring mistakes that are fatal at startup,
//! decode failures that only drop a single message, transport failures that end
//! one connection, correlation failures surfaced to a single in-flight caller,
//! and application failures that travel back to the peer as an `Error` payload.

use crate::envelope::{MessageType, RequestId};
use crate::dtos::StorageServerId;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the volume manager.
#[derive(Debug, Error)]
pub enum BvmError {
    // Configuration errors
    #[error("Message type {0} is already registered")]
    DuplicateMessageType(MessageType),

    #[error("Payload type {type_name} is already registered")]
    DuplicatePayloadType { type_name: &'static str },

    #[error("Handler already present for message type {0}")]
    DuplicateHandler(MessageType),

    // Decode errors
    #[error("Unknown message type: {0}")]
    UnknownMessageType(MessageType),

    #[error("Malformed envelope: {message}")]
    MalformedEnvelope {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Payload of message type {message_type} does not match its shape: {message}")]
    PayloadDecode {
        message_type: MessageType,
        message: String,
    },

    // Encoding errors
    #[error("Encoding error: {message}")]
    Encoding { message: String },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Deadline exceeded after {0:?}")]
    Timeout(Duration),

    // Correlation errors
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request {0} abandoned: connection closed before a response arrived")]
    Abandoned(RequestId),

    #[error("Connection is already being served")]
    AlreadyServing,

    // Application errors
    #[error("Unknown storage server: {0}")]
    UnknownAgent(StorageServerId),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Unexpected payload: expected {expected}, got message type {actual}")]
    UnexpectedPayload {
        expected: &'static str,
        actual: MessageType,
    },

    #[error("{subsystem}: {details}")]
    Remote { subsystem: String, details: String },

    #[error("Storage probe failed: {0}")]
    Probe(String),
}

/// Result type alias for volume manager operations.
pub type Result<T> = std::result::Result<T, BvmError>;

impl From<tokio_tungstenite::tungstenite::Error> for BvmError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BvmError::Transport {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for BvmError {
    fn from(err: std::io::Error) -> Self {
        BvmError::Transport {
            message: err.to_string(),
        }
    }
}

impl BvmError {
    /// Name of the subsystem reported in an `Error` payload for this error.
    pub fn subsystem(&self) -> &'static str {
        match self {
            BvmError::DuplicateMessageType(_)
            | BvmError::DuplicatePayloadType { .. }
            | BvmError::DuplicateHandler(_)
            | BvmError::UnknownMessageType(_) => "router",

            BvmError::MalformedEnvelope { .. }
            | BvmError::PayloadDecode { .. }
            | BvmError::Encoding { .. }
            | BvmError::UnexpectedPayload { .. } => "codec",

            BvmError::Transport { .. }
            | BvmError::Timeout(_)
            | BvmError::ConnectionClosed
            | BvmError::AlreadyServing => "connection",

            BvmError::Abandoned(_) | BvmError::UnknownAgent(_) => "forwarder",

            BvmError::Authentication(_) => "authentication",

            BvmError::Validation { .. } => "validation",

            BvmError::Probe(_) => "probe",

            BvmError::Remote { .. } => "internal",
        }
    }
}
