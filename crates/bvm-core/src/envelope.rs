//! The outer wire message and the payload trait.
//!
//! An [`Envelope`] pairs a message type tag and a connection-scoped request ID
//! with a typed payload. Envelopes are built through
//! [`TypeRegistry::envelope`](crate::registry::TypeRegistry::envelope) so the
//! tag always agrees with the concrete payload type.

use crate::{BvmError, Result};
use serde::Serialize;
use serde_json::value::RawValue;
use std::any::Any;
use std::fmt;

/// Numeric message type tag. Requests use low tags, responses start at 10000.
pub type MessageType = u32;

/// Correlation ID, meaningful only on the connection that issued it.
pub type RequestId = i64;

/// A typed message body.
///
/// Implemented for every `Serialize + Debug` type; registration in a
/// `TypeRegistry` is what makes a type usable on the wire.
pub trait Payload: fmt::Debug + Send + Sync + 'static {
    /// Serialize into raw JSON, keeping field declaration order.
    fn to_raw_json(&self) -> serde_json::Result<Box<RawValue>>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;

    fn type_name(&self) -> &'static str;
}

impl<T> Payload for T
where
    T: Serialize + fmt::Debug + Send + Sync + 'static,
{
    fn to_raw_json(&self) -> serde_json::Result<Box<RawValue>> {
        serde_json::value::to_raw_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A decoded or ready-to-send wire message.
#[derive(Debug)]
pub struct Envelope {
    message_type: MessageType,
    /// Rewritten by the forwarder when a request crosses from one leg to another.
    pub request_id: RequestId,
    payload: Box<dyn Payload>,
}

impl Envelope {
    pub(crate) fn from_parts(
        message_type: MessageType,
        request_id: RequestId,
        payload: Box<dyn Payload>,
    ) -> Self {
        Self {
            message_type,
            request_id,
            payload,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn payload(&self) -> &dyn Payload {
        self.payload.as_ref()
    }

    /// Borrow the payload as `T`, or `None` if it is some other type.
    pub fn payload_as<T: 'static>(&self) -> Option<&T> {
        self.payload.as_ref().as_any().downcast_ref::<T>()
    }

    /// Borrow the payload as `T`, failing with `UnexpectedPayload` otherwise.
    pub fn expect_payload<T: 'static>(&self) -> Result<&T> {
        self.payload_as::<T>()
            .ok_or(BvmError::UnexpectedPayload {
                expected: std::any::type_name::<T>(),
                actual: self.message_type,
            })
    }

    /// Take ownership of the payload as `T`.
    pub fn into_payload<T: 'static>(self) -> Result<T> {
        let message_type = self.message_type;
        self.payload
            .into_any()
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| BvmError::UnexpectedPayload {
                expected: std::any::type_name::<T>(),
                actual: message_type,
            })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type={} request={} ({})",
            self.message_type,
            self.request_id,
            self.payload.type_name()
        )
    }
}
