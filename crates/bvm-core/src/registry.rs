//! Message type registry and the reference JSON envelope encoding.
//!
//! The registry maps each tag to exactly one payload type and back. It is
//! built once through [`TypeRegistryBuilder`] and then shared read-only by the
//! codec, the router and the forwarder.
//!
//! Wire format:
//!
//! ```text
//! {"messageType":1,"requestID":1,"payload":{"username":"u","password":"p"}}
//! ```

use crate::envelope::{Envelope, MessageType, Payload, RequestId};
use crate::{BvmError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::any::TypeId;
use std::collections::HashMap;

type DecodeFn = fn(&str) -> serde_json::Result<Box<dyn Payload>>;

fn decode_payload<T>(json: &str) -> serde_json::Result<Box<dyn Payload>>
where
    T: Payload + DeserializeOwned,
{
    let payload: T = serde_json::from_str(json)?;
    Ok(Box::new(payload))
}

struct Registration {
    type_name: &'static str,
    decode: DecodeFn,
}

#[derive(Serialize)]
struct WireEnvelopeOut<'a> {
    #[serde(rename = "messageType")]
    message_type: MessageType,
    #[serde(rename = "requestID")]
    request_id: RequestId,
    payload: &'a RawValue,
}

#[derive(Deserialize)]
struct WireEnvelopeIn<'a> {
    #[serde(rename = "messageType")]
    message_type: MessageType,
    #[serde(rename = "requestID")]
    request_id: RequestId,
    #[serde(borrow, default)]
    payload: Option<&'a RawValue>,
}

/// Bidirectional mapping between message type tags and payload types.
#[derive(Default)]
pub struct TypeRegistry {
    by_tag: HashMap<MessageType, Registration>,
    by_type: HashMap<TypeId, MessageType>,
}

/// Builder used during wiring. Duplicates are configuration bugs.
#[derive(Default)]
pub struct TypeRegistryBuilder {
    registry: TypeRegistry,
}

impl TypeRegistryBuilder {
    /// Bind `message_type` to `T`.
    ///
    /// # Panics
    ///
    /// Panics if the tag or the payload type is already bound.
    pub fn register<T>(self, message_type: MessageType) -> Self
    where
        T: Payload + DeserializeOwned,
    {
        match self.try_register::<T>(message_type) {
            Ok(builder) => builder,
            Err(e) => panic!("Invalid message registry: {}", e),
        }
    }

    /// Bind `message_type` to `T`, reporting duplicates as errors.
    pub fn try_register<T>(mut self, message_type: MessageType) -> Result<Self>
    where
        T: Payload + DeserializeOwned,
    {
        let type_name = std::any::type_name::<T>();
        if self.registry.by_tag.contains_key(&message_type) {
            return Err(BvmError::DuplicateMessageType(message_type));
        }
        if self.registry.by_type.contains_key(&TypeId::of::<T>()) {
            return Err(BvmError::DuplicatePayloadType { type_name });
        }

        self.registry.by_tag.insert(
            message_type,
            Registration {
                type_name,
                decode: decode_payload::<T>,
            },
        );
        self.registry.by_type.insert(TypeId::of::<T>(), message_type);
        Ok(self)
    }

    pub fn build(self) -> TypeRegistry {
        self.registry
    }
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    pub fn contains(&self, message_type: MessageType) -> bool {
        self.by_tag.contains_key(&message_type)
    }

    /// All registered tags, in ascending order.
    pub fn message_types(&self) -> Vec<MessageType> {
        let mut tags: Vec<MessageType> = self.by_tag.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    /// Name of the payload type bound to `message_type`.
    pub fn type_name(&self, message_type: MessageType) -> Option<&'static str> {
        self.by_tag.get(&message_type).map(|r| r.type_name)
    }

    /// Tag bound to the concrete type of `payload`.
    pub fn message_type_of(&self, payload: &dyn Payload) -> Option<MessageType> {
        self.by_type.get(&payload.as_any().type_id()).copied()
    }

    /// Wrap `payload` in an envelope, failing if its type is not registered.
    pub fn envelope<T: Payload>(&self, request_id: RequestId, payload: T) -> Result<Envelope> {
        self.envelope_boxed(request_id, Box::new(payload))
    }

    pub fn envelope_boxed(
        &self,
        request_id: RequestId,
        payload: Box<dyn Payload>,
    ) -> Result<Envelope> {
        let message_type =
            self.message_type_of(payload.as_ref())
                .ok_or_else(|| BvmError::Encoding {
                    message: format!("Payload type {} is not registered", payload.type_name()),
                })?;
        Ok(Envelope::from_parts(message_type, request_id, payload))
    }

    /// Serialize an envelope to JSON bytes.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let payload = envelope.payload();
        let message_type = self
            .message_type_of(payload)
            .ok_or_else(|| BvmError::Encoding {
                message: format!("Payload type {} is not registered", payload.type_name()),
            })?;
        if message_type != envelope.message_type() {
            return Err(BvmError::Encoding {
                message: format!(
                    "Envelope tagged {} carries {} (registered as {})",
                    envelope.message_type(),
                    payload.type_name(),
                    message_type
                ),
            });
        }

        let raw = payload.to_raw_json().map_err(|e| BvmError::Encoding {
            message: e.to_string(),
        })?;
        let wire = WireEnvelopeOut {
            message_type,
            request_id: envelope.request_id,
            payload: &raw,
        };
        serde_json::to_vec(&wire).map_err(|e| BvmError::Encoding {
            message: e.to_string(),
        })
    }

    /// Parse JSON bytes into an envelope.
    ///
    /// The tag and request ID are read first; the payload is then decoded with
    /// the shape registered for that tag. A missing payload decodes as `{}`.
    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        let wire: WireEnvelopeIn<'_> =
            serde_json::from_slice(bytes).map_err(|e| BvmError::MalformedEnvelope {
                message: e.to_string(),
                source: Some(e),
            })?;

        let registration = self
            .by_tag
            .get(&wire.message_type)
            .ok_or(BvmError::UnknownMessageType(wire.message_type))?;

        let json = wire.payload.map(RawValue::get).unwrap_or("{}");
        let payload = (registration.decode)(json).map_err(|e| BvmError::PayloadDecode {
            message_type: wire.message_type,
            message: e.to_string(),
        })?;

        Ok(Envelope::from_parts(
            wire.message_type,
            wire.request_id,
            payload,
        ))
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("message_types", &self.message_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtos::{
        self, message_type, AuthenticationRequest, BlockDevice, BlockDeviceListResponse,
        LogoutRequest, StorageServerRegistrationResponse,
    };

    #[derive(Debug, Serialize, Deserialize)]
    struct Unregistered {
        value: u8,
    }

    #[test]
    fn test_decode_authentication_request() {
        let registry = dtos::standard_registry();
        let bytes =
            br#"{"messageType":1,"requestID":1,"payload":{"username":"u","password":"p"}}"#;

        let envelope = registry.decode(bytes).unwrap();
        assert_eq!(envelope.message_type(), message_type::AUTHENTICATION_REQUEST);
        assert_eq!(envelope.request_id, 1);
        assert_eq!(
            envelope.payload_as::<AuthenticationRequest>(),
            Some(&AuthenticationRequest {
                username: "u".into(),
                password: "p".into(),
            })
        );
    }

    #[test]
    fn test_encode_keeps_field_order() {
        let registry = dtos::standard_registry();
        let envelope = registry
            .envelope(
                1,
                AuthenticationRequest {
                    username: "username".into(),
                    password: "password".into(),
                },
            )
            .unwrap();

        let json = String::from_utf8(registry.encode(&envelope).unwrap()).unwrap();
        assert_eq!(
            json,
            r#"{"messageType":1,"requestID":1,"payload":{"username":"username","password":"password"}}"#
        );
    }

    #[test]
    fn test_roundtrip_preserves_payload() {
        let registry = dtos::standard_registry();
        let original = BlockDeviceListResponse {
            block_devices: vec![BlockDevice {
                path: "/dev/sda1".into(),
                uuid: "5f1c".into(),
                fs_type: "btrfs".into(),
                label: "data".into(),
            }],
        };
        let envelope = registry.envelope(42, original.clone()).unwrap();
        let bytes = registry.encode(&envelope).unwrap();

        let decoded = registry.decode(&bytes).unwrap();
        assert_eq!(decoded.message_type(), message_type::BLOCK_DEVICE_LIST_RESPONSE);
        assert_eq!(decoded.request_id, 42);
        assert_eq!(decoded.into_payload::<BlockDeviceListResponse>().unwrap(), original);
    }

    #[test]
    fn test_wire_field_names() {
        let registry = dtos::standard_registry();
        let envelope = registry
            .envelope(3, StorageServerRegistrationResponse { assigned_id: 9 })
            .unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&registry.encode(&envelope).unwrap()).unwrap();
        assert_eq!(value["messageType"], 10004);
        assert_eq!(value["payload"]["assignedID"], 9);
    }

    #[test]
    fn test_missing_payload_decodes_as_empty_object() {
        let registry = dtos::standard_registry();
        let envelope = registry.decode(br#"{"messageType":2,"requestID":8}"#).unwrap();
        assert!(envelope.payload_as::<LogoutRequest>().is_some());
    }

    #[test]
    fn test_decode_unknown_message_type() {
        let registry = dtos::standard_registry();
        let result = registry.decode(br#"{"messageType":77,"requestID":1,"payload":{}}"#);
        assert!(matches!(result, Err(BvmError::UnknownMessageType(77))));
    }

    #[test]
    fn test_decode_malformed_envelope() {
        let registry = dtos::standard_registry();
        assert!(matches!(
            registry.decode(b"not json"),
            Err(BvmError::MalformedEnvelope { .. })
        ));
        assert!(matches!(
            registry.decode(br#"{"requestID":1}"#),
            Err(BvmError::MalformedEnvelope { .. })
        ));
    }

    #[test]
    fn test_decode_payload_shape_mismatch() {
        let registry = dtos::standard_registry();
        let result = registry.decode(br#"{"messageType":1,"requestID":1,"payload":{"user":1}}"#);
        match result {
            Err(BvmError::PayloadDecode { message_type, .. }) => assert_eq!(message_type, 1),
            other => panic!("Expected PayloadDecode, got: {:?}", other),
        }
    }

    #[test]
    fn test_unregistered_payload_is_an_error_not_a_panic() {
        let registry = dtos::standard_registry();
        let result = registry.envelope(0, Unregistered { value: 1 });
        assert!(matches!(result, Err(BvmError::Encoding { .. })));
    }

    #[test]
    fn test_encode_rejects_unregistered_payload() {
        let registry = dtos::standard_registry();
        let envelope = Envelope::from_parts(5, 0, Box::new(Unregistered { value: 1 }));
        assert!(matches!(
            registry.encode(&envelope),
            Err(BvmError::Encoding { .. })
        ));
    }

    #[test]
    fn test_duplicate_tag_is_rejected() {
        let result = TypeRegistry::builder()
            .register::<AuthenticationRequest>(1)
            .try_register::<LogoutRequest>(1);
        assert!(matches!(result, Err(BvmError::DuplicateMessageType(1))));
    }

    #[test]
    fn test_duplicate_payload_type_is_rejected() {
        let result = TypeRegistry::builder()
            .register::<AuthenticationRequest>(1)
            .try_register::<AuthenticationRequest>(2);
        assert!(matches!(
            result,
            Err(BvmError::DuplicatePayloadType { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_register_panics_on_duplicate() {
        let _ = TypeRegistry::builder()
            .register::<AuthenticationRequest>(1)
            .register::<LogoutRequest>(1);
    }
}
