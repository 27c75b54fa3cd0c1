//! Pluggable envelope encoding.
//!
//! Connections only see [`MessageCodec`]; [`JsonCodec`] is the encoding the
//! browser client and the slaves speak.

use crate::envelope::Envelope;
use crate::registry::TypeRegistry;
use crate::Result;
use std::sync::Arc;

/// Turns envelopes into frame bytes and back.
pub trait MessageCodec: Send + Sync + 'static {
    fn marshal(&self, envelope: &Envelope) -> Result<Vec<u8>>;

    fn unmarshal(&self, bytes: &[u8]) -> Result<Envelope>;

    /// Whether marshalled bytes are valid UTF-8 and go out as text frames.
    fn is_text(&self) -> bool {
        true
    }
}

/// JSON encoding over a shared [`TypeRegistry`].
#[derive(Debug, Clone)]
pub struct JsonCodec {
    registry: Arc<TypeRegistry>,
}

impl JsonCodec {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }
}

impl MessageCodec for JsonCodec {
    fn marshal(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        self.registry.encode(envelope)
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<Envelope> {
        self.registry.decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtos::{standard_registry, StorageServerListRequest};

    #[test]
    fn test_json_codec_delegates_to_registry() {
        let codec = JsonCodec::new(Arc::new(standard_registry()));
        let envelope = codec
            .registry()
            .envelope(7, StorageServerListRequest {})
            .unwrap();

        let bytes = codec.marshal(&envelope).unwrap();
        assert_eq!(bytes, br#"{"messageType":6,"requestID":7,"payload":{}}"#);

        let decoded = codec.unmarshal(&bytes).unwrap();
        assert_eq!(decoded.request_id, 7);
        assert!(decoded.payload_as::<StorageServerListRequest>().is_some());
        assert!(codec.is_text());
    }
}
