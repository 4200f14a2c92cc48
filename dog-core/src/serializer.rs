//! Serializer boundary.
//!
//! Queues, caches and the message bus move opaque byte payloads. The typed
//! layers on top pick a [`Serializer`] to turn values into bytes and back;
//! JSON is the default, MessagePack is available behind the `msgpack`
//! feature.

use serde::{de::DeserializeOwned, Serialize};

use crate::{CoreError, CoreResult};

/// Converts typed values to opaque payload bytes.
pub trait Serializer: Clone + Send + Sync + 'static {
    /// Encode a value into bytes
    fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> CoreResult<Vec<u8>>;

    /// Decode bytes produced by [`Serializer::to_bytes`]
    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> CoreResult<T>;

    /// Stable identifier stored next to payloads
    fn id(&self) -> &'static str;
}

/// JSON serializer backed by `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> CoreResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CoreError::serialization(self.id(), e))
    }

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> CoreResult<T> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::serialization(self.id(), e))
    }

    fn id(&self) -> &'static str {
        "json"
    }
}

/// MessagePack serializer backed by `rmp-serde`
#[cfg(feature = "msgpack")]
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackSerializer;

#[cfg(feature = "msgpack")]
impl Serializer for MessagePackSerializer {
    fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> CoreResult<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(|e| CoreError::serialization(self.id(), e))
    }

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> CoreResult<T> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::serialization(self.id(), e))
    }

    fn id(&self) -> &'static str {
        "msgpack"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
        sku: String,
    }

    #[test]
    fn json_reports_malformed_payloads() {
        let serializer = JsonSerializer;
        let result: CoreResult<Order> = serializer.from_bytes(b"{not json");

        match result {
            Err(CoreError::Serialization { serializer, .. }) => assert_eq!(serializer, "json"),
            other => panic!("expected serialization error, got {:?}", other),
        }
    }

    #[test]
    fn json_decodes_what_it_encodes() {
        let serializer = JsonSerializer;
        let bytes = serializer.to_bytes(&Order { id: 7, sku: "A-1".into() }).unwrap();
        let order: Order = serializer.from_bytes(&bytes).unwrap();
        assert_eq!(order.sku, "A-1");
    }

    #[cfg(feature = "msgpack")]
    #[test]
    fn msgpack_has_its_own_id() {
        assert_eq!(MessagePackSerializer.id(), "msgpack");
    }
}
