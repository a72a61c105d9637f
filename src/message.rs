//! Message typing, registration and the application envelope.
//!
//! Every payload that crosses the wire is registered once, process-wide,
//! before any host starts traffic. The registry is an explicitly constructed
//! object handed to every host at start-up: populate it, wrap it in an
//! [`Arc`](std::sync::Arc), and it is read-only from then on. Decoding is
//! strictly by type identifier through the id→constructor table, never by
//! structural inference.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConetError, Result};
use crate::frame::Frame;
use crate::identity::Identity;

/// Stable wire identifier of a registered payload type.
///
/// Derived from the payload's registered name, so every participant that
/// agrees on the name agrees on the id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageTypeId(Uuid);

impl MessageTypeId {
    /// Derive the id for a payload name.
    pub fn from_name(name: &str) -> Self {
        let url = format!("conet:msg:{name}");
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, url.as_bytes()))
    }

    /// The id of a typed payload.
    pub fn of<M: Message>() -> Self {
        Self::from_name(M::NAME)
    }

    /// The raw 16 UUID bytes, as laid out in the frame header.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Rebuild from the 16 frame-header bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl std::fmt::Debug for MessageTypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageTypeId({})", self.0)
    }
}

impl std::fmt::Display for MessageTypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// A payload type with a stable wire name.
///
/// The name is the only thing participants must agree on; the wire id is
/// derived from it.
pub trait Message: Any + Send + Sync {
    /// Stable name of this payload on the wire.
    const NAME: &'static str;
}

/// Custom binary codec for payloads the structural encoding cannot carry
/// (variable-length group elements and the like).
pub trait BinaryMessage: Sized {
    /// Encode to the type's own binary form.
    fn marshal_binary(&self) -> Result<Vec<u8>>;
    /// Decode from the type's own binary form.
    fn unmarshal_binary(data: &[u8]) -> Result<Self>;
}

type AnyBody = Box<dyn Any + Send + Sync>;
type EncodeFn = Box<dyn Fn(&(dyn Any + Send + Sync)) -> Result<Vec<u8>> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&[u8]) -> Result<AnyBody> + Send + Sync>;

struct RegistryEntry {
    name: &'static str,
    encode: EncodeFn,
    decode: DecodeFn,
}

/// The id→constructor table shared by every host of a process.
///
/// Append-only: register everything up front, then share it read-only.
/// Registering two different payloads under the same id is a programming
/// error and panics.
pub struct MessageRegistry {
    by_wire: HashMap<MessageTypeId, RegistryEntry>,
    by_rust: HashMap<TypeId, MessageTypeId>,
}

impl MessageRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            by_wire: HashMap::new(),
            by_rust: HashMap::new(),
        }
    }

    /// A registry pre-loaded with every payload conet itself puts on the
    /// wire: the handshake identity, the overlay envelope, and the
    /// management protocol payloads.
    pub fn with_core_types() -> Self {
        let mut reg = Self::new();
        reg.register::<Identity>();
        reg.register::<crate::overlay::ProtocolEnvelope>();
        reg.register::<crate::protocol::count::CountRequest>();
        reg.register::<crate::protocol::count::CountReply>();
        reg.register::<crate::protocol::close_all::CloseRequest>();
        reg.register::<crate::protocol::close_all::CloseAck>();
        reg
    }

    /// Register a structurally encoded payload.
    pub fn register<M>(&mut self) -> MessageTypeId
    where
        M: Message + Serialize + DeserializeOwned,
    {
        let encode: EncodeFn = Box::new(|any| {
            let msg = any
                .downcast_ref::<M>()
                .ok_or_else(|| ConetError::Unmarshal(format!("payload is not a {}", M::NAME)))?;
            bincode::serialize(msg).map_err(|e| ConetError::Unmarshal(e.to_string()))
        });
        let decode: DecodeFn = Box::new(|data| {
            bincode::deserialize::<M>(data)
                .map(|m| Box::new(m) as AnyBody)
                .map_err(|e| ConetError::Unmarshal(format!("decoding {}: {e}", M::NAME)))
        });
        self.insert::<M>(encode, decode)
    }

    /// Register a payload with its own binary codec.
    pub fn register_custom<M>(&mut self) -> MessageTypeId
    where
        M: Message + BinaryMessage,
    {
        let encode: EncodeFn = Box::new(|any| {
            let msg = any
                .downcast_ref::<M>()
                .ok_or_else(|| ConetError::Unmarshal(format!("payload is not a {}", M::NAME)))?;
            msg.marshal_binary()
        });
        let decode: DecodeFn = Box::new(|data| {
            M::unmarshal_binary(data)
                .map(|m| Box::new(m) as AnyBody)
                .map_err(|e| ConetError::Unmarshal(format!("decoding {}: {e}", M::NAME)))
        });
        self.insert::<M>(encode, decode)
    }

    fn insert<M: Message>(&mut self, encode: EncodeFn, decode: DecodeFn) -> MessageTypeId {
        let id = MessageTypeId::of::<M>();
        if let Some(existing) = self.by_wire.get(&id) {
            panic!(
                "message type {} registered twice (id already bound to {})",
                M::NAME,
                existing.name
            );
        }
        self.by_wire.insert(
            id,
            RegistryEntry {
                name: M::NAME,
                encode,
                decode,
            },
        );
        self.by_rust.insert(TypeId::of::<M>(), id);
        id
    }

    /// Whether a wire id is known.
    pub fn contains(&self, id: MessageTypeId) -> bool {
        self.by_wire.contains_key(&id)
    }

    /// The registered name of a wire id, for logging.
    pub fn name_of(&self, id: MessageTypeId) -> Option<&'static str> {
        self.by_wire.get(&id).map(|e| e.name)
    }

    /// Encode a registered payload into a frame.
    pub fn encode<M: Any + Send + Sync>(&self, msg: &M) -> Result<Frame> {
        let id = self
            .by_rust
            .get(&TypeId::of::<M>())
            .copied()
            .ok_or_else(|| {
                ConetError::Unmarshal(format!(
                    "payload type {} is not registered",
                    std::any::type_name::<M>()
                ))
            })?;
        let entry = self.by_wire.get(&id).expect("wire entry for registered type");
        let payload = (entry.encode)(msg)?;
        Ok(Frame::new(id, payload))
    }

    /// Decode raw payload bytes by wire id.
    pub fn decode_payload(&self, id: MessageTypeId, data: &[u8]) -> Result<AnyBody> {
        let entry = self
            .by_wire
            .get(&id)
            .ok_or_else(|| ConetError::Unmarshal(format!("unknown message type {id}")))?;
        (entry.decode)(data)
    }

    /// Decode a frame into an application message (sender fields unset).
    pub fn decode(&self, frame: &Frame) -> Result<ApplicationMessage> {
        let body = self.decode_payload(frame.type_id, &frame.payload)?;
        Ok(ApplicationMessage {
            msg_type: frame.type_id,
            body,
            from: String::new(),
            identity: None,
        })
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded message as delivered by a connection: typed payload plus the
/// sender, with the peer [`Identity`] attached once a secure channel has
/// negotiated it.
pub struct ApplicationMessage {
    /// Wire id of the payload.
    pub msg_type: MessageTypeId,
    /// The decoded payload.
    pub body: Box<dyn Any + Send + Sync>,
    /// Remote address the message arrived from.
    pub from: String,
    /// Peer identity, attached by the secure channel.
    pub identity: Option<Identity>,
}

impl ApplicationMessage {
    /// Whether the payload is of type `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.msg_type == MessageTypeId::of::<M>()
    }

    /// Take the payload as a concrete type.
    pub fn downcast<M: Message>(self) -> Result<M> {
        self.body
            .downcast::<M>()
            .map(|b| *b)
            .map_err(|_| ConetError::Unmarshal(format!("payload is not a {}", M::NAME)))
    }
}

impl std::fmt::Debug for ApplicationMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationMessage")
            .field("msg_type", &self.msg_type)
            .field("from", &self.from)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        text: String,
        hops: u32,
    }

    impl Message for Greeting {
        const NAME: &'static str = "test.Greeting";
    }

    #[derive(Debug, Clone, PartialEq)]
    struct RawBlob(Vec<u8>);

    impl Message for RawBlob {
        const NAME: &'static str = "test.RawBlob";
    }

    impl BinaryMessage for RawBlob {
        fn marshal_binary(&self) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }

        fn unmarshal_binary(data: &[u8]) -> Result<Self> {
            Ok(Self(data.to_vec()))
        }
    }

    #[test]
    fn structural_roundtrip() {
        let mut reg = MessageRegistry::new();
        reg.register::<Greeting>();

        let msg = Greeting {
            text: "hello".into(),
            hops: 3,
        };
        let frame = reg.encode(&msg).unwrap();
        assert_eq!(frame.type_id, MessageTypeId::of::<Greeting>());

        let decoded = reg.decode(&frame).unwrap();
        assert!(decoded.is::<Greeting>());
        assert_eq!(decoded.downcast::<Greeting>().unwrap(), msg);
    }

    #[test]
    fn custom_roundtrip() {
        let mut reg = MessageRegistry::new();
        reg.register_custom::<RawBlob>();

        let msg = RawBlob(vec![0xde, 0xad, 0xbe, 0xef]);
        let frame = reg.encode(&msg).unwrap();
        let decoded = reg.decode(&frame).unwrap();
        assert_eq!(decoded.downcast::<RawBlob>().unwrap(), msg);
    }

    #[test]
    fn unknown_type_is_unmarshal_failure() {
        let reg = MessageRegistry::new();
        let frame = Frame::new(MessageTypeId::from_name("test.Nobody"), vec![1, 2, 3]);
        assert!(matches!(reg.decode(&frame), Err(ConetError::Unmarshal(_))));
    }

    #[test]
    fn encoding_unregistered_type_fails() {
        let reg = MessageRegistry::new();
        let msg = Greeting {
            text: "nope".into(),
            hops: 0,
        };
        assert!(matches!(reg.encode(&msg), Err(ConetError::Unmarshal(_))));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn double_registration_panics() {
        let mut reg = MessageRegistry::new();
        reg.register::<Greeting>();
        reg.register::<Greeting>();
    }

    #[test]
    fn ids_follow_names() {
        assert_eq!(
            MessageTypeId::of::<Greeting>(),
            MessageTypeId::from_name("test.Greeting")
        );
        assert_ne!(
            MessageTypeId::from_name("test.A"),
            MessageTypeId::from_name("test.B")
        );
    }
}
