//! Conode identities.
//!
//! An [`Identity`] is how one conode is known to the whole network: its
//! public key, a stable id derived from that key, and the ordered list of
//! addresses where it can be reached. Identities are immutable after
//! creation and travel on the wire during the secure-channel handshake.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Message;
use crate::suite::PublicKey;

/// Stable identifier of a conode, derived from its public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityId(Uuid);

impl IdentityId {
    /// Derive the id for a public key.
    ///
    /// Deterministic: every conode derives the same id from the same key.
    pub fn derive(public: &PublicKey) -> Self {
        let mut name = Vec::with_capacity(9 + public.as_bytes().len());
        name.extend_from_slice(b"conet:id:");
        name.extend_from_slice(public.as_bytes());
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, &name))
    }

    /// The raw UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Debug for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityId({self})")
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First UUID group is plenty for logs.
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// A conode as seen by its peers: public key, derived id, addresses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Identity {
    public: PublicKey,
    id: IdentityId,
    addresses: Vec<String>,
}

impl Identity {
    /// Create an identity from a public key and the addresses it listens on.
    pub fn new(public: PublicKey, addresses: Vec<String>) -> Self {
        let id = IdentityId::derive(&public);
        Self {
            public,
            id,
            addresses,
        }
    }

    /// The public key.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// The derived stable id.
    pub fn id(&self) -> IdentityId {
        self.id
    }

    /// Addresses in dial order.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.addresses.iter().map(String::as_str)
    }

    /// The first (preferred) address, if any.
    pub fn first_address(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Identity {}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.first_address() {
            Some(addr) => write!(f, "{}@{}", self.id, addr),
            None => write!(f, "{}@?", self.id),
        }
    }
}

impl Message for Identity {
    const NAME: &'static str = "Identity";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::testing::TestElement;
    use crate::suite::Element;

    fn key(seed: u8) -> PublicKey {
        PublicKey::from_element(&TestElement::from_seed(seed)).unwrap()
    }

    #[test]
    fn id_is_deterministic() {
        let a = Identity::new(key(1), vec!["127.0.0.1:2000".into()]);
        let b = Identity::new(key(1), vec!["10.0.0.1:9999".into()]);
        // Same key, same id, regardless of addresses.
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn different_keys_differ() {
        let a = Identity::new(key(1), vec![]);
        let b = Identity::new(key(2), vec![]);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn addresses_keep_order() {
        let id = Identity::new(key(3), vec!["x:1".into(), "y:2".into()]);
        let addrs: Vec<_> = id.addresses().collect();
        assert_eq!(addrs, vec!["x:1", "y:2"]);
        assert_eq!(id.first_address(), Some("x:1"));
    }
}
