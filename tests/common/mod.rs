#![allow(dead_code)]

//! Shared scaffolding for the integration tests: local conodes on ephemeral
//! ports, with fast dial retries.

use std::sync::Arc;
use std::time::Duration;

use conet::protocol::{CloseAll, Count};
use conet::suite::testing::TestElement;
use conet::suite::PublicKey;
use conet::{HostConfig, Identity, MessageRegistry, Overlay, Roster, SecureTcpHost};

/// A host config with short retries so failure cases stay fast.
pub fn test_config() -> HostConfig {
    HostConfig {
        max_dial_attempts: 3,
        dial_retry_wait: Duration::from_millis(100),
        send_timeout: Duration::from_secs(2),
        negotiation_timeout: Duration::from_secs(2),
        ..HostConfig::default()
    }
}

/// A deterministic identity for a seed and address list.
pub fn identity(seed: u8, addresses: Vec<String>) -> Identity {
    let public = PublicKey::from_element(&TestElement::from_seed(seed)).unwrap();
    Identity::new(public, addresses)
}

/// Reserve a localhost port by binding and dropping a listener.
///
/// Slightly racy, but good enough to pre-agree an address for a conode that
/// starts later in the test.
pub fn reserve_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

/// One test conode: listening overlay plus its resolvable identity.
pub struct TestConode {
    pub overlay: Arc<Overlay>,
    pub identity: Identity,
    pub count: Count,
    pub close: CloseAll,
}

/// Start a conode on an ephemeral port.
pub async fn start_conode(seed: u8, registry: Arc<MessageRegistry>) -> TestConode {
    start_conode_at(seed, "127.0.0.1:0".to_string(), registry).await
}

/// Start a conode listening on a specific address.
pub async fn start_conode_at(
    seed: u8,
    addr: String,
    registry: Arc<MessageRegistry>,
) -> TestConode {
    let host = Arc::new(SecureTcpHost::new(
        identity(seed, vec![addr]),
        registry.clone(),
        test_config(),
    ));
    let overlay = Overlay::new(host, registry);
    let count = Count::register(&overlay);
    let close = CloseAll::register(&overlay);
    let bound = overlay.listen().await.unwrap();

    // Same key, now with the resolved address: this is the identity the
    // roster hands to every other conode.
    let identity = identity(seed, vec![bound.to_string()]);
    TestConode {
        overlay,
        identity,
        count,
        close,
    }
}

/// Build the shared roster of a set of conodes, in the given order.
pub fn roster_of(conodes: &[&TestConode]) -> Roster {
    Roster::new(conodes.iter().map(|c| c.identity.clone()).collect()).unwrap()
}
