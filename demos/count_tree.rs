//! Spin up a small collective of conodes on localhost, establish that the
//! whole tree is up by counting it, then tear everything down leaves-first.
//!
//! Run with: `cargo run --example count_tree`

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use conet::protocol::{CloseAll, Count, CountOptions};
use conet::suite::testing::TestElement;
use conet::suite::PublicKey;
use conet::{HostConfig, Identity, MessageRegistry, Overlay, Roster, SecureTcpHost};

struct Conode {
    overlay: Arc<Overlay>,
    identity: Identity,
    count: Count,
    close: CloseAll,
}

async fn start_conode(seed: u8, registry: Arc<MessageRegistry>) -> Result<Conode, Box<dyn Error>> {
    let public = PublicKey::from_element(&TestElement::from_seed(seed))?;
    let host = Arc::new(SecureTcpHost::new(
        Identity::new(public.clone(), vec!["127.0.0.1:0".into()]),
        registry.clone(),
        HostConfig::default(),
    ));
    let overlay = Overlay::new(host, registry);
    let count = Count::register(&overlay);
    let close = CloseAll::register(&overlay);

    let bound = overlay.listen().await?;
    info!("conode {} listening on {}", seed, bound);

    Ok(Conode {
        overlay,
        identity: Identity::new(public, vec![bound.to_string()]),
        count,
        close,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let registry = Arc::new(MessageRegistry::with_core_types());

    // Five conodes, all in this process for the demo; in a deployment each
    // runs in its own process with the same registry and roster.
    let mut conodes = Vec::new();
    for seed in 1..=5 {
        conodes.push(start_conode(seed, registry.clone()).await?);
    }

    let roster = Roster::new(conodes.iter().map(|c| c.identity.clone()).collect())?;
    let tree = Arc::new(roster.generate_binary_tree());
    for conode in &conodes {
        conode.overlay.register_tree(tree.clone());
    }
    info!("tree {} spans {} conodes", tree.id(), tree.size());

    // The root waits until the whole tree answers.
    let root = &mut conodes[0];
    let outcome = root
        .count
        .run(
            &tree,
            CountOptions {
                initial_timeout: Duration::from_secs(1),
                max_attempts: Some(10),
            },
        )
        .await?;
    info!(
        "counted {} conodes in {} attempt(s)",
        outcome.total, outcome.attempts
    );

    // Leaves-first shutdown of the whole collective.
    conodes[0].close.run(&tree).await?;

    for conode in &conodes {
        let traffic = conode.overlay.host().traffic();
        info!(
            "conode {} moved {} msgs / {} bytes out, {} msgs / {} bytes in",
            conode.identity.id(),
            traffic.msgs_sent,
            traffic.bytes_sent,
            traffic.msgs_received,
            traffic.bytes_received
        );
    }

    info!("all conodes closed");
    Ok(())
}
