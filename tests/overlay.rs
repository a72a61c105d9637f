//! Overlay integration tests: count convergence (with and without a late
//! leaf) and leaves-first shutdown, over real localhost conodes.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::time::timeout;

use conet::protocol::CountOptions;
use conet::MessageRegistry;

use common::{reserve_addr, roster_of, start_conode, start_conode_at};

#[tokio::test]
async fn count_converges_on_a_healthy_tree() {
    let registry = Arc::new(MessageRegistry::with_core_types());

    let mut root = start_conode(1, registry.clone()).await;
    let others = vec![
        start_conode(2, registry.clone()).await,
        start_conode(3, registry.clone()).await,
        start_conode(4, registry.clone()).await,
        start_conode(5, registry.clone()).await,
    ];

    let identities: Vec<_> = std::iter::once(root.identity.clone())
        .chain(others.iter().map(|c| c.identity.clone()))
        .collect();
    let overlays: Vec<_> = std::iter::once(root.overlay.clone())
        .chain(others.iter().map(|c| c.overlay.clone()))
        .collect();

    let roster = conet::Roster::new(identities).unwrap();
    let tree = Arc::new(roster.generate_binary_tree());
    for overlay in &overlays {
        overlay.register_tree(tree.clone());
    }

    let outcome = root
        .count
        .run(
            &tree,
            CountOptions {
                initial_timeout: Duration::from_secs(2),
                max_attempts: Some(3),
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.total, 5);
    assert_eq!(outcome.attempts, 1, "a healthy tree counts in one round");

    for overlay in &overlays {
        overlay.close().await.unwrap();
    }
}

#[tokio::test]
async fn count_retries_until_a_late_leaf_answers() {
    let registry = Arc::new(MessageRegistry::with_core_types());

    let mut root = start_conode(1, registry.clone()).await;
    let second = start_conode(2, registry.clone()).await;

    // The third conode is in the roster from the start but only comes up
    // a while into the run.
    let late_addr = reserve_addr();
    let late_identity = common::identity(3, vec![late_addr.clone()]);

    let roster = conet::Roster::new(vec![
        root.identity.clone(),
        second.identity.clone(),
        late_identity,
    ])
    .unwrap();
    let tree = Arc::new(roster.generate_binary_tree());
    root.overlay.register_tree(tree.clone());
    second.overlay.register_tree(tree.clone());

    let late_registry = registry.clone();
    let late_tree = tree.clone();
    let late_handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        let conode = start_conode_at(3, late_addr, late_registry).await;
        conode.overlay.register_tree(late_tree);
        conode
    });

    let outcome = root
        .count
        .run(
            &tree,
            CountOptions {
                initial_timeout: Duration::from_millis(300),
                max_attempts: Some(5),
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.total, 3);
    assert!(
        outcome.attempts > 1,
        "the first round must come up short while the leaf is down"
    );
    assert!(outcome.final_timeout > Duration::from_millis(300));

    let late = late_handle.await.unwrap();
    root.overlay.close().await.unwrap();
    second.overlay.close().await.unwrap();
    late.overlay.close().await.unwrap();
}

#[tokio::test]
async fn close_all_shuts_down_leaves_first() {
    let registry = Arc::new(MessageRegistry::with_core_types());

    let root = start_conode(1, registry.clone()).await;
    let left = start_conode(2, registry.clone()).await;
    let right = start_conode(3, registry.clone()).await;

    let all = [&root, &left, &right];
    let roster = roster_of(&all);
    let tree = Arc::new(roster.generate_binary_tree());
    assert!(tree.uses_whole_roster());
    for conode in &all {
        conode.overlay.register_tree(tree.clone());
    }

    // Record when each host actually closes.
    let closings: Arc<Mutex<Vec<(u8, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
    for (seed, conode) in [(1u8, &root), (2, &left), (3, &right)] {
        let host = conode.overlay.host().clone();
        let closings = closings.clone();
        tokio::spawn(async move {
            host.closed().await;
            closings.lock().unwrap().push((seed, Instant::now()));
        });
    }

    timeout(Duration::from_secs(10), root.close.run(&tree))
        .await
        .expect("shutdown must finish")
        .unwrap();

    // Give the watchers a beat to record.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let recorded = closings.lock().unwrap().clone();
    assert_eq!(recorded.len(), 3, "every host must close");
    let at = |seed: u8| {
        recorded
            .iter()
            .find(|(s, _)| *s == seed)
            .map(|(_, t)| *t)
            .unwrap()
    };
    assert!(at(2) < at(1), "left child must close before the root");
    assert!(at(3) < at(1), "right child must close before the root");
}

#[tokio::test]
async fn close_all_rebuilds_an_aliased_tree() {
    let registry = Arc::new(MessageRegistry::with_core_types());

    let root = start_conode(1, registry.clone()).await;
    let b = start_conode(2, registry.clone()).await;
    let c = start_conode(3, registry.clone()).await;

    let all = [&root, &b, &c];
    let roster = roster_of(&all);
    // Six slots over three identities: co-located simulated processes.
    let aliased = Arc::new(roster.generate_sized_tree(2, 6));
    assert!(!aliased.uses_whole_roster());
    for conode in &all {
        conode.overlay.register_tree(aliased.clone());
    }

    timeout(Duration::from_secs(10), root.close.run(&aliased))
        .await
        .expect("shutdown over an aliased tree must finish")
        .unwrap();

    for conode in &all {
        timeout(Duration::from_secs(5), conode.overlay.host().closed())
            .await
            .expect("every host must close");
        assert!(conode.overlay.host().host().is_closed());
    }
}
