//! CloseAll: cascading, leaves-first shutdown of a whole tree.
//!
//! The close signal travels root-to-leaves; every node closes its own host
//! only after each child acknowledged closing, so hosts disappear from the
//! leaves upward and nobody is cut off while still relaying. The run must
//! cover every distinct identity exactly once, so an aliased working tree is
//! replaced by a binary tree rebuilt from its roster.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ConetError, Result};
use crate::message::Message;
use crate::overlay::Overlay;
use crate::protocol::TreeNodeInstance;
use crate::tree::Tree;

/// Name the protocol is registered and dispatched under.
pub const PROTOCOL_NAME: &str = "CloseAll";

/// How long a node waits for each child's acknowledgement before shutting
/// down anyway. A dead child must not wedge the whole run's teardown.
const ACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Close signal, propagated root-to-leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseRequest {}

impl Message for CloseRequest {
    const NAME: &'static str = "CloseRequest";
}

/// Acknowledgement that a subtree has shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseAck {}

impl Message for CloseAck {
    const NAME: &'static str = "CloseAck";
}

/// Root-side handle for shutting a tree down.
pub struct CloseAll {
    overlay: Arc<Overlay>,
}

impl CloseAll {
    /// Register the protocol on an overlay and keep the root-side handle.
    pub fn register(overlay: &Arc<Overlay>) -> Self {
        overlay.register_protocol(PROTOCOL_NAME, |node| Box::pin(run(node)));
        Self {
            overlay: overlay.clone(),
        }
    }

    /// Shut down every conode of `tree`, leaves first.
    ///
    /// An aliased tree is replaced by the deduplicated binary tree of its
    /// roster; failing to build one aborts the run before anything closes.
    /// Resolves once this (root) conode's own host has closed.
    pub async fn run(&self, tree: &Arc<Tree>) -> Result<()> {
        let close_tree = if tree.uses_whole_roster() {
            tree.clone()
        } else {
            info!("tree aliases identities; rebuilding shutdown tree from its roster");
            let rebuilt = Arc::new(tree.roster().generate_binary_tree());
            if !rebuilt.uses_whole_roster() {
                return Err(ConetError::Tree(
                    "cannot build a deduplicated shutdown tree".into(),
                ));
            }
            self.overlay.register_tree(rebuilt.clone());
            rebuilt
        };

        self.overlay.start_protocol(PROTOCOL_NAME, &close_tree)?;
        self.overlay.host().closed().await;
        Ok(())
    }
}

/// Per-node instance logic: forward, await child acks, ack, close.
async fn run(mut node: TreeNodeInstance) -> Result<()> {
    if !node.is_root() {
        let msg = node.receive().await?;
        if !msg.is::<CloseRequest>() {
            return Err(ConetError::Protocol(format!(
                "expected a close request, got {}",
                msg.msg_type
            )));
        }
    }

    let unreachable = node.broadcast_children(&CloseRequest {}).await;
    let mut pending = node.children().len() - unreachable.len();

    while pending > 0 {
        match node.receive_timeout(ACK_TIMEOUT).await {
            Ok(msg) if msg.is::<CloseAck>() => pending -= 1,
            Ok(msg) => warn!("{}: ignoring {}", node.token(), msg.msg_type),
            Err(ConetError::Timeout) => {
                warn!(
                    "{}: {} children never acknowledged; closing anyway",
                    node.token(),
                    pending
                );
                break;
            }
            Err(e) => {
                warn!("{}: wait for acks failed: {}", node.token(), e);
                break;
            }
        }
    }

    if !node.is_root() {
        // Best effort: the parent may already be tearing down.
        if let Err(e) = node.send_parent(&CloseAck {}).await {
            warn!("{}: could not acknowledge to parent: {}", node.token(), e);
        }
    }

    info!("closing host of {}", node.overlay().identity());
    node.overlay().close().await?;
    Ok(())
}
