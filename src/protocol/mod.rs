//! Protocol instances: the per-tree-node execution handles.
//!
//! A protocol is registered with the overlay as a factory from
//! [`TreeNodeInstance`] to a future. The instance is the protocol's whole
//! world: its position in the tree, a blocking receive on its inbound queue,
//! and sends scoped to its parent and children.

pub mod close_all;
pub mod count;

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{ConetError, Result};
use crate::message::{Message, MessageTypeId};
use crate::overlay::{InstanceKey, Overlay, ProtocolEnvelope, Token};
use crate::tree::{Tree, TreeNodeId};

pub use close_all::CloseAll;
pub use count::{Count, CountOptions, CountOutcome};

/// A message delivered to a protocol instance.
pub struct TreeMessage {
    /// Tree slot the message came from.
    pub from: TreeNodeId,
    /// Wire id of the payload.
    pub msg_type: MessageTypeId,
    /// The decoded payload.
    pub body: Box<dyn Any + Send + Sync>,
}

impl TreeMessage {
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

impl std::fmt::Debug for TreeMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeMessage")
            .field("from", &self.from)
            .field("msg_type", &self.msg_type)
            .finish_non_exhaustive()
    }
}

/// One running protocol instance, bound to one tree slot.
///
/// Dropping the instance (normally by returning from the protocol future)
/// deregisters it; anything addressed to it afterwards is dropped as a late
/// delivery.
pub struct TreeNodeInstance {
    token: Token,
    node: TreeNodeId,
    tree: Arc<Tree>,
    overlay: Arc<Overlay>,
    rx: mpsc::UnboundedReceiver<TreeMessage>,
    config: Option<Box<dyn Any + Send + Sync>>,
}

impl TreeNodeInstance {
    pub(crate) fn new(
        token: Token,
        node: TreeNodeId,
        tree: Arc<Tree>,
        overlay: Arc<Overlay>,
        rx: mpsc::UnboundedReceiver<TreeMessage>,
        config: Option<Box<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            token,
            node,
            tree,
            overlay,
            rx,
            config,
        }
    }

    /// This instance's dispatch key.
    pub fn token(&self) -> &Token {
        &self.token
    }

    /// This instance's tree slot.
    pub fn node(&self) -> TreeNodeId {
        self.node
    }

    /// The tree the run spans.
    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    /// The overlay running this instance.
    pub fn overlay(&self) -> &Arc<Overlay> {
        &self.overlay
    }

    /// Whether this slot is the tree root.
    pub fn is_root(&self) -> bool {
        self.node == self.tree.root()
    }

    /// Parent slot, if any.
    pub fn parent(&self) -> Option<TreeNodeId> {
        self.tree.node(self.node).parent
    }

    /// Child slots in order.
    pub fn children(&self) -> Vec<TreeNodeId> {
        self.tree.node(self.node).children.clone()
    }

    /// Take the start configuration handed to a root instance, if any.
    pub fn take_config<C: Any>(&mut self) -> Option<C> {
        let boxed = self.config.take()?;
        boxed.downcast::<C>().ok().map(|c| *c)
    }

    /// Block until the next message for this instance arrives.
    ///
    /// Unblocks with [`ConetError::Canceled`] when the host closes, so a
    /// waiting instance never outlives its conode.
    pub async fn receive(&mut self) -> Result<TreeMessage> {
        tokio::select! {
            _ = self.overlay.host().closed() => Err(ConetError::Canceled),
            msg = self.rx.recv() => msg.ok_or(ConetError::Closed),
        }
    }

    /// [`receive`](Self::receive) with a caller-supplied deadline.
    pub async fn receive_timeout(&mut self, deadline: Duration) -> Result<TreeMessage> {
        match tokio::time::timeout(deadline, self.receive()).await {
            Ok(result) => result,
            Err(_) => Err(ConetError::Timeout),
        }
    }

    /// Send a payload to another slot of this tree.
    pub async fn send_to<M: Message>(&self, to: TreeNodeId, msg: &M) -> Result<()> {
        let frame = self.overlay.registry().encode(msg)?;
        let env = ProtocolEnvelope {
            token: self.token.clone(),
            from: self.node,
            to,
            inner_type: frame.type_id,
            inner: frame.payload,
        };
        self.overlay.dispatch(env).await
    }

    /// Send a payload to the parent slot.
    pub async fn send_parent<M: Message>(&self, msg: &M) -> Result<()> {
        let parent = self
            .parent()
            .ok_or_else(|| ConetError::Protocol("root has no parent".into()))?;
        self.send_to(parent, msg).await
    }

    /// Send a payload to every child, collecting per-child failures.
    ///
    /// One unreachable child must not wedge an aggregation round, so this
    /// never aborts early; the caller decides what a failure means.
    pub async fn broadcast_children<M: Message>(&self, msg: &M) -> Vec<(TreeNodeId, ConetError)> {
        let mut failures = Vec::new();
        for child in self.children() {
            if let Err(e) = self.send_to(child, msg).await {
                warn!("{}: sending to child slot {} failed: {}", self.token, child, e);
                failures.push((child, e));
            }
        }
        failures
    }
}

impl Drop for TreeNodeInstance {
    fn drop(&mut self) {
        let key: InstanceKey = (self.token.clone(), self.node);
        self.overlay.finish_instance(&key);
    }
}

impl std::fmt::Debug for TreeNodeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeNodeInstance")
            .field("token", &self.token)
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}
