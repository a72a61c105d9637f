//! The overlay: per-tree-node protocol instances and message routing.
//!
//! Given a registered [`Tree`] and a registered protocol, the overlay runs
//! one [`TreeNodeInstance`] per local tree slot and routes every inbound
//! envelope to the right instance by its dispatch key: (tree id, protocol
//! name, instance id) plus the destination slot. Instances on non-root
//! conodes are created on demand when their first message arrives; envelopes
//! for finished or unknown keys are dropped silently, since late and
//! duplicate deliveries after completion are expected.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ConetError, Result};
use crate::identity::{Identity, IdentityId};
use crate::message::{Message, MessageRegistry, MessageTypeId};
use crate::protocol::{TreeMessage, TreeNodeInstance};
use crate::tcp::{SecureTcpConn, SecureTcpHost};
use crate::tree::{Roster, Tree, TreeNodeId};

/// Dispatch key of one protocol run.
///
/// Opaque to the wire; both sides must round-trip it exactly.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Token {
    /// Id of the tree the run spans.
    pub tree: Uuid,
    /// Registered protocol name.
    pub protocol: String,
    /// Fresh id for this run.
    pub instance: Uuid,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let instance = self.instance.simple().to_string();
        write!(f, "{}/{}", self.protocol, &instance[..8])
    }
}

/// Wire envelope of one protocol message travelling along a tree edge.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolEnvelope {
    /// Dispatch key.
    pub token: Token,
    /// Sending tree slot.
    pub from: TreeNodeId,
    /// Destination tree slot.
    pub to: TreeNodeId,
    /// Wire id of the inner payload.
    pub inner_type: MessageTypeId,
    /// Encoded inner payload.
    pub inner: Vec<u8>,
}

impl Message for ProtocolEnvelope {
    const NAME: &'static str = "ProtocolEnvelope";
}

/// Future returned by a protocol factory.
pub type ProtocolFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

type ProtocolFactory = Box<dyn Fn(TreeNodeInstance) -> ProtocolFuture + Send + Sync>;

/// An envelope queued to a peer writer, with a completion signal so the
/// sender can await the actual write.
struct OutboundEnvelope {
    env: ProtocolEnvelope,
    done: tokio::sync::oneshot::Sender<Result<()>>,
}

type EnvelopeSender = mpsc::UnboundedSender<OutboundEnvelope>;

pub(crate) type InstanceKey = (Token, TreeNodeId);

/// The protocol-orchestration engine of one conode.
pub struct Overlay {
    host: Arc<SecureTcpHost>,
    registry: Arc<MessageRegistry>,
    trees: Mutex<HashMap<Uuid, Arc<Tree>>>,
    protocols: Mutex<HashMap<String, ProtocolFactory>>,
    instances: Mutex<HashMap<InstanceKey, mpsc::UnboundedSender<TreeMessage>>>,
    finished: Mutex<HashSet<InstanceKey>>,
    peers: Mutex<HashMap<IdentityId, EnvelopeSender>>,
}

impl Overlay {
    /// An overlay over the given secure host.
    pub fn new(host: Arc<SecureTcpHost>, registry: Arc<MessageRegistry>) -> Arc<Self> {
        Arc::new(Self {
            host,
            registry,
            trees: Mutex::new(HashMap::new()),
            protocols: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashSet::new()),
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// The secure host this overlay serves.
    pub fn host(&self) -> &Arc<SecureTcpHost> {
        &self.host
    }

    /// This conode's identity.
    pub fn identity(&self) -> &Identity {
        self.host.identity()
    }

    /// The shared message registry.
    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    /// Start serving: listen on the host and route inbound envelopes.
    pub async fn listen(self: &Arc<Self>) -> Result<SocketAddr> {
        let overlay = self.clone();
        self.host
            .listen(move |conn| {
                let overlay = overlay.clone();
                async move {
                    overlay.attach_conn(conn);
                }
            })
            .await
    }

    /// Make a tree known to this conode.
    pub fn register_tree(&self, tree: Arc<Tree>) {
        self.trees.lock().unwrap().insert(tree.id(), tree);
    }

    /// Register a protocol under its stable name.
    ///
    /// The factory is called once per instance, with the instance's tree
    /// position and inbound queue. Registering one name twice is a
    /// programming error.
    pub fn register_protocol<F>(&self, name: &str, factory: F)
    where
        F: Fn(TreeNodeInstance) -> ProtocolFuture + Send + Sync + 'static,
    {
        let previous = self
            .protocols
            .lock()
            .unwrap()
            .insert(name.to_string(), Box::new(factory));
        assert!(previous.is_none(), "protocol {name} registered twice");
    }

    /// Start a protocol run at the root of `tree`.
    pub fn start_protocol(self: &Arc<Self>, name: &str, tree: &Arc<Tree>) -> Result<Token> {
        self.start_inner(name, tree, None)
    }

    /// Start a protocol run, handing `config` to the root instance.
    pub fn start_protocol_with(
        self: &Arc<Self>,
        name: &str,
        tree: &Arc<Tree>,
        config: Box<dyn Any + Send + Sync>,
    ) -> Result<Token> {
        self.start_inner(name, tree, Some(config))
    }

    fn start_inner(
        self: &Arc<Self>,
        name: &str,
        tree: &Arc<Tree>,
        config: Option<Box<dyn Any + Send + Sync>>,
    ) -> Result<Token> {
        let root = tree.root();
        if tree.identity(root).id() != self.identity().id() {
            return Err(ConetError::Protocol(format!(
                "only the root identity may start {name}"
            )));
        }
        self.register_tree(tree.clone());
        let token = Token {
            tree: tree.id(),
            protocol: name.to_string(),
            instance: Uuid::new_v4(),
        };
        self.spawn_instance(&token, root, tree, config)
            .ok_or_else(|| ConetError::Protocol(format!("protocol {name} is not registered")))?;
        info!("started protocol {}", token);
        Ok(token)
    }

    /// Close the underlying host. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.host.close().await
    }

    /// Attach a negotiated channel: spawn its reader/writer task and make it
    /// the send path for its peer identity.
    fn attach_conn(self: &Arc<Self>, conn: SecureTcpConn) -> EnvelopeSender {
        let peer_id = conn.peer().id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().unwrap().insert(peer_id, tx.clone());
        debug!("attached channel to {}", conn.peer());
        let overlay = self.clone();
        let my_tx = tx.clone();
        tokio::spawn(async move {
            overlay.conn_loop(conn, rx, my_tx).await;
        });
        tx
    }

    async fn conn_loop(
        self: Arc<Self>,
        mut conn: SecureTcpConn,
        mut rx: mpsc::UnboundedReceiver<OutboundEnvelope>,
        my_tx: EnvelopeSender,
    ) {
        let peer_id = conn.peer().id();
        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(out) => {
                        let result = conn.send(&out.env).await;
                        let failed = result.is_err();
                        if let Err(e) = &result {
                            warn!("send to {} failed: {}", peer_id, e);
                        }
                        let _ = out.done.send(result);
                        if failed {
                            break;
                        }
                    }
                    None => break,
                },
                inbound = conn.receive() => match inbound {
                    Ok(msg) if msg.is::<ProtocolEnvelope>() => match msg.downcast::<ProtocolEnvelope>() {
                        Ok(env) => self.route(env),
                        Err(e) => warn!("envelope from {} unusable: {}", peer_id, e),
                    },
                    Ok(msg) => debug!("unexpected {} from {}; dropped", msg.msg_type, peer_id),
                    Err(ConetError::Unmarshal(e)) => {
                        // One bad message; the channel stays up.
                        warn!("undecodable message from {}: {}", peer_id, e);
                    }
                    Err(ConetError::Temporary) => debug!("transient receive fault from {}", peer_id),
                    Err(ConetError::Closed) | Err(ConetError::Eof) | Err(ConetError::Canceled) => break,
                    Err(e) => {
                        warn!("receive from {} failed: {}", peer_id, e);
                        break;
                    }
                }
            }
        }

        {
            let mut peers = self.peers.lock().unwrap();
            let stale = peers
                .get(&peer_id)
                .map(|tx| tx.same_channel(&my_tx))
                .unwrap_or(false);
            if stale {
                peers.remove(&peer_id);
            }
        }
        let _ = conn.close().await;
        debug!("channel to {} detached", peer_id);
    }

    /// Send an envelope towards its destination slot, opening a channel to
    /// the owning conode if none exists. Local slots short-circuit through
    /// the routing path without touching the network.
    pub(crate) async fn dispatch(self: &Arc<Self>, env: ProtocolEnvelope) -> Result<()> {
        let tree = self
            .lookup_tree(env.token.tree)
            .ok_or_else(|| ConetError::Tree(format!("unknown tree {}", env.token.tree)))?;
        if env.to >= tree.size() {
            return Err(ConetError::Tree(format!(
                "destination slot {} outside tree of {} nodes",
                env.to,
                tree.size()
            )));
        }
        let target = tree.identity(env.to).clone();
        if target.id() == self.identity().id() {
            self.route(env);
            return Ok(());
        }
        let tx = self.peer_channel(&target).await?;
        let (done, written) = tokio::sync::oneshot::channel();
        tx.send(OutboundEnvelope { env, done })
            .map_err(|_| ConetError::Closed)?;
        written.await.map_err(|_| ConetError::Closed)?
    }

    async fn peer_channel(self: &Arc<Self>, target: &Identity) -> Result<EnvelopeSender> {
        if let Some(tx) = self.peers.lock().unwrap().get(&target.id()) {
            return Ok(tx.clone());
        }
        let conn = self.host.open(target).await?;
        // Both sides may have dialed at once; prefer the channel that won.
        let existing = self.peers.lock().unwrap().get(&target.id()).cloned();
        if let Some(tx) = existing {
            let mut conn = conn;
            tokio::spawn(async move {
                let _ = conn.close().await;
            });
            return Ok(tx);
        }
        Ok(self.attach_conn(conn))
    }

    /// Route an inbound envelope to its instance, spawning it on demand.
    pub(crate) fn route(self: &Arc<Self>, env: ProtocolEnvelope) {
        let key: InstanceKey = (env.token.clone(), env.to);

        let existing = self.instances.lock().unwrap().get(&key).cloned();
        if let Some(tx) = existing {
            self.deliver(&tx, env);
            return;
        }
        if self.finished.lock().unwrap().contains(&key) {
            debug!("late delivery for finished instance {}; dropped", env.token);
            return;
        }

        let Some(tree) = self.lookup_tree(env.token.tree) else {
            debug!("envelope for unknown tree {}; dropped", env.token.tree);
            return;
        };
        if env.to >= tree.size() {
            warn!("envelope for slot {} outside tree; dropped", env.to);
            return;
        }
        if tree.identity(env.to).id() != self.identity().id() {
            warn!(
                "envelope for slot {} owned by {}; not local, dropped",
                env.to,
                tree.identity(env.to).id()
            );
            return;
        }

        match self.spawn_instance(&env.token, env.to, &tree, None) {
            Some(tx) => self.deliver(&tx, env),
            None => debug!(
                "no protocol {:?} registered here; envelope dropped",
                env.token.protocol
            ),
        }
    }

    fn deliver(&self, tx: &mpsc::UnboundedSender<TreeMessage>, env: ProtocolEnvelope) {
        let body = match self.registry.decode_payload(env.inner_type, &env.inner) {
            Ok(body) => body,
            Err(e) => {
                warn!("dropping undecodable payload for {}: {}", env.token, e);
                return;
            }
        };
        let message = TreeMessage {
            from: env.from,
            msg_type: env.inner_type,
            body,
        };
        if tx.send(message).is_err() {
            debug!("instance {} just finished; message dropped", env.token);
        }
    }

    fn spawn_instance(
        self: &Arc<Self>,
        token: &Token,
        node: TreeNodeId,
        tree: &Arc<Tree>,
        config: Option<Box<dyn Any + Send + Sync>>,
    ) -> Option<mpsc::UnboundedSender<TreeMessage>> {
        let protocols = self.protocols.lock().unwrap();
        let factory = protocols.get(&token.protocol)?;

        let key: InstanceKey = (token.clone(), node);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut instances = self.instances.lock().unwrap();
            if let Some(existing) = instances.get(&key) {
                return Some(existing.clone());
            }
            instances.insert(key, tx.clone());
        }

        let instance =
            TreeNodeInstance::new(token.clone(), node, tree.clone(), self.clone(), rx, config);
        let fut = factory(instance);
        drop(protocols);

        let label = token.clone();
        debug!("spawning instance {} at slot {}", label, node);
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                warn!("protocol instance {} failed: {}", label, e);
            }
        });
        Some(tx)
    }

    /// Find a tree by id, deriving the deduplicated shutdown tree of a known
    /// roster when the id matches its deterministic construction.
    fn lookup_tree(self: &Arc<Self>, id: Uuid) -> Option<Arc<Tree>> {
        if let Some(tree) = self.trees.lock().unwrap().get(&id) {
            return Some(tree.clone());
        }

        let mut rosters: Vec<Roster> = Vec::new();
        {
            let trees = self.trees.lock().unwrap();
            for tree in trees.values() {
                if !rosters.iter().any(|r| r.id() == tree.roster().id()) {
                    rosters.push(tree.roster().clone());
                }
            }
        }
        for roster in rosters {
            let candidate = roster.generate_binary_tree();
            if candidate.id() == id {
                info!("derived tree {} from roster {}", id, roster.id());
                let tree = Arc::new(candidate);
                self.register_tree(tree.clone());
                return Some(tree);
            }
        }
        None
    }

    /// Mark an instance finished: its key becomes a tombstone so late
    /// deliveries are dropped instead of respawning it.
    pub(crate) fn finish_instance(&self, key: &InstanceKey) {
        self.finished.lock().unwrap().insert(key.clone());
        self.instances.lock().unwrap().remove(key);
        debug!("instance {} at slot {} finished", key.0, key.1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrips_through_bincode() {
        let token = Token {
            tree: Uuid::new_v5(&Uuid::NAMESPACE_URL, b"tree"),
            protocol: "Count".into(),
            instance: Uuid::new_v5(&Uuid::NAMESPACE_URL, b"run"),
        };
        let env = ProtocolEnvelope {
            token: token.clone(),
            from: 0,
            to: 2,
            inner_type: MessageTypeId::from_name("test.Inner"),
            inner: vec![1, 2, 3],
        };
        let bytes = bincode::serialize(&env).unwrap();
        let back: ProtocolEnvelope = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.token, token);
        assert_eq!(back.from, 0);
        assert_eq!(back.to, 2);
        assert_eq!(back.inner, vec![1, 2, 3]);
    }
}
