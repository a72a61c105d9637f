//! Identity-declaring secure channels.
//!
//! A [`SecureTcpHost`] wraps a [`TcpHost`] with a mutual identity
//! declaration exchanged on every fresh connection: each side sends its own
//! [`Identity`] and requires the peer's in return. The check is fail-closed
//! in both directions: a connection that did not finish the handshake is
//! never exposed to the caller. It is a declaration check, not a
//! cryptographically bound transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{ConetError, Result};
use crate::identity::Identity;
use crate::message::{ApplicationMessage, MessageRegistry, MessageTypeId};
use crate::tcp::host::{HostConfig, TcpConn, TcpHost, Traffic};

/// A host tied to an identity, producing negotiated channels only.
pub struct SecureTcpHost {
    host: TcpHost,
    identity: Identity,
}

impl SecureTcpHost {
    /// A secure host for `identity`.
    pub fn new(identity: Identity, registry: Arc<MessageRegistry>, config: HostConfig) -> Self {
        Self {
            host: TcpHost::new(registry, config),
            identity,
        }
    }

    /// This host's identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The underlying transport host.
    pub fn host(&self) -> &TcpHost {
        &self.host
    }

    /// Current traffic counters.
    pub fn traffic(&self) -> Traffic {
        self.host.traffic()
    }

    /// Listen on the first bindable address of this host's identity.
    ///
    /// Every accepted connection runs the identity handshake before being
    /// handed to `handler`; failed negotiations drop the connection.
    /// Fails with [`ConetError::Listen`] if no configured address binds.
    pub async fn listen<F, Fut>(&self, handler: F) -> Result<SocketAddr>
    where
        F: Fn(SecureTcpConn) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let own = self.identity.clone();
        let timeout = self.host.config().negotiation_timeout;
        let wrapped = move |mut conn: TcpConn| {
            let own = own.clone();
            let handler = handler.clone();
            async move {
                match negotiate_listen(&mut conn, &own, timeout).await {
                    Ok(peer) => {
                        debug!("negotiated identity {} on {}", peer, conn.remote());
                        handler(SecureTcpConn { conn, peer }).await;
                    }
                    Err(e) => {
                        warn!("dropping {}: {}", conn.remote(), e);
                        let _ = conn.close().await;
                    }
                }
            }
        };

        let mut last_err = None;
        for addr in self.identity.addresses() {
            match self.host.listen(addr, wrapped.clone()).await {
                Ok(bound) => {
                    info!("identity {} listening on {}", self.identity.id(), bound);
                    return Ok(bound);
                }
                Err(e) => {
                    warn!("cannot listen on {}: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(ConetError::Listen(format!(
            "no address of {} could be bound (last error: {})",
            self.identity,
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "none configured".into())
        )))
    }

    /// Open a negotiated channel to `to`.
    ///
    /// Tries each address of the identity in order; a dead address is only
    /// logged as long as a later one succeeds. After the handshake the
    /// received identity must match the one dialed, otherwise the connection
    /// is dropped with [`ConetError::Negotiation`].
    pub async fn open(&self, to: &Identity) -> Result<SecureTcpConn> {
        let mut attempts = 0;
        for addr in to.addresses() {
            attempts += self.host.config().max_dial_attempts;
            let mut conn = match self.host.open(addr).await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!("address {} of {} unreachable: {}", addr, to.id(), e);
                    continue;
                }
            };

            let timeout = self.host.config().negotiation_timeout;
            let peer = match negotiate_open(&mut conn, &self.identity, to, timeout).await {
                Ok(peer) => peer,
                Err(e) => {
                    let _ = conn.close().await;
                    return Err(e);
                }
            };
            return Ok(SecureTcpConn { conn, peer });
        }
        Err(ConetError::DialFailure {
            target: to.to_string(),
            attempts,
        })
    }

    /// Close the underlying host. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.host.close().await
    }

    /// Resolves once the host has been closed.
    pub async fn closed(&self) {
        self.host.closed().await;
    }
}

/// Accept-side handshake: declare ourselves, read the peer's declaration.
async fn negotiate_listen(
    conn: &mut TcpConn,
    own: &Identity,
    timeout: Duration,
) -> Result<Identity> {
    conn.send(own)
        .await
        .map_err(|e| ConetError::Negotiation(format!("sending local identity: {e}")))?;
    let msg = conn
        .receive_timeout(timeout)
        .await
        .map_err(|e| ConetError::Negotiation(format!("receiving remote identity: {e}")))?;
    if msg.msg_type != MessageTypeId::of::<Identity>() {
        return Err(ConetError::Negotiation(format!(
            "expected an identity, got type {}",
            msg.msg_type
        )));
    }
    msg.downcast::<Identity>()
        .map_err(|e| ConetError::Negotiation(e.to_string()))
}

/// Open-side handshake: listen-side negotiation plus the dialed-id check.
async fn negotiate_open(
    conn: &mut TcpConn,
    own: &Identity,
    dialed: &Identity,
    timeout: Duration,
) -> Result<Identity> {
    let peer = negotiate_listen(conn, own, timeout).await?;
    if peer.id() != dialed.id() {
        return Err(ConetError::Negotiation(format!(
            "peer declared identity {} instead of dialed {}",
            peer.id(),
            dialed.id()
        )));
    }
    Ok(peer)
}

/// A negotiated channel; every received message carries the peer identity.
pub struct SecureTcpConn {
    conn: TcpConn,
    peer: Identity,
}

impl SecureTcpConn {
    /// The negotiated peer identity.
    pub fn peer(&self) -> &Identity {
        &self.peer
    }

    /// Address of the remote endpoint.
    pub fn remote(&self) -> &str {
        self.conn.remote()
    }

    /// Encode and send one registered payload.
    pub async fn send<M: std::any::Any + Send + Sync>(&mut self, msg: &M) -> Result<()> {
        self.conn.send(msg).await
    }

    /// Receive the next message with the peer identity attached.
    pub async fn receive(&mut self) -> Result<ApplicationMessage> {
        let mut msg = self.conn.receive().await?;
        msg.identity = Some(self.peer.clone());
        Ok(msg)
    }

    /// [`receive`](Self::receive) with a caller-supplied deadline.
    pub async fn receive_timeout(&mut self, deadline: Duration) -> Result<ApplicationMessage> {
        let mut msg = self.conn.receive_timeout(deadline).await?;
        msg.identity = Some(self.peer.clone());
        Ok(msg)
    }

    /// Close the channel. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        self.conn.close().await
    }
}

impl std::fmt::Debug for SecureTcpConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureTcpConn")
            .field("peer", &self.peer.id())
            .field("remote", &self.conn.remote())
            .finish()
    }
}
