//! TCP host and connection.
//!
//! A [`TcpHost`] owns a set of point-to-point connections: it opens outbound
//! ones with bounded retry (peers may not be up yet when a run starts) and
//! accepts inbound ones concurrently, handing each to the caller's handler
//! in its own task so one slow peer never blocks new accepts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::codec::{FrameCodec as Codec, DEFAULT_MAX_FRAME_SIZE};
use crate::error::{ConetError, Result};
use crate::message::{ApplicationMessage, MessageRegistry};

/// Tunables for a host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// How many times to dial an address before giving up.
    pub max_dial_attempts: u32,
    /// Fixed wait between dial attempts.
    pub dial_retry_wait: Duration,
    /// Deadline for writing one frame.
    pub send_timeout: Duration,
    /// Deadline for the identity handshake on a fresh connection.
    pub negotiation_timeout: Duration,
    /// Maximum encoded frame size accepted or produced.
    pub max_frame_size: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_dial_attempts: 10,
            dial_retry_wait: Duration::from_secs(1),
            send_timeout: Duration::from_secs(5),
            negotiation_timeout: Duration::from_secs(5),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Default)]
struct TrafficCounters {
    msgs_sent: AtomicU64,
    bytes_sent: AtomicU64,
    msgs_received: AtomicU64,
    bytes_received: AtomicU64,
}

impl TrafficCounters {
    fn record_sent(&self, bytes: usize) {
        self.msgs_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_received(&self, bytes: usize) {
        self.msgs_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Traffic {
        Traffic {
            msgs_sent: self.msgs_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            msgs_received: self.msgs_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a host's traffic counters, for the driver's bandwidth sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Traffic {
    /// Messages written.
    pub msgs_sent: u64,
    /// Frame bytes written.
    pub bytes_sent: u64,
    /// Messages read.
    pub msgs_received: u64,
    /// Frame bytes read.
    pub bytes_received: u64,
}

/// A TCP host: opens, accepts and tracks connections.
pub struct TcpHost {
    registry: Arc<MessageRegistry>,
    config: HostConfig,
    conns: Arc<Mutex<HashMap<String, CancellationToken>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    listening: AtomicBool,
    traffic: Arc<TrafficCounters>,
}

impl TcpHost {
    /// A fresh host sharing the given message registry.
    pub fn new(registry: Arc<MessageRegistry>, config: HostConfig) -> Self {
        Self {
            registry,
            config,
            conns: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            traffic: Arc::new(TrafficCounters::default()),
        }
    }

    /// The host configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Current traffic counters.
    pub fn traffic(&self) -> Traffic {
        self.traffic.snapshot()
    }

    /// Open a connection to `addr`, retrying on failure.
    ///
    /// Dial failures during start-up races are expected; the host retries up
    /// to `max_dial_attempts` with a fixed wait before reporting
    /// [`ConetError::DialFailure`].
    pub async fn open(&self, addr: &str) -> Result<TcpConn> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConetError::Closed);
        }

        let max = self.config.max_dial_attempts;
        let mut attempt = 0;
        let stream = loop {
            attempt += 1;
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) => {
                    debug!("dial {} attempt {}/{} failed: {}", addr, attempt, max, e);
                    if attempt >= max {
                        return Err(ConetError::DialFailure {
                            target: addr.to_string(),
                            attempts: attempt,
                        });
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(ConetError::Canceled),
                        _ = tokio::time::sleep(self.config.dial_retry_wait) => {}
                    }
                }
            }
        };

        let conn = self.track(stream, addr.to_string()).await;
        Ok(conn)
    }

    /// Bind `addr` and accept connections until the host closes.
    ///
    /// Returns the bound address (useful when the port is 0). Every accepted
    /// connection is handed to `handler` in its own task.
    pub async fn listen<F, Fut>(&self, addr: &str, handler: F) -> Result<SocketAddr>
    where
        F: Fn(TcpConn) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ConetError::Listen(format!("{addr}: {e}")))?;
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(ConetError::Listen("host is already listening".into()));
        }
        let local = listener.local_addr()?;
        info!("listening on {}", local);

        let registry = self.registry.clone();
        let config = self.config.clone();
        let conns = self.conns.clone();
        let shutdown = self.shutdown.clone();
        let traffic = self.traffic.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("listener on {} stopping", local);
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            debug!("accepted connection from {}", remote);
                            let conn = TcpConn::from_stream(
                                stream,
                                remote.to_string(),
                                registry.clone(),
                                &config,
                                shutdown.child_token(),
                                traffic.clone(),
                            );
                            conns.lock().await.insert(remote.to_string(), conn.shutdown.clone());
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                handler(conn).await;
                            });
                        }
                        Err(e) => {
                            error!("accept failed: {}", e);
                        }
                    }
                }
            }
        });

        Ok(local)
    }

    /// Close the host: stop accepting, close every tracked connection.
    ///
    /// Idempotent; a second close is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("host closing");
        self.shutdown.cancel();
        self.conns.lock().await.clear();
        Ok(())
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the host has been closed.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    async fn track(&self, stream: TcpStream, remote: String) -> TcpConn {
        let conn = TcpConn::from_stream(
            stream,
            remote.clone(),
            self.registry.clone(),
            &self.config,
            self.shutdown.child_token(),
            self.traffic.clone(),
        );
        self.conns.lock().await.insert(remote, conn.shutdown.clone());
        conn
    }
}

/// One point-to-point connection with typed message framing.
pub struct TcpConn {
    endpoint: String,
    framed: Framed<TcpStream, Codec>,
    registry: Arc<MessageRegistry>,
    shutdown: CancellationToken,
    send_timeout: Duration,
    traffic: Arc<TrafficCounters>,
    closed: bool,
}

impl TcpConn {
    fn from_stream(
        stream: TcpStream,
        endpoint: String,
        registry: Arc<MessageRegistry>,
        config: &HostConfig,
        shutdown: CancellationToken,
        traffic: Arc<TrafficCounters>,
    ) -> Self {
        Self {
            endpoint,
            framed: Framed::new(stream, Codec::new(config.max_frame_size)),
            registry,
            shutdown,
            send_timeout: config.send_timeout,
            traffic,
            closed: false,
        }
    }

    /// Address of the remote endpoint.
    pub fn remote(&self) -> &str {
        &self.endpoint
    }

    /// Encode and send one registered payload.
    pub async fn send<M: std::any::Any + Send + Sync>(&mut self, msg: &M) -> Result<()> {
        if self.closed {
            return Err(ConetError::Closed);
        }
        let frame = self.registry.encode(msg)?;
        let len = frame.encoded_len();
        match tokio::time::timeout(self.send_timeout, self.framed.send(frame)).await {
            Err(_) => Err(ConetError::Timeout),
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => {
                self.traffic.record_sent(len);
                Ok(())
            }
        }
    }

    /// Receive and decode the next message.
    ///
    /// Blocks until a full frame arrives, the connection fails, or the host
    /// closes (then [`ConetError::Canceled`]). An unknown or malformed
    /// payload is reported as [`ConetError::Unmarshal`] and leaves the
    /// connection usable for subsequent receives.
    pub async fn receive(&mut self) -> Result<ApplicationMessage> {
        if self.closed {
            return Err(ConetError::Closed);
        }
        let frame = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(ConetError::Canceled),
            next = self.framed.try_next() => match next {
                Ok(Some(frame)) => frame,
                Ok(None) => return Err(ConetError::Eof),
                Err(e) => return Err(e),
            }
        };
        self.traffic.record_received(frame.encoded_len());
        let mut msg = self.registry.decode(&frame)?;
        msg.from = self.endpoint.clone();
        Ok(msg)
    }

    /// [`receive`](Self::receive) with a caller-supplied deadline.
    pub async fn receive_timeout(&mut self, deadline: Duration) -> Result<ApplicationMessage> {
        match tokio::time::timeout(deadline, self.receive()).await {
            Ok(result) => result,
            Err(_) => Err(ConetError::Timeout),
        }
    }

    /// Close the connection. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.shutdown.cancel();
        if let Err(e) = self.framed.get_mut().shutdown().await {
            debug!("shutdown of {} reported: {}", self.endpoint, e);
        }
        Ok(())
    }
}

impl Drop for TcpConn {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConn")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
