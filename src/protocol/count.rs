//! Count: the template aggregation protocol.
//!
//! The root broadcasts a count request down the tree; every node forwards it
//! to its children, waits for one reply per child under the round deadline,
//! sums its subtree size including itself and replies to its parent. The
//! root driver compares the total against the expected tree size and, on a
//! short or timed-out round, doubles the timeout and restarts the whole run
//! from the root: an at-least-once policy that rides out bring-up churn
//! while conodes are still coming online.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{ConetError, Result};
use crate::message::Message;
use crate::overlay::{Overlay, Token};
use crate::protocol::TreeNodeInstance;
use crate::tree::Tree;

/// Name the protocol is registered and dispatched under.
pub const PROTOCOL_NAME: &str = "Count";

/// Request broadcast down the tree; carries the round timeout so every
/// level gathers under the same deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRequest {
    /// Round timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Message for CountRequest {
    const NAME: &'static str = "CountRequest";
}

/// Reply carrying the size of the sender's subtree, itself included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountReply {
    /// Subtree size.
    pub count: u32,
}

impl Message for CountReply {
    const NAME: &'static str = "CountReply";
}

/// Tunables for a count run.
#[derive(Debug, Clone)]
pub struct CountOptions {
    /// Round timeout of the first attempt; doubled on every retry.
    pub initial_timeout: Duration,
    /// Maximum number of attempts before giving up.
    ///
    /// `None` preserves the original behaviour of retrying until the tree
    /// answers in full, which is only appropriate in a controlled run.
    pub max_attempts: Option<u32>,
}

impl Default for CountOptions {
    fn default() -> Self {
        Self {
            initial_timeout: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

/// Outcome of a converged count run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountOutcome {
    /// Nodes counted; equals the tree size on success.
    pub total: usize,
    /// Attempts it took.
    pub attempts: u32,
    /// Round timeout of the successful attempt.
    pub final_timeout: Duration,
}

/// Root-side handle for running counts over trees.
///
/// Every conode registers the protocol; the root's handle additionally
/// receives the per-run totals.
pub struct Count {
    overlay: Arc<Overlay>,
    results: mpsc::UnboundedReceiver<(Token, u32)>,
}

impl Count {
    /// Register the protocol on an overlay and keep the root-side handle.
    pub fn register(overlay: &Arc<Overlay>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        overlay.register_protocol(PROTOCOL_NAME, move |node| {
            let results = tx.clone();
            Box::pin(run(node, results))
        });
        Self {
            overlay: overlay.clone(),
            results: rx,
        }
    }

    /// Count the tree until the full size answers, doubling the timeout
    /// between attempts.
    pub async fn run(&mut self, tree: &Arc<Tree>, opts: CountOptions) -> Result<CountOutcome> {
        let mut timeout = opts.initial_timeout;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let token =
                self.overlay
                    .start_protocol_with(PROTOCOL_NAME, tree, Box::new(timeout))?;
            info!(
                "counting {} nodes, attempt {} with timeout {:?}",
                tree.size(),
                attempts,
                timeout
            );

            match self.await_total(&token, timeout).await? {
                Some(total) if total as usize == tree.size() => {
                    info!("found all {} nodes", total);
                    return Ok(CountOutcome {
                        total: total as usize,
                        attempts,
                        final_timeout: timeout,
                    });
                }
                Some(total) => info!("found only {} of {} nodes, counting again", total, tree.size()),
                None => info!("count round produced no total, counting again"),
            }

            if let Some(max) = opts.max_attempts {
                if attempts >= max {
                    return Err(ConetError::Protocol(format!(
                        "count did not converge within {max} attempts"
                    )));
                }
            }
            timeout *= 2;
        }
    }

    /// Wait for this attempt's total. The root instance reports within its
    /// own round timeout, so a modest grace on top of it is enough.
    async fn await_total(&mut self, token: &Token, timeout: Duration) -> Result<Option<u32>> {
        let deadline = Instant::now() + timeout * 2 + Duration::from_secs(1);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match tokio::time::timeout(remaining, self.results.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(ConetError::Closed),
                Ok(Some((t, total))) if &t == token => return Ok(Some(total)),
                Ok(Some((stale, _))) => debug!("ignoring total of earlier attempt {}", stale),
            }
        }
    }
}

/// Per-node instance logic, shared by root and inner nodes.
async fn run(mut node: TreeNodeInstance, results: mpsc::UnboundedSender<(Token, u32)>) -> Result<()> {
    let timeout = if node.is_root() {
        node.take_config::<Duration>()
            .unwrap_or_else(|| Duration::from_secs(1))
    } else {
        let msg = node.receive().await?;
        let request: CountRequest = msg.downcast()?;
        Duration::from_millis(request.timeout_ms)
    };

    let request = CountRequest {
        timeout_ms: timeout.as_millis() as u64,
    };
    let unreachable = node.broadcast_children(&request).await;
    let mut pending = node.children().len() - unreachable.len();

    let mut total: u32 = 1;
    let deadline = Instant::now() + timeout;
    while pending > 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!("{}: round over with {} children silent", node.token(), pending);
            break;
        }
        match node.receive_timeout(remaining).await {
            Ok(msg) if msg.is::<CountReply>() => {
                let reply: CountReply = msg.downcast()?;
                total += reply.count;
                pending -= 1;
            }
            Ok(msg) => debug!("{}: ignoring {}", node.token(), msg.msg_type),
            Err(ConetError::Timeout) => {
                debug!("{}: timed out with {} children silent", node.token(), pending);
                break;
            }
            Err(e) => return Err(e),
        }
    }

    if node.is_root() {
        let _ = results.send((node.token().clone(), total));
    } else {
        node.send_parent(&CountReply { count: total }).await?;
    }
    Ok(())
}
