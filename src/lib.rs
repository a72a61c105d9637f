//! # conet - collective-authority networking
//!
//! conet is the messaging substrate and protocol-orchestration engine for
//! networks of autonomous conodes that jointly execute multi-party
//! protocols (collective signing, proof aggregation, key ceremonies)
//! structured as communication trees:
//!
//! * **Typed transport** - every payload is registered once in an explicit
//!   [`MessageRegistry`] and travels as a checksummed, length-prefixed frame
//! * **Identity-declaring channels** - every fresh connection exchanges
//!   [`Identity`] declarations before the caller ever sees it
//! * **Retrying dials** - conodes of one run start in any order; opening a
//!   connection rides out the start-up race with bounded retries
//! * **Tree overlay** - one protocol instance per tree node, messages scoped
//!   to parent/children, dispatch by (tree id, protocol name, instance id)
//! * **Management protocols** - [`Count`](protocol::Count) to establish that
//!   a tree is fully up, [`CloseAll`](protocol::CloseAll) for leaves-first
//!   shutdown
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use conet::protocol::{CloseAll, Count, CountOptions};
//! use conet::suite::testing::TestElement;
//! use conet::suite::PublicKey;
//! use conet::{HostConfig, Identity, MessageRegistry, Overlay, Roster, SecureTcpHost};
//!
//! # async fn example() -> conet::Result<()> {
//! let registry = Arc::new(MessageRegistry::with_core_types());
//!
//! let public = PublicKey::from_element(&TestElement::from_seed(1))?;
//! let identity = Identity::new(public, vec!["127.0.0.1:2000".into()]);
//!
//! let host = Arc::new(SecureTcpHost::new(
//!     identity.clone(),
//!     registry.clone(),
//!     HostConfig::default(),
//! ));
//! let overlay = Overlay::new(host, registry);
//! let mut count = Count::register(&overlay);
//! let close = CloseAll::register(&overlay);
//! overlay.listen().await?;
//!
//! // The driver supplies the same roster and tree to every conode.
//! let roster = Roster::new(vec![identity /* , peers ... */])?;
//! let tree = Arc::new(roster.generate_binary_tree());
//! overlay.register_tree(tree.clone());
//!
//! // Root only: wait for the whole tree, then tear it down.
//! let outcome = count.run(&tree, CountOptions::default()).await?;
//! assert_eq!(outcome.total, tree.size());
//! close.run(&tree).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Wire format
//!
//! One frame carries one registered payload:
//!
//! ```text
//! MAGIC (2B) | VER (1B) | TYPE (16B) | PAY_LEN (4B BE) | PAYLOAD | CRC16 (2B BE)
//! ```
//!
//! - **MAGIC**: `0x43 0x4f` ("CO")
//! - **VER**: protocol version (`0x01` for v1)
//! - **TYPE**: UUIDv5 of the payload's registered name
//! - **PAY_LEN**: big-endian payload length
//! - **PAYLOAD**: the registered payload's encoding (structural or custom)
//! - **CRC16**: checksum over TYPE | PAYLOAD
//!
//! Participants that agree on payload names agree on the whole wire format.
//!
//! ## Failure model
//!
//! Transport faults are classified ([`ConetError`]): `Closed`, `Eof`,
//! `Canceled`, `Temporary` (retryable), `Timeout` (back off), `Unknown`.
//! A failed identity negotiation drops the connection and never surfaces a
//! half-negotiated channel. An undecodable payload is isolated to that one
//! message. Envelopes for finished or unknown protocol instances are dropped
//! silently - late deliveries after completion are part of normal operation.

pub mod codec;
pub mod error;
pub mod frame;
pub mod identity;
pub mod message;
pub mod overlay;
pub mod protocol;
pub mod suite;
pub mod tcp;
pub mod tree;

// Re-export the main types for convenience
pub use codec::FrameCodec;
pub use error::{ConetError, Result};
pub use frame::{encode_frame, try_decode_frame, Frame, MAGIC, VERSION};
pub use identity::{Identity, IdentityId};
pub use message::{ApplicationMessage, BinaryMessage, Message, MessageRegistry, MessageTypeId};
pub use overlay::{Overlay, ProtocolEnvelope, Token};
pub use tcp::{HostConfig, SecureTcpConn, SecureTcpHost, TcpConn, TcpHost, Traffic};
pub use tree::{Roster, Tree, TreeNode, TreeNodeId};
