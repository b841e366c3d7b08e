//! P2P message-processing engine for the Galvan node.
//!
//! This crate drives block and transaction propagation between the
//! local node and its peers:
//!
//! - Per-peer state and message dispatch with anti-DoS scoring
//! - Anti-DoS two-phase headers synchronization
//! - Window-based parallel block download with stall detection
//! - Timed, deduplicated transaction request scheduling
//! - A stochastic address manager resistant to table poisoning
//! - BIP 37 bloom and BIP 158 compact filter serving
//!
//! # Architecture
//!
//! The engine is synchronous: sockets live behind the
//! [`ConnectionManager`] collaborator, which feeds framed messages in
//! and accepts outbound messages. Two external events drive all work:
//!
//! ```text
//! ConnectionManager ──frames──► PeerManager::on_message
//!        ▲                            │ dispatch
//!        │ push_message     ┌─────────┼──────────────┐
//!        │                  ▼         ▼              ▼
//!        │            headers sync  block fetch  tx requests
//!        │                  └─────────┼──────────────┘
//!        └──────── PeerManager::tick_send (per-peer timer)
//! ```
//!
//! Chain validation is the [`galvan_chain::ChainManager`]'s concern;
//! the engine only schedules, polices and relays.

pub mod addrman;
pub mod config;
pub mod error;
pub mod filters;
pub mod manager;
pub mod peer;
pub mod protocol;
pub mod sync;
pub mod transport;
pub mod txrequest;

pub use config::{P2pConfig, PROTOCOL_VERSION};
pub use error::{P2pError, P2pResult};
pub use manager::{NetworkEventSink, PeerManager, ValidationEventSink};
pub use peer::{ConnectionDirection, PeerId, ServiceFlags};
pub use protocol::{Message, NetAddress};
pub use transport::ConnectionManager;
