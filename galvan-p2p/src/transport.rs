//! Connection-layer collaborator interfaces.
//!
//! Socket I/O lives outside the engine. The connection manager frames
//! and ships messages; the ban manager keeps long-lived address-level
//! verdicts. Both are object-safe so tests can substitute recorders.

use crate::peer::PeerId;
use crate::protocol::{Message, NetAddress};

/// The socket-owning collaborator.
///
/// `push_message` may be backpressured internally; the engine never
/// holds per-peer locks while calling it.
pub trait ConnectionManager: Send + Sync {
    /// Queue a message for delivery to a peer.
    fn push_message(&self, peer: PeerId, message: Message);

    /// Close a peer's connection. Teardown is reported back through
    /// `on_peer_disconnected`.
    fn disconnect(&self, peer: PeerId);

    /// Whether we already maintain our target outbound count.
    fn outbound_target_reached(&self) -> bool;

    /// Ask for a short-lived feeler connection to test an address.
    fn start_feeler(&self, address: NetAddress);
}

/// Read access to a compact-filter index (BIP 157 serving).
pub trait BlockFilterIndex: Send + Sync {
    /// Encoded filters for blocks from `start_height` up to the block
    /// named by `stop_hash`, as (block_hash, encoded_filter) pairs.
    /// None when the range is unknown or not indexed.
    fn lookup_filter_range(
        &self,
        start_height: u32,
        stop_hash: &galvan_core::Hash256,
    ) -> Option<Vec<(galvan_core::Hash256, Vec<u8>)>>;

    /// Filter hashes for the same range.
    fn lookup_filter_hash_range(
        &self,
        start_height: u32,
        stop_hash: &galvan_core::Hash256,
    ) -> Option<Vec<galvan_core::Hash256>>;

    /// The derived filter header for one block.
    fn lookup_filter_header(
        &self,
        block_hash: &galvan_core::Hash256,
    ) -> Option<galvan_core::Hash256>;
}

/// Address-level banning and discouragement.
pub trait BanMan: Send + Sync {
    /// Operator-banned addresses are never gossiped or accepted.
    fn is_banned(&self, address: &NetAddress) -> bool;

    /// Discouraged addresses are deprioritized but tolerated.
    fn is_discouraged(&self, address: &NetAddress) -> bool;

    /// Mark an address discouraged (misbehavior threshold crossed).
    fn discourage(&self, address: &NetAddress);
}
