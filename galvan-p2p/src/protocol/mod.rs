//! Wire protocol: framing, message types and address encodings.

pub mod address;
pub mod framing;
pub mod inventory;
pub mod messages;

pub use address::{AddrV2, NetAddress, TimedAddress};
pub use framing::MessageCodec;
pub use inventory::{InvItem, InvType};
pub use messages::{
    CompactBlock, Message, PrefilledTransaction, VersionMessage,
};
