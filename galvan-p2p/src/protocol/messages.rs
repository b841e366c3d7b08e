//! Protocol messages and their payload encodings.
//!
//! Every variant maps to one wire command. Payload layouts are
//! bit-exact; size-limit *policing* (inv counts, locator lengths)
//! happens in the handlers so violations can be punished rather than
//! silently dropped, while decoding itself only guards allocations.

use galvan_core::crypto::hashing::sha256;
use galvan_core::crypto::siphash::siphash_u256_extra;
use galvan_core::{
    Block, BlockHeader, DecodeError, Decoder, Encoder, Hash256, Transaction,
};

use crate::filters::merkle::PartialMerkleTree;
use crate::protocol::address::{NetAddress, TimedAddress};
use crate::protocol::inventory::InvItem;

/// Version information exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    /// Receiver address as the sender sees it.
    pub addr_recv_services: u64,
    pub addr_recv: NetAddress,
    /// Sender's own address (historically; rarely meaningful).
    pub addr_from_services: u64,
    pub addr_from: NetAddress,
    /// Random nonce for self-connection detection.
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    /// BIP 37 relay flag; absent means true.
    pub relay: bool,
}

/// A transaction shipped inside a compact block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefilledTransaction {
    /// Absolute index in the block (differential on the wire).
    pub index: u32,
    pub tx: Transaction,
}

/// A BIP 152 compact block: header, short IDs, prefilled transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactBlock {
    pub header: BlockHeader,
    pub nonce: u64,
    /// 48-bit short transaction IDs.
    pub short_ids: Vec<u64>,
    pub prefilled: Vec<PrefilledTransaction>,
}

impl CompactBlock {
    /// Build the announcement form of a block: coinbase prefilled,
    /// everything else as short IDs.
    pub fn from_block(block: &Block, nonce: u64) -> Self {
        let (k0, k1) = short_id_keys(&block.header, nonce);
        let mut short_ids = Vec::new();
        let mut prefilled = Vec::new();
        for (index, tx) in block.transactions.iter().enumerate() {
            if index == 0 {
                prefilled.push(PrefilledTransaction {
                    index: 0,
                    tx: tx.clone(),
                });
            } else {
                short_ids.push(short_id(k0, k1, &tx.wtxid()));
            }
        }
        Self {
            header: block.header,
            nonce,
            short_ids,
            prefilled,
        }
    }

    /// Total transactions the block claims.
    pub fn total_tx_count(&self) -> usize {
        self.short_ids.len() + self.prefilled.len()
    }

    /// The SipHash keys for this block's short IDs.
    pub fn short_id_keys(&self) -> (u64, u64) {
        short_id_keys(&self.header, self.nonce)
    }
}

/// Derive the short ID keys from the header and nonce.
pub fn short_id_keys(header: &BlockHeader, nonce: u64) -> (u64, u64) {
    let mut enc = Encoder::with_capacity(88);
    header.consensus_encode(&mut enc);
    enc.write_u64_le(nonce);
    let digest = sha256(&enc.into_inner());
    let k0 = u64::from_le_bytes(digest[0..8].try_into().expect("8 bytes"));
    let k1 = u64::from_le_bytes(digest[8..16].try_into().expect("8 bytes"));
    (k0, k1)
}

/// Compute a transaction's 48-bit short ID.
pub fn short_id(k0: u64, k1: u64, wtxid: &Hash256) -> u64 {
    siphash_u256_extra(k0, k1, wtxid, 0) & 0xffff_ffff_ffff
}

/// All protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    // Handshake and negotiation
    Version(VersionMessage),
    Verack,
    WtxidRelay,
    SendAddrV2,
    SendHeaders,
    SendCmpct { announce: bool, version: u64 },

    // Address gossip
    Addr(Vec<TimedAddress>),
    AddrV2(Vec<TimedAddress>),
    GetAddr,

    // Inventory and data exchange
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    GetBlocks { locator: Vec<Hash256>, stop_hash: Hash256 },
    GetHeaders { locator: Vec<Hash256>, stop_hash: Hash256 },
    Headers(Vec<BlockHeader>),
    Block(Block),
    MerkleBlock { header: BlockHeader, tree: PartialMerkleTree },
    Tx(Transaction),
    CmpctBlock(CompactBlock),
    GetBlockTxn { block_hash: Hash256, indexes: Vec<u32> },
    BlockTxn { block_hash: Hash256, transactions: Vec<Transaction> },
    MempoolRequest,

    // Keepalive
    Ping(u64),
    Pong(u64),

    // BIP 37 bloom filtering
    FilterLoad { data: Vec<u8>, hash_funcs: u32, tweak: u32, flags: u8 },
    FilterAdd { data: Vec<u8> },
    FilterClear,
    FeeFilter(i64),

    // BIP 157 compact filters
    GetCFilters { filter_type: u8, start_height: u32, stop_hash: Hash256 },
    CFilter { filter_type: u8, block_hash: Hash256, filter: Vec<u8> },
    GetCFHeaders { filter_type: u8, start_height: u32, stop_hash: Hash256 },
    CFHeaders {
        filter_type: u8,
        stop_hash: Hash256,
        prev_filter_header: Hash256,
        filter_hashes: Vec<Hash256>,
    },
    GetCFCheckpt { filter_type: u8, stop_hash: Hash256 },
    CFCheckpt { filter_type: u8, stop_hash: Hash256, headers: Vec<Hash256> },

    /// A command we do not recognize; ignored by the engine.
    Unknown { command: String, payload: Vec<u8> },
}

impl Message {
    /// The wire command string.
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::WtxidRelay => "wtxidrelay",
            Message::SendAddrV2 => "sendaddrv2",
            Message::SendHeaders => "sendheaders",
            Message::SendCmpct { .. } => "sendcmpct",
            Message::Addr(_) => "addr",
            Message::AddrV2(_) => "addrv2",
            Message::GetAddr => "getaddr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::GetBlocks { .. } => "getblocks",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::Block(_) => "block",
            Message::MerkleBlock { .. } => "merkleblock",
            Message::Tx(_) => "tx",
            Message::CmpctBlock(_) => "cmpctblock",
            Message::GetBlockTxn { .. } => "getblocktxn",
            Message::BlockTxn { .. } => "blocktxn",
            Message::MempoolRequest => "mempool",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::FilterLoad { .. } => "filterload",
            Message::FilterAdd { .. } => "filteradd",
            Message::FilterClear => "filterclear",
            Message::FeeFilter(_) => "feefilter",
            Message::GetCFilters { .. } => "getcfilters",
            Message::CFilter { .. } => "cfilter",
            Message::GetCFHeaders { .. } => "getcfheaders",
            Message::CFHeaders { .. } => "cfheaders",
            Message::GetCFCheckpt { .. } => "getcfcheckpt",
            Message::CFCheckpt { .. } => "cfcheckpt",
            Message::Unknown { command, .. } => command,
        }
    }

    /// Serialize the payload (everything after the frame header).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            Message::Version(v) => {
                enc.write_i32_le(v.version);
                enc.write_u64_le(v.services);
                enc.write_i64_le(v.timestamp);
                v.addr_recv.encode_legacy(v.addr_recv_services, &mut enc);
                v.addr_from.encode_legacy(v.addr_from_services, &mut enc);
                enc.write_u64_le(v.nonce);
                enc.write_var_str(&v.user_agent);
                enc.write_i32_le(v.start_height);
                enc.write_u8(v.relay as u8);
            }
            Message::Verack
            | Message::WtxidRelay
            | Message::SendAddrV2
            | Message::SendHeaders
            | Message::GetAddr
            | Message::MempoolRequest
            | Message::FilterClear => {}
            Message::SendCmpct { announce, version } => {
                enc.write_u8(*announce as u8);
                enc.write_u64_le(*version);
            }
            Message::Addr(entries) => {
                enc.write_compact_size(entries.len() as u64);
                for entry in entries {
                    entry.encode_legacy(&mut enc);
                }
            }
            Message::AddrV2(entries) => {
                enc.write_compact_size(entries.len() as u64);
                for entry in entries {
                    entry.encode_v2(&mut enc);
                }
            }
            Message::Inv(items) | Message::GetData(items) | Message::NotFound(items) => {
                enc.write_compact_size(items.len() as u64);
                for item in items {
                    item.consensus_encode(&mut enc);
                }
            }
            Message::GetBlocks { locator, stop_hash }
            | Message::GetHeaders { locator, stop_hash } => {
                enc.write_i32_le(crate::config::PROTOCOL_VERSION);
                enc.write_compact_size(locator.len() as u64);
                for hash in locator {
                    enc.write_bytes(hash);
                }
                enc.write_bytes(stop_hash);
            }
            Message::Headers(headers) => {
                enc.write_compact_size(headers.len() as u64);
                for header in headers {
                    header.consensus_encode(&mut enc);
                    // Headers travel with an always-zero tx count.
                    enc.write_compact_size(0);
                }
            }
            Message::Block(block) => block.consensus_encode(&mut enc),
            Message::MerkleBlock { header, tree } => {
                header.consensus_encode(&mut enc);
                tree.consensus_encode(&mut enc);
            }
            Message::Tx(tx) => tx.consensus_encode(&mut enc, true),
            Message::CmpctBlock(cmpct) => {
                cmpct.header.consensus_encode(&mut enc);
                enc.write_u64_le(cmpct.nonce);
                enc.write_compact_size(cmpct.short_ids.len() as u64);
                for id in &cmpct.short_ids {
                    enc.write_bytes(&id.to_le_bytes()[..6]);
                }
                enc.write_compact_size(cmpct.prefilled.len() as u64);
                let mut last_index = 0u32;
                for prefilled in &cmpct.prefilled {
                    // Differential index encoding.
                    let diff = prefilled.index - last_index;
                    enc.write_compact_size(diff as u64);
                    last_index = prefilled.index + 1;
                    prefilled.tx.consensus_encode(&mut enc, true);
                }
            }
            Message::GetBlockTxn { block_hash, indexes } => {
                enc.write_bytes(block_hash);
                enc.write_compact_size(indexes.len() as u64);
                let mut last_index = 0u32;
                for index in indexes {
                    enc.write_compact_size((index - last_index) as u64);
                    last_index = index + 1;
                }
            }
            Message::BlockTxn {
                block_hash,
                transactions,
            } => {
                enc.write_bytes(block_hash);
                enc.write_compact_size(transactions.len() as u64);
                for tx in transactions {
                    tx.consensus_encode(&mut enc, true);
                }
            }
            Message::Ping(nonce) | Message::Pong(nonce) => enc.write_u64_le(*nonce),
            Message::FilterLoad {
                data,
                hash_funcs,
                tweak,
                flags,
            } => {
                enc.write_var_bytes(data);
                enc.write_u32_le(*hash_funcs);
                enc.write_u32_le(*tweak);
                enc.write_u8(*flags);
            }
            Message::FilterAdd { data } => enc.write_var_bytes(data),
            Message::FeeFilter(rate) => enc.write_i64_le(*rate),
            Message::GetCFilters {
                filter_type,
                start_height,
                stop_hash,
            }
            | Message::GetCFHeaders {
                filter_type,
                start_height,
                stop_hash,
            } => {
                enc.write_u8(*filter_type);
                enc.write_u32_le(*start_height);
                enc.write_bytes(stop_hash);
            }
            Message::CFilter {
                filter_type,
                block_hash,
                filter,
            } => {
                enc.write_u8(*filter_type);
                enc.write_bytes(block_hash);
                enc.write_var_bytes(filter);
            }
            Message::CFHeaders {
                filter_type,
                stop_hash,
                prev_filter_header,
                filter_hashes,
            } => {
                enc.write_u8(*filter_type);
                enc.write_bytes(stop_hash);
                enc.write_bytes(prev_filter_header);
                enc.write_compact_size(filter_hashes.len() as u64);
                for hash in filter_hashes {
                    enc.write_bytes(hash);
                }
            }
            Message::GetCFCheckpt {
                filter_type,
                stop_hash,
            } => {
                enc.write_u8(*filter_type);
                enc.write_bytes(stop_hash);
            }
            Message::CFCheckpt {
                filter_type,
                stop_hash,
                headers,
            } => {
                enc.write_u8(*filter_type);
                enc.write_bytes(stop_hash);
                enc.write_compact_size(headers.len() as u64);
                for header in headers {
                    enc.write_bytes(header);
                }
            }
            Message::Unknown { payload, .. } => enc.write_bytes(payload),
        }
        enc.into_inner()
    }

    /// Parse a payload for the given command. Unrecognized commands
    /// decode to [`Message::Unknown`].
    pub fn decode(command: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(payload);
        let message = match command {
            "version" => {
                let version = dec.read_i32_le()?;
                let services = dec.read_u64_le()?;
                let timestamp = dec.read_i64_le()?;
                let (addr_recv_services, addr_recv) = NetAddress::decode_legacy(&mut dec)?;
                let (addr_from_services, addr_from) = NetAddress::decode_legacy(&mut dec)?;
                let nonce = dec.read_u64_le()?;
                let user_agent = dec.read_var_str()?;
                let start_height = dec.read_i32_le()?;
                // The relay flag is optional; absence means relay.
                let relay = match dec.read_u8() {
                    Ok(byte) => byte != 0,
                    Err(_) => true,
                };
                Message::Version(VersionMessage {
                    version,
                    services,
                    timestamp,
                    addr_recv_services,
                    addr_recv,
                    addr_from_services,
                    addr_from,
                    nonce,
                    user_agent,
                    start_height,
                    relay,
                })
            }
            "verack" => Message::Verack,
            "wtxidrelay" => Message::WtxidRelay,
            "sendaddrv2" => Message::SendAddrV2,
            "sendheaders" => Message::SendHeaders,
            "sendcmpct" => Message::SendCmpct {
                announce: dec.read_u8()? != 0,
                version: dec.read_u64_le()?,
            },
            "addr" => {
                let count = dec.read_size()?;
                let mut entries = Vec::with_capacity(count.min(dec.remaining() / 30 + 1));
                for _ in 0..count {
                    entries.push(TimedAddress::decode_legacy(&mut dec)?);
                }
                Message::Addr(entries)
            }
            "addrv2" => {
                let count = dec.read_size()?;
                let mut entries = Vec::with_capacity(count.min(dec.remaining() / 10 + 1));
                for _ in 0..count {
                    entries.push(TimedAddress::decode_v2(&mut dec)?);
                }
                Message::AddrV2(entries)
            }
            "getaddr" => Message::GetAddr,
            "inv" | "getdata" | "notfound" => {
                let count = dec.read_size()?;
                let mut items = Vec::with_capacity(count.min(dec.remaining() / 36 + 1));
                for _ in 0..count {
                    items.push(InvItem::consensus_decode(&mut dec)?);
                }
                match command {
                    "inv" => Message::Inv(items),
                    "getdata" => Message::GetData(items),
                    _ => Message::NotFound(items),
                }
            }
            "getblocks" | "getheaders" => {
                let _version = dec.read_i32_le()?;
                let count = dec.read_size()?;
                let mut locator = Vec::with_capacity(count.min(dec.remaining() / 32 + 1));
                for _ in 0..count {
                    locator.push(dec.read_fixed()?);
                }
                let stop_hash = dec.read_fixed()?;
                if command == "getblocks" {
                    Message::GetBlocks { locator, stop_hash }
                } else {
                    Message::GetHeaders { locator, stop_hash }
                }
            }
            "headers" => {
                let count = dec.read_size()?;
                let mut headers = Vec::with_capacity(count.min(dec.remaining() / 81 + 1));
                for _ in 0..count {
                    headers.push(BlockHeader::consensus_decode(&mut dec)?);
                    let _tx_count = dec.read_compact_size()?;
                }
                Message::Headers(headers)
            }
            "block" => Message::Block(Block::consensus_decode(&mut dec)?),
            "merkleblock" => Message::MerkleBlock {
                header: BlockHeader::consensus_decode(&mut dec)?,
                tree: PartialMerkleTree::consensus_decode(&mut dec)?,
            },
            "tx" => Message::Tx(Transaction::consensus_decode(&mut dec)?),
            "cmpctblock" => {
                let header = BlockHeader::consensus_decode(&mut dec)?;
                let nonce = dec.read_u64_le()?;
                let short_id_count = dec.read_size()?;
                let mut short_ids = Vec::with_capacity(short_id_count.min(dec.remaining() / 6 + 1));
                for _ in 0..short_id_count {
                    let bytes = dec.read_bytes(6)?;
                    let mut raw = [0u8; 8];
                    raw[..6].copy_from_slice(bytes);
                    short_ids.push(u64::from_le_bytes(raw));
                }
                let prefilled_count = dec.read_size()?;
                let mut prefilled = Vec::with_capacity(prefilled_count.min(1024));
                let mut last_index = 0u32;
                for _ in 0..prefilled_count {
                    let diff = dec.read_compact_size()?;
                    let index = last_index
                        .checked_add(u32::try_from(diff).map_err(|_| {
                            DecodeError::InvalidValue("prefilled index")
                        })?)
                        .ok_or(DecodeError::InvalidValue("prefilled index"))?;
                    last_index = index + 1;
                    prefilled.push(PrefilledTransaction {
                        index,
                        tx: Transaction::consensus_decode(&mut dec)?,
                    });
                }
                Message::CmpctBlock(CompactBlock {
                    header,
                    nonce,
                    short_ids,
                    prefilled,
                })
            }
            "getblocktxn" => {
                let block_hash = dec.read_fixed()?;
                let count = dec.read_size()?;
                let mut indexes = Vec::with_capacity(count.min(dec.remaining() + 1));
                let mut last_index = 0u32;
                for _ in 0..count {
                    let diff = dec.read_compact_size()?;
                    let index = last_index
                        .checked_add(u32::try_from(diff).map_err(|_| {
                            DecodeError::InvalidValue("blocktxn index")
                        })?)
                        .ok_or(DecodeError::InvalidValue("blocktxn index"))?;
                    last_index = index + 1;
                    indexes.push(index);
                }
                Message::GetBlockTxn {
                    block_hash,
                    indexes,
                }
            }
            "blocktxn" => {
                let block_hash = dec.read_fixed()?;
                let count = dec.read_size()?;
                let mut transactions = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    transactions.push(Transaction::consensus_decode(&mut dec)?);
                }
                Message::BlockTxn {
                    block_hash,
                    transactions,
                }
            }
            "mempool" => Message::MempoolRequest,
            "ping" => Message::Ping(dec.read_u64_le()?),
            "pong" => Message::Pong(dec.read_u64_le()?),
            "filterload" => {
                let data = dec.read_var_bytes()?.to_vec();
                Message::FilterLoad {
                    data,
                    hash_funcs: dec.read_u32_le()?,
                    tweak: dec.read_u32_le()?,
                    flags: dec.read_u8()?,
                }
            }
            "filteradd" => Message::FilterAdd {
                data: dec.read_var_bytes()?.to_vec(),
            },
            "filterclear" => Message::FilterClear,
            "feefilter" => Message::FeeFilter(dec.read_i64_le()?),
            "getcfilters" => Message::GetCFilters {
                filter_type: dec.read_u8()?,
                start_height: dec.read_u32_le()?,
                stop_hash: dec.read_fixed()?,
            },
            "cfilter" => Message::CFilter {
                filter_type: dec.read_u8()?,
                block_hash: dec.read_fixed()?,
                filter: dec.read_var_bytes()?.to_vec(),
            },
            "getcfheaders" => Message::GetCFHeaders {
                filter_type: dec.read_u8()?,
                start_height: dec.read_u32_le()?,
                stop_hash: dec.read_fixed()?,
            },
            "cfheaders" => {
                let filter_type = dec.read_u8()?;
                let stop_hash = dec.read_fixed()?;
                let prev_filter_header = dec.read_fixed()?;
                let count = dec.read_size()?;
                let mut filter_hashes = Vec::with_capacity(count.min(dec.remaining() / 32 + 1));
                for _ in 0..count {
                    filter_hashes.push(dec.read_fixed()?);
                }
                Message::CFHeaders {
                    filter_type,
                    stop_hash,
                    prev_filter_header,
                    filter_hashes,
                }
            }
            "getcfcheckpt" => Message::GetCFCheckpt {
                filter_type: dec.read_u8()?,
                stop_hash: dec.read_fixed()?,
            },
            "cfcheckpt" => {
                let filter_type = dec.read_u8()?;
                let stop_hash = dec.read_fixed()?;
                let count = dec.read_size()?;
                let mut headers = Vec::with_capacity(count.min(dec.remaining() / 32 + 1));
                for _ in 0..count {
                    headers.push(dec.read_fixed()?);
                }
                Message::CFCheckpt {
                    filter_type,
                    stop_hash,
                    headers,
                }
            }
            _ => Message::Unknown {
                command: command.to_string(),
                payload: payload.to_vec(),
            },
        };
        Ok(message)
    }
}
