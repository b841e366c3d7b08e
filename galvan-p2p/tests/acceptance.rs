//! End-to-end acceptance scenarios for the message-processing engine,
//! driven through the public event-sink interfaces against mock
//! collaborators.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use galvan_chain::{ChainManager, ChainParams, InMemoryChain, Mempool, TxMempoolInfo};
use galvan_core::{Block, BlockHeader, GenTxId, Hash256, Transaction, ZERO_HASH};
use galvan_p2p::protocol::{InvItem, InvType, Message, NetAddress, VersionMessage};
use galvan_p2p::transport::ConnectionManager;
use galvan_p2p::{
    ConnectionDirection, NetworkEventSink, P2pConfig, P2pError, PeerId, PeerManager,
    ServiceFlags, ValidationEventSink,
};

const WALL: i64 = 1_700_000_000;

fn t(secs: u64) -> Duration {
    Duration::from_secs(secs)
}

fn t_ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

// ---- mocks ----

#[derive(Default)]
struct RecordingNet {
    messages: Mutex<Vec<(PeerId, Message)>>,
    disconnects: Mutex<Vec<PeerId>>,
    feelers: Mutex<Vec<NetAddress>>,
}

impl ConnectionManager for RecordingNet {
    fn push_message(&self, peer: PeerId, message: Message) {
        self.messages.lock().unwrap().push((peer, message));
    }

    fn disconnect(&self, peer: PeerId) {
        self.disconnects.lock().unwrap().push(peer);
    }

    fn outbound_target_reached(&self) -> bool {
        false
    }

    fn start_feeler(&self, address: NetAddress) {
        self.feelers.lock().unwrap().push(address);
    }
}

impl RecordingNet {
    fn sent_to(&self, peer: PeerId) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == peer)
            .map(|(_, message)| message.clone())
            .collect()
    }

    fn commands_to(&self, peer: PeerId) -> Vec<String> {
        self.sent_to(peer)
            .iter()
            .map(|message| message.command().to_string())
            .collect()
    }

    fn count_command(&self, peer: PeerId, command: &str) -> usize {
        self.commands_to(peer)
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }

    fn disconnected(&self, peer: PeerId) -> bool {
        self.disconnects.lock().unwrap().contains(&peer)
    }

    fn clear(&self) {
        self.messages.lock().unwrap().clear();
        self.disconnects.lock().unwrap().clear();
    }
}

struct EmptyMempool;

impl Mempool for EmptyMempool {
    fn exists(&self, _gtxid: &GenTxId) -> bool {
        false
    }
    fn info(&self, _gtxid: &GenTxId) -> Option<TxMempoolInfo> {
        None
    }
    fn get(&self, _txid: &Hash256) -> Option<Transaction> {
        None
    }
    fn info_all(&self) -> Vec<TxMempoolInfo> {
        Vec::new()
    }
    fn unbroadcast(&self) -> Vec<(Hash256, Hash256)> {
        Vec::new()
    }
    fn remove_unbroadcast(&self, _txid: &Hash256) {}
    fn min_fee_rate(&self) -> i64 {
        0
    }
    fn size(&self) -> usize {
        0
    }
}

/// A mempool holding exactly one transaction.
struct SingleTxMempool {
    tx: Transaction,
    fee: i64,
}

impl SingleTxMempool {
    fn info_entry(&self) -> TxMempoolInfo {
        TxMempoolInfo {
            tx: self.tx.clone(),
            fee: self.fee,
            vsize: 100,
            time: 0,
        }
    }
}

impl Mempool for SingleTxMempool {
    fn exists(&self, gtxid: &GenTxId) -> bool {
        *gtxid.hash() == self.tx.txid() || *gtxid.hash() == self.tx.wtxid()
    }
    fn info(&self, gtxid: &GenTxId) -> Option<TxMempoolInfo> {
        self.exists(gtxid).then(|| self.info_entry())
    }
    fn get(&self, txid: &Hash256) -> Option<Transaction> {
        (*txid == self.tx.txid()).then(|| self.tx.clone())
    }
    fn info_all(&self) -> Vec<TxMempoolInfo> {
        vec![self.info_entry()]
    }
    fn unbroadcast(&self) -> Vec<(Hash256, Hash256)> {
        Vec::new()
    }
    fn remove_unbroadcast(&self, _txid: &Hash256) {}
    fn min_fee_rate(&self) -> i64 {
        0
    }
    fn size(&self) -> usize {
        1
    }
}

// ---- chain building helpers ----

fn genesis() -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_blockhash: ZERO_HASH,
        merkle_root: [0u8; 32],
        time: 1_600_000_000,
        bits: 0x207fffff,
        nonce: 0,
    }
}

fn mine_on(parent: &BlockHeader, salt: u32) -> BlockHeader {
    let mut header = BlockHeader {
        prev_blockhash: parent.hash(),
        nonce: salt,
        time: parent.time + 600,
        ..*parent
    };
    while !header.check_pow() {
        header.nonce = header.nonce.wrapping_add(1);
    }
    header
}

fn mine_chain(from: &BlockHeader, len: usize) -> Vec<BlockHeader> {
    let mut headers = Vec::with_capacity(len);
    let mut prev = *from;
    for salt in 0..len {
        let header = mine_on(&prev, salt as u32);
        headers.push(header);
        prev = header;
    }
    headers
}

// ---- harness ----

struct Harness {
    manager: PeerManager,
    net: Arc<RecordingNet>,
    chain: Arc<InMemoryChain>,
}

fn remote_version(version: i32) -> VersionMessage {
    VersionMessage {
        version,
        services: (ServiceFlags::NETWORK | ServiceFlags::WITNESS).bits(),
        timestamp: WALL,
        addr_recv_services: 0,
        addr_recv: NetAddress::ipv4(Ipv4Addr::new(127, 0, 0, 1), 8333),
        addr_from_services: 0,
        addr_from: NetAddress::ipv4(Ipv4Addr::UNSPECIFIED, 0),
        nonce: 0x5151_5151,
        user_agent: "/remote:1.0/".to_string(),
        start_height: 0,
        relay: true,
    }
}

fn peer_address(id: u64) -> NetAddress {
    NetAddress::ipv4(
        Ipv4Addr::new(100, 64, (id >> 8) as u8, id as u8),
        8333,
    )
}

impl Harness {
    fn new() -> Self {
        Self::with_params(ChainParams::regtest(), P2pConfig::default())
    }

    fn with_params(params: ChainParams, config: P2pConfig) -> Self {
        let chain = Arc::new(InMemoryChain::new(params, genesis()));
        let net = Arc::new(RecordingNet::default());
        let manager = PeerManager::new(
            config,
            chain.clone(),
            Arc::new(EmptyMempool),
            net.clone(),
            None,
            None,
        );
        Self {
            manager,
            net,
            chain,
        }
    }

    fn with_mempool(mempool: Arc<dyn Mempool>) -> Self {
        let chain = Arc::new(InMemoryChain::new(ChainParams::regtest(), genesis()));
        let net = Arc::new(RecordingNet::default());
        let manager = PeerManager::new(
            P2pConfig::default(),
            chain.clone(),
            mempool,
            net.clone(),
            None,
            None,
        );
        Self {
            manager,
            net,
            chain,
        }
    }

    fn connect(&self, id: u64, direction: ConnectionDirection) -> PeerId {
        let peer = PeerId::new(id);
        self.manager
            .on_peer_connected(peer, peer_address(id), direction, t(0), WALL);
        peer
    }

    /// Connect and complete the handshake, then drop the recorded
    /// handshake traffic.
    fn connect_handshaked(
        &self,
        id: u64,
        direction: ConnectionDirection,
        version: i32,
    ) -> PeerId {
        let peer = self.connect(id, direction);
        self.manager
            .process_message(peer, Message::Version(remote_version(version)), t(0), WALL);
        self.manager
            .process_message(peer, Message::Verack, t(0), WALL);
        self.net.clear();
        peer
    }
}

// ---- scenarios ----

#[test]
fn test_version_handshake_inbound() {
    let harness = Harness::new();
    let peer = harness.connect(1, ConnectionDirection::Inbound);

    harness
        .manager
        .process_message(peer, Message::Version(remote_version(70016)), t(0), WALL);

    let commands = harness.net.commands_to(peer);
    assert!(commands.contains(&"version".to_string()));
    assert!(commands.contains(&"wtxidrelay".to_string()));
    assert!(commands.contains(&"sendaddrv2".to_string()));
    assert!(commands.contains(&"verack".to_string()));
    // Our version goes out before our verack.
    let version_pos = commands.iter().position(|c| c == "version").unwrap();
    let verack_pos = commands.iter().position(|c| c == "verack").unwrap();
    assert!(version_pos < verack_pos);

    harness
        .manager
        .process_message(peer, Message::Verack, t(0), WALL);
    let messages = harness.net.sent_to(peer);
    assert!(messages.iter().any(|m| m == &Message::SendHeaders));
    assert!(messages.iter().any(|m| matches!(
        m,
        Message::SendCmpct {
            announce: false,
            version: 2
        }
    )));
    assert!(!harness.net.disconnected(peer));
}

#[test]
fn test_version_handshake_outbound_requests_addresses_and_headers() {
    let harness = Harness::new();
    let peer = harness.connect(1, ConnectionDirection::OutboundFullRelay);

    // We speak first on outbound connections.
    assert_eq!(harness.net.count_command(peer, "version"), 1);

    harness
        .manager
        .process_message(peer, Message::Version(remote_version(70016)), t(0), WALL);
    assert_eq!(harness.net.count_command(peer, "getaddr"), 1);

    harness
        .manager
        .process_message(peer, Message::Verack, t(0), WALL);
    assert_eq!(harness.net.count_command(peer, "getheaders"), 1);
}

#[test]
fn test_messages_before_handshake_ignored() {
    let harness = Harness::new();
    let peer = harness.connect(1, ConnectionDirection::Inbound);

    harness.manager.process_message(
        peer,
        Message::Inv(vec![InvItem::new(InvType::Block, [1u8; 32])]),
        t(0),
        WALL,
    );
    harness
        .manager
        .process_message(peer, Message::GetAddr, t(0), WALL);

    assert!(!harness.net.disconnected(peer));
    assert_eq!(harness.manager.misbehavior_score(peer), Some(0));
    assert!(harness.net.sent_to(peer).is_empty());
}

#[test]
fn test_obsolete_version_disconnected() {
    let harness = Harness::new();
    let peer = harness.connect(1, ConnectionDirection::Inbound);
    harness
        .manager
        .process_message(peer, Message::Version(remote_version(200)), t(0), WALL);
    assert!(harness.net.disconnected(peer));
}

#[test]
fn test_unconnecting_headers_limit() {
    let harness = Harness::new();
    let peer = harness.connect_handshaked(1, ConnectionDirection::Inbound, 70016);

    for i in 0..10u8 {
        let mut header = genesis();
        header.prev_blockhash = [0xa0 + i; 32];
        header.nonce = i as u32;
        harness
            .manager
            .process_message(peer, Message::Headers(vec![header]), t(0), WALL);
    }

    // Every occurrence probes with getheaders; the tenth costs 20.
    assert_eq!(harness.net.count_command(peer, "getheaders"), 10);
    assert_eq!(harness.manager.misbehavior_score(peer), Some(20));
    assert!(!harness.net.disconnected(peer));
}

#[test]
fn test_headers_anti_dos_presync_then_redownload() {
    // The peer's chain must claim at least 3000 blocks of work before
    // we store anything.
    let mut params = ChainParams::regtest();
    params.minimum_chain_work = genesis().work() * 3000u64;
    let harness = Harness::with_params(params, P2pConfig::default());
    let peer = harness.connect_handshaked(1, ConnectionDirection::OutboundFullRelay, 70016);

    let headers = mine_chain(&genesis(), 4000);

    // First full batch: below threshold, nothing stored, more asked.
    harness.manager.process_message(
        peer,
        Message::Headers(headers[..2000].to_vec()),
        t(1),
        WALL,
    );
    assert_eq!(harness.chain.header_count(), 1, "presync stores nothing");
    let request = harness
        .net
        .sent_to(peer)
        .into_iter()
        .rev()
        .find_map(|m| match m {
            Message::GetHeaders { locator, .. } => Some(locator),
            _ => None,
        })
        .expect("continuation getheaders");
    assert_eq!(request[0], headers[1999].hash());

    // Second batch crosses the threshold: redownload starts from the
    // fork point (genesis).
    harness.manager.process_message(
        peer,
        Message::Headers(headers[2000..].to_vec()),
        t(2),
        WALL,
    );
    assert_eq!(harness.chain.header_count(), 1);
    let request = harness
        .net
        .sent_to(peer)
        .into_iter()
        .rev()
        .find_map(|m| match m {
            Message::GetHeaders { locator, .. } => Some(locator),
            _ => None,
        })
        .expect("redownload getheaders");
    assert_eq!(request[0], genesis().hash());

    // Redownload the same chain; headers are stored at the end.
    harness.manager.process_message(
        peer,
        Message::Headers(headers[..2000].to_vec()),
        t(3),
        WALL,
    );
    assert_eq!(harness.chain.header_count(), 1);
    harness.manager.process_message(
        peer,
        Message::Headers(headers[2000..].to_vec()),
        t(4),
        WALL,
    );
    assert_eq!(harness.chain.header_count(), 4001);
    assert_eq!(harness.manager.misbehavior_score(peer), Some(0));
}

#[test]
fn test_tx_request_fallthrough_after_notfound() {
    let harness = Harness::new();
    harness.chain.set_initial_block_download(false);
    // Pre-wtxid versions announce by txid.
    let peer_a = harness.connect_handshaked(1, ConnectionDirection::OutboundFullRelay, 70015);
    let peer_b = harness.connect_handshaked(2, ConnectionDirection::Inbound, 70015);

    let hash: Hash256 = [7u8; 32];
    let inv = Message::Inv(vec![InvItem::new(InvType::Tx, hash)]);

    harness.manager.process_message(peer_a, inv.clone(), t(0), WALL);
    harness.manager.process_message(peer_b, inv, t(1), WALL);

    // The preferred peer is asked immediately.
    harness.manager.tick_send(peer_a, t(0), WALL);
    let getdata_a: Vec<Message> = harness
        .net
        .sent_to(peer_a)
        .into_iter()
        .filter(|m| matches!(m, Message::GetData(_)))
        .collect();
    assert_eq!(
        getdata_a,
        vec![Message::GetData(vec![InvItem::new(InvType::Tx, hash)])]
    );
    harness.net.clear();

    // A notfound at t=30 falls through to B after the non-preferred
    // delay: not at 31, at 32.
    harness.manager.process_message(
        peer_a,
        Message::NotFound(vec![InvItem::new(InvType::Tx, hash)]),
        t(30),
        WALL,
    );
    harness.manager.tick_send(peer_b, t(31), WALL);
    assert_eq!(harness.net.count_command(peer_b, "getdata"), 0);

    harness.manager.tick_send(peer_b, t(32), WALL);
    let getdata_b: Vec<Message> = harness
        .net
        .sent_to(peer_b)
        .into_iter()
        .filter(|m| matches!(m, Message::GetData(_)))
        .collect();
    assert_eq!(
        getdata_b,
        vec![Message::GetData(vec![InvItem::new(InvType::Tx, hash)])]
    );
}

#[test]
fn test_block_stalling_disconnects_window_holder() {
    let harness = Harness::new();
    let headers = mine_chain(&genesis(), 5);
    harness.chain.process_new_block_headers(&headers, true).unwrap();

    let peer_p = harness.connect_handshaked(1, ConnectionDirection::OutboundFullRelay, 70016);
    let peer_o = harness.connect_handshaked(2, ConnectionDirection::OutboundFullRelay, 70016);

    let tip_inv = Message::Inv(vec![InvItem::new(InvType::Block, headers[4].hash())]);
    harness.manager.process_message(peer_p, tip_inv.clone(), t(0), WALL);
    harness.manager.process_message(peer_o, tip_inv, t(0), WALL);
    harness.net.clear();

    // P grabs the whole window.
    harness.manager.tick_send(peer_p, t(0), WALL);
    let requested: usize = harness
        .net
        .sent_to(peer_p)
        .iter()
        .filter_map(|m| match m {
            Message::GetData(items) => Some(items.len()),
            _ => None,
        })
        .sum();
    assert_eq!(requested, 5);

    // O has nothing to fetch; P is now marked as stalling.
    harness.manager.tick_send(peer_o, t(0), WALL);
    assert!(!harness.net.disconnected(peer_p));

    // Two seconds later the window still cannot move: P goes.
    harness.manager.tick_send(peer_o, t_ms(2500), WALL);
    assert!(harness.net.disconnected(peer_p));

    // Once the connection drops, its downloads are released and O
    // takes over; nothing further is asked of P.
    harness.manager.on_peer_disconnected(peer_p, t(3), WALL);
    harness.net.clear();
    harness.manager.tick_send(peer_o, t(3), WALL);
    let re_requested: usize = harness
        .net
        .sent_to(peer_o)
        .iter()
        .filter_map(|m| match m {
            Message::GetData(items) => Some(items.len()),
            _ => None,
        })
        .sum();
    assert_eq!(re_requested, 5);
    assert!(harness.net.sent_to(peer_p).is_empty());
}

#[test]
fn test_getaddr_answered_once() {
    let harness = Harness::new();
    let peer = harness.connect_handshaked(1, ConnectionDirection::Inbound, 70016);

    // Seed the table.
    harness.manager.with_addrman(|addrman| {
        let mut addrs = Vec::new();
        for i in 0..100u8 {
            addrs.push((
                NetAddress::ipv4(Ipv4Addr::new(50, i, 1, 1), 8333),
                1u64,
                WALL,
            ));
        }
        addrman.add(&addrs, &peer_address(99), 0, WALL);
    });

    harness.manager.process_message(peer, Message::GetAddr, t(0), WALL);
    harness.manager.tick_send(peer, t(0), WALL); // schedules the trickle
    harness.manager.tick_send(peer, t(700), WALL); // due by now

    let addr_messages: Vec<usize> = harness
        .net
        .sent_to(peer)
        .iter()
        .filter_map(|m| match m {
            Message::AddrV2(entries) => Some(entries.len()),
            Message::Addr(entries) => Some(entries.len()),
            _ => None,
        })
        .collect();
    assert_eq!(addr_messages.len(), 1);
    // 23% of the table, not the whole table.
    assert!(addr_messages[0] <= 23);
    assert!(addr_messages[0] > 0);

    // A second getaddr is ignored entirely.
    harness.net.clear();
    harness.manager.process_message(peer, Message::GetAddr, t(800), WALL);
    harness.manager.tick_send(peer, t(1500), WALL);
    assert_eq!(harness.net.count_command(peer, "addr"), 0);
    assert_eq!(harness.net.count_command(peer, "addrv2"), 0);
}

#[test]
fn test_addr_rate_limit_inbound() {
    let harness = Harness::new();
    let peer = harness.connect_handshaked(1, ConnectionDirection::Inbound, 70016);

    let mut entries = Vec::new();
    for i in 0..600u16 {
        entries.push(galvan_p2p::protocol::TimedAddress {
            time: WALL as u32,
            services: 1,
            address: NetAddress::ipv4(
                Ipv4Addr::new(60, (i >> 8) as u8, i as u8, 1),
                8333,
            ),
        });
    }
    harness
        .manager
        .process_message(peer, Message::Addr(entries), t(0), WALL);

    // The unsolicited bucket starts at one token.
    let stored = harness.manager.with_addrman(|addrman| addrman.size());
    assert!(stored <= 1, "rate limiter admitted {stored} addresses");
}

#[test]
fn test_addr_rate_limit_credited_after_getaddr() {
    let harness = Harness::new();
    // Outbound full relay: our getaddr goes out during the handshake
    // and credits the bucket.
    let peer = harness.connect_handshaked(1, ConnectionDirection::OutboundFullRelay, 70016);

    // Addresses spanning distinct /16 groups so they spread over the
    // address manager's buckets.
    let mut entries = Vec::new();
    for i in 0..600u16 {
        entries.push(galvan_p2p::protocol::TimedAddress {
            time: WALL as u32,
            services: 1,
            address: NetAddress::ipv4(
                Ipv4Addr::new(64 + (i >> 8) as u8, i as u8, 1, 1),
                8333,
            ),
        });
    }
    harness
        .manager
        .process_message(peer, Message::Addr(entries), t(0), WALL);

    let stored = harness.manager.with_addrman(|addrman| addrman.size());
    assert!(stored > 500, "getaddr credit should admit the batch, got {stored}");
}

#[test]
fn test_fetch_block_no_double_request() {
    let harness = Harness::new();
    let headers = mine_chain(&genesis(), 1);
    harness.chain.process_new_block_headers(&headers, true).unwrap();
    let handle = harness
        .chain
        .lookup_block_index(&headers[0].hash())
        .unwrap();

    let peer = harness.connect_handshaked(1, ConnectionDirection::OutboundFullRelay, 70016);

    assert!(harness.manager.fetch_block(peer, handle).is_ok());
    assert!(matches!(
        harness.manager.fetch_block(peer, handle),
        Err(P2pError::AlreadyRequested)
    ));
    assert_eq!(
        harness.manager.block_in_flight_from(&headers[0].hash()),
        Some(peer)
    );
    assert_eq!(harness.net.count_command(peer, "getdata"), 1);
}

#[test]
fn test_fee_filter_suppresses_cheap_announcements() {
    let tx = Transaction {
        version: 2,
        inputs: vec![],
        outputs: vec![],
        lock_time: 0,
    };
    let mempool = Arc::new(SingleTxMempool {
        tx: tx.clone(),
        fee: 100, // 1000 per kvB at vsize 100
    });
    let harness = Harness::with_mempool(mempool);
    harness.chain.set_initial_block_download(false);
    let peer = harness.connect_handshaked(1, ConnectionDirection::Inbound, 70016);

    // Peer only wants expensive transactions.
    harness
        .manager
        .process_message(peer, Message::FeeFilter(2000), t(0), WALL);
    harness.manager.relay_transaction(tx.txid(), tx.wtxid());
    harness.manager.tick_send(peer, t(0), WALL);
    harness.manager.tick_send(peer, t(200), WALL);
    assert_eq!(harness.net.count_command(peer, "inv"), 0);

    // Lowering the filter lets the announcement through.
    harness
        .manager
        .process_message(peer, Message::FeeFilter(500), t(200), WALL);
    harness.manager.relay_transaction(tx.txid(), tx.wtxid());
    harness.manager.tick_send(peer, t(401), WALL);
    harness.manager.tick_send(peer, t(600), WALL);
    assert!(harness.net.count_command(peer, "inv") >= 1);
}

#[test]
fn test_ping_timeout_disconnects() {
    let harness = Harness::new();
    let peer = harness.connect_handshaked(1, ConnectionDirection::Inbound, 70016);

    harness.manager.tick_send(peer, t(0), WALL);
    let nonce = harness
        .net
        .sent_to(peer)
        .into_iter()
        .find_map(|m| match m {
            Message::Ping(nonce) => Some(nonce),
            _ => None,
        })
        .expect("ping sent on first tick");

    // An answered ping keeps the connection alive...
    harness
        .manager
        .process_message(peer, Message::Pong(nonce), t(1), WALL);
    harness.manager.tick_send(peer, t(2), WALL);
    assert!(!harness.net.disconnected(peer));

    // ...an unanswered one does not.
    harness.manager.tick_send(peer, t(130), WALL); // next ping goes out
    harness.manager.tick_send(peer, t(130 + 21 * 60), WALL);
    assert!(harness.net.disconnected(peer));
}

#[test]
fn test_mismatched_pong_tolerated() {
    let harness = Harness::new();
    let peer = harness.connect_handshaked(1, ConnectionDirection::Inbound, 70016);
    harness.manager.tick_send(peer, t(0), WALL);

    harness
        .manager
        .process_message(peer, Message::Pong(0xbad), t(1), WALL);
    assert!(!harness.net.disconnected(peer));
    assert_eq!(harness.manager.misbehavior_score(peer), Some(0));
}

#[test]
fn test_oversized_bloom_filter_penalized() {
    let config = P2pConfig::default().with_services(
        (ServiceFlags::NETWORK | ServiceFlags::WITNESS | ServiceFlags::BLOOM).bits(),
    );
    let harness = Harness::with_params(ChainParams::regtest(), config);
    let peer = harness.connect_handshaked(1, ConnectionDirection::Inbound, 70016);

    harness.manager.process_message(
        peer,
        Message::FilterLoad {
            data: vec![0u8; 36_001],
            hash_funcs: 10,
            tweak: 0,
            flags: 0,
        },
        t(0),
        WALL,
    );
    assert_eq!(harness.manager.misbehavior_score(peer), Some(100));
    assert!(harness.net.disconnected(peer));
}

#[test]
fn test_mempool_request_without_bloom_disconnects() {
    let harness = Harness::new();
    let peer = harness.connect_handshaked(1, ConnectionDirection::Inbound, 70016);
    harness
        .manager
        .process_message(peer, Message::MempoolRequest, t(0), WALL);
    assert!(harness.net.disconnected(peer));
}

#[test]
fn test_getheaders_served_from_active_chain() {
    let harness = Harness::new();
    harness.chain.set_initial_block_download(false);
    // Store three full blocks so the active chain advances.
    let mut parent = genesis();
    let mut stored = Vec::new();
    for salt in 0..3u32 {
        let header = mine_on(&parent, salt);
        let block = Block {
            header,
            transactions: vec![],
        };
        harness.chain.process_new_block(&block, true, true);
        stored.push(header);
        parent = header;
    }

    let peer = harness.connect_handshaked(1, ConnectionDirection::Inbound, 70016);
    harness.manager.process_message(
        peer,
        Message::GetHeaders {
            locator: vec![genesis().hash()],
            stop_hash: ZERO_HASH,
        },
        t(0),
        WALL,
    );

    let reply = harness
        .net
        .sent_to(peer)
        .into_iter()
        .find_map(|m| match m {
            Message::Headers(headers) => Some(headers),
            _ => None,
        })
        .expect("headers reply");
    assert_eq!(reply.len(), 3);
    assert_eq!(reply[0].hash(), stored[0].hash());
    assert_eq!(reply[2].hash(), stored[2].hash());
}

#[test]
fn test_high_bandwidth_peer_gets_compact_block() {
    let harness = Harness::new();
    let peer = harness.connect_handshaked(1, ConnectionDirection::Inbound, 70016);
    harness.manager.process_message(
        peer,
        Message::SendCmpct {
            announce: true,
            version: 2,
        },
        t(0),
        WALL,
    );

    let header = mine_on(&genesis(), 9);
    let block = Block {
        header,
        transactions: vec![Transaction {
            version: 2,
            inputs: vec![],
            outputs: vec![],
            lock_time: 0,
        }],
    };
    let handle = match harness.chain.process_new_block(&block, true, true) {
        galvan_chain::BlockProcessResult::Accepted(handle) => handle,
        other => panic!("block not accepted: {other:?}"),
    };
    harness.manager.on_new_pow_valid_block(handle, &block);

    let compact = harness
        .net
        .sent_to(peer)
        .into_iter()
        .find_map(|m| match m {
            Message::CmpctBlock(compact) => Some(compact),
            _ => None,
        })
        .expect("compact block pushed to high-bandwidth peer");
    assert_eq!(compact.header.hash(), block.hash());
}

#[test]
fn test_wtx_inv_from_legacy_peer_disconnects() {
    let harness = Harness::new();
    harness.chain.set_initial_block_download(false);
    let peer = harness.connect_handshaked(1, ConnectionDirection::Inbound, 70015);

    harness.manager.process_message(
        peer,
        Message::Inv(vec![InvItem::new(InvType::WTx, [9u8; 32])]),
        t(0),
        WALL,
    );
    assert!(harness.net.disconnected(peer));
}

#[test]
fn test_txid_inv_from_wtxid_peer_disconnects() {
    let harness = Harness::new();
    harness.chain.set_initial_block_download(false);

    // Negotiate wtxid relay explicitly between version and verack.
    let peer = harness.connect(1, ConnectionDirection::Inbound);
    harness
        .manager
        .process_message(peer, Message::Version(remote_version(70016)), t(0), WALL);
    harness
        .manager
        .process_message(peer, Message::WtxidRelay, t(0), WALL);
    harness
        .manager
        .process_message(peer, Message::Verack, t(0), WALL);
    harness.net.clear();

    harness.manager.process_message(
        peer,
        Message::Inv(vec![InvItem::new(InvType::Tx, [9u8; 32])]),
        t(0),
        WALL,
    );
    assert!(harness.net.disconnected(peer));
}

#[test]
fn test_gen_txid_spec_vector_matches_core_filter() {
    // Sanity bridge to the GCS scenario: the BASIC parameters with a
    // zero key match a member and reject a non-member (see the
    // galvan-core filter tests for the full false-positive sweep).
    use galvan_core::{GcsFilter, GcsFilterParams};
    use std::collections::BTreeSet;

    let params = GcsFilterParams {
        siphash_k0: 0,
        siphash_k1: 0,
        p: 19,
        m: 784_931,
    };
    let mut elements = BTreeSet::new();
    let mut e0 = vec![0u8; 32];
    e0[0] = 0x00;
    let mut e1 = vec![0u8; 32];
    e1[0] = 0x01;
    elements.insert(e0);
    elements.insert(e1.clone());

    let filter = GcsFilter::from_elements(params, &elements);
    assert!(filter.matches(&e1).unwrap());
    let mut probe = vec![0u8; 32];
    probe[0] = 0xff;
    assert!(!filter.matches(&probe).unwrap());
}
