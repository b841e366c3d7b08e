//! Chain parameters the networking engine depends on.

use crate::Work;

/// Consensus and network parameters, fixed at startup.
#[derive(Debug, Clone)]
pub struct ChainParams {
    /// Network magic prefixing every wire frame.
    pub magic: [u8; 4],
    /// Target seconds between blocks; scales block download timeouts.
    pub pow_target_spacing: u64,
    /// Hard floor of cumulative work a peer's chain must claim before
    /// we commit memory to it.
    pub minimum_chain_work: Work,
    /// Largest valid monetary amount, for fee filter sanity checks.
    pub max_money: i64,
}

impl ChainParams {
    /// Parameters for a local regression-test network.
    pub fn regtest() -> Self {
        Self {
            magic: [0xfa, 0xbf, 0xb5, 0xda],
            pow_target_spacing: 600,
            minimum_chain_work: Work::zero(),
            max_money: 21_000_000 * 100_000_000,
        }
    }
}
