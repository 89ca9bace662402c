use ethers_core::types::{Address, U256};
use ethers_signers::{LocalWallet, Signer};
use sputnik::Config;

use crate::error::ChainError;

/// Hardforks the embedded VM provides an execution config for. The chain
/// always runs the whole history under a single fork.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Hardfork {
    #[default]
    Istanbul,
    Berlin,
    London,
}

impl Hardfork {
    pub fn config(self) -> Config {
        match self {
            Hardfork::Istanbul => Config::istanbul(),
            Hardfork::Berlin => Config::berlin(),
            Hardfork::London => Config::london(),
        }
    }
}

/// Development keys funded at genesis. Fixed so test suites can hardcode the
/// derived addresses.
pub const DEFAULT_PRIVATE_KEYS: [&str; 10] = [
    "8f2a55948c0b6f1e2f7d3b4891c6e0d57a3f4c82b5d90e674e1a8c3df6072b9a",
    "29d1b3c4e8f7a6052d9c0e1f73b8a4d6510f2e9c8b7a3d415e6f0c2a9b8d7e34",
    "6c4f0d2e9a7b83155f1e6d3c0b8a9247d5e2f4a1c6b08d937e5a1f4b2c8d0e66",
    "4b8e1f6a2d0c935741a6d8e0b3f2c5977c1d4e8f0a5b62d3948e6c1f7a0b5d28",
    "d7305f8c1b4e6a92e8a2c5d0f1b7364f9c6e0d3a8b5f21747d2b9e4c0a1f6385",
    "1e9c4b7d0a2f68533d5a8c1e6f0b49272b6d9f3c8e1a0574fa4e7b2d9c306158",
    "a3f61c8e5b0d49277e2a9d4c1f8b063549c8e2b7d6a0f1355b0f3a6d8c4e2719",
    "58d20c7b9e4f1a36c1b8f5a20e6d39748a7f0e3d5c2b61944f6a9c0d2e8b1753",
    "3a7d5e2c8f0b164992e4c6a1d8f57b0306b1d9f4e7a2c85df2c50b8a1d6e3947",
    "e60b3d9a4c7f28151c9f7b2e6a0d4853b4a8d1c5e2f7096d7f3e6b0c9a2d5148",
];

pub const DEFAULT_CHAIN_ID: u64 = 1337;

/// Configuration for a test chain instance.
#[derive(Clone, Debug)]
pub struct ChainOptions {
    /// Hex-encoded private keys whose accounts are funded at genesis.
    pub private_keys: Vec<String>,
    /// Balance assigned to each configured account at genesis, in wei.
    pub initial_balance: U256,
    pub block_gas_limit: U256,
    /// Gas price reported by `eth_gasPrice` and assumed for transactions
    /// that do not carry one.
    pub gas_price: U256,
    pub coinbase: Address,
    pub chain_id: u64,
    pub hardfork: Hardfork,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            private_keys: DEFAULT_PRIVATE_KEYS.iter().map(|key| key.to_string()).collect(),
            // 100 ether
            initial_balance: U256::exp10(20),
            block_gas_limit: U256::from(8_000_000u64),
            // 1 gwei
            gas_price: U256::from(1_000_000_000u64),
            coinbase: Address::repeat_byte(0x42),
            chain_id: DEFAULT_CHAIN_ID,
            hardfork: Hardfork::default(),
        }
    }
}

impl ChainOptions {
    /// One wallet per configured private key, bound to the chain id.
    pub fn wallets(&self) -> Result<Vec<LocalWallet>, ChainError> {
        self.private_keys
            .iter()
            .map(|key| Ok(key.parse::<LocalWallet>()?.with_chain_id(self.chain_id)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_keys_parse_into_distinct_wallets() {
        let options = ChainOptions::default();
        let wallets = options.wallets().unwrap();
        assert_eq!(wallets.len(), 10);
        let mut addresses: Vec<_> = wallets.iter().map(|w| w.address()).collect();
        addresses.dedup();
        assert_eq!(addresses.len(), 10);
        assert_eq!(wallets[0].chain_id(), DEFAULT_CHAIN_ID);
    }
}
