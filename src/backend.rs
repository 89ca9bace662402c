use ethers_core::types::{H160, H256, U256};
use sputnik::backend::{Apply, ApplyBackend, Backend, Basic, Log, MemoryAccount, MemoryVicinity};
use std::collections::BTreeMap;

/// Account state and block environment for the embedded VM.
///
/// sputnik's `MemoryBackend` borrows its vicinity, but the chain has to own
/// and update the environment across blocks, so this carries the same data
/// owned. `block_hashes` is recent-first, matching `MemoryBackend::block_hash`.
#[derive(Clone, Debug)]
pub struct ChainBackend {
    pub vicinity: MemoryVicinity,
    state: BTreeMap<H160, MemoryAccount>,
    logs: Vec<Log>,
}

impl ChainBackend {
    pub fn new(vicinity: MemoryVicinity, state: BTreeMap<H160, MemoryAccount>) -> Self {
        Self { vicinity, state, logs: Vec::new() }
    }

    pub fn state(&self) -> &BTreeMap<H160, MemoryAccount> {
        &self.state
    }

    pub fn insert_account(&mut self, address: H160, account: MemoryAccount) {
        self.state.insert(address, account);
    }

    /// Move the execution environment onto the next block template.
    pub fn roll_block(&mut self, timestamp: U256, difficulty: U256) {
        self.vicinity.block_timestamp = timestamp;
        self.vicinity.block_difficulty = difficulty;
    }

    /// Record a sealed block hash for the BLOCKHASH opcode and advance the
    /// environment to the following block number.
    pub fn seal_block(&mut self, hash: H256) {
        self.vicinity.block_hashes.insert(0, hash);
        self.vicinity.block_number = self.vicinity.block_number + U256::one();
    }

    /// Debit the gas fee from the payer and credit it to the beneficiary.
    pub fn charge_fee(&mut self, payer: H160, beneficiary: H160, fee: U256) {
        if fee.is_zero() {
            return;
        }
        let account = self.state.entry(payer).or_default();
        account.balance = account.balance.saturating_sub(fee);
        let miner = self.state.entry(beneficiary).or_default();
        miner.balance = miner.balance + fee;
    }
}

impl Backend for ChainBackend {
    fn gas_price(&self) -> U256 {
        self.vicinity.gas_price
    }
    fn origin(&self) -> H160 {
        self.vicinity.origin
    }
    fn block_hash(&self, number: U256) -> H256 {
        if number >= self.vicinity.block_number
            || self.vicinity.block_number - number - U256::one()
                >= U256::from(self.vicinity.block_hashes.len())
        {
            H256::default()
        } else {
            let index = (self.vicinity.block_number - number - U256::one()).as_usize();
            self.vicinity.block_hashes[index]
        }
    }
    fn block_number(&self) -> U256 {
        self.vicinity.block_number
    }
    fn block_coinbase(&self) -> H160 {
        self.vicinity.block_coinbase
    }
    fn block_timestamp(&self) -> U256 {
        self.vicinity.block_timestamp
    }
    fn block_difficulty(&self) -> U256 {
        self.vicinity.block_difficulty
    }
    fn block_randomness(&self) -> Option<H256> {
        self.vicinity.block_randomness
    }
    fn block_gas_limit(&self) -> U256 {
        self.vicinity.block_gas_limit
    }
    fn block_base_fee_per_gas(&self) -> U256 {
        self.vicinity.block_base_fee_per_gas
    }
    fn chain_id(&self) -> U256 {
        self.vicinity.chain_id
    }

    fn exists(&self, address: H160) -> bool {
        self.state.contains_key(&address)
    }

    fn basic(&self, address: H160) -> Basic {
        self.state
            .get(&address)
            .map(|account| Basic { balance: account.balance, nonce: account.nonce })
            .unwrap_or_default()
    }

    fn code(&self, address: H160) -> Vec<u8> {
        self.state.get(&address).map(|account| account.code.clone()).unwrap_or_default()
    }

    fn storage(&self, address: H160, index: H256) -> H256 {
        self.state
            .get(&address)
            .map(|account| account.storage.get(&index).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn original_storage(&self, address: H160, index: H256) -> Option<H256> {
        Some(self.storage(address, index))
    }
}

impl ApplyBackend for ChainBackend {
    fn apply<A, I, L>(&mut self, values: A, logs: L, delete_empty: bool)
    where
        A: IntoIterator<Item = Apply<I>>,
        I: IntoIterator<Item = (H256, H256)>,
        L: IntoIterator<Item = Log>,
    {
        for apply in values {
            match apply {
                Apply::Modify { address, basic, code, storage, reset_storage } => {
                    let is_empty = {
                        let account = self.state.entry(address).or_default();
                        account.balance = basic.balance;
                        account.nonce = basic.nonce;
                        if let Some(code) = code {
                            account.code = code;
                        }
                        if reset_storage {
                            account.storage = BTreeMap::new();
                        }
                        for (index, value) in storage {
                            if value == H256::default() {
                                account.storage.remove(&index);
                            } else {
                                account.storage.insert(index, value);
                            }
                        }
                        account.balance == U256::zero()
                            && account.nonce == U256::zero()
                            && account.code.is_empty()
                    };
                    if is_empty && delete_empty {
                        self.state.remove(&address);
                    }
                }
                Apply::Delete { address } => {
                    self.state.remove(&address);
                }
            }
        }
        self.logs.extend(logs);
    }
}
