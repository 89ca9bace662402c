//! The VM adapter: owns the embedded sputnik EVM plus the block and
//! transaction bookkeeping sputnik itself does not provide. Blocks are
//! assembled here as templates (next number, parent hash, canonical
//! difficulty) and filled from the pending transaction queue; execution is
//! delegated to the VM.

use ethers_core::types::transaction::eip2718::TypedTransaction;
use ethers_core::types::{
    Address, Bytes, NameOrAddress, Signature, Transaction, TransactionReceipt, TxHash, H256, U256,
    U64,
};
use ethers_core::utils::{get_contract_address, keccak256};
use ethers_signers::LocalWallet;
use sputnik::backend::{Apply, ApplyBackend, Backend, Log, MemoryAccount, MemoryVicinity};
use sputnik::executor::stack::{MemoryStackState, PrecompileFn, StackExecutor, StackSubstateMetadata};
use sputnik::ExitReason;
use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::backend::ChainBackend;
use crate::chain::CallRequest;
use crate::conversions::{self, MIN_DIFFICULTY};
use crate::error::ChainError;
use crate::options::ChainOptions;

/// Header nonce stamped on every template, genesis included.
const HEADER_NONCE: u64 = 42;

/// A signed transaction waiting for the next mined block.
#[derive(Clone, Debug)]
pub struct QueuedTransaction {
    pub tx: TypedTransaction,
    pub signature: Signature,
    pub sender: Address,
    /// keccak256 of the raw signed bytes.
    pub hash: TxHash,
    pub raw: Bytes,
}

/// Header-level data for a block this chain produced.
#[derive(Clone, Debug)]
pub struct BlockRecord {
    pub number: U64,
    pub hash: H256,
    pub parent_hash: H256,
    pub timestamp: u64,
    pub difficulty: U256,
    pub gas_limit: U256,
    pub gas_used: U256,
    pub coinbase: Address,
    pub extra_data: Bytes,
    pub nonce: u64,
    pub transactions: Vec<TxHash>,
}

/// Outcome of running a single transaction through the VM.
#[derive(Debug)]
pub struct Execution {
    pub exit: ExitReason,
    pub output: Vec<u8>,
    pub gas_used: u64,
    pub logs: Vec<Log>,
    /// Address of the deployed contract, for creation transactions.
    pub created: Option<Address>,
    applies: Vec<Apply<BTreeMap<H256, H256>>>,
}

/// The in-memory chain: one VM, one pending queue, one canonical history.
#[derive(Debug)]
pub struct FriendlyVm {
    options: ChainOptions,
    backend: ChainBackend,
    default_sender: Address,
    pending: Vec<QueuedTransaction>,
    blocks: Vec<BlockRecord>,
    transactions: HashMap<TxHash, Transaction>,
    receipts: HashMap<TxHash, TransactionReceipt>,
}

impl FriendlyVm {
    pub fn new(options: ChainOptions) -> Result<Self, ChainError> {
        let wallets = options.wallets()?;
        let default_sender = wallets.first().map(ethers_signers::Signer::address).unwrap_or_default();

        let mut state = BTreeMap::new();
        for wallet in &wallets {
            let address = ethers_signers::Signer::address(wallet);
            state.insert(
                address,
                MemoryAccount { balance: options.initial_balance, ..Default::default() },
            );
        }

        let mut genesis = BlockRecord {
            number: U64::zero(),
            hash: H256::zero(),
            parent_hash: H256::zero(),
            timestamp: 0,
            difficulty: U256::from(MIN_DIFFICULTY),
            gas_limit: options.block_gas_limit,
            gas_used: U256::zero(),
            coinbase: options.coinbase,
            extra_data: Bytes::default(),
            nonce: HEADER_NONCE,
            transactions: Vec::new(),
        };
        genesis.hash = conversions::block_hash(&genesis);

        let vicinity = MemoryVicinity {
            gas_price: options.gas_price,
            origin: Address::zero(),
            chain_id: U256::from(options.chain_id),
            block_hashes: vec![genesis.hash],
            block_number: U256::one(),
            block_coinbase: options.coinbase,
            block_timestamp: U256::zero(),
            block_difficulty: U256::from(MIN_DIFFICULTY),
            block_gas_limit: options.block_gas_limit,
            block_base_fee_per_gas: U256::zero(),
            block_randomness: None,
        };

        Ok(Self {
            options,
            backend: ChainBackend::new(vicinity, state),
            default_sender,
            pending: Vec::new(),
            blocks: vec![genesis],
            transactions: HashMap::new(),
            receipts: HashMap::new(),
        })
    }

    pub fn options(&self) -> &ChainOptions {
        &self.options
    }

    pub fn wallets(&self) -> Result<Vec<LocalWallet>, ChainError> {
        self.options.wallets()
    }

    pub fn chain_id(&self) -> U256 {
        U256::from(self.options.chain_id)
    }

    pub fn gas_price(&self) -> U256 {
        self.backend.gas_price()
    }

    pub fn balance(&self, address: Address) -> U256 {
        self.backend.basic(address).balance
    }

    pub fn nonce(&self, address: Address) -> U256 {
        self.backend.basic(address).nonce
    }

    pub fn code(&self, address: Address) -> Bytes {
        Bytes::from(self.backend.code(address))
    }

    pub fn storage(&self, address: Address, position: H256) -> H256 {
        self.backend.storage(address, position)
    }

    pub fn latest_block(&self) -> &BlockRecord {
        // the genesis record is installed at construction
        self.blocks.last().expect("chain contains at least the genesis block")
    }

    pub fn block_by_number(&self, number: u64) -> Option<&BlockRecord> {
        self.blocks.get(number as usize)
    }

    pub fn block_by_hash(&self, hash: H256) -> Option<&BlockRecord> {
        self.blocks.iter().find(|block| block.hash == hash)
    }

    pub fn transaction(&self, hash: TxHash) -> Option<Transaction> {
        self.transactions.get(&hash).cloned()
    }

    pub fn transaction_receipt(&self, hash: TxHash) -> Option<TransactionReceipt> {
        self.receipts.get(&hash).cloned()
    }

    /// Full transaction responses for a mined block, in block order.
    pub fn block_transactions(&self, record: &BlockRecord) -> Vec<Transaction> {
        record
            .transactions
            .iter()
            .filter_map(|hash| self.transactions.get(hash).cloned())
            .collect()
    }

    pub fn pending_transactions(&self) -> &[QueuedTransaction] {
        &self.pending
    }

    /// Decode a signed raw transaction, recover its sender and append it to
    /// the pending queue. Returns the transaction hash.
    pub fn add_pending_transaction(&mut self, raw: &Bytes) -> Result<TxHash, ChainError> {
        let rlp = rlp::Rlp::new(raw.as_ref());
        let (tx, signature) = TypedTransaction::decode_signed(&rlp)?;
        let sender = signature.recover(tx.sighash())?;
        let hash = TxHash::from(keccak256(raw.as_ref()));
        tracing::debug!(?hash, from = ?sender, "transaction queued");
        self.pending.push(QueuedTransaction {
            tx,
            signature,
            sender,
            hash,
            raw: raw.clone(),
        });
        Ok(hash)
    }

    /// Assemble the next block template, flush the pending queue into it,
    /// execute everything through the VM and append the block to the chain.
    pub fn mine_block(&mut self) -> Result<BlockRecord, ChainError> {
        let parent = self.latest_block().clone();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(parent.timestamp);
        let timestamp = now.max(parent.timestamp + 1);
        let difficulty =
            conversions::canonical_difficulty(parent.difficulty, parent.timestamp, timestamp);
        self.backend.roll_block(U256::from(timestamp), difficulty);

        let queued = std::mem::take(&mut self.pending);
        let mut outcomes = Vec::with_capacity(queued.len());
        let mut gas_used = U256::zero();
        for transaction in &queued {
            let execution = self.run_transaction(transaction)?;
            gas_used = gas_used + U256::from(execution.gas_used);
            outcomes.push(execution);
        }

        let mut record = BlockRecord {
            number: parent.number + 1u64,
            hash: H256::zero(),
            parent_hash: parent.hash,
            timestamp,
            difficulty,
            gas_limit: self.options.block_gas_limit,
            gas_used,
            coinbase: self.options.coinbase,
            extra_data: Bytes::default(),
            nonce: HEADER_NONCE,
            transactions: queued.iter().map(|tx| tx.hash).collect(),
        };
        record.hash = conversions::block_hash(&record);
        self.backend.seal_block(record.hash);

        let mut cumulative_gas_used = U256::zero();
        let mut log_index = 0u64;
        for (index, (transaction, execution)) in queued.iter().zip(&outcomes).enumerate() {
            cumulative_gas_used = cumulative_gas_used + U256::from(execution.gas_used);
            let response = conversions::transaction_response(transaction, &record, index as u64);
            let receipt = conversions::transaction_receipt(
                transaction,
                execution,
                &record,
                index as u64,
                cumulative_gas_used,
                &mut log_index,
            );
            self.transactions.insert(transaction.hash, response);
            self.receipts.insert(transaction.hash, receipt);
        }

        tracing::info!(
            number = record.number.as_u64(),
            transactions = queued.len(),
            "block mined"
        );
        self.blocks.push(record.clone());
        Ok(record)
    }

    /// Simulate a call against the latest state without committing anything.
    pub fn call(&self, request: &CallRequest) -> Result<Bytes, ChainError> {
        let execution = self.simulate(request)?;
        exit_to_result(&execution.exit, &execution.output)?;
        // For a creation request, hand back the code that would have been
        // deployed rather than the (empty) create output.
        if let Some(created) = execution.created {
            for apply in &execution.applies {
                if let Apply::Modify { address, code: Some(code), .. } = apply {
                    if *address == created {
                        return Ok(Bytes::from(code.clone()));
                    }
                }
            }
        }
        Ok(Bytes::from(execution.output))
    }

    /// Simulate a call and report the gas it consumed.
    pub fn estimate_gas(&self, request: &CallRequest) -> Result<U256, ChainError> {
        let execution = self.simulate(request)?;
        exit_to_result(&execution.exit, &execution.output)?;
        Ok(U256::from(execution.gas_used))
    }

    fn simulate(&self, request: &CallRequest) -> Result<Execution, ChainError> {
        let from = request.from.unwrap_or(self.default_sender);
        let gas_limit = request
            .gas
            .unwrap_or(self.options.block_gas_limit)
            .min(self.options.block_gas_limit);
        let gas_price = request.gas_price.unwrap_or_default();
        let value = request.value.unwrap_or_default();
        let data = request.data.clone().unwrap_or_default();
        self.execute(from, request.to, value, data.to_vec(), gas_limit.low_u64(), gas_price)
    }

    /// Validate a queued transaction, run it through the VM and commit the
    /// resulting state. Failed transactions are still included in the block
    /// (status 0), matching chain semantics; only fatal VM exits propagate.
    fn run_transaction(&mut self, queued: &QueuedTransaction) -> Result<Execution, ChainError> {
        let tx = &queued.tx;
        let from = queued.sender;
        let value = tx.value().copied().unwrap_or_default();
        let data = tx.data().cloned().unwrap_or_default();
        let gas_price = tx.gas_price().unwrap_or(self.options.gas_price);
        let gas_limit = tx
            .gas()
            .copied()
            .unwrap_or(self.options.block_gas_limit)
            .min(self.options.block_gas_limit);

        let account = self.backend.basic(from);
        if let Some(nonce) = tx.nonce() {
            if *nonce != account.nonce {
                return Err(ChainError::InvalidTransaction(format!(
                    "nonce mismatch for {from:?}: transaction has {nonce}, account is at {}",
                    account.nonce
                )));
            }
        }
        let max_cost = value + gas_price * gas_limit;
        if account.balance < max_cost {
            return Err(ChainError::InvalidTransaction(format!(
                "insufficient funds for {from:?}: balance {} < cost {max_cost}",
                account.balance
            )));
        }
        let to = match tx.to() {
            Some(NameOrAddress::Address(address)) => Some(*address),
            Some(NameOrAddress::Name(_)) => {
                return Err(ChainError::InvalidTransaction(
                    "ENS names cannot be resolved by the test chain".to_string(),
                ))
            }
            None => None,
        };

        let mut execution =
            self.execute(from, to, value, data.to_vec(), gas_limit.low_u64(), gas_price)?;
        if let ExitReason::Fatal(fatal) = &execution.exit {
            return Err(ChainError::Execution(format!("{fatal:?}")));
        }

        let applies = std::mem::take(&mut execution.applies);
        self.backend.apply(applies, execution.logs.clone(), false);
        self.backend
            .charge_fee(from, self.options.coinbase, U256::from(execution.gas_used) * gas_price);
        Ok(execution)
    }

    /// Run a single call or creation through a fresh executor over a snapshot
    /// of the current state. Nothing is committed; the state changes come
    /// back in the execution for the caller to apply or discard.
    fn execute(
        &self,
        from: Address,
        to: Option<Address>,
        value: U256,
        data: Vec<u8>,
        gas_limit: u64,
        gas_price: U256,
    ) -> Result<Execution, ChainError> {
        let config = self.options.hardfork.config();
        let precompiles: BTreeMap<Address, PrecompileFn> = BTreeMap::new();
        let created = match to {
            Some(_) => None,
            None => Some(get_contract_address(from, self.backend.basic(from).nonce)),
        };

        let mut snapshot = self.backend.clone();
        snapshot.vicinity.origin = from;
        snapshot.vicinity.gas_price = gas_price;

        let metadata = StackSubstateMetadata::new(gas_limit, &config);
        let state = MemoryStackState::new(metadata, &snapshot);
        let mut executor = StackExecutor::new_with_precompiles(state, &config, &precompiles);

        let (exit, output) = match to {
            Some(to) => executor.transact_call(from, to, value, data, gas_limit, Vec::new()),
            None => executor.transact_create(from, value, data, gas_limit, Vec::new()),
        };
        let gas_used = executor.used_gas();
        let (applies, logs) = {
            let (raw_applies, raw_logs) = executor.into_state().deconstruct();
            let applies = raw_applies
                .into_iter()
                .map(|apply| match apply {
                    Apply::Modify { address, basic, code, storage, reset_storage } => {
                        Apply::Modify {
                            address,
                            basic,
                            code,
                            storage: storage.into_iter().collect::<BTreeMap<_, _>>(),
                            reset_storage,
                        }
                    }
                    Apply::Delete { address } => Apply::Delete { address },
                })
                .collect::<Vec<_>>();
            (applies, raw_logs.into_iter().collect::<Vec<_>>())
        };

        Ok(Execution { exit, output, gas_used, logs, created, applies })
    }
}

fn exit_to_result(exit: &ExitReason, output: &[u8]) -> Result<(), ChainError> {
    match exit {
        ExitReason::Succeed(_) => Ok(()),
        ExitReason::Revert(_) => Err(ChainError::Reverted(output.to_vec())),
        ExitReason::Error(err) => Err(ChainError::Execution(format!("{err:?}"))),
        ExitReason::Fatal(err) => Err(ChainError::Execution(format!("{err:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ChainOptions;
    use ethers_core::types::TransactionRequest;
    use ethers_signers::Signer;

    fn vm() -> FriendlyVm {
        FriendlyVm::new(ChainOptions::default()).unwrap()
    }

    async fn signed_transfer(vm: &FriendlyVm, value: u64, nonce: u64) -> Bytes {
        let wallets = vm.wallets().unwrap();
        let to = wallets[1].address();
        let tx: TypedTransaction = TransactionRequest::new()
            .from(wallets[0].address())
            .to(to)
            .value(value)
            .gas(21_000)
            .gas_price(0)
            .nonce(nonce)
            .chain_id(vm.options().chain_id)
            .into();
        let signature = wallets[0].sign_transaction(&tx).await.unwrap();
        tx.rlp_signed(&signature)
    }

    #[test]
    fn genesis_is_block_zero_with_zero_parent() {
        let vm = vm();
        let genesis = vm.latest_block();
        assert_eq!(genesis.number, U64::zero());
        assert_eq!(genesis.parent_hash, H256::zero());
        assert_eq!(genesis.nonce, HEADER_NONCE);
        assert_ne!(genesis.hash, H256::zero());
    }

    #[test]
    fn mined_blocks_link_to_their_parents() {
        let mut vm = vm();
        let first = vm.mine_block().unwrap();
        let second = vm.mine_block().unwrap();
        assert_eq!(first.number, U64::one());
        assert_eq!(first.parent_hash, vm.block_by_number(0).unwrap().hash);
        assert_eq!(second.parent_hash, first.hash);
        assert!(second.timestamp > first.timestamp);
        assert_eq!(vm.block_by_hash(second.hash).unwrap().number, second.number);
    }

    #[tokio::test]
    async fn queued_transactions_are_flushed_into_the_next_block() {
        let mut vm = vm();
        let raw = signed_transfer(&vm, 1_000, 0).await;
        let hash = vm.add_pending_transaction(&raw).unwrap();
        assert_eq!(hash, TxHash::from(keccak256(raw.as_ref())));
        assert_eq!(vm.pending_transactions().len(), 1);

        let block = vm.mine_block().unwrap();
        assert!(vm.pending_transactions().is_empty());
        assert_eq!(block.transactions, vec![hash]);

        let receipt = vm.transaction_receipt(hash).unwrap();
        assert_eq!(receipt.status, Some(1u64.into()));
        assert_eq!(receipt.block_hash, Some(block.hash));

        let wallets = vm.wallets().unwrap();
        assert_eq!(vm.nonce(wallets[0].address()), U256::one());
        assert_eq!(
            vm.balance(wallets[1].address()),
            vm.options().initial_balance + U256::from(1_000u64)
        );
    }

    #[tokio::test]
    async fn nonce_mismatches_abort_the_mine() {
        let mut vm = vm();
        let raw = signed_transfer(&vm, 1_000, 7).await;
        vm.add_pending_transaction(&raw).unwrap();
        let err = vm.mine_block().unwrap_err();
        assert!(matches!(err, ChainError::InvalidTransaction(_)));
        // the queue was drained before execution; errors propagate, nothing retries
        assert!(vm.pending_transactions().is_empty());
    }

    #[test]
    fn simulation_does_not_touch_state() {
        let vm = vm();
        let wallets = vm.wallets().unwrap();
        let from = wallets[0].address();
        let before = vm.balance(from);
        let request = CallRequest {
            from: Some(from),
            to: Some(wallets[1].address()),
            value: Some(U256::from(5_000u64)),
            ..Default::default()
        };
        let gas = vm.estimate_gas(&request).unwrap();
        assert!(gas >= U256::from(21_000u64));
        assert_eq!(vm.balance(from), before);
        assert_eq!(vm.latest_block().number, U64::zero());
    }
}
