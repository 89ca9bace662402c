//! Translators from the chain's native records into the response shapes an
//! ethers client expects, plus the header-level computations (block hash,
//! difficulty adjustment) the block templates need.

use ethers_core::types::transaction::eip2718::TypedTransaction;
use ethers_core::types::{
    Block, Bloom, Bytes, Log, Transaction, TransactionReceipt, TxHash, H256, H64, U256,
};
use ethers_core::utils::keccak256;
use rlp::RlpStream;
use serde::Serialize;

use crate::vm::{BlockRecord, Execution, QueuedTransaction};

/// Difficulty floor for the canonical adjustment, and the genesis difficulty.
pub const MIN_DIFFICULTY: u64 = 131_072;

/// A block response, with transactions resolved either to hashes or to full
/// transaction responses depending on what the caller asked for.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum BlockResponse {
    Hashes(Block<TxHash>),
    Full(Box<Block<Transaction>>),
}

/// keccak256(rlp("")), standing in for the state and receipt roots the
/// embedded VM does not compute.
pub fn empty_trie_root() -> H256 {
    H256::from(keccak256(rlp::NULL_RLP))
}

fn empty_uncles_hash() -> H256 {
    H256::from(keccak256(rlp::EMPTY_LIST_RLP))
}

/// The block hash is keccak256 over the RLP of the header fields the chain
/// actually tracks. Not a consensus-valid header hash, but deterministic and
/// unique per block, which is all a test chain needs.
pub fn block_hash(record: &BlockRecord) -> H256 {
    let mut stream = RlpStream::new_list(9);
    stream.append(&record.parent_hash);
    stream.append(&record.coinbase);
    stream.append(&U256::from(record.number.as_u64()));
    stream.append(&U256::from(record.timestamp));
    stream.append(&record.difficulty);
    stream.append(&record.gas_limit);
    stream.append(&record.gas_used);
    stream.append(&record.extra_data.to_vec());
    stream.append(&record.nonce);
    H256::from(keccak256(stream.out()))
}

/// Homestead-style canonical difficulty: the parent's difficulty adjusted by
/// parent/2048 * max(1 - elapsed/10, -99), floored at [`MIN_DIFFICULTY`].
pub fn canonical_difficulty(parent_difficulty: U256, parent_timestamp: u64, timestamp: u64) -> U256 {
    let offset = parent_difficulty / U256::from(2048u64);
    let elapsed = timestamp.saturating_sub(parent_timestamp);
    let factor = (1i64 - (elapsed / 10) as i64).max(-99);
    let adjusted = if factor >= 0 {
        parent_difficulty + offset * U256::from(factor as u64)
    } else {
        parent_difficulty.saturating_sub(offset * U256::from(factor.unsigned_abs()))
    };
    adjusted.max(U256::from(MIN_DIFFICULTY))
}

fn shell<TX: Default>(record: &BlockRecord) -> Block<TX> {
    Block {
        hash: Some(record.hash),
        parent_hash: record.parent_hash,
        uncles_hash: empty_uncles_hash(),
        author: Some(record.coinbase),
        state_root: empty_trie_root(),
        transactions_root: transactions_root(record),
        receipts_root: empty_trie_root(),
        number: Some(record.number),
        gas_used: record.gas_used,
        gas_limit: record.gas_limit,
        extra_data: record.extra_data.clone(),
        logs_bloom: Some(Bloom::default()),
        timestamp: U256::from(record.timestamp),
        difficulty: record.difficulty,
        nonce: Some(H64::from_low_u64_be(record.nonce)),
        mix_hash: Some(H256::zero()),
        ..Default::default()
    }
}

/// Placeholder transactions root: the empty-trie root for empty blocks,
/// otherwise a digest over the included hashes. Real trie construction is the
/// VM library's concern and out of scope here.
fn transactions_root(record: &BlockRecord) -> H256 {
    if record.transactions.is_empty() {
        return empty_trie_root();
    }
    let mut buf = Vec::with_capacity(record.transactions.len() * 32);
    for hash in &record.transactions {
        buf.extend_from_slice(hash.as_bytes());
    }
    H256::from(keccak256(buf))
}

pub fn block_with_tx_hashes(record: &BlockRecord) -> Block<TxHash> {
    let mut block = shell(record);
    block.transactions = record.transactions.clone();
    block
}

pub fn block_with_transactions(record: &BlockRecord, transactions: Vec<Transaction>) -> Block<Transaction> {
    let mut block = shell(record);
    block.transactions = transactions;
    block
}

pub fn transaction_response(queued: &QueuedTransaction, block: &BlockRecord, index: u64) -> Transaction {
    let tx = &queued.tx;
    let mut response = Transaction {
        hash: queued.hash,
        nonce: tx.nonce().copied().unwrap_or_default(),
        block_hash: Some(block.hash),
        block_number: Some(block.number),
        transaction_index: Some(index.into()),
        from: queued.sender,
        to: tx.to().and_then(|id| id.as_address().copied()),
        value: tx.value().copied().unwrap_or_default(),
        gas_price: tx.gas_price(),
        gas: tx.gas().copied().unwrap_or_default(),
        input: tx.data().cloned().unwrap_or_default(),
        v: queued.signature.v.into(),
        r: queued.signature.r,
        s: queued.signature.s,
        chain_id: tx.chain_id().map(|id| U256::from(id.as_u64())),
        ..Default::default()
    };
    match tx {
        TypedTransaction::Legacy(_) => {}
        TypedTransaction::Eip2930(inner) => {
            response.transaction_type = Some(1u64.into());
            response.access_list = Some(inner.access_list.clone());
        }
        TypedTransaction::Eip1559(inner) => {
            response.transaction_type = Some(2u64.into());
            response.access_list = Some(inner.access_list.clone());
            response.max_fee_per_gas = inner.max_fee_per_gas;
            response.max_priority_fee_per_gas = inner.max_priority_fee_per_gas;
        }
    }
    response
}

pub fn transaction_receipt(
    queued: &QueuedTransaction,
    execution: &Execution,
    block: &BlockRecord,
    index: u64,
    cumulative_gas_used: U256,
    log_index: &mut u64,
) -> TransactionReceipt {
    let succeeded = execution.exit.is_succeed();
    let logs = execution
        .logs
        .iter()
        .map(|log| {
            let entry = Log {
                address: log.address,
                topics: log.topics.clone(),
                data: Bytes::from(log.data.clone()),
                block_hash: Some(block.hash),
                block_number: Some(block.number),
                transaction_hash: Some(queued.hash),
                transaction_index: Some(index.into()),
                log_index: Some((*log_index).into()),
                ..Default::default()
            };
            *log_index += 1;
            entry
        })
        .collect();
    TransactionReceipt {
        transaction_hash: queued.hash,
        transaction_index: index.into(),
        block_hash: Some(block.hash),
        block_number: Some(block.number),
        from: queued.sender,
        to: queued.tx.to().and_then(|id| id.as_address().copied()),
        cumulative_gas_used,
        gas_used: Some(U256::from(execution.gas_used)),
        contract_address: if succeeded { execution.created } else { None },
        logs,
        status: Some(u64::from(succeeded).into()),
        effective_gas_price: queued.tx.gas_price(),
        transaction_type: match &queued.tx {
            TypedTransaction::Legacy(_) => None,
            TypedTransaction::Eip2930(_) => Some(1u64.into()),
            TypedTransaction::Eip1559(_) => Some(2u64.into()),
        },
        ..Default::default()
    }
}
