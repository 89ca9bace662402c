//! The chain-facing query facade: getter-style requests mapped onto the VM
//! adapter's accessors, with the few operations the embedded VM cannot serve
//! left as explicit unsupported stubs.

use ethers_core::types::{Address, Bytes, Transaction, TransactionReceipt, TxHash, H256, U256, U64};
use ethers_signers::LocalWallet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::conversions::{self, BlockResponse};
use crate::error::ChainError;
use crate::options::ChainOptions;
use crate::vm::{BlockRecord, FriendlyVm};

/// Identifies the block a query targets. Carried on the wire as a string:
/// `"latest"`, `"pending"`, `"earliest"` or a hex quantity like `"0x1f3"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Pending,
    Earliest,
    Number(u64),
}

impl FromStr for BlockTag {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latest" => Ok(Self::Latest),
            "pending" => Ok(Self::Pending),
            "earliest" => Ok(Self::Earliest),
            // JSON-RPC quantities are 0x-prefixed; bare digit strings are not tags
            other => other
                .strip_prefix("0x")
                .and_then(|digits| u64::from_str_radix(digits, 16).ok())
                .map(Self::Number)
                .ok_or_else(|| ChainError::InvalidBlockTag(other.to_string())),
        }
    }
}

impl fmt::Display for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Pending => f.write_str("pending"),
            Self::Earliest => f.write_str("earliest"),
            Self::Number(number) => write!(f, "0x{number:x}"),
        }
    }
}

impl<'de> Deserialize<'de> for BlockTag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tag = String::deserialize(deserializer)?;
        tag.parse().map_err(serde::de::Error::custom)
    }
}

/// A call/estimate request, the wire shape of an unsigned transaction.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CallRequest {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub gas: Option<U256>,
    pub gas_price: Option<U256>,
    pub value: Option<U256>,
    pub data: Option<Bytes>,
    pub nonce: Option<U256>,
}

/// The test chain facade. Owns the VM adapter behind a lock so clones can be
/// handed to providers and test code alike.
#[derive(Clone, Debug)]
pub struct TestChain {
    vm: Arc<RwLock<FriendlyVm>>,
}

impl TestChain {
    pub fn new(options: ChainOptions) -> Result<Self, ChainError> {
        Ok(Self { vm: Arc::new(RwLock::new(FriendlyVm::new(options)?)) })
    }

    pub async fn vm(&self) -> impl Deref<Target = FriendlyVm> + '_ {
        self.vm.read().await
    }

    pub async fn vm_mut(&self) -> impl DerefMut<Target = FriendlyVm> + '_ {
        self.vm.write().await
    }

    pub async fn wallets(&self) -> Result<Vec<LocalWallet>, ChainError> {
        self.vm().await.wallets()
    }

    pub async fn chain_id(&self) -> U256 {
        self.vm().await.chain_id()
    }

    pub async fn block_number(&self) -> U64 {
        self.vm().await.latest_block().number
    }

    pub async fn gas_price(&self) -> U256 {
        self.vm().await.gas_price()
    }

    pub async fn accounts(&self) -> Result<Vec<Address>, ChainError> {
        Ok(self
            .wallets()
            .await?
            .iter()
            .map(ethers_signers::Signer::address)
            .collect())
    }

    pub async fn balance(&self, address: Address, tag: BlockTag) -> Result<U256, ChainError> {
        let vm = self.vm().await;
        require_latest(tag, vm.latest_block().number)?;
        Ok(vm.balance(address))
    }

    pub async fn transaction_count(
        &self,
        address: Address,
        tag: BlockTag,
    ) -> Result<U256, ChainError> {
        let vm = self.vm().await;
        require_latest(tag, vm.latest_block().number)?;
        Ok(vm.nonce(address))
    }

    pub async fn code(&self, address: Address, tag: BlockTag) -> Result<Bytes, ChainError> {
        let vm = self.vm().await;
        require_latest(tag, vm.latest_block().number)?;
        Ok(vm.code(address))
    }

    pub async fn storage_at(
        &self,
        address: Address,
        position: H256,
        tag: BlockTag,
    ) -> Result<H256, ChainError> {
        let vm = self.vm().await;
        require_latest(tag, vm.latest_block().number)?;
        Ok(vm.storage(address, position))
    }

    /// Queue a signed raw transaction and immediately mine a block containing
    /// the queue. Returns the transaction hash.
    pub async fn send_raw_transaction(&self, raw: &Bytes) -> Result<TxHash, ChainError> {
        let mut vm = self.vm_mut().await;
        let hash = vm.add_pending_transaction(raw)?;
        vm.mine_block()?;
        Ok(hash)
    }

    /// Mine a block on demand, empty or carrying whatever is queued.
    pub async fn mine_block(&self) -> Result<BlockRecord, ChainError> {
        self.vm_mut().await.mine_block()
    }

    pub async fn call(&self, request: &CallRequest, tag: BlockTag) -> Result<Bytes, ChainError> {
        let vm = self.vm().await;
        require_latest(tag, vm.latest_block().number)?;
        vm.call(request)
    }

    pub async fn estimate_gas(
        &self,
        request: &CallRequest,
        tag: BlockTag,
    ) -> Result<U256, ChainError> {
        let vm = self.vm().await;
        require_latest(tag, vm.latest_block().number)?;
        vm.estimate_gas(request)
    }

    pub async fn block_by_number(
        &self,
        tag: BlockTag,
        include_txs: bool,
    ) -> Result<Option<BlockResponse>, ChainError> {
        let vm = self.vm().await;
        let record = match tag {
            BlockTag::Latest | BlockTag::Pending => Some(vm.latest_block().clone()),
            BlockTag::Earliest => vm.block_by_number(0).cloned(),
            BlockTag::Number(number) => vm.block_by_number(number).cloned(),
        };
        Ok(record.map(|record| respond(&vm, &record, include_txs)))
    }

    pub async fn block_by_hash(
        &self,
        hash: H256,
        include_txs: bool,
    ) -> Result<Option<BlockResponse>, ChainError> {
        let vm = self.vm().await;
        let record = vm.block_by_hash(hash).cloned();
        Ok(record.map(|record| respond(&vm, &record, include_txs)))
    }

    pub async fn transaction(&self, hash: TxHash) -> Option<Transaction> {
        self.vm().await.transaction(hash)
    }

    pub async fn transaction_receipt(&self, hash: TxHash) -> Option<TransactionReceipt> {
        self.vm().await.transaction_receipt(hash)
    }

    /// Log filtering is not implemented; the chain keeps no filterable index.
    pub fn logs(&self) -> Result<(), ChainError> {
        Err(ChainError::UnsupportedMethod("eth_getLogs".to_string()))
    }
}

/// Only the latest state is retained; any other tag is answerable by a real
/// node, not by this chain.
fn require_latest(tag: BlockTag, latest: U64) -> Result<(), ChainError> {
    match tag {
        BlockTag::Latest | BlockTag::Pending => Ok(()),
        BlockTag::Number(number) if U64::from(number) == latest => Ok(()),
        other => Err(ChainError::UnsupportedBlockTag(other.to_string())),
    }
}

fn respond(vm: &FriendlyVm, record: &BlockRecord, include_txs: bool) -> BlockResponse {
    if include_txs {
        BlockResponse::Full(Box::new(conversions::block_with_transactions(
            record,
            vm.block_transactions(record),
        )))
    } else {
        BlockResponse::Hashes(conversions::block_with_tx_hashes(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_tags_parse_from_wire_strings() {
        assert_eq!("latest".parse::<BlockTag>().unwrap(), BlockTag::Latest);
        assert_eq!("pending".parse::<BlockTag>().unwrap(), BlockTag::Pending);
        assert_eq!("earliest".parse::<BlockTag>().unwrap(), BlockTag::Earliest);
        assert_eq!("0x1f3".parse::<BlockTag>().unwrap(), BlockTag::Number(0x1f3));
        assert!("finalized".parse::<BlockTag>().is_err());
        // quantities without the 0x prefix are malformed, not block numbers
        assert!("5".parse::<BlockTag>().is_err());
        assert!("0xzz".parse::<BlockTag>().is_err());
    }

    #[test]
    fn block_tags_round_trip_through_display() {
        assert_eq!(BlockTag::Number(499).to_string(), "0x1f3");
        assert_eq!(BlockTag::Latest.to_string(), "latest");
    }

    #[test]
    fn historical_tags_are_rejected() {
        assert!(require_latest(BlockTag::Latest, U64::from(3)).is_ok());
        assert!(require_latest(BlockTag::Number(3), U64::from(3)).is_ok());
        assert!(matches!(
            require_latest(BlockTag::Number(1), U64::from(3)),
            Err(ChainError::UnsupportedBlockTag(_))
        ));
        assert!(matches!(
            require_latest(BlockTag::Earliest, U64::from(3)),
            Err(ChainError::UnsupportedBlockTag(_))
        ));
    }

    #[test]
    fn call_requests_accept_typed_transaction_shapes() {
        let request: CallRequest = serde_json::from_str(
            r#"{"from":"0x0000000000000000000000000000000000000001",
                "to":"0x0000000000000000000000000000000000000002",
                "maxFeePerGas":"0x1","value":"0x64","data":"0x60ff","accessList":[]}"#,
        )
        .unwrap();
        assert_eq!(request.value, Some(U256::from(100u64)));
        assert_eq!(request.data.unwrap().to_vec(), vec![0x60, 0xff]);
        assert!(request.gas_price.is_none());
    }
}
