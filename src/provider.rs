//! The provider shim: satisfies ethers' request-dispatch contract
//! ([`JsonRpcClient`]) by translating named RPC-style calls into calls on the
//! chain facade and serializing the results back into the shapes the client
//! expects.

use async_trait::async_trait;
use ethers_providers::{JsonRpcClient, Provider, ProviderError};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt::Debug;

use crate::chain::TestChain;
use crate::error::ChainError;
use crate::options::ChainOptions;

/// An in-process replacement for a JSON-RPC transport, backed by the test
/// chain. Wrap it in [`Provider`] to get the full ethers client surface.
#[derive(Clone, Debug)]
pub struct TestProvider {
    chain: TestChain,
}

impl TestProvider {
    pub fn new(options: ChainOptions) -> Result<Self, ChainError> {
        Ok(Self { chain: TestChain::new(options)? })
    }

    pub fn with_chain(chain: TestChain) -> Self {
        Self { chain }
    }

    pub fn chain(&self) -> &TestChain {
        &self.chain
    }

    /// A ready-to-use ethers `Provider` over a fresh chain.
    pub fn provider(options: ChainOptions) -> Result<Provider<TestProvider>, ChainError> {
        Ok(Provider::new(Self::new(options)?))
    }

    async fn execute(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let mut params = ParamCursor::new(method, params);
        let response = match method {
            "eth_chainId" => json(self.chain.chain_id().await)?,
            "net_version" => json(self.chain.chain_id().await.to_string())?,
            "eth_blockNumber" => json(self.chain.block_number().await)?,
            "eth_gasPrice" => json(self.chain.gas_price().await)?,
            "eth_accounts" => json(self.chain.accounts().await?)?,
            "eth_getBalance" => {
                let address = params.take("address")?;
                let tag = params.take_tag_or_latest()?;
                json(self.chain.balance(address, tag).await?)?
            }
            "eth_getTransactionCount" => {
                let address = params.take("address")?;
                let tag = params.take_tag_or_latest()?;
                json(self.chain.transaction_count(address, tag).await?)?
            }
            "eth_getCode" => {
                let address = params.take("address")?;
                let tag = params.take_tag_or_latest()?;
                json(self.chain.code(address, tag).await?)?
            }
            "eth_getStorageAt" => {
                let address = params.take("address")?;
                let position = params.take("position")?;
                let tag = params.take_tag_or_latest()?;
                json(self.chain.storage_at(address, position, tag).await?)?
            }
            "eth_sendRawTransaction" => {
                let raw = params.take("transaction")?;
                json(self.chain.send_raw_transaction(&raw).await?)?
            }
            "eth_call" => {
                let request = params.take("transaction")?;
                let tag = params.take_tag_or_latest()?;
                json(self.chain.call(&request, tag).await?)?
            }
            "eth_estimateGas" => {
                let request = params.take("transaction")?;
                let tag = params.take_tag_or_latest()?;
                json(self.chain.estimate_gas(&request, tag).await?)?
            }
            "eth_getBlockByNumber" => {
                let tag = params.take("block tag")?;
                let include_txs = params.take("include transactions flag")?;
                json(self.chain.block_by_number(tag, include_txs).await?)?
            }
            "eth_getBlockByHash" => {
                let hash = params.take("block hash")?;
                let include_txs = params.take("include transactions flag")?;
                json(self.chain.block_by_hash(hash, include_txs).await?)?
            }
            "eth_getTransactionByHash" => {
                let hash = params.take("transaction hash")?;
                json(self.chain.transaction(hash).await)?
            }
            "eth_getTransactionReceipt" => {
                let hash = params.take("transaction hash")?;
                json(self.chain.transaction_receipt(hash).await)?
            }
            "evm_mine" => {
                self.chain.mine_block().await?;
                Value::Null
            }
            "eth_getLogs" => {
                self.chain.logs()?;
                Value::Null
            }
            other => return Err(ChainError::UnsupportedMethod(other.to_string())),
        };
        Ok(response)
    }
}

#[async_trait]
impl JsonRpcClient for TestProvider {
    type Error = ProviderError;

    async fn request<T, R>(&self, method: &str, params: T) -> Result<R, Self::Error>
    where
        T: Debug + Serialize + Send + Sync,
        R: DeserializeOwned + Send,
    {
        let params = serde_json::to_value(params)?;
        tracing::trace!(method, %params, "provider request");
        let response = self.execute(method, params).await?;
        Ok(serde_json::from_value(response)?)
    }
}

fn json<T: Serialize>(value: T) -> Result<Value, ChainError> {
    Ok(serde_json::to_value(value)?)
}

/// Positional JSON-RPC params, consumed left to right.
struct ParamCursor<'a> {
    method: &'a str,
    params: std::vec::IntoIter<Value>,
}

impl<'a> ParamCursor<'a> {
    fn new(method: &'a str, params: Value) -> Self {
        let list = match params {
            Value::Array(list) => list,
            Value::Null => Vec::new(),
            single => vec![single],
        };
        Self { method, params: list.into_iter() }
    }

    fn take<T: DeserializeOwned>(&mut self, name: &str) -> Result<T, ChainError> {
        let value = self.params.next().ok_or_else(|| ChainError::InvalidParams {
            method: self.method.to_string(),
            message: format!("missing `{name}`"),
        })?;
        serde_json::from_value(value).map_err(|err| ChainError::InvalidParams {
            method: self.method.to_string(),
            message: format!("bad `{name}`: {err}"),
        })
    }

    /// Trailing block tags are optional on several methods; absent means latest.
    fn take_tag_or_latest(&mut self) -> Result<crate::chain::BlockTag, ChainError> {
        match self.params.next() {
            None => Ok(crate::chain::BlockTag::Latest),
            Some(value) => serde_json::from_value(value).map_err(|err| ChainError::InvalidParams {
                method: self.method.to_string(),
                message: format!("bad block tag: {err}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unsupported_methods_surface_as_unsupported_rpc() {
        let provider = TestProvider::new(ChainOptions::default()).unwrap();
        let err = provider
            .request::<_, Value>("eth_newFilter", ())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnsupportedRPC));
    }

    #[tokio::test]
    async fn dispatch_reports_missing_params() {
        let provider = TestProvider::new(ChainOptions::default()).unwrap();
        let err = provider.execute("eth_getBalance", Value::Null).await.unwrap_err();
        assert!(matches!(err, ChainError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn single_values_are_treated_as_one_param() {
        let provider = TestProvider::new(ChainOptions::default()).unwrap();
        let balance = provider
            .execute(
                "eth_getBalance",
                json!("0x00000000000000000000000000000000000000aa"),
            )
            .await
            .unwrap();
        assert_eq!(balance, json!("0x0"));
    }
}
