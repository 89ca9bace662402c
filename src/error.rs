use ethers_core::types::transaction::eip2718::TypedTransactionError;
use ethers_core::types::SignatureError;
use ethers_providers::ProviderError;
use ethers_signers::WalletError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("failed to decode raw transaction: {0}")]
    TxDecode(#[from] TypedTransactionError),
    #[error("failed to recover transaction sender: {0}")]
    Signature(#[from] SignatureError),
    #[error("invalid account key: {0}")]
    Wallet(#[from] WalletError),
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("execution reverted: 0x{}", hex::encode(.0))]
    Reverted(Vec<u8>),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("unrecognized block tag `{0}`")]
    InvalidBlockTag(String),
    #[error("state for block tag `{0}` is not retained, only latest")]
    UnsupportedBlockTag(String),
    #[error("method `{0}` is not supported by the test chain")]
    UnsupportedMethod(String),
    #[error("invalid params for `{method}`: {message}")]
    InvalidParams { method: String, message: String },
    #[error("response serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<ChainError> for ProviderError {
    fn from(src: ChainError) -> Self {
        match src {
            ChainError::UnsupportedMethod(_) => ProviderError::UnsupportedRPC,
            other => ProviderError::CustomError(other.to_string()),
        }
    }
}
