//! An in-memory Ethereum test chain behind an ethers-compatible provider.
//!
//! Execution is delegated to the embedded sputnik EVM; this crate queues
//! signed transactions, assembles synthetic blocks on demand and translates
//! the VM's outputs into the response shapes an ethers client expects.

pub mod backend;
pub mod chain;
pub mod conversions;
pub mod error;
pub mod options;
pub mod provider;
pub mod vm;

pub use chain::{BlockTag, CallRequest, TestChain};
pub use error::ChainError;
pub use options::{ChainOptions, Hardfork};
pub use provider::TestProvider;
