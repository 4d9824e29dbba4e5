//! txpilot - Ethereum JSON-RPC client library
//!
//! Wraps raw transaction submission with the pieces that make it usable in
//! anger: parallel-safe nonce allocation across many signing keys, a
//! congestion-aware fee oracle, automatic gas bumping of stuck
//! transactions, and ABI-driven decoding of mined transactions including
//! full `debug_traceTransaction` call trees.

pub mod abi;
pub mod chain;
pub mod client;
pub mod config;
pub mod error;
pub mod gas;
pub mod keys;
pub mod trace;
pub mod tx;

pub use abi::{AbiFinder, AbiFinderResult, ContractMap, ContractStore};
pub use chain::{BlockHeader, RpcTransport};
pub use client::{wei_to_ether, ether_to_wei, Client, DeploymentData, FundingDetails};
pub use config::{Config, CongestionStrategy, KeyfileSource, TracingLevel, TxPriority};
pub use error::{PilotError, PilotResult};
pub use gas::{CongestionClass, GasOracle, HeaderCache};
pub use trace::{DecodedCall, DecodedLog, DecodedTransaction, Tracer};
pub use tx::{
    noop_bump_strategy, priority_bump_strategy, FeeSnapshot, GasBumpStrategy, NonceManager,
    TxOutcome, TxTemplate,
};
