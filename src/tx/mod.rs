//! Transaction templates, fee snapshots and gas bump strategies

pub mod lifecycle;
pub mod nonce;

pub use lifecycle::TxOutcome;
pub use nonce::NonceManager;

use crate::config::TxPriority;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TransactionRequest, U256};
use std::sync::Arc;

/// Per-gas pricing for one transaction. Only one family is active on a
/// given network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeSnapshot {
    Legacy { gas_price: U256 },
    Dynamic { gas_fee_cap: U256, gas_tip_cap: U256 },
}

/// The logical transaction: everything except the signature. Bumping
/// re-signs the same template under new fees.
#[derive(Debug, Clone)]
pub struct TxTemplate {
    pub from_index: usize,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: u64,
    pub fee: FeeSnapshot,
    pub nonce: u64,
}

impl TxTemplate {
    pub fn with_to(mut self, to: Address) -> Self {
        self.to = Some(to);
        self
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = data;
        self
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn with_fee(mut self, fee: FeeSnapshot) -> Self {
        self.fee = fee;
        self
    }

    /// Build the unsigned typed transaction for the sender `from`
    pub fn to_typed(&self, from: Address, chain_id: u64) -> TypedTransaction {
        let mut tx: TypedTransaction = match self.fee {
            FeeSnapshot::Legacy { gas_price } => {
                let mut req = TransactionRequest::new()
                    .from(from)
                    .value(self.value)
                    .data(self.data.clone())
                    .nonce(self.nonce)
                    .gas(self.gas_limit)
                    .gas_price(gas_price);
                if let Some(to) = self.to {
                    req = req.to(to);
                }
                req.into()
            }
            FeeSnapshot::Dynamic {
                gas_fee_cap,
                gas_tip_cap,
            } => {
                let mut req = Eip1559TransactionRequest::new()
                    .from(from)
                    .value(self.value)
                    .data(self.data.clone())
                    .nonce(self.nonce)
                    .gas(self.gas_limit)
                    .max_fee_per_gas(gas_fee_cap)
                    .max_priority_fee_per_gas(gas_tip_cap);
                if let Some(to) = self.to {
                    req = req.to(to);
                }
                req.into()
            }
        };
        tx.set_chain_id(chain_id);
        tx
    }
}

/// A pure `old fee → new fee` function applied on bump. The identity
/// strategy disables bumping.
pub type GasBumpStrategy = Arc<dyn Fn(U256) -> U256 + Send + Sync>;

/// Strategy that never changes the fee, i.e. bumping is off
pub fn noop_bump_strategy() -> GasBumpStrategy {
    Arc::new(|fee| fee)
}

/// Default strategies by priority: slow +5 %, standard +15 %, fast +50 %,
/// degen ×2. Integer percentage math so bumped fees never drift.
pub fn priority_bump_strategy(priority: TxPriority) -> GasBumpStrategy {
    match priority {
        TxPriority::Degen => Arc::new(|fee| fee.saturating_mul(U256::from(2u64))),
        TxPriority::Fast => Arc::new(|fee| bump_by_percent(fee, 50)),
        TxPriority::Standard => Arc::new(|fee| bump_by_percent(fee, 15)),
        TxPriority::Slow => Arc::new(|fee| bump_by_percent(fee, 5)),
    }
}

fn bump_by_percent(fee: U256, percent: u64) -> U256 {
    fee + fee.saturating_mul(U256::from(percent)) / U256::from(100u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_template_round_trips_fields() {
        let to: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        let template = TxTemplate {
            from_index: 0,
            to: Some(to),
            value: U256::from(1234u64),
            data: Bytes::from(vec![0xde, 0xad]),
            gas_limit: 21_000,
            fee: FeeSnapshot::Legacy {
                gas_price: U256::from(7u64),
            },
            nonce: 5,
        };
        let from: Address = "0x00000000000000000000000000000000000000bb".parse().unwrap();
        let tx = template.to_typed(from, 1337);

        assert!(matches!(tx, TypedTransaction::Legacy(_)));
        assert_eq!(tx.nonce().copied().unwrap(), U256::from(5u64));
        assert_eq!(tx.gas().copied().unwrap(), U256::from(21_000u64));
        assert_eq!(tx.gas_price().unwrap(), U256::from(7u64));
        assert_eq!(tx.chain_id().unwrap().as_u64(), 1337);
        assert_eq!(tx.from().copied().unwrap(), from);
    }

    #[test]
    fn dynamic_template_builds_eip1559() {
        let template = TxTemplate {
            from_index: 0,
            to: None,
            value: U256::zero(),
            data: Bytes::default(),
            gas_limit: 100_000,
            fee: FeeSnapshot::Dynamic {
                gas_fee_cap: U256::from(30u64),
                gas_tip_cap: U256::from(2u64),
            },
            nonce: 0,
        };
        let from = Address::zero();
        let tx = template.to_typed(from, 1);
        match &tx {
            TypedTransaction::Eip1559(req) => {
                assert_eq!(req.max_fee_per_gas.unwrap(), U256::from(30u64));
                assert_eq!(req.max_priority_fee_per_gas.unwrap(), U256::from(2u64));
            }
            other => panic!("expected EIP-1559 transaction, got {other:?}"),
        }
    }

    #[test]
    fn bump_strategies_scale_fees() {
        let fee = U256::from(1_000_000u64);
        assert_eq!(noop_bump_strategy()(fee), fee);
        assert_eq!(priority_bump_strategy(TxPriority::Slow)(fee), U256::from(1_050_000u64));
        assert_eq!(
            priority_bump_strategy(TxPriority::Standard)(fee),
            U256::from(1_150_000u64)
        );
        assert_eq!(priority_bump_strategy(TxPriority::Fast)(fee), U256::from(1_500_000u64));
        assert_eq!(priority_bump_strategy(TxPriority::Degen)(fee), U256::from(2_000_000u64));
    }
}
