//! Transaction lifecycle: submit, await inclusion, bump on timeout
//!
//! A submitted transaction is polled for its receipt once a second until
//! the per-attempt deadline. On timeout the same logical transaction is
//! re-signed under fees produced by the bump strategy and resubmitted at
//! the same nonce, up to `gas_bump_retries` times. A rejected replacement
//! keeps the previous hash alive so inclusion of the original is still
//! detected.

use crate::chain::RpcTransport;
use crate::error::{PilotError, PilotResult};
use crate::tx::GasBumpStrategy;

use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionReceipt, TxHash, U256};
use std::time::Duration;
use tracing::{debug, info, warn};

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub(crate) const CONNECTION_RETRY_ATTEMPTS: u32 = 10;
pub(crate) const CONNECTION_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The committed outcome of one (key, nonce) pair
#[derive(Debug, Clone)]
pub struct TxOutcome {
    pub hash: TxHash,
    pub receipt: TransactionReceipt,
    pub gas_bumps: u32,
    /// The transaction variant that was finally mined (fees reflect bumps)
    pub tx: TypedTransaction,
}

/// Sign `tx` with `wallet` and broadcast it
pub async fn sign_and_send(
    transport: &RpcTransport,
    wallet: &LocalWallet,
    tx: &TypedTransaction,
) -> PilotResult<TxHash> {
    let signature = wallet
        .sign_transaction(tx)
        .await
        .map_err(|e| PilotError::Wallet(format!("failed to sign transaction: {e}")))?;
    let raw = tx.rlp_signed(&signature);
    transport.send_raw_transaction(raw).await
}

/// Poll for a receipt every second until `deadline` elapses
pub async fn wait_mined(
    transport: &RpcTransport,
    hash: TxHash,
    deadline: Duration,
) -> PilotResult<TransactionReceipt> {
    let mut ticker = tokio::time::interval(RECEIPT_POLL_INTERVAL);
    tokio::time::timeout(deadline, async {
        loop {
            ticker.tick().await;
            match transport.get_receipt(hash).await {
                Ok(Some(receipt)) => {
                    info!(
                        tx = ?hash,
                        block = receipt.block_number.map(|b| b.as_u64()).unwrap_or_default(),
                        "Transaction accepted"
                    );
                    return Ok(receipt);
                }
                Ok(None) => debug!(tx = ?hash, "Awaiting transaction"),
                Err(e) => warn!(tx = ?hash, error = %e, "Failed to get receipt"),
            }
        }
    })
    .await
    .map_err(|_| PilotError::Timeout {
        operation: format!("inclusion of {hash:?}"),
    })?
}

/// Submit a signed-template transaction and watch it to completion,
/// bumping fees on each per-attempt timeout.
pub async fn send_with_bumps(
    transport: &RpcTransport,
    wallets: &[LocalWallet],
    tx: TypedTransaction,
    strategy: &GasBumpStrategy,
    txn_timeout: Duration,
    bump_retries: u32,
) -> PilotResult<TxOutcome> {
    let wallet = find_signer(wallets, &tx)?;
    let mut current_tx = tx;
    let mut current_hash = sign_and_send(transport, wallet, &current_tx).await?;
    let mut gas_bumps = 0u32;

    for attempt in 0..=bump_retries {
        match wait_mined(transport, current_hash, txn_timeout).await {
            Ok(receipt) => {
                return Ok(TxOutcome {
                    hash: current_hash,
                    receipt,
                    gas_bumps,
                    tx: current_tx,
                });
            }
            Err(PilotError::Timeout { .. }) if attempt < bump_retries => {
                // the tx may have been included between polls
                if let Ok(Some(seen)) = transport.get_transaction(current_hash).await {
                    if seen.block_number.is_some() {
                        debug!(tx = ?current_hash, "Transaction was confirmed before bumping gas");
                        continue;
                    }
                }

                warn!(
                    tx = ?current_hash,
                    timeout = ?txn_timeout,
                    "Transaction not confirmed in time, bumping gas"
                );
                let replacement = bumped_replacement(&current_tx, strategy)?;
                gas_bumps += 1;

                match sign_and_send(transport, wallet, &replacement).await {
                    Ok(new_hash) => {
                        debug!(old = ?current_hash, new = ?new_hash, "Replacement transaction sent");
                        current_tx = replacement;
                        current_hash = new_hash;
                    }
                    Err(e) => {
                        // keep the previous hash so inclusion of the
                        // original is still detected next round
                        warn!(tx = ?current_hash, error = %e, "Replacement rejected, keeping previous hash");
                    }
                }
            }
            Err(PilotError::Timeout { .. }) => return Err(PilotError::RetryTimeout),
            Err(e) => return Err(e),
        }
    }
    Err(PilotError::RetryTimeout)
}

/// Derive the replacement transaction: identical template, bumped fees.
/// Only legacy and EIP-1559 transactions can be bumped.
pub fn bumped_replacement(
    tx: &TypedTransaction,
    strategy: &GasBumpStrategy,
) -> PilotResult<TypedTransaction> {
    match tx {
        TypedTransaction::Legacy(req) => {
            let old = req.gas_price.unwrap_or_default();
            let new = strategy(old);
            warn!(old = %old, new = %new, "Bumping gas price for legacy transaction");
            let mut bumped = req.clone();
            bumped.gas_price = Some(new);
            Ok(TypedTransaction::Legacy(bumped))
        }
        TypedTransaction::Eip1559(req) => {
            let old_fee_cap = req.max_fee_per_gas.unwrap_or_default();
            let old_tip_cap = req.max_priority_fee_per_gas.unwrap_or_default();
            let new_fee_cap = strategy(old_fee_cap);
            let new_tip_cap = strategy(old_tip_cap);
            warn!(
                old_fee_cap = %old_fee_cap,
                new_fee_cap = %new_fee_cap,
                old_tip_cap = %old_tip_cap,
                new_tip_cap = %new_tip_cap,
                "Bumping fee and tip caps for EIP-1559 transaction"
            );
            let mut bumped = req.clone();
            bumped.max_fee_per_gas = Some(new_fee_cap);
            bumped.max_priority_fee_per_gas = Some(new_tip_cap);
            Ok(TypedTransaction::Eip1559(bumped))
        }
        TypedTransaction::Eip2930(_) => Err(PilotError::BumpUnsupportedType { tx_type: 1 }),
        #[allow(unreachable_patterns)]
        _ => Err(PilotError::BumpUnsupportedType { tx_type: u64::MAX }),
    }
}

/// The wallet able to sign `tx`; bumping cannot proceed without it
fn find_signer<'a>(
    wallets: &'a [LocalWallet],
    tx: &TypedTransaction,
) -> PilotResult<&'a LocalWallet> {
    let sender: Address = *tx
        .from()
        .ok_or_else(|| PilotError::Internal("transaction has no sender set".to_string()))?;
    wallets
        .iter()
        .find(|w| w.address() == sender)
        .ok_or(PilotError::BumpUnknownSender(sender))
}

/// Run `f` until it succeeds, retrying connection-refused failures with a
/// fixed 1 s delay for up to 10 attempts. Exhaustion is a retry timeout.
pub async fn retry_on_connection_refused<T, F, Fut>(mut f: F) -> PilotResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = PilotResult<T>>,
{
    for attempt in 1..=CONNECTION_RETRY_ATTEMPTS {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_connection_refused() => {
                debug!(attempt, error = %e, "Retrying transaction");
                tokio::time::sleep(CONNECTION_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(PilotError::RetryTimeout)
}
