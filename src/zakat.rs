//! Periodic percentage deduction from every funded wallet into a pool
//! wallet. Deductions are queued as pending transactions and move value
//! only when mined, like any transfer.

use crate::error::{LedgerError, Result};
use crate::events::EventKind;
use crate::ledger::Ledger;
use crate::storage::{PendingPool, UtxoRepository};
use crate::transaction::Transaction;
use crate::utxo::{self, Amount};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZakatOutcome {
    Queued(Transaction),
    /// Nothing to deduct; carries the reason.
    NotDue(String),
}

/// Largest accepted rate: the whole balance.
pub const MAX_RATE_BPS: u64 = 10_000;

/// `balance * rate_bps / 10_000`, rounded down.
pub fn zakat_due(balance: Amount, rate_bps: u64) -> Result<Amount> {
    if rate_bps > MAX_RATE_BPS {
        return Err(LedgerError::validation(format!("zakat rate {rate_bps} bps exceeds {MAX_RATE_BPS}")));
    }
    let due = (balance as u128 * rate_bps as u128) / 10_000;
    Amount::try_from(due).map_err(|_| LedgerError::validation("zakat amount out of range"))
}

pub fn run_for_wallet(ledger: &Ledger, wallet: &str) -> Result<ZakatOutcome> {
    let cfg = ledger.zakat_config();
    if !ledger.wallet_exists(wallet)? {
        return Err(LedgerError::validation(format!("unknown wallet {wallet}")));
    }
    let store = ledger.store();
    let unspent = store.unspent_by_owner(wallet)?;
    let balance: Amount = unspent.iter().map(|u| u.amount).sum();
    if balance == 0 {
        return Ok(ZakatOutcome::NotDue("zero balance".into()));
    }
    let due = zakat_due(balance, cfg.rate_bps)?;
    if due == 0 {
        return Ok(ZakatOutcome::NotDue(format!("balance {balance} too small at {} bps", cfg.rate_bps)));
    }

    let selection = utxo::select_greedy(unspent, due)?;
    let tx = Transaction::zakat(wallet, &cfg.pool_wallet, due, &selection);
    store.enqueue_pending(&tx)?;
    info!(wallet, amount = due, balance, tx = %tx.id, "zakat deduction queued");
    ledger.record(EventKind::ZakatCreated, format!("wallet={wallet} amount={due}"));
    Ok(ZakatOutcome::Queued(tx))
}

/// Queues a deduction for every registered wallet with a balance, skipping
/// the pool itself. Returns how many were queued.
pub fn run_all(ledger: &Ledger) -> Result<usize> {
    let pool = ledger.zakat_config().pool_wallet.clone();
    let mut queued = 0;
    for wallet in ledger.list_wallets()? {
        if wallet.id == pool {
            continue;
        }
        match run_for_wallet(ledger, &wallet.id) {
            Ok(ZakatOutcome::Queued(_)) => queued += 1,
            Ok(ZakatOutcome::NotDue(_)) => {}
            Err(e @ LedgerError::Storage(_)) => return Err(e),
            Err(e) => warn!(wallet = %wallet.id, "zakat skipped: {e}"),
        }
    }
    Ok(queued)
}

/// Runs `run_all` every `zakat.interval_secs` until `shutdown_rx` fires.
pub fn spawn(ledger: Arc<Ledger>, mut shutdown_rx: Receiver<()>) -> JoinHandle<()> {
    let every = Duration::from_secs(ledger.zakat_config().interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick fires immediately; the first run waits a full period.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("zakat scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let l = ledger.clone();
                    match tokio::task::spawn_blocking(move || run_all(&l)).await {
                        Ok(Ok(n)) => info!(queued = n, "zakat run complete"),
                        Ok(Err(e)) => warn!("zakat run failed: {e}"),
                        Err(e) => error!("zakat task panicked: {e}"),
                    }
                }
            }
        }
    })
}
