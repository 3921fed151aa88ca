//! The ledger facade: the operations the outer layers call, each taking an
//! already-authenticated wallet id.

use crate::block::{Block, BlockRef};
use crate::chain;
use crate::config::{self, Mining};
use crate::error::{LedgerError, Result};
use crate::events::{EventKind, SystemEvent};
use crate::miner::{BlockAssembler, MinedBlock};
use crate::storage::{
    BlockRepository, EventLog, LedgerStore, PendingPool, TransactionLog, TransferCommit, UtxoRepository,
    WalletRepository,
};
use crate::transaction::{self, Transaction, TransferRequest, TxStatus, TxType};
use crate::utxo::{Amount, Utxo};
use crate::wallet::{Wallet, WalletReport};
use anyhow::anyhow;
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Entries returned by `history` and `system_logs` when no limit is given.
pub const DEFAULT_LOG_LIMIT: usize = 100;

pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    mining: Mining,
    zakat: config::Zakat,
    // One assembler at a time; two would drain the same pool.
    assembly: Mutex<()>,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, mining: Mining, zakat: config::Zakat) -> Self {
        Ledger { store, mining, zakat, assembly: Mutex::new(()) }
    }

    pub fn store(&self) -> &dyn LedgerStore {
        self.store.as_ref()
    }

    pub fn mining_config(&self) -> &Mining {
        &self.mining
    }

    pub fn zakat_config(&self) -> &config::Zakat {
        &self.zakat
    }

    pub fn register_wallet(&self, user_id: &str, public_key: &VerifyingKey) -> Result<Wallet> {
        if user_id.trim().is_empty() {
            return Err(LedgerError::validation("user id is required"));
        }
        let wallet = Wallet::new(user_id, public_key);
        if !self.store.insert_wallet(&wallet)? {
            return Err(LedgerError::validation(format!("wallet {} already registered", wallet.id)));
        }
        info!(wallet = %wallet.id, user = user_id, "wallet registered");
        self.record(EventKind::WalletRegistered, format!("wallet={} user={user_id}", wallet.id));
        Ok(wallet)
    }

    pub fn wallet_exists(&self, wallet: &str) -> Result<bool> {
        Ok(self.store.get_wallet(wallet)?.is_some())
    }

    pub fn list_wallets(&self) -> Result<Vec<Wallet>> {
        Ok(self.store.wallets()?)
    }

    pub fn submit_transfer(&self, sender: &str, signing_key: &SigningKey, req: TransferRequest) -> Result<Transaction> {
        let tx = transaction::submit_transfer(self.store(), sender, signing_key, req)?;
        crate::metrics::TX_SUBMITTED.inc();
        Ok(tx)
    }

    /// Live sum of the wallet's unspent outputs; 0 for an unknown wallet.
    pub fn balance(&self, wallet: &str) -> Result<Amount> {
        Ok(self.store.balance(wallet)?)
    }

    pub fn list_utxos(&self, wallet: &str) -> Result<Vec<Utxo>> {
        Ok(self.store.unspent_by_owner(wallet)?)
    }

    pub fn pending(&self) -> Result<Vec<Transaction>> {
        Ok(self.store.pending()?.into_iter().map(|p| p.tx).collect())
    }

    /// Mines one block over the whole pending pool, crediting `authority`.
    /// Blocks the calling thread for the length of the nonce search.
    pub fn mine_pending(&self, authority: &str) -> Result<MinedBlock> {
        let _guard = self.assembly.lock().map_err(|_| anyhow!("assembly lock poisoned"))?;
        BlockAssembler::new(self.store(), &self.mining).assemble(authority)
    }

    /// Every block in index order, after checking linkage end to end.
    pub fn list_blocks(&self) -> Result<Vec<Block>> {
        let blocks = self.store.blocks()?;
        chain::validate_chain(&blocks)?;
        Ok(blocks)
    }

    pub fn get_block(&self, r: &BlockRef) -> Result<Block> {
        self.store.get_block(r)?.ok_or_else(|| LedgerError::NotFound(format!("block {r:?}")))
    }

    pub fn validate_chain(&self) -> Result<u64> {
        let blocks = self.store.blocks()?;
        chain::validate_chain(&blocks)?;
        Ok(blocks.len() as u64)
    }

    /// Logged transactions (confirmed and rejected) touching `wallet`, newest
    /// first, at most `limit` of them.
    pub fn history(&self, wallet: &str, limit: usize) -> Result<Vec<Transaction>> {
        let mut txs = self.store.history(wallet)?;
        txs.reverse();
        // Stable, so records sharing a timestamp stay newest-logged first.
        txs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        txs.truncate(limit);
        Ok(txs)
    }

    /// The persisted system event log, newest first.
    pub fn system_logs(&self, limit: usize) -> Result<Vec<SystemEvent>> {
        Ok(self.store.events(limit)?)
    }

    /// Appends to the system log. The event is informational, so a failed
    /// write is logged and the operation that caused it still succeeds.
    pub(crate) fn record(&self, event: EventKind, details: String) {
        if let Err(e) = self.store.append_event(&SystemEvent::new(event, details)) {
            warn!(?event, "could not record system event: {e:#}");
        }
    }

    /// Credits `amount` to `wallet` out of thin air.
    pub fn fund(&self, wallet: &str, amount: Amount) -> Result<Transaction> {
        if amount == 0 {
            return Err(LedgerError::validation("amount must be greater than zero"));
        }
        if !self.wallet_exists(wallet)? {
            return Err(LedgerError::validation(format!("unknown wallet {wallet}")));
        }
        let tx = Transaction::faucet(wallet, amount);
        let create = vec![Utxo::new(wallet, &tx.id, 0, amount)];
        let commit = TransferCommit::credit(tx, create);
        self.store.commit_transfer(&commit)?;
        info!(wallet, amount, tx = %commit.record.id, "faucet funded wallet");
        self.record(EventKind::WalletFunded, format!("wallet={wallet} amount={amount}"));
        Ok(commit.record)
    }

    /// Totals over the wallet's confirmed history. Zakat deductions count as
    /// sent and are also broken out on their own.
    pub fn report(&self, wallet: &str) -> Result<WalletReport> {
        let mut report = WalletReport { wallet: wallet.to_string(), ..Default::default() };
        for tx in self.store.history(wallet)? {
            if tx.status != TxStatus::Confirmed {
                continue;
            }
            if tx.sender == wallet {
                report.total_sent += tx.amount;
                report.sent_count += 1;
                if tx.tx_type == TxType::ZakatDeduction {
                    report.zakat_deducted += tx.amount;
                    report.zakat_count += 1;
                }
            }
            if tx.receiver == wallet {
                report.total_received += tx.amount;
                report.received_count += 1;
            }
        }
        Ok(report)
    }
}
