//! In-process store with the same contract as the RocksDB `Store`.
//! Used by tests and for throwaway ledgers.

use crate::block::Block;
use crate::events::SystemEvent;
use crate::storage::{
    BlockRepository, EventLog, LedgerStore, PendingEntry, PendingPool, TransactionLog, TransferCommit,
    UtxoRepository, WalletRepository,
};
use crate::transaction::Transaction;
use crate::utxo::Utxo;
use crate::wallet::Wallet;
use anyhow::{anyhow, bail, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default, Clone)]
struct Inner {
    utxos: Vec<Utxo>,
    utxo_pos: HashMap<String, usize>,
    log: Vec<Transaction>,
    pending: BTreeMap<u64, Transaction>,
    next_seq: u64,
    blocks: Vec<Block>,
    wallets: Vec<Wallet>,
    events: Vec<SystemEvent>,
}

impl Inner {
    fn push_utxo(&mut self, utxo: Utxo) -> Result<()> {
        if self.utxo_pos.contains_key(&utxo.id) {
            bail!("utxo {} already exists", utxo.id);
        }
        self.utxo_pos.insert(utxo.id.clone(), self.utxos.len());
        self.utxos.push(utxo);
        Ok(())
    }

    fn unspent_mut(&mut self, id: &str) -> Option<&mut Utxo> {
        let pos = *self.utxo_pos.get(id)?;
        let u = &mut self.utxos[pos];
        (!u.spent).then_some(u)
    }

    fn apply(&mut self, commit: &TransferCommit) -> Result<bool> {
        if commit.spend.iter().any(|id| self.unspent_mut(id).is_none()) {
            if let Some(fallback) = &commit.fallback {
                self.log(fallback, commit.pending_seq);
            }
            return Ok(false);
        }
        if let Some(dup) = commit.create.iter().find(|u| self.utxo_pos.contains_key(&u.id)) {
            bail!("utxo {} already exists", dup.id);
        }
        for id in &commit.spend {
            if let Some(u) = self.unspent_mut(id) {
                u.spent = true;
                u.spent_in = Some(commit.record.id.clone());
            }
        }
        for u in &commit.create {
            self.push_utxo(u.clone())?;
        }
        self.log(&commit.record, commit.pending_seq);
        Ok(true)
    }

    fn log(&mut self, record: &Transaction, pending_seq: Option<u64>) {
        self.log.push(record.clone());
        if let Some(seq) = pending_seq {
            self.pending.remove(&seq);
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

impl UtxoRepository for MemoryStore {
    fn insert_utxo(&self, utxo: &Utxo) -> Result<()> {
        self.lock()?.push_utxo(utxo.clone())
    }

    fn get_utxo(&self, id: &str) -> Result<Option<Utxo>> {
        let inner = self.lock()?;
        Ok(inner.utxo_pos.get(id).map(|&p| inner.utxos[p].clone()))
    }

    fn unspent_by_owner(&self, owner: &str) -> Result<Vec<Utxo>> {
        Ok(self.lock()?.utxos.iter().filter(|u| u.owner == owner && !u.spent).cloned().collect())
    }

    fn mark_spent(&self, id: &str, spent_in: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.unspent_mut(id) {
            Some(u) => {
                u.spent = true;
                u.spent_in = Some(spent_in.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl TransactionLog for MemoryStore {
    fn transactions(&self) -> Result<Vec<Transaction>> {
        Ok(self.lock()?.log.clone())
    }
}

impl PendingPool for MemoryStore {
    fn enqueue_pending(&self, tx: &Transaction) -> Result<u64> {
        let mut inner = self.lock()?;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.pending.insert(seq, tx.clone());
        Ok(seq)
    }

    fn pending(&self) -> Result<Vec<PendingEntry>> {
        Ok(self
            .lock()?
            .pending
            .iter()
            .map(|(seq, tx)| PendingEntry { seq: *seq, tx: tx.clone() })
            .collect())
    }
}

impl BlockRepository for MemoryStore {
    fn latest_block(&self) -> Result<Option<Block>> {
        Ok(self.lock()?.blocks.last().cloned())
    }

    fn block_by_index(&self, index: u64) -> Result<Option<Block>> {
        Ok(self.lock()?.blocks.iter().find(|b| b.index == index).cloned())
    }

    fn block_by_hash(&self, hash: &str) -> Result<Option<Block>> {
        Ok(self.lock()?.blocks.iter().find(|b| b.hash == hash).cloned())
    }

    fn blocks(&self) -> Result<Vec<Block>> {
        Ok(self.lock()?.blocks.clone())
    }
}

impl WalletRepository for MemoryStore {
    fn insert_wallet(&self, wallet: &Wallet) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.wallets.iter().any(|w| w.id == wallet.id) {
            return Ok(false);
        }
        inner.wallets.push(wallet.clone());
        Ok(true)
    }

    fn get_wallet(&self, id: &str) -> Result<Option<Wallet>> {
        Ok(self.lock()?.wallets.iter().find(|w| w.id == id).cloned())
    }

    fn wallets(&self) -> Result<Vec<Wallet>> {
        Ok(self.lock()?.wallets.clone())
    }
}

impl EventLog for MemoryStore {
    fn append_event(&self, event: &SystemEvent) -> Result<()> {
        self.lock()?.events.push(event.clone());
        Ok(())
    }

    fn events(&self, limit: usize) -> Result<Vec<SystemEvent>> {
        Ok(self.lock()?.events.iter().rev().take(limit).cloned().collect())
    }
}

impl LedgerStore for MemoryStore {
    fn commit_transfer(&self, commit: &TransferCommit) -> Result<bool> {
        // `apply` checks everything before it mutates.
        self.lock()?.apply(commit)
    }

    fn commit_block(&self, block: &Block, commits: &[TransferCommit]) -> Result<Vec<bool>> {
        let mut inner = self.lock()?;
        if inner.blocks.iter().any(|b| b.index == block.index) {
            bail!("block #{} already exists", block.index);
        }
        // Work on a copy so a failure halfway leaves nothing behind.
        let mut next = inner.clone();
        next.blocks.push(block.clone());
        next.blocks.sort_by_key(|b| b.index);
        let mut applied = Vec::with_capacity(commits.len());
        for commit in commits {
            applied.push(next.apply(commit)?);
        }
        *inner = next;
        Ok(applied)
    }
}
