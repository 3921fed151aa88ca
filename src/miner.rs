//! Block assembly: drain the pending pool, prepend the coinbase, run the
//! proof-of-work search, then append the block together with every
//! transaction's UTXO effects in one store write.

use crate::block::Block;
use crate::chain;
use crate::config::{Mining, UnderfundedPolicy};
use crate::error::{LedgerError, Result};
use crate::events::{EventKind, SystemEvent};
use crate::storage::{BlockRepository, EventLog, LedgerStore, PendingEntry, PendingPool, TransferCommit, UtxoRepository};
use crate::transaction::{inputs_from, plan_outputs, Transaction, TxStatus, TxType};
use crate::utxo::{self, Utxo};
use chrono::Utc;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Summary of one `mine` call.
#[derive(Debug, Clone)]
pub struct MinedBlock {
    pub block: Block,
    /// Ids of pending transactions confirmed in this block.
    pub confirmed: Vec<String>,
    /// Pending transactions that were not confirmed, and why.
    pub dropped: Vec<Dropped>,
    pub attempts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dropped {
    pub tx_id: String,
    pub reason: DropReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The sender's unspent outputs no longer cover the amount.
    Underfunded { available: u64 },
    /// The stored signature does not verify; always rejected.
    BadSignature,
    /// An input was spent by someone else between selection and commit.
    LostRace,
}

/// Outputs spent and created by commits planned earlier in the same block.
#[derive(Default)]
struct Overlay {
    spent: HashSet<String>,
    created: Vec<Utxo>,
}

impl Overlay {
    /// The owner's unspent outputs as they will look once the earlier
    /// commits land, in store order followed by creation order.
    fn unspent(&self, store: &dyn LedgerStore, owner: &str) -> Result<Vec<Utxo>> {
        let mut out: Vec<Utxo> =
            store.unspent_by_owner(owner)?.into_iter().filter(|u| !self.spent.contains(&u.id)).collect();
        out.extend(self.created.iter().filter(|u| u.owner == owner && !self.spent.contains(&u.id)).cloned());
        Ok(out)
    }

    fn record(&mut self, commit: &TransferCommit) {
        self.spent.extend(commit.spend.iter().cloned());
        self.created.extend(commit.create.iter().cloned());
    }
}

enum Plan {
    Confirm(TransferCommit),
    Drop(DropReason),
}

/// Where each pending entry ended up in the block's commit list.
enum Slot {
    Confirm(usize),
    Dropped(DropReason),
}

/// A mined block with its commits planned but not yet written.
struct Draft {
    block: Block,
    commits: Vec<TransferCommit>,
    slots: Vec<(String, Slot)>,
    attempts: u64,
}

pub struct BlockAssembler<'a> {
    store: &'a dyn LedgerStore,
    cfg: &'a Mining,
}

impl<'a> BlockAssembler<'a> {
    pub fn new(store: &'a dyn LedgerStore, cfg: &'a Mining) -> Self {
        BlockAssembler { store, cfg }
    }

    /// Builds, mines and applies the next block, crediting `authority`.
    ///
    /// Nothing is written until the whole block is ready, and then the block,
    /// the reward and every transaction land in one atomic store write. A
    /// failure at any point leaves the chain, pool and UTXO set untouched.
    pub fn assemble(&self, authority: &str) -> Result<MinedBlock> {
        let draft = self.prepare(authority)?;
        self.apply(draft, authority)
    }

    fn prepare(&self, authority: &str) -> Result<Draft> {
        if authority.is_empty() {
            return Err(LedgerError::validation("missing miner wallet"));
        }

        let prev = self.store.latest_block()?;
        let (index, previous_hash) = match &prev {
            Some(b) => (b.index + 1, b.hash.clone()),
            None => (0, String::new()),
        };

        let pending = self.store.pending()?;
        let timestamp = Utc::now();
        let coinbase = Transaction::coinbase(authority, self.cfg.reward, timestamp);

        let mut txs = Vec::with_capacity(pending.len() + 1);
        txs.push(coinbase.clone());
        txs.extend(pending.iter().map(|p| p.tx.clone()));

        let mut block = Block::new(index, timestamp, txs, previous_hash);
        debug!(index, txs = block.transactions.len(), difficulty = self.cfg.difficulty, "searching nonce");
        let started = std::time::Instant::now();
        let attempts = block.mine(self.cfg.difficulty, self.cfg.max_attempts);
        crate::metrics::POW_SEARCH_MS.observe(started.elapsed().as_secs_f64() * 1000.0);
        let attempts = match attempts {
            Ok(n) => n,
            Err(e) => {
                if let LedgerError::PowExhausted(n) = e {
                    crate::metrics::POW_ATTEMPTS.inc_by(n);
                }
                return Err(e);
            }
        };
        crate::metrics::POW_ATTEMPTS.inc_by(attempts);
        chain::validate_append(&block, prev.as_ref(), self.cfg.difficulty)?;

        // Reward first; it has no inputs so it cannot fail on funds.
        let mut overlay = Overlay::default();
        let mut reward = coinbase;
        reward.block_id = Some(block.hash.clone());
        let reward_utxo = Utxo::new(authority, &reward.id, 0, reward.amount);
        let mut commits = vec![TransferCommit::credit(reward, vec![reward_utxo])];
        overlay.record(&commits[0]);

        let mut slots = Vec::with_capacity(pending.len());
        for entry in &pending {
            let slot = match self.plan(entry, &block.hash, &overlay)? {
                Plan::Confirm(commit) => {
                    overlay.record(&commit);
                    commits.push(commit);
                    Slot::Confirm(commits.len() - 1)
                }
                Plan::Drop(reason) => {
                    if let Some(retire) = self.retirement(entry, reason) {
                        commits.push(retire);
                    }
                    Slot::Dropped(reason)
                }
            };
            slots.push((entry.tx.id.clone(), slot));
        }

        Ok(Draft { block, commits, slots, attempts })
    }

    fn apply(&self, draft: Draft, authority: &str) -> Result<MinedBlock> {
        let Draft { block, commits, slots, attempts } = draft;
        let applied = self.store.commit_block(&block, &commits)?;
        crate::metrics::BLOCKS_MINED.inc();

        let mut confirmed = Vec::new();
        let mut dropped = Vec::new();
        for (tx_id, slot) in slots {
            let reason = match slot {
                Slot::Confirm(i) if applied.get(i).copied().unwrap_or(false) => {
                    crate::metrics::TX_CONFIRMED.inc();
                    confirmed.push(tx_id);
                    continue;
                }
                Slot::Confirm(_) => DropReason::LostRace,
                Slot::Dropped(reason) => reason,
            };
            warn!(tx = %tx_id, ?reason, "pending transaction not confirmed");
            crate::metrics::TX_DROPPED.inc();
            dropped.push(Dropped { tx_id, reason });
        }

        info!(
            index = block.index,
            hash = %block.hash,
            miner = authority,
            reward = self.cfg.reward,
            confirmed = confirmed.len(),
            dropped = dropped.len(),
            attempts,
            "⛏️  block mined"
        );
        let event = SystemEvent::new(
            EventKind::MinedBlock,
            format!(
                "Block #{} mined by {} with reward {}, user_tx={}",
                block.index,
                authority,
                self.cfg.reward,
                confirmed.len() + dropped.len()
            ),
        );
        if let Err(e) = self.store.append_event(&event) {
            warn!("could not record mined block event: {e:#}");
        }

        Ok(MinedBlock { block, confirmed, dropped, attempts })
    }

    /// Re-selects the sender's inputs against the block-so-far and plans the
    /// commit that spends them, creates the receiver and change outputs, logs
    /// the confirmed record and removes the pending entry.
    fn plan(&self, entry: &PendingEntry, block_hash: &str, overlay: &Overlay) -> Result<Plan> {
        let tx = &entry.tx;
        if tx.tx_type == TxType::Normal && !tx.verify_signature() {
            return Ok(Plan::Drop(DropReason::BadSignature));
        }
        let unspent = overlay.unspent(self.store, &tx.sender)?;
        let selection = match utxo::select_greedy(unspent, tx.amount) {
            Ok(s) => s,
            Err(LedgerError::InsufficientFunds { available, .. }) => {
                return Ok(Plan::Drop(DropReason::Underfunded { available }))
            }
            Err(e) => return Err(e),
        };

        let outputs = plan_outputs(&tx.sender, &tx.receiver, tx.amount, selection.change);
        let create = outputs
            .iter()
            .enumerate()
            .map(|(i, o)| Utxo::new(&o.owner, &tx.id, i as u32, o.amount))
            .collect();

        let mut record = tx.clone();
        record.inputs = inputs_from(&selection);
        record.outputs = outputs;
        record.status = TxStatus::Confirmed;
        record.block_id = Some(block_hash.to_string());

        Ok(Plan::Confirm(TransferCommit {
            spend: selection.selected.iter().map(|u| u.id.clone()).collect(),
            create,
            record,
            pending_seq: Some(entry.seq),
            fallback: self.rejected(entry),
        }))
    }

    /// Rejected record for `entry` under the configured policy.
    fn rejected(&self, entry: &PendingEntry) -> Option<Transaction> {
        match self.cfg.underfunded {
            UnderfundedPolicy::Requeue => None,
            UnderfundedPolicy::Reject => {
                let mut record = entry.tx.clone();
                record.status = TxStatus::Rejected;
                Some(record)
            }
        }
    }

    fn retirement(&self, entry: &PendingEntry, reason: DropReason) -> Option<TransferCommit> {
        let record = match reason {
            // A forged entry never becomes valid; requeueing it would stall.
            DropReason::BadSignature => {
                let mut record = entry.tx.clone();
                record.status = TxStatus::Rejected;
                record
            }
            _ => self.rejected(entry)?,
        };
        Some(TransferCommit::retire(record, entry.seq))
    }
}
