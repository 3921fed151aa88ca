use crate::block::{Block, BlockRef};
use crate::events::SystemEvent;
use crate::transaction::Transaction;
use crate::utxo::{self, Amount, Selection, Utxo};
use crate::wallet::Wallet;
use anyhow::{anyhow, bail, Context, Result};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

// -----------------------------------------------------------------------------
// Repository traits, one per record kind
// -----------------------------------------------------------------------------

pub trait UtxoRepository {
    /// Inserts a new unspent output; fails if its key already exists.
    fn insert_utxo(&self, utxo: &Utxo) -> Result<()>;
    fn get_utxo(&self, id: &str) -> Result<Option<Utxo>>;
    /// Unspent outputs owned by `owner`, in insertion order.
    fn unspent_by_owner(&self, owner: &str) -> Result<Vec<Utxo>>;
    /// Compare-and-set `spent: false -> true`. Returns `false` when the output
    /// is missing or somebody else already spent it.
    fn mark_spent(&self, id: &str, spent_in: &str) -> Result<bool>;

    fn balance(&self, owner: &str) -> Result<Amount> {
        Ok(self.unspent_by_owner(owner)?.iter().map(|u| u.amount).sum())
    }

    fn select_for_amount(&self, owner: &str, amount: Amount) -> crate::error::Result<Selection> {
        let unspent = self.unspent_by_owner(owner)?;
        utxo::select_greedy(unspent, amount)
    }
}

/// Durable log of confirmed (and rejected) transactions, in write order.
pub trait TransactionLog {
    fn transactions(&self) -> Result<Vec<Transaction>>;

    fn history(&self, wallet: &str) -> Result<Vec<Transaction>> {
        Ok(self
            .transactions()?
            .into_iter()
            .filter(|t| t.sender == wallet || t.receiver == wallet)
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub seq: u64,
    pub tx: Transaction,
}

/// Transient queue of submitted, not yet mined transactions.
pub trait PendingPool {
    fn enqueue_pending(&self, tx: &Transaction) -> Result<u64>;
    /// Snapshot in arrival order.
    fn pending(&self) -> Result<Vec<PendingEntry>>;
}

pub trait BlockRepository {
    fn latest_block(&self) -> Result<Option<Block>>;
    fn block_by_index(&self, index: u64) -> Result<Option<Block>>;
    fn block_by_hash(&self, hash: &str) -> Result<Option<Block>>;
    /// All blocks ordered by index.
    fn blocks(&self) -> Result<Vec<Block>>;

    fn get_block(&self, r: &BlockRef) -> Result<Option<Block>> {
        match r {
            BlockRef::Index(i) => self.block_by_index(*i),
            BlockRef::Hash(h) => self.block_by_hash(h),
        }
    }
}

pub trait WalletRepository {
    /// Returns `false` without writing when the wallet id is already taken.
    fn insert_wallet(&self, wallet: &Wallet) -> Result<bool>;
    fn get_wallet(&self, id: &str) -> Result<Option<Wallet>>;
    fn wallets(&self) -> Result<Vec<Wallet>>;
}

/// Persisted system log.
pub trait EventLog {
    fn append_event(&self, event: &SystemEvent) -> Result<()>;
    /// Up to `limit` events, newest first.
    fn events(&self, limit: usize) -> Result<Vec<SystemEvent>>;
}

/// Everything one transaction does to the ledger when it is confirmed (or
/// retired), applied as a single unit.
#[derive(Debug, Clone)]
pub struct TransferCommit {
    /// Outputs to move from unspent to spent.
    pub spend: Vec<String>,
    /// Outputs to create.
    pub create: Vec<Utxo>,
    /// Record appended to the transaction log.
    pub record: Transaction,
    /// Pending-pool entry to remove alongside.
    pub pending_seq: Option<u64>,
    /// Logged instead of `record` (and `pending_seq` still removed) when an
    /// input is gone at commit time. `None` leaves the pending entry alone.
    pub fallback: Option<Transaction>,
}

impl TransferCommit {
    /// A commit that only moves value out of nowhere (rewards, faucet).
    pub fn credit(record: Transaction, create: Vec<Utxo>) -> Self {
        TransferCommit { spend: Vec::new(), create, record, pending_seq: None, fallback: None }
    }

    /// Logs `record` and drops `pending_seq` without touching any output.
    pub fn retire(record: Transaction, pending_seq: u64) -> Self {
        TransferCommit { spend: Vec::new(), create: Vec::new(), record, pending_seq: Some(pending_seq), fallback: None }
    }
}

pub trait LedgerStore:
    UtxoRepository + TransactionLog + PendingPool + BlockRepository + WalletRepository + EventLog + Send + Sync
{
    /// Applies `commit` atomically. If any output in `commit.spend` is missing
    /// or already spent, only `commit.fallback` (if any) is applied and
    /// `Ok(false)` is returned.
    fn commit_transfer(&self, commit: &TransferCommit) -> Result<bool>;

    /// Appends `block` and applies `commits` in order, all in one atomic
    /// write. Each commit sees the effects of the ones before it and is
    /// skipped (as in `commit_transfer`) when its inputs are gone. Fails
    /// without writing anything if the block index is already taken.
    /// Returns, per commit, whether it was applied.
    fn commit_block(&self, block: &Block, commits: &[TransferCommit]) -> Result<Vec<bool>>;
}

// -----------------------------------------------------------------------------
// RocksDB-backed store
// -----------------------------------------------------------------------------

const CF_NAMES: [&str; 10] = [
    "default",
    "utxo",       // utxo id -> UtxoRecord
    "owner_utxo", // owner 0x00 seq -> utxo id, unspent only, in insertion order
    "tx",         // seq -> Transaction (confirmed / rejected log)
    "pending",    // seq -> Transaction
    "block",      // index -> zstd(Block)
    "block_hash", // hash -> index
    "wallet",     // wallet id -> Wallet
    "system_log", // seq -> SystemEvent
    "meta",
];

const SEQ_KEY: &[u8] = b"seq";
const BLOCK_ZSTD_LEVEL: i32 = 3;

/// Stored form of a UTXO; remembers its owner-index key so spending can
/// drop it.
#[derive(Serialize, Deserialize)]
struct UtxoRecord {
    utxo: Utxo,
    owner_seq: u64,
}

pub struct Store {
    pub db: DB,
    // Serializes every read-check-write sequence; RocksDB has no native CAS.
    write_lock: Mutex<()>,
    seq: AtomicU64,
}

fn owner_prefix(owner: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(owner.len() + 1);
    key.extend_from_slice(owner.as_bytes());
    key.push(0);
    key
}

fn owner_key(owner: &str, seq: u64) -> Vec<u8> {
    let mut key = owner_prefix(owner);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn decode_seq(key: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = key.try_into().map_err(|_| anyhow!("malformed sequence key ({} bytes)", key.len()))?;
    Ok(u64::from_be_bytes(arr))
}

impl Store {
    /// Perform database health check
    pub fn health_check(&self) -> Result<()> {
        let test_key = b"health_check";
        self.db.put(test_key, b"ok").with_context(|| "Database write test failed")?;
        let value = self.db.get(test_key).with_context(|| "Database read test failed")?;
        if value.as_deref() != Some(b"ok") {
            bail!("Database read/write consistency check failed");
        }
        self.db.delete(test_key).with_context(|| "Database delete test failed")?;
        Ok(())
    }

    pub fn open(base_path: &str) -> Result<Self> {
        let db_path = base_path.to_string();

        let mut cf_opts = Options::default();
        cf_opts.set_write_buffer_size(16 * 1024 * 1024);
        cf_opts.set_max_write_buffer_number(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = CF_NAMES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_opts.clone()))
            .collect();

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let wal_dir = format!("{db_path}/logs");
        std::fs::create_dir_all(&db_path).ok();
        std::fs::create_dir_all(&wal_dir).ok();
        db_opts.set_wal_dir(&wal_dir);
        db_opts.set_bytes_per_sync(8 * 1024 * 1024);
        db_opts.set_wal_recovery_mode(rocksdb::DBRecoveryMode::TolerateCorruptedTailRecords);
        db_opts.set_keep_log_file_num(10);
        db_opts.set_max_open_files(512);

        let db = DB::open_cf_descriptors(&db_opts, &db_path, cf_descriptors)
            .with_context(|| format!("Failed to open database at '{db_path}'"))?;

        let meta = db.cf_handle("meta").ok_or_else(|| anyhow!("'meta' column family missing"))?;
        let seq = match db.get_cf(meta, SEQ_KEY)? {
            Some(v) => decode_seq(&v)?,
            None => 0,
        };

        let store = Store { db, write_lock: Mutex::new(()), seq: AtomicU64::new(seq) };
        store.health_check().with_context(|| "Database health check failed during initialization")?;
        info!(path = %db_path, next_seq = seq, "ledger database opened");
        Ok(store)
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| anyhow!("Column family '{}' not found", name))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| anyhow!("store write lock poisoned"))
    }

    pub fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let data = bincode::serialize(value)
            .with_context(|| format!("Failed to serialize value for key '{key:?}' in CF '{cf}'"))?;
        self.db
            .put_cf_opt(self.cf(cf)?, key, &data, &WriteOptions::default())
            .with_context(|| format!("Failed to PUT to database for key '{key:?}' in CF '{cf}'"))
    }

    pub fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(value) => bincode::deserialize(&value)
                .map(Some)
                .with_context(|| format!("Failed to deserialize value for key '{key:?}' in CF '{cf}'")),
            None => Ok(None),
        }
    }

    fn batch_put<T: Serialize>(&self, batch: &mut WriteBatch, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let data = bincode::serialize(value)
            .with_context(|| format!("Failed to serialize value for key '{key:?}' in CF '{cf}'"))?;
        batch.put_cf(self.cf(cf)?, key, data);
        Ok(())
    }

    /// Reserves the next global sequence number and records the new high-water
    /// mark in `batch`. Caller must hold the write lock.
    fn next_seq(&self, batch: &mut WriteBatch) -> Result<u64> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        batch.put_cf(self.cf("meta")?, SEQ_KEY, (seq + 1).to_be_bytes());
        Ok(seq)
    }

    fn batch_insert_utxo(&self, batch: &mut WriteBatch, utxo: &Utxo) -> Result<UtxoRecord> {
        let seq = self.next_seq(batch)?;
        let record = UtxoRecord { utxo: utxo.clone(), owner_seq: seq };
        self.batch_put(batch, "utxo", utxo.id.as_bytes(), &record)?;
        batch.put_cf(self.cf("owner_utxo")?, owner_key(&utxo.owner, seq), utxo.id.as_bytes());
        Ok(record)
    }

    /// Marks `record` spent and drops it from the owner index.
    fn batch_spend(&self, batch: &mut WriteBatch, record: &mut UtxoRecord, spent_in: &str) -> Result<()> {
        record.utxo.spent = true;
        record.utxo.spent_in = Some(spent_in.to_string());
        self.batch_put(batch, "utxo", record.utxo.id.as_bytes(), &*record)?;
        batch.delete_cf(self.cf("owner_utxo")?, owner_key(&record.utxo.owner, record.owner_seq));
        Ok(())
    }

    /// Stages one transfer into `batch`. `staged` holds outputs already
    /// touched earlier in the same batch. Caller must hold the write lock.
    fn stage_commit(
        &self,
        batch: &mut WriteBatch,
        staged: &mut HashMap<String, UtxoRecord>,
        commit: &TransferCommit,
    ) -> Result<bool> {
        let mut inputs = Vec::with_capacity(commit.spend.len());
        for id in &commit.spend {
            let current = match staged.remove(id) {
                Some(r) => Some(r),
                None => self.get::<UtxoRecord>("utxo", id.as_bytes())?,
            };
            match current {
                Some(r) if !r.utxo.spent => inputs.push(r),
                other => {
                    if let Some(r) = other {
                        staged.insert(id.clone(), r);
                    }
                    for r in inputs {
                        staged.insert(r.utxo.id.clone(), r);
                    }
                    if let Some(fallback) = &commit.fallback {
                        self.stage_log(batch, fallback, commit.pending_seq)?;
                    }
                    return Ok(false);
                }
            }
        }
        for u in &commit.create {
            if staged.contains_key(&u.id) || self.db.get_cf(self.cf("utxo")?, u.id.as_bytes())?.is_some() {
                bail!("utxo {} already exists", u.id);
            }
        }

        for mut r in inputs {
            self.batch_spend(batch, &mut r, &commit.record.id)?;
            staged.insert(r.utxo.id.clone(), r);
        }
        for u in &commit.create {
            let r = self.batch_insert_utxo(batch, u)?;
            staged.insert(u.id.clone(), r);
        }
        self.stage_log(batch, &commit.record, commit.pending_seq)?;
        Ok(true)
    }

    fn stage_log(&self, batch: &mut WriteBatch, record: &Transaction, pending_seq: Option<u64>) -> Result<()> {
        let log_seq = self.next_seq(batch)?;
        self.batch_put(batch, "tx", &log_seq.to_be_bytes(), record)?;
        if let Some(seq) = pending_seq {
            batch.delete_cf(self.cf("pending")?, seq.to_be_bytes());
        }
        Ok(())
    }

    /// Atomically applies a set of writes.
    pub fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts).with_context(|| "Failed to write batch to database")
    }

    /// Decodes every value of a seq-keyed column family in key order.
    fn scan_seq<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<(u64, T)>> {
        let handle = self.cf(cf)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (k, v) = item?;
            let value = bincode::deserialize(&v)
                .with_context(|| format!("Corrupt record in CF '{cf}'"))?;
            out.push((decode_seq(&k)?, value));
        }
        Ok(out)
    }

    fn decode_block(bytes: &[u8]) -> Result<Block> {
        let raw = zstd::decode_all(bytes).context("Failed to decompress block")?;
        bincode::deserialize(&raw).context("Failed to deserialize block")
    }

    /// Force flush all memtables to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush().with_context(|| "Failed to flush database")?;
        self.db.flush_wal(true).with_context(|| "Failed to flush WAL")?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.db.cancel_all_background_work(true);
        Ok(())
    }

    fn count(&self, cf: &str) -> Result<u64> {
        Ok(self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start).count() as u64)
    }

    /// Gets statistics about the database
    pub fn get_stats(&self) -> Result<DatabaseStats> {
        Ok(DatabaseStats {
            utxo_count: self.count("utxo")?,
            owner_index_count: self.count("owner_utxo")?,
            transaction_count: self.count("tx")?,
            pending_count: self.count("pending")?,
            block_count: self.count("block")?,
            wallet_count: self.count("wallet")?,
            event_count: self.count("system_log")?,
        })
    }
}

impl UtxoRepository for Store {
    fn insert_utxo(&self, utxo: &Utxo) -> Result<()> {
        let _guard = self.lock()?;
        if self.db.get_cf(self.cf("utxo")?, utxo.id.as_bytes())?.is_some() {
            bail!("utxo {} already exists", utxo.id);
        }
        let mut batch = WriteBatch::default();
        self.batch_insert_utxo(&mut batch, utxo)?;
        self.write_batch(batch)
    }

    fn get_utxo(&self, id: &str) -> Result<Option<Utxo>> {
        Ok(self.get::<UtxoRecord>("utxo", id.as_bytes())?.map(|r| r.utxo))
    }

    fn unspent_by_owner(&self, owner: &str) -> Result<Vec<Utxo>> {
        let cf = self.cf("owner_utxo")?;
        let prefix = owner_prefix(owner);
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(prefix.as_slice(), Direction::Forward)) {
            let (k, v) = item?;
            if !k.starts_with(prefix.as_slice()) {
                break;
            }
            let id = String::from_utf8(v.to_vec()).context("non-utf8 utxo id in owner index")?;
            let record: UtxoRecord = self
                .get("utxo", id.as_bytes())?
                .ok_or_else(|| anyhow!("owner index points at missing utxo {}", id))?;
            if !record.utxo.spent {
                out.push(record.utxo);
            }
        }
        Ok(out)
    }

    fn mark_spent(&self, id: &str, spent_in: &str) -> Result<bool> {
        let _guard = self.lock()?;
        let Some(mut record) = self.get::<UtxoRecord>("utxo", id.as_bytes())? else { return Ok(false) };
        if record.utxo.spent {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        self.batch_spend(&mut batch, &mut record, spent_in)?;
        self.write_batch(batch)?;
        Ok(true)
    }
}

impl TransactionLog for Store {
    fn transactions(&self) -> Result<Vec<Transaction>> {
        Ok(self.scan_seq::<Transaction>("tx")?.into_iter().map(|(_, t)| t).collect())
    }
}

impl PendingPool for Store {
    fn enqueue_pending(&self, tx: &Transaction) -> Result<u64> {
        let _guard = self.lock()?;
        let mut batch = WriteBatch::default();
        let seq = self.next_seq(&mut batch)?;
        self.batch_put(&mut batch, "pending", &seq.to_be_bytes(), tx)?;
        self.write_batch(batch)?;
        Ok(seq)
    }

    fn pending(&self) -> Result<Vec<PendingEntry>> {
        Ok(self
            .scan_seq::<Transaction>("pending")?
            .into_iter()
            .map(|(seq, tx)| PendingEntry { seq, tx })
            .collect())
    }
}

impl BlockRepository for Store {
    fn latest_block(&self) -> Result<Option<Block>> {
        match self.db.iterator_cf(self.cf("block")?, IteratorMode::End).next() {
            Some(item) => {
                let (_, v) = item?;
                Ok(Some(Self::decode_block(&v)?))
            }
            None => Ok(None),
        }
    }

    fn block_by_index(&self, index: u64) -> Result<Option<Block>> {
        match self.db.get_cf(self.cf("block")?, index.to_be_bytes())? {
            Some(v) => Ok(Some(Self::decode_block(&v)?)),
            None => Ok(None),
        }
    }

    fn block_by_hash(&self, hash: &str) -> Result<Option<Block>> {
        match self.db.get_cf(self.cf("block_hash")?, hash.as_bytes())? {
            Some(k) => self.block_by_index(decode_seq(&k)?),
            None => Ok(None),
        }
    }

    fn blocks(&self) -> Result<Vec<Block>> {
        let mut out = Vec::new();
        for item in self.db.iterator_cf(self.cf("block")?, IteratorMode::Start) {
            let (_, v) = item?;
            out.push(Self::decode_block(&v)?);
        }
        Ok(out)
    }
}

impl WalletRepository for Store {
    fn insert_wallet(&self, wallet: &Wallet) -> Result<bool> {
        let _guard = self.lock()?;
        if self.get::<Wallet>("wallet", wallet.id.as_bytes())?.is_some() {
            return Ok(false);
        }
        self.put("wallet", wallet.id.as_bytes(), wallet)?;
        Ok(true)
    }

    fn get_wallet(&self, id: &str) -> Result<Option<Wallet>> {
        self.get("wallet", id.as_bytes())
    }

    fn wallets(&self) -> Result<Vec<Wallet>> {
        let mut out = Vec::new();
        for item in self.db.iterator_cf(self.cf("wallet")?, IteratorMode::Start) {
            let (_, v) = item?;
            out.push(bincode::deserialize(&v).context("Corrupt wallet record")?);
        }
        Ok(out)
    }
}

impl EventLog for Store {
    fn append_event(&self, event: &SystemEvent) -> Result<()> {
        let _guard = self.lock()?;
        let mut batch = WriteBatch::default();
        let seq = self.next_seq(&mut batch)?;
        self.batch_put(&mut batch, "system_log", &seq.to_be_bytes(), event)?;
        self.write_batch(batch)
    }

    fn events(&self, limit: usize) -> Result<Vec<SystemEvent>> {
        let mut out = Vec::new();
        for item in self.db.iterator_cf(self.cf("system_log")?, IteratorMode::End).take(limit) {
            let (_, v) = item?;
            out.push(bincode::deserialize(&v).context("Corrupt system log record")?);
        }
        Ok(out)
    }
}

impl LedgerStore for Store {
    fn commit_transfer(&self, commit: &TransferCommit) -> Result<bool> {
        let _guard = self.lock()?;
        let mut batch = WriteBatch::default();
        let applied = self.stage_commit(&mut batch, &mut HashMap::new(), commit)?;
        if applied || commit.fallback.is_some() {
            self.write_batch(batch)?;
        }
        Ok(applied)
    }

    fn commit_block(&self, block: &Block, commits: &[TransferCommit]) -> Result<Vec<bool>> {
        let _guard = self.lock()?;
        let key = block.index.to_be_bytes();
        if self.db.get_cf(self.cf("block")?, key)?.is_some() {
            bail!("block #{} already exists", block.index);
        }
        let raw = bincode::serialize(block).context("Failed to serialize block")?;
        let compressed = zstd::encode_all(&raw[..], BLOCK_ZSTD_LEVEL).context("Failed to compress block")?;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf("block")?, key, compressed);
        batch.put_cf(self.cf("block_hash")?, block.hash.as_bytes(), key);

        let mut staged = HashMap::new();
        let mut applied = Vec::with_capacity(commits.len());
        for commit in commits {
            applied.push(self.stage_commit(&mut batch, &mut staged, commit)?);
        }
        self.write_batch(batch)?;
        Ok(applied)
    }
}

/// Database statistics
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub utxo_count: u64,
    /// Unspent outputs reachable through the owner index.
    pub owner_index_count: u64,
    pub transaction_count: u64,
    pub pending_count: u64,
    pub block_count: u64,
    pub wallet_count: u64,
    pub event_count: u64,
}

pub fn open(cfg: &crate::config::Storage) -> Result<Arc<Store>> {
    Store::open(&cfg.path).map(Arc::new).with_context(|| {
        format!(
            "Database failed to open at '{}' (is another instance running? a stale LOCK file after a crash can be removed)",
            cfg.path
        )
    })
}
