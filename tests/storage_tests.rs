// RocksDB store: persistence, ordering and the atomic spend path.

use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use utxo_ledger::{
    config::{Mining, Zakat},
    crypto,
    storage::{BlockRepository, EventLog, LedgerStore, PendingPool, TransactionLog, TransferCommit, UtxoRepository},
    BlockRef, EventKind, Ledger, Store, SystemEvent, Transaction, TransferRequest, TxStatus, Utxo, DEFAULT_LOG_LIMIT,
};

fn open(dir: &TempDir) -> Arc<Store> {
    let path = dir.path().join("ledger_db");
    Arc::new(Store::open(path.to_str().unwrap()).expect("Failed to open store"))
}

fn mining() -> Mining {
    Mining { difficulty: 1, reward: 50, ..Mining::default() }
}

#[test]
fn ledger_state_survives_reopen() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let sk = crypto::generate_keypair();
    let (alice, bob, block_hash) = {
        let ledger = Ledger::new(open(&temp_dir), mining(), Zakat::default());
        let alice = ledger.register_wallet("alice", &sk.verifying_key()).unwrap().id;
        let bob = ledger.register_wallet("bob", &crypto::generate_keypair().verifying_key()).unwrap().id;
        ledger.fund(&alice, 100).unwrap();
        ledger
            .submit_transfer(&alice, &sk, TransferRequest { receiver: bob.clone(), amount: 40, note: String::new() })
            .unwrap();
        let mined = ledger.mine_pending("miner").unwrap();
        (alice, bob, mined.block.hash)
    };

    let ledger = Ledger::new(open(&temp_dir), mining(), Zakat::default());
    assert_eq!(ledger.balance(&alice).unwrap(), 60);
    assert_eq!(ledger.balance(&bob).unwrap(), 40);
    assert_eq!(ledger.balance("miner").unwrap(), 50);
    assert_eq!(ledger.list_wallets().unwrap().len(), 2);
    assert_eq!(ledger.validate_chain().unwrap(), 1);
    assert_eq!(ledger.get_block(&BlockRef::Hash(block_hash.clone())).unwrap().index, 0);

    // The next block links onto the persisted tip.
    let next = ledger.mine_pending("miner").unwrap();
    assert_eq!(next.block.index, 1);
    assert_eq!(next.block.previous_hash, block_hash);
}

#[test]
fn unspent_by_owner_keeps_insertion_order_per_owner() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = open(&temp_dir);
    // "a" is a byte prefix of "ab"; their outputs must not mix.
    for (i, owner) in ["a", "ab", "a", "ab", "a"].iter().enumerate() {
        store.insert_utxo(&Utxo::new(owner, &format!("t{}", 9 - i), 0, i as u64 + 1)).unwrap();
    }
    let amounts: Vec<u64> = store.unspent_by_owner("a").unwrap().iter().map(|u| u.amount).collect();
    assert_eq!(amounts, vec![1, 3, 5]);
    assert_eq!(store.balance("ab").unwrap(), 6);

    assert!(store.insert_utxo(&Utxo::new("a", "t9", 0, 1)).is_err(), "duplicate key must be refused");
    let sel = store.select_for_amount("a", 4).unwrap();
    assert_eq!(sel.selected.len(), 2);
    assert_eq!(sel.change, 0);
}

#[test]
fn concurrent_mark_spent_has_one_winner() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = open(&temp_dir);
    store.insert_utxo(&Utxo::new("alice", "t0", 0, 100)).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            thread::spawn(move || store.mark_spent("t0:0", &format!("spender{i}")).unwrap())
        })
        .collect();
    let wins = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
    assert_eq!(wins, 1);
    assert_eq!(store.balance("alice").unwrap(), 0);
}

#[test]
fn commit_with_spent_input_writes_nothing() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = open(&temp_dir);
    store.insert_utxo(&Utxo::new("alice", "t0", 0, 100)).unwrap();
    let record = Transaction::faucet("bob", 100);
    let seq = store.enqueue_pending(&record).unwrap();
    assert!(store.mark_spent("t0:0", "elsewhere").unwrap());

    let commit = TransferCommit {
        spend: vec!["t0:0".into()],
        create: vec![Utxo::new("bob", &record.id, 0, 100)],
        record: record.clone(),
        pending_seq: Some(seq),
        fallback: None,
    };
    assert!(!store.commit_transfer(&commit).unwrap());
    assert!(store.get_utxo(&Utxo::key(&record.id, 0)).unwrap().is_none());
    assert!(store.transactions().unwrap().is_empty());
    assert_eq!(store.pending().unwrap().len(), 1);
    assert_eq!(store.get_utxo("t0:0").unwrap().unwrap().spent_in.as_deref(), Some("elsewhere"));

    // With a fallback the refused entry is retired instead of left pending.
    let mut rejected = record.clone();
    rejected.status = TxStatus::Rejected;
    let commit = TransferCommit { fallback: Some(rejected), ..commit };
    assert!(!store.commit_transfer(&commit).unwrap());
    assert!(store.get_utxo(&Utxo::key(&record.id, 0)).unwrap().is_none());
    assert_eq!(store.transactions().unwrap()[0].status, TxStatus::Rejected);
    assert!(store.pending().unwrap().is_empty());
}

#[test]
fn block_commit_is_all_or_nothing() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = open(&temp_dir);
    let ledger = Ledger::new(store.clone(), mining(), Zakat::default());
    let first = ledger.mine_pending("miner").unwrap();
    store.insert_utxo(&Utxo::new("alice", "t0", 0, 100)).unwrap();

    // Second commit creates an output that already exists, so the whole
    // block must be refused, including the first commit and the block itself.
    let mut next = first.block.clone();
    next.index = 1;
    next.hash = "next".into();
    let credit = Transaction::faucet("bob", 5);
    let commits = vec![
        TransferCommit::credit(credit.clone(), vec![Utxo::new("bob", &credit.id, 0, 5)]),
        TransferCommit::credit(Transaction::faucet("carol", 1), vec![Utxo::new("carol", "t0", 0, 1)]),
    ];
    assert!(store.commit_block(&next, &commits).is_err());
    assert_eq!(store.latest_block().unwrap().unwrap().index, 0);
    assert!(store.block_by_hash("next").unwrap().is_none());
    assert_eq!(store.balance("bob").unwrap(), 0);
    assert_eq!(store.transactions().unwrap().len(), 1, "only the first coinbase is logged");
}

#[test]
fn spending_drops_the_owner_index_entry() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = open(&temp_dir);
    store.insert_utxo(&Utxo::new("alice", "t0", 0, 60)).unwrap();
    store.insert_utxo(&Utxo::new("alice", "t1", 0, 40)).unwrap();
    assert_eq!(store.get_stats().unwrap().owner_index_count, 2);

    assert!(store.mark_spent("t0:0", "x").unwrap());
    let stats = store.get_stats().unwrap();
    assert_eq!(stats.owner_index_count, 1);
    assert_eq!(stats.utxo_count, 2, "spent outputs stay readable by id");

    let record = Transaction::faucet("bob", 40);
    let commit = TransferCommit {
        spend: vec!["t1:0".into()],
        create: vec![Utxo::new("bob", &record.id, 0, 40)],
        record,
        pending_seq: None,
        fallback: None,
    };
    assert!(store.commit_transfer(&commit).unwrap());
    let stats = store.get_stats().unwrap();
    assert_eq!(stats.owner_index_count, 1);
    assert!(store.unspent_by_owner("alice").unwrap().is_empty());
    assert_eq!(store.balance("bob").unwrap(), 40);
}

#[test]
fn system_log_persists_newest_first() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    {
        let ledger = Ledger::new(open(&temp_dir), mining(), Zakat::default());
        let alice = ledger.register_wallet("alice", &crypto::generate_keypair().verifying_key()).unwrap().id;
        ledger.fund(&alice, 10).unwrap();
        ledger.mine_pending("miner").unwrap();
    }
    let store = open(&temp_dir);
    store.append_event(&SystemEvent::new(EventKind::ZakatCreated, "wallet=x amount=1")).unwrap();
    let kinds: Vec<EventKind> = store.events(DEFAULT_LOG_LIMIT).unwrap().into_iter().map(|e| e.event).collect();
    assert_eq!(kinds, vec![
        EventKind::ZakatCreated,
        EventKind::MinedBlock,
        EventKind::WalletFunded,
        EventKind::WalletRegistered
    ]);
    assert_eq!(store.events(2).unwrap().len(), 2);
    assert_eq!(store.get_stats().unwrap().event_count, 4);
}

#[test]
fn pending_order_continues_after_reopen() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let first = Transaction::faucet("a", 1);
    let second = Transaction::faucet("b", 2);
    {
        let store = open(&temp_dir);
        store.enqueue_pending(&first).unwrap();
        store.enqueue_pending(&second).unwrap();
        store.flush().unwrap();
    }
    let store = open(&temp_dir);
    let third = Transaction::faucet("c", 3);
    store.enqueue_pending(&third).unwrap();
    let ids: Vec<String> = store.pending().unwrap().into_iter().map(|p| p.tx.id).collect();
    assert_eq!(ids, vec![first.id, second.id, third.id]);

    let stats = store.get_stats().unwrap();
    assert_eq!(stats.pending_count, 3);
    assert_eq!(stats.block_count, 0);
}

#[test]
fn duplicate_block_index_is_refused() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = open(&temp_dir);
    let ledger = Ledger::new(store.clone(), mining(), Zakat::default());
    let mined = ledger.mine_pending("miner").unwrap();
    assert!(store.commit_block(&mined.block, &[]).is_err());
    assert_eq!(store.block_by_hash(&mined.block.hash).unwrap().unwrap(), mined.block);
    assert_eq!(store.latest_block().unwrap().unwrap().index, 0);
}

#[tokio::test]
async fn mining_off_the_runtime_thread() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let ledger = Arc::new(Ledger::new(open(&temp_dir), mining(), Zakat::default()));

    let l = ledger.clone();
    let mined = tokio::task::spawn_blocking(move || l.mine_pending("miner")).await.unwrap().unwrap();
    assert_eq!(mined.block.index, 0);
    assert_eq!(ledger.balance("miner").unwrap(), 50);
    assert_eq!(ledger.history("miner", DEFAULT_LOG_LIMIT).unwrap().len(), 1);
}
