// End-to-end ledger behaviour on the in-memory store.

use ed25519_dalek::SigningKey;
use std::sync::Arc;
use std::thread;
use utxo_ledger::{
    chain,
    config::{Mining, UnderfundedPolicy, Zakat},
    crypto,
    storage::UtxoRepository,
    zakat::{self, ZakatOutcome},
    BlockRef, DropReason, Dropped, EventKind, Ledger, LedgerError, MemoryStore, MerkleTree, TransferRequest, TxStatus, TxType,
    DEFAULT_LOG_LIMIT,
};

const REWARD: u64 = 50;

fn mining(policy: UnderfundedPolicy) -> Mining {
    Mining { difficulty: 1, reward: REWARD, underfunded: policy, ..Mining::default() }
}

fn ledger_with(policy: UnderfundedPolicy) -> Ledger {
    Ledger::new(Arc::new(MemoryStore::new()), mining(policy), Zakat::default())
}

fn ledger() -> Ledger {
    ledger_with(UnderfundedPolicy::Reject)
}

fn user(l: &Ledger, name: &str) -> (SigningKey, String) {
    let sk = crypto::generate_keypair();
    let w = l.register_wallet(name, &sk.verifying_key()).expect("register wallet");
    (sk, w.id)
}

fn send(l: &Ledger, from: &(SigningKey, String), to: &str, amount: u64) -> utxo_ledger::Result<utxo_ledger::Transaction> {
    l.submit_transfer(&from.1, &from.0, TransferRequest { receiver: to.to_string(), amount, note: "test".into() })
}

#[test]
fn transfer_with_change() {
    let l = ledger();
    let alice = user(&l, "alice");
    let (_, bob) = user(&l, "bob");
    let funding = l.fund(&alice.1, 100).unwrap();

    let tx = send(&l, &alice, &bob, 40).unwrap();
    assert_eq!(tx.status, TxStatus::Pending);
    // Nothing moves until mining.
    assert_eq!(l.balance(&alice.1).unwrap(), 100);
    assert_eq!(l.balance(&bob).unwrap(), 0);

    let mined = l.mine_pending("miner").unwrap();
    assert_eq!(mined.confirmed, vec![tx.id.clone()]);
    assert!(mined.dropped.is_empty());

    assert_eq!(l.balance(&bob).unwrap(), 40);
    assert_eq!(l.balance(&alice.1).unwrap(), 60);
    assert_eq!(l.balance("miner").unwrap(), REWARD);

    let original = l.store().get_utxo(&format!("{}:0", funding.id)).unwrap().unwrap();
    assert!(original.spent);
    assert_eq!(original.spent_in.as_deref(), Some(tx.id.as_str()));

    let logged = l.history(&bob, DEFAULT_LOG_LIMIT).unwrap().into_iter().find(|t| t.id == tx.id).unwrap();
    assert_eq!(logged.status, TxStatus::Confirmed);
    assert_eq!(logged.block_id.as_deref(), Some(mined.block.hash.as_str()));
    assert_eq!(logged.input_total(), logged.output_total());
    assert_eq!(logged.outputs.len(), 2, "change output present when inputs exceed amount");
    assert!(l.pending().unwrap().is_empty());
}

#[test]
fn exact_spend_has_no_change_output() {
    let l = ledger();
    let alice = user(&l, "alice");
    let (_, bob) = user(&l, "bob");
    l.fund(&alice.1, 30).unwrap();
    l.fund(&alice.1, 20).unwrap();

    let tx = send(&l, &alice, &bob, 50).unwrap();
    l.mine_pending("miner").unwrap();

    let logged = l.history(&bob, DEFAULT_LOG_LIMIT).unwrap().into_iter().find(|t| t.id == tx.id).unwrap();
    assert_eq!(logged.inputs.len(), 2);
    assert_eq!(logged.outputs.len(), 1);
    assert_eq!(logged.input_total(), 50);
    assert_eq!(l.balance(&alice.1).unwrap(), 0);
}

#[test]
fn second_overlapping_send_is_dropped_at_mining() {
    let l = ledger();
    let alice = user(&l, "alice");
    let (_, bob) = user(&l, "bob");
    l.fund(&alice.1, 100).unwrap();

    // Pending transfers do not reserve funds, so both pass submission.
    let first = send(&l, &alice, &bob, 60).unwrap();
    let second = send(&l, &alice, &bob, 60).unwrap();

    let mined = l.mine_pending("miner").unwrap();
    assert_eq!(mined.confirmed, vec![first.id.clone()]);
    assert_eq!(
        mined.dropped,
        vec![Dropped { tx_id: second.id.clone(), reason: DropReason::Underfunded { available: 40 } }]
    );
    assert_eq!(l.balance(&alice.1).unwrap(), 40);
    assert_eq!(l.balance(&bob).unwrap(), 60);

    let rejected = l.history(&alice.1, DEFAULT_LOG_LIMIT).unwrap().into_iter().find(|t| t.id == second.id).unwrap();
    assert_eq!(rejected.status, TxStatus::Rejected);
    assert!(rejected.block_id.is_none());
    assert!(l.pending().unwrap().is_empty());
    assert_eq!(l.report(&alice.1).unwrap().sent_count, 1);
}

#[test]
fn requeued_transfer_confirms_once_funded() {
    let l = ledger_with(UnderfundedPolicy::Requeue);
    let alice = user(&l, "alice");
    let (_, bob) = user(&l, "bob");
    l.fund(&alice.1, 100).unwrap();
    send(&l, &alice, &bob, 60).unwrap();
    let late = send(&l, &alice, &bob, 60).unwrap();

    let mined = l.mine_pending("miner").unwrap();
    assert_eq!(mined.dropped.len(), 1);
    assert_eq!(mined.dropped[0].tx_id, late.id);
    assert_eq!(l.pending().unwrap().len(), 1);

    l.fund(&alice.1, 20).unwrap();
    let mined = l.mine_pending("miner").unwrap();
    assert_eq!(mined.confirmed, vec![late.id]);
    assert_eq!(l.balance(&bob).unwrap(), 120);
    assert_eq!(l.balance(&alice.1).unwrap(), 0);
}

#[test]
fn empty_pool_mines_coinbase_only() {
    let l = ledger();
    let mined = l.mine_pending("miner").unwrap();
    let block = &mined.block;
    assert_eq!(block.index, 0);
    assert_eq!(block.previous_hash, "");
    assert_eq!(block.transactions.len(), 1);
    assert_eq!(block.transactions[0].tx_type, TxType::MiningReward);
    assert_eq!(block.merkle_root, MerkleTree::root(&block.transactions));
    assert!(block.hash.starts_with('0'));
    assert_eq!(l.balance("miner").unwrap(), REWARD);
}

#[test]
fn chain_links_and_lookups() {
    let l = ledger();
    for _ in 0..4 {
        l.mine_pending("miner").unwrap();
    }
    let blocks = l.list_blocks().unwrap();
    assert_eq!(blocks.len(), 4);
    for pair in blocks.windows(2) {
        assert_eq!(pair[1].previous_hash, pair[0].hash);
        assert_eq!(pair[1].index, pair[0].index + 1);
    }
    let by_hash = l.get_block(&BlockRef::Hash(blocks[2].hash.clone())).unwrap();
    assert_eq!(by_hash, blocks[2]);
    let by_index = l.get_block(&"3".parse().unwrap()).unwrap();
    assert_eq!(by_index.hash, blocks[3].hash);
    assert_eq!(l.validate_chain().unwrap(), 4);
    assert_eq!(l.balance("miner").unwrap(), 4 * REWARD);
}

#[test]
fn tampered_block_fails_validation() {
    let l = ledger();
    let alice = user(&l, "alice");
    let (_, bob) = user(&l, "bob");
    l.fund(&alice.1, 10).unwrap();
    send(&l, &alice, &bob, 5).unwrap();
    l.mine_pending("miner").unwrap();
    l.mine_pending("miner").unwrap();

    let mut blocks = l.list_blocks().unwrap();
    blocks[0].transactions[1].receiver = "mallory".into();
    assert!(matches!(chain::validate_chain(&blocks), Err(LedgerError::StructuralIntegrity { index: 0, .. })));

    let mut blocks = l.list_blocks().unwrap();
    blocks[1].previous_hash = "ff".repeat(32);
    assert!(matches!(chain::validate_chain(&blocks), Err(LedgerError::StructuralIntegrity { index: 1, .. })));
}

#[test]
fn submission_rejections() {
    let l = ledger();
    let alice = user(&l, "alice");
    let (_, bob) = user(&l, "bob");
    l.fund(&alice.1, 10).unwrap();

    assert!(matches!(send(&l, &alice, &bob, 0), Err(LedgerError::Validation(_))));
    assert!(matches!(send(&l, &alice, "", 1), Err(LedgerError::Validation(_))));
    assert!(matches!(send(&l, &alice, "nobody", 1), Err(LedgerError::Validation(_))));
    assert!(matches!(
        send(&l, &alice, &bob, 11),
        Err(LedgerError::InsufficientFunds { requested: 11, available: 10 })
    ));
    assert!(l.pending().unwrap().is_empty());
}

#[test]
fn key_not_matching_registry_is_rejected() {
    let l = ledger();
    let alice = user(&l, "alice");
    let (_, bob) = user(&l, "bob");
    l.fund(&alice.1, 10).unwrap();

    let impostor = (crypto::generate_keypair(), alice.1.clone());
    assert!(matches!(send(&l, &impostor, &bob, 5), Err(LedgerError::SignatureInvalid(_))));
    assert!(l.pending().unwrap().is_empty());

    let tx = send(&l, &alice, &bob, 5).unwrap();
    assert!(tx.verify_signature());
}

#[test]
fn zakat_deduction_moves_value_to_pool_when_mined() {
    let l = ledger();
    let alice = user(&l, "alice");
    user(&l, "bob");
    l.fund(&alice.1, 1000).unwrap();

    let ZakatOutcome::Queued(tx) = zakat::run_for_wallet(&l, &alice.1).unwrap() else {
        panic!("zakat should be due");
    };
    assert_eq!(tx.amount, 25);
    assert_eq!(tx.tx_type, TxType::ZakatDeduction);
    assert_eq!(l.pending().unwrap().len(), 1);

    l.mine_pending("miner").unwrap();
    assert_eq!(l.balance(&alice.1).unwrap(), 975);
    assert_eq!(l.balance("ZAKAT_POOL").unwrap(), 25);

    let report = l.report(&alice.1).unwrap();
    assert_eq!(report.zakat_deducted, 25);
    assert_eq!(report.zakat_count, 1);
    // Deductions leave the wallet like any other send.
    assert_eq!((report.total_sent, report.sent_count), (25, 1));
    assert_eq!(report.total_received, 1000);
}

#[test]
fn system_log_records_lifecycle_newest_first() {
    let l = ledger();
    let alice = user(&l, "alice");
    l.fund(&alice.1, 1000).unwrap();
    zakat::run_for_wallet(&l, &alice.1).unwrap();
    l.mine_pending("miner").unwrap();

    let kinds: Vec<EventKind> = l.system_logs(DEFAULT_LOG_LIMIT).unwrap().iter().map(|e| e.event).collect();
    assert_eq!(kinds, vec![
        EventKind::MinedBlock,
        EventKind::ZakatCreated,
        EventKind::WalletFunded,
        EventKind::WalletRegistered
    ]);
    let newest = &l.system_logs(1).unwrap()[0];
    assert_eq!(newest.details, format!("Block #0 mined by miner with reward {REWARD}, user_tx=1"));
}

#[test]
fn history_limit_keeps_the_newest() {
    let l = ledger();
    let alice = user(&l, "alice");
    let (_, bob) = user(&l, "bob");
    l.fund(&alice.1, 100).unwrap();
    let tx = send(&l, &alice, &bob, 10).unwrap();
    l.mine_pending("miner").unwrap();

    let all = l.history(&alice.1, DEFAULT_LOG_LIMIT).unwrap();
    assert_eq!(all.len(), 2);
    let newest = l.history(&alice.1, 1).unwrap();
    assert_eq!(newest.len(), 1);
    assert_eq!(newest[0].id, tx.id);
    assert!(l.history(&alice.1, 0).unwrap().is_empty());
}

#[test]
fn zakat_run_all_skips_empty_wallets() {
    let l = ledger();
    let alice = user(&l, "alice");
    let (_, bob) = user(&l, "bob");
    let (_, carol) = user(&l, "carol");
    l.fund(&alice.1, 400).unwrap();
    l.fund(&bob, 30).unwrap();

    assert_eq!(zakat::run_all(&l).unwrap(), 1, "only alice owes anything at 2.5 %");
    assert!(matches!(zakat::run_for_wallet(&l, &carol).unwrap(), ZakatOutcome::NotDue(_)));
    assert!(matches!(zakat::run_for_wallet(&l, "ghost"), Err(LedgerError::Validation(_))));
}

#[test]
fn report_counts_confirmed_traffic() {
    let l = ledger();
    let alice = user(&l, "alice");
    let bob = user(&l, "bob");
    l.fund(&alice.1, 100).unwrap();
    send(&l, &alice, &bob.1, 30).unwrap();
    send(&l, &alice, &bob.1, 20).unwrap();
    l.mine_pending("miner").unwrap();
    send(&l, &bob, &alice.1, 5).unwrap();
    l.mine_pending("miner").unwrap();

    let a = l.report(&alice.1).unwrap();
    assert_eq!((a.total_sent, a.sent_count), (50, 2));
    assert_eq!((a.total_received, a.received_count), (105, 2));
    let b = l.report(&bob.1).unwrap();
    assert_eq!((b.total_sent, b.sent_count), (5, 1));
    assert_eq!((b.total_received, b.received_count), (50, 2));
}

#[test]
fn balance_matches_unspent_sum_after_many_blocks() {
    let l = ledger();
    let users: Vec<_> = (0..4).map(|i| user(&l, &format!("user{i}"))).collect();
    for u in &users {
        l.fund(&u.1, 100).unwrap();
    }
    for round in 0..5u64 {
        for (i, u) in users.iter().enumerate() {
            let to = &users[(i + 1) % users.len()].1;
            let _ = send(&l, u, to, 7 + round * 3 + i as u64);
        }
        l.mine_pending("miner").unwrap();
    }

    let mut total = 0;
    for u in &users {
        let sum: u64 = l.list_utxos(&u.1).unwrap().iter().map(|x| x.amount).sum();
        assert_eq!(l.balance(&u.1).unwrap(), sum);
        total += sum;
    }
    // Transfers move value around without creating or destroying it.
    assert_eq!(total, 400);
    for tx in users.iter().flat_map(|u| l.history(&u.1, DEFAULT_LOG_LIMIT).unwrap()) {
        if tx.status == TxStatus::Confirmed && tx.tx_type == TxType::Normal {
            assert_eq!(tx.input_total(), tx.output_total());
        }
    }
}

#[test]
fn concurrent_mines_are_serialized() {
    let l = Arc::new(ledger());
    let alice = user(&l, "alice");
    let (_, bob) = user(&l, "bob");
    l.fund(&alice.1, 100).unwrap();
    let tx = send(&l, &alice, &bob, 60).unwrap();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let l = l.clone();
            thread::spawn(move || l.mine_pending("miner").unwrap())
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let confirmations: usize = results.iter().map(|m| m.confirmed.len()).sum();
    assert_eq!(confirmations, 1);
    assert!(results.iter().all(|m| m.dropped.is_empty()));
    let mut indexes: Vec<_> = results.iter().map(|m| m.block.index).collect();
    indexes.sort();
    assert_eq!(indexes, vec![0, 1]);
    assert_eq!(l.balance(&bob).unwrap(), 60);
    assert_eq!(l.balance(&alice.1).unwrap(), 40);
    assert_eq!(l.history(&bob, DEFAULT_LOG_LIMIT).unwrap().iter().filter(|t| t.id == tx.id).count(), 1);
}
