use crate::crypto::{self, WalletId};
use crate::error::{LedgerError, Result};
use crate::storage::{LedgerStore, PendingPool, UtxoRepository, WalletRepository};
use crate::utxo::{Amount, Selection};
use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Sender recorded on mining rewards.
pub const COINBASE_SENDER: &str = "SYSTEM_COINBASE";
/// Sender recorded on faucet credits.
pub const FAUCET_SENDER: &str = "SYSTEM_FAUCET";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Normal,
    MiningReward,
    ZakatDeduction,
    Faucet,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Rejected,
}

/// Reference to a consumed output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxInput {
    pub utxo_id: String,
    pub index: u32,
    pub amount: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutput {
    pub owner: WalletId,
    pub amount: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub id: String,
    pub sender: WalletId,
    pub receiver: WalletId,
    pub amount: Amount,
    pub note: String,
    pub timestamp: DateTime<Utc>,
    pub sender_public_key: String,
    pub signature: String,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub tx_type: TxType,
    pub status: TxStatus,
    pub block_id: Option<String>,
}

/// A client's request to move `amount` to `receiver`.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub receiver: WalletId,
    pub amount: Amount,
    pub note: String,
}

fn new_tx_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Receiver output first, change (if any) second.
pub fn plan_outputs(sender: &str, receiver: &str, amount: Amount, change: Amount) -> Vec<TxOutput> {
    let mut outputs = vec![TxOutput { owner: receiver.to_string(), amount }];
    if change > 0 {
        outputs.push(TxOutput { owner: sender.to_string(), amount: change });
    }
    outputs
}

pub fn inputs_from(selection: &Selection) -> Vec<TxInput> {
    selection
        .selected
        .iter()
        .map(|u| TxInput { utxo_id: u.id.clone(), index: u.index, amount: u.amount })
        .collect()
}

impl Transaction {
    /// Canonical payload covered by the sender's signature:
    /// sender ‖ receiver ‖ amount ‖ timestamp (RFC 3339, seconds) ‖ note.
    pub fn signing_payload(&self) -> Vec<u8> {
        format!(
            "{}{}{}{}{}",
            self.sender,
            self.receiver,
            self.amount,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.note
        )
        .into_bytes()
    }

    /// Checks the embedded signature against the embedded public key.
    pub fn verify_signature(&self) -> bool {
        match crypto::verifying_key_from_hex(&self.sender_public_key) {
            Ok(pk) => crypto::verify(&pk, &self.signing_payload(), &self.signature),
            Err(_) => false,
        }
    }

    pub fn input_total(&self) -> Amount {
        self.inputs.iter().map(|i| i.amount).sum()
    }

    pub fn output_total(&self) -> Amount {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    /// System-issued reward with no inputs; confirmed from birth.
    pub fn coinbase(miner: &str, reward: Amount, timestamp: DateTime<Utc>) -> Self {
        Transaction {
            id: new_tx_id(),
            sender: COINBASE_SENDER.to_string(),
            receiver: miner.to_string(),
            amount: reward,
            note: "Mining reward".to_string(),
            timestamp,
            sender_public_key: String::new(),
            signature: String::new(),
            inputs: Vec::new(),
            outputs: vec![TxOutput { owner: miner.to_string(), amount: reward }],
            tx_type: TxType::MiningReward,
            status: TxStatus::Confirmed,
            block_id: None,
        }
    }

    pub fn faucet(wallet: &str, amount: Amount) -> Self {
        Transaction {
            id: format!("faucet-{}", new_tx_id()),
            sender: FAUCET_SENDER.to_string(),
            receiver: wallet.to_string(),
            amount,
            note: "Admin faucet funding".to_string(),
            timestamp: Utc::now(),
            sender_public_key: String::new(),
            signature: String::new(),
            inputs: Vec::new(),
            outputs: vec![TxOutput { owner: wallet.to_string(), amount }],
            tx_type: TxType::Faucet,
            status: TxStatus::Confirmed,
            block_id: None,
        }
    }

    /// Unsigned system deduction queued on behalf of `wallet`.
    pub fn zakat(wallet: &str, pool: &str, amount: Amount, selection: &Selection) -> Self {
        Transaction {
            id: new_tx_id(),
            sender: wallet.to_string(),
            receiver: pool.to_string(),
            amount,
            note: "Zakat deduction".to_string(),
            timestamp: Utc::now(),
            sender_public_key: String::new(),
            signature: String::new(),
            inputs: inputs_from(selection),
            outputs: plan_outputs(wallet, pool, amount, selection.change),
            tx_type: TxType::ZakatDeduction,
            status: TxStatus::Pending,
            block_id: None,
        }
    }
}

/// Builds, signs and self-verifies a transfer from `sender`, then queues it
/// as pending. UTXO state is not touched; balances move only at mining time.
pub fn submit_transfer(
    store: &dyn LedgerStore,
    sender: &str,
    signing_key: &SigningKey,
    req: TransferRequest,
) -> Result<Transaction> {
    if req.amount == 0 {
        return Err(LedgerError::validation("amount must be greater than zero"));
    }
    if req.receiver.is_empty() {
        return Err(LedgerError::validation("receiver wallet is required"));
    }
    let sender_wallet = store
        .get_wallet(sender)?
        .ok_or_else(|| LedgerError::validation(format!("unknown sender wallet {sender}")))?;
    if store.get_wallet(&req.receiver)?.is_none() {
        return Err(LedgerError::validation(format!("invalid receiver wallet {}", req.receiver)));
    }

    let selection = store.select_for_amount(sender, req.amount)?;

    let mut tx = Transaction {
        id: new_tx_id(),
        sender: sender.to_string(),
        receiver: req.receiver.clone(),
        amount: req.amount,
        note: req.note,
        timestamp: Utc::now(),
        sender_public_key: sender_wallet.public_key.clone(),
        signature: String::new(),
        inputs: inputs_from(&selection),
        outputs: plan_outputs(sender, &req.receiver, req.amount, selection.change),
        tx_type: TxType::Normal,
        status: TxStatus::Pending,
        block_id: None,
    };

    let payload = tx.signing_payload();
    tx.signature = crypto::sign(signing_key, &payload);

    // The key of record comes from the registry, not from the signer.
    let stored_pk = sender_wallet.verifying_key()?;
    if !crypto::verify(&stored_pk, &payload, &tx.signature) {
        return Err(LedgerError::SignatureInvalid(sender.to_string()));
    }

    store.enqueue_pending(&tx)?;
    debug!(tx = %tx.id, sender, receiver = %tx.receiver, amount = tx.amount, "transfer queued");
    Ok(tx)
}
