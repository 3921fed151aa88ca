use crate::crypto::{self, WalletId};
use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

/// A registered wallet.
///
/// Deliberately carries no balance: the balance of record is always the
/// live sum of the wallet's unspent outputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Wallet {
    pub id: WalletId,
    pub user_id: String,
    /// Hex-encoded Ed25519 public key; `id` is derived from it.
    pub public_key: String,
    pub created_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(user_id: &str, pk: &VerifyingKey) -> Self {
        Wallet {
            id: crypto::wallet_id_from_pk(pk),
            user_id: user_id.to_string(),
            public_key: hex::encode(pk.as_bytes()),
            created_at: Utc::now(),
        }
    }

    pub fn verifying_key(&self) -> anyhow::Result<VerifyingKey> {
        crypto::verifying_key_from_hex(&self.public_key)
    }
}

/// Per-wallet totals over the confirmed transaction log.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletReport {
    pub wallet: WalletId,
    pub total_sent: u64,
    pub sent_count: u64,
    pub total_received: u64,
    pub received_count: u64,
    pub zakat_deducted: u64,
    pub zakat_count: u64,
}
