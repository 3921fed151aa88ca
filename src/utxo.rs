use crate::crypto::WalletId;
use crate::error::{LedgerError, Result};
use anyhow::{anyhow, bail};
use serde::{Deserialize, Serialize};

/// Fixed-point amount in minor units.
pub type Amount = u64;

/// Minor units per whole coin.
pub const COIN: Amount = 100_000_000;
const COIN_DECIMALS: usize = 8;

/// An unspent (or formerly unspent) transaction output.
///
/// The only mutation a stored UTXO ever sees is `spent: false -> true`,
/// together with `spent_in` being set to the consuming transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Utxo {
    pub id: String,
    pub tx_id: String,
    pub index: u32,
    pub owner: WalletId,
    pub amount: Amount,
    pub spent: bool,
    pub spent_in: Option<String>,
}

impl Utxo {
    pub fn new(owner: &str, tx_id: &str, index: u32, amount: Amount) -> Self {
        Utxo {
            id: Self::key(tx_id, index),
            tx_id: tx_id.to_string(),
            index,
            owner: owner.to_string(),
            amount,
            spent: false,
            spent_in: None,
        }
    }

    /// Unique store key of the output `index` created by `tx_id`.
    pub fn key(tx_id: &str, index: u32) -> String {
        format!("{tx_id}:{index}")
    }
}

/// Result of greedy coin selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub selected: Vec<Utxo>,
    pub total: Amount,
    pub change: Amount,
}

/// Greedy first-match selection: walk `unspent` in the given order and stop
/// as soon as the running sum covers `amount`.
///
/// The order is whatever the store returns (insertion order); no sorting
/// happens here, so the same UTXO set always yields the same selection.
pub fn select_greedy(unspent: Vec<Utxo>, amount: Amount) -> Result<Selection> {
    let mut selected = Vec::new();
    let mut total: Amount = 0;
    for u in unspent {
        if u.spent {
            continue;
        }
        total = total.saturating_add(u.amount);
        selected.push(u);
        if total >= amount {
            return Ok(Selection { selected, total, change: total - amount });
        }
    }
    Err(LedgerError::InsufficientFunds { requested: amount, available: total })
}

/// Renders minor units as a decimal coin amount, e.g. `40.00000000`.
pub fn format_amount(amount: Amount) -> String {
    format!("{}.{:0width$}", amount / COIN, amount % COIN, width = COIN_DECIMALS)
}

/// Parses a decimal coin amount (`"12"`, `"0.5"`, `"1.25000000"`) into minor units.
pub fn parse_amount(text: &str) -> anyhow::Result<Amount> {
    let text = text.trim();
    let (whole, frac) = match text.split_once('.') {
        Some((w, f)) => (w, f),
        None => (text, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        bail!("empty amount");
    }
    if frac.len() > COIN_DECIMALS {
        bail!("amount '{}' has more than {} decimal places", text, COIN_DECIMALS);
    }
    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| anyhow!("invalid amount '{}'", text))? };
    let frac_units: u64 = if frac.is_empty() {
        0
    } else {
        let padded = format!("{:0<width$}", frac, width = COIN_DECIMALS);
        padded.parse().map_err(|_| anyhow!("invalid amount '{}'", text))?
    };
    whole
        .checked_mul(COIN)
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(|| anyhow!("amount '{}' overflows", text))
}
