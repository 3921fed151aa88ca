use crate::utxo::{Amount, COIN};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::{fs, path::Path};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: Storage,
    #[serde(default)]
    pub mining: Mining,
    #[serde(default)]
    pub zakat: Zakat,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    pub path: String,
}

/// What happens to a pending transaction the sender can no longer fund when
/// its block is mined.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnderfundedPolicy {
    /// Log it as `rejected` and remove it from the pool.
    #[default]
    Reject,
    /// Leave it in the pool for the next block.
    Requeue,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Mining {
    /// Required leading hex '0' characters in a block hash.
    #[serde(default = "default_difficulty")]
    pub difficulty: usize,
    /// Coinbase reward in minor units.
    #[serde(default = "default_reward")]
    pub reward: Amount,
    /// Upper bound on nonce attempts per block; unbounded when absent.
    #[serde(default)]
    pub max_attempts: Option<u64>,
    #[serde(default = "default_mining_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_true")]
    pub offload_blocking: bool,
    #[serde(default)]
    pub underfunded: UnderfundedPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Zakat {
    #[serde(default)]
    pub enabled: bool,
    /// Deduction rate in basis points (250 = 2.5 %).
    #[serde(default = "default_zakat_bps")]
    pub rate_bps: u64,
    #[serde(default = "default_zakat_pool")]
    pub pool_wallet: String,
    #[serde(default = "default_zakat_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_difficulty() -> usize { 4 }
fn default_reward() -> Amount { 50 * COIN }
fn default_mining_interval() -> u64 { 60 }
fn default_true() -> bool { true }
fn default_zakat_bps() -> u64 { 250 }
fn default_zakat_pool() -> String { "ZAKAT_POOL".into() }
fn default_zakat_interval() -> u64 { 30 * 24 * 60 * 60 } // monthly
fn default_bind() -> String { "127.0.0.1:9100".into() }

impl Default for Mining {
    fn default() -> Self {
        Mining {
            difficulty: default_difficulty(),
            reward: default_reward(),
            max_attempts: None,
            interval_secs: default_mining_interval(),
            offload_blocking: true,
            underfunded: UnderfundedPolicy::Reject,
        }
    }
}

impl Default for Zakat {
    fn default() -> Self {
        Zakat {
            enabled: false,
            rate_bps: default_zakat_bps(),
            pool_wallet: default_zakat_pool(),
            interval_secs: default_zakat_interval(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics { bind: default_bind() }
    }
}

/// Read the TOML file at `p` and deserialize into `Config`.
/// *Adds context* so user errors print a friendlier message.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read or parsed.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("🗂️  couldn’t read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(text).with_context(|| "📝  invalid TOML in config file".to_string())?;
    if cfg.zakat.rate_bps > crate::zakat::MAX_RATE_BPS {
        bail!("⚖️  zakat.rate_bps = {} is above {} (the whole balance)", cfg.zakat.rate_bps, crate::zakat::MAX_RATE_BPS);
    }
    Ok(cfg)
}
