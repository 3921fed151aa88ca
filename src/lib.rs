// Library interface for the UTXO ledger
// The `ledger` binary and the integration tests both go through this crate.

pub mod config;
pub mod crypto;
pub mod error;
pub mod utxo;
pub mod wallet;
pub mod transaction;
pub mod block;
pub mod chain;
pub mod storage;
pub mod events;
pub mod memory;
pub mod miner;
pub mod ledger;
pub mod zakat;
pub mod metrics;

pub use block::{Block, BlockRef, MerkleTree};
pub use error::{LedgerError, Result};
pub use events::{EventKind, SystemEvent};
pub use ledger::{Ledger, DEFAULT_LOG_LIMIT};
pub use memory::MemoryStore;
pub use miner::{BlockAssembler, DropReason, Dropped, MinedBlock};
pub use storage::{LedgerStore, Store};
pub use transaction::{Transaction, TransferRequest, TxStatus, TxType};
pub use utxo::{Amount, Utxo, COIN};
pub use wallet::{Wallet, WalletReport};
