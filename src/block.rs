//! Blocks, the transaction Merkle root and the proof-of-work search.
//!
//! Both digests are part of the persisted format: changing the leaf encoding,
//! the header string or the timestamp rendering changes every hash that
//! follows, so they are kept in one place.

use crate::crypto::sha256;
use crate::error::{LedgerError, Result};
use crate::transaction::Transaction;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub transactions: Vec<Transaction>,
    pub previous_hash: String,
    pub nonce: u64,
    pub hash: String,
    pub merkle_root: String,
}

/// How callers address a stored block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRef {
    Index(u64),
    Hash(String),
}

impl FromStr for BlockRef {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s.parse::<u64>() {
            Ok(i) if s.len() < 64 => BlockRef::Index(i),
            _ => BlockRef::Hash(s.to_lowercase()),
        })
    }
}

/// Timestamp rendering used inside the block header.
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// `true` when the hex `hash` starts with at least `difficulty` `'0'` characters.
pub fn meets_difficulty(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

/// Merkle tree over a block's transactions.
pub struct MerkleTree;

impl MerkleTree {
    /// Leaf digest: SHA-256(id ‖ sender ‖ receiver).
    pub fn leaf(tx: &Transaction) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(tx.id.as_bytes());
        h.update(tx.sender.as_bytes());
        h.update(tx.receiver.as_bytes());
        h.finalize().into()
    }

    /// Hex root over `txs` in their given order; `""` for an empty list.
    ///
    /// An odd node at the end of a level is carried up unchanged rather than
    /// hashed with itself.
    pub fn root(txs: &[Transaction]) -> String {
        if txs.is_empty() {
            return String::new();
        }
        let mut level: Vec<[u8; 32]> = txs.iter().map(Self::leaf).collect();
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for pair in level.chunks(2) {
                if let [left, right] = pair {
                    let mut concat = [0u8; 64];
                    concat[..32].copy_from_slice(left);
                    concat[32..].copy_from_slice(right);
                    next.push(sha256(&concat));
                } else {
                    next.push(pair[0]);
                }
            }
            level = next;
        }
        hex::encode(level[0])
    }
}

impl Block {
    /// Unmined block: Merkle root computed, nonce 0, hash empty.
    pub fn new(
        index: u64,
        timestamp: DateTime<Utc>,
        transactions: Vec<Transaction>,
        previous_hash: String,
    ) -> Self {
        let merkle_root = MerkleTree::root(&transactions);
        Block {
            index,
            timestamp,
            transactions,
            previous_hash,
            nonce: 0,
            hash: String::new(),
            merkle_root,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }

    /// `index|timestamp|previous_hash|nonce|merkle_root`
    pub fn header(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.index,
            canonical_timestamp(&self.timestamp),
            self.previous_hash,
            self.nonce,
            self.merkle_root
        )
    }

    pub fn compute_hash(&self) -> String {
        hex::encode(sha256(self.header().as_bytes()))
    }

    /// Searches nonces upward from 0 until the header hash meets `difficulty`.
    ///
    /// Runs on the calling thread until it succeeds unless `max_attempts`
    /// bounds it. Returns the number of hashes computed.
    pub fn mine(&mut self, difficulty: usize, max_attempts: Option<u64>) -> Result<u64> {
        // Only the nonce changes between attempts.
        let prefix = format!(
            "{}|{}|{}|",
            self.index,
            canonical_timestamp(&self.timestamp),
            self.previous_hash
        );
        let suffix = format!("|{}", self.merkle_root);
        let mut buf = String::with_capacity(prefix.len() + suffix.len() + 20);

        let mut nonce: u64 = 0;
        let mut attempts: u64 = 0;
        loop {
            if let Some(max) = max_attempts {
                if attempts >= max {
                    return Err(LedgerError::PowExhausted(attempts));
                }
            }
            attempts += 1;
            buf.clear();
            buf.push_str(&prefix);
            buf.push_str(&nonce.to_string());
            buf.push_str(&suffix);
            let hash = hex::encode(sha256(buf.as_bytes()));
            if meets_difficulty(&hash, difficulty) {
                self.nonce = nonce;
                self.hash = hash;
                return Ok(attempts);
            }
            nonce += 1;
        }
    }
}
