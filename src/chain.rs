use crate::block::{meets_difficulty, Block, MerkleTree};
use crate::error::{LedgerError, Result};

/// Checks `block`'s linkage against its predecessor (`None` means genesis).
pub fn validate_link(block: &Block, prev: Option<&Block>) -> Result<()> {
    match prev {
        Some(prev) => {
            if block.previous_hash != prev.hash {
                return Err(LedgerError::integrity(
                    block.index,
                    format!("previous hash {} does not match block #{} hash {}", block.previous_hash, prev.index, prev.hash),
                ));
            }
            if block.index != prev.index + 1 {
                return Err(LedgerError::integrity(
                    block.index,
                    format!("index does not follow predecessor #{}", prev.index),
                ));
            }
        }
        None => {
            if !block.is_genesis() {
                return Err(LedgerError::integrity(block.index, "first block must have index 0"));
            }
            if !block.previous_hash.is_empty() {
                return Err(LedgerError::integrity(block.index, "genesis block must not reference a previous hash"));
            }
        }
    }
    Ok(())
}

/// Checks that the stored hash and Merkle root recompute from the block's own
/// contents.
pub fn validate_contents(block: &Block) -> Result<()> {
    let merkle = MerkleTree::root(&block.transactions);
    if merkle != block.merkle_root {
        return Err(LedgerError::integrity(block.index, "merkle root does not match transactions"));
    }
    if block.compute_hash() != block.hash {
        return Err(LedgerError::integrity(block.index, "stored hash does not match header"));
    }
    Ok(())
}

/// Full acceptance check for a freshly mined block.
pub fn validate_append(block: &Block, prev: Option<&Block>, difficulty: usize) -> Result<()> {
    validate_link(block, prev)?;
    validate_contents(block)?;
    if !meets_difficulty(&block.hash, difficulty) {
        return Err(LedgerError::integrity(
            block.index,
            format!("hash {} does not meet difficulty {}", block.hash, difficulty),
        ));
    }
    Ok(())
}

/// Walks an index-ordered chain from genesis.
///
/// Difficulty is not re-checked here since it may have been reconfigured
/// after older blocks were mined.
pub fn validate_chain(blocks: &[Block]) -> Result<()> {
    let mut prev: Option<&Block> = None;
    for block in blocks {
        validate_link(block, prev)?;
        validate_contents(block)?;
        prev = Some(block);
    }
    Ok(())
}
