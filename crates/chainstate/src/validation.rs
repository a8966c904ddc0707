//! Block-level structural and contextual checks.

use rayon::prelude::*;
use utxod_consensus::constants::{max_block_sigops_count, LEGACY_MAX_BLOCK_SIZE};
use utxod_consensus::upgrades::UpgradeIndex;
use utxod_consensus::Hash256;
use utxod_pow::validation::PowError;
use utxod_primitives::block::Block;
use utxod_primitives::hash::sha256d_pair;
use utxod_primitives::transaction::Transaction;

use crate::blockindex::NodeId;
use crate::index::ChainIndex;
use crate::rules::{HeaderRules, TxRules};
use crate::versionbits::DeploymentState;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ValidationFlags {
    pub check_header: bool,
    pub check_merkle: bool,
}

impl ValidationFlags {
    pub fn all() -> Self {
        Self {
            check_header: true,
            check_merkle: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidBlock(&'static str),
    InvalidHeader(&'static str),
    InvalidTransaction(&'static str),
    ValueOutOfRange,
    DuplicateInput,
    DuplicateTransaction,
    MerkleMismatch,
    MissingCoinbase,
    BlockTooLarge,
    Pow(PowError),
}

impl ValidationError {
    /// The short reason string peers see in a reject.
    pub fn reject_reason(&self) -> &'static str {
        match self {
            ValidationError::InvalidBlock(reason)
            | ValidationError::InvalidHeader(reason)
            | ValidationError::InvalidTransaction(reason) => reason,
            ValidationError::ValueOutOfRange => "bad-txns-vout-toolarge",
            ValidationError::DuplicateInput => "bad-txns-inputs-duplicate",
            ValidationError::DuplicateTransaction => "bad-txns-duplicate",
            ValidationError::MerkleMismatch => "bad-txnmrklroot",
            ValidationError::MissingCoinbase => "bad-cb-missing",
            ValidationError::BlockTooLarge => "bad-blk-length",
            ValidationError::Pow(PowError::HashMismatch) => "high-hash",
            ValidationError::Pow(_) => "bad-diffbits",
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::InvalidBlock(message) => write!(f, "{message}"),
            ValidationError::InvalidHeader(message) => write!(f, "{message}"),
            ValidationError::InvalidTransaction(message) => write!(f, "{message}"),
            ValidationError::ValueOutOfRange => write!(f, "value out of range"),
            ValidationError::DuplicateInput => write!(f, "duplicate input"),
            ValidationError::DuplicateTransaction => write!(f, "duplicate transaction"),
            ValidationError::MerkleMismatch => write!(f, "merkle root mismatch"),
            ValidationError::MissingCoinbase => write!(f, "first transaction is not coinbase"),
            ValidationError::BlockTooLarge => write!(f, "block size limits failed"),
            ValidationError::Pow(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<PowError> for ValidationError {
    fn from(err: PowError) -> Self {
        ValidationError::Pow(err)
    }
}

/// Merkle root over `txids` plus whether the tree is malleable: some level
/// holds two equal adjacent hashes at positions `2k` and `2k + 1`, so a
/// different transaction list commits to the same root.
pub fn merkle_root(txids: &[Hash256]) -> (Hash256, bool) {
    if txids.is_empty() {
        return ([0u8; 32], false);
    }
    let mut layer = txids.to_vec();
    let mut mutated = false;
    while layer.len() > 1 {
        let size = layer.len();
        let mut next = Vec::with_capacity(size.div_ceil(2));
        let mut i = 0usize;
        while i < size {
            let i2 = if i + 1 < size { i + 1 } else { i };
            if i2 == i + 1 && layer[i] == layer[i2] {
                mutated = true;
            }
            next.push(sha256d_pair(&layer[i], &layer[i2]));
            i += 2;
        }
        layer = next;
    }
    (layer[0], mutated)
}

pub fn block_merkle_root(block: &Block) -> (Hash256, bool) {
    let txids: Vec<Hash256> = block
        .transactions
        .par_iter()
        .map(Transaction::txid)
        .collect();
    merkle_root(&txids)
}

/// Context-free checks. A block that passed once is not checked again.
pub fn check_block(
    block: &mut Block,
    flags: ValidationFlags,
    header_rules: &dyn HeaderRules,
    tx_rules: &dyn TxRules,
    max_block_size: u64,
) -> Result<(), ValidationError> {
    if block.checked {
        return Ok(());
    }

    if flags.check_header {
        header_rules.check_block_header(&block.header)?;
    }

    // An empty list has no root to compare; it is rejected just below.
    if flags.check_merkle && !block.transactions.is_empty() {
        let (root, mutated) = block_merkle_root(block);
        if root != block.header.merkle_root {
            return Err(ValidationError::MerkleMismatch);
        }
        if mutated {
            return Err(ValidationError::DuplicateTransaction);
        }
    }

    if block.transactions.is_empty() {
        return Err(ValidationError::MissingCoinbase);
    }

    let min_tx_size = Transaction::empty().encoded_size() as u64;
    if (block.transactions.len() as u64).saturating_mul(min_tx_size) > max_block_size {
        return Err(ValidationError::BlockTooLarge);
    }
    let block_size = block.encoded_size() as u64;
    if block_size > max_block_size {
        return Err(ValidationError::BlockTooLarge);
    }

    tx_rules.check_block_transactions(&block.transactions, max_block_sigops_count(block_size))?;

    block.checked = true;
    Ok(())
}

/// Checks that depend on the parent: the pre-monolith size cap, then
/// finality and coinbase height through `tx_rules`.
pub fn contextual_check_block(
    block: &Block,
    index: &ChainIndex,
    prev: Option<NodeId>,
    deployments: &dyn DeploymentState,
    tx_rules: &dyn TxRules,
) -> Result<(), ValidationError> {
    if !deployments.is_active(UpgradeIndex::Monolith, index, prev)
        && block.encoded_size() as u64 > LEGACY_MAX_BLOCK_SIZE
    {
        return Err(ValidationError::BlockTooLarge);
    }

    let height = prev.map(|id| index.node(id).height + 1).unwrap_or(0);

    let lock_time_cutoff = match prev {
        Some(id) if deployments.is_active(UpgradeIndex::Csv, index, prev) => {
            index.median_time_past(id)
        }
        _ => i64::from(block.header.time),
    };

    tx_rules.contextual_check_block_transactions(&block.transactions, height, lock_time_cutoff)
}
