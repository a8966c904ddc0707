use primitive_types::U256;
use utxod_consensus::{ConsensusParams, Hash256};
use utxod_primitives::block::BlockHeader;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowError {
    InvalidBits(&'static str),
    HashMismatch,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashMismatch => write!(f, "pow hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("pow target is zero"));
    }

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if target > pow_limit {
        return Err(PowError::InvalidBits("pow target above limit"));
    }

    if U256::from_little_endian(hash) > target {
        return Err(PowError::HashMismatch);
    }
    Ok(())
}

pub fn validate_pow_header(header: &BlockHeader, params: &ConsensusParams) -> Result<(), PowError> {
    check_proof_of_work(&header.hash(), header.bits, params)
}
