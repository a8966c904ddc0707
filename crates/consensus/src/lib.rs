//! Consensus constants, parameters, and upgrade schedule.

pub mod constants;
pub mod money;
pub mod params;
pub mod upgrades;

pub use params::{
    chain_params, consensus_params, ChainParams, ChainTxData, Checkpoint, ConsensusParams,
    Network,
};
pub use upgrades::Hash256;
