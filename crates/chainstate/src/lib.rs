//! Block acceptance, the coins view and the undo engine of a UTXO node.

pub mod accept;
pub mod blockindex;
pub mod coins;
pub mod config;
pub mod disk;
pub mod filemeta;
pub mod flatfiles;
pub mod ibd;
pub mod index;
pub mod rules;
pub mod state;
pub mod undo;
pub mod validation;
pub mod versionbits;

pub use accept::{AcceptError, AcceptedBlock};
pub use blockindex::{BlockIndexNode, BlockValidity, NodeId};
pub use config::ChainConfig;
pub use disk::{BlockFiles, DiskBlockPos, FlatFileBlocks};
pub use ibd::{IbdLatch, IbdState};
pub use index::ChainIndex;
pub use state::{ChainState, ChainStateError, SharedChainState};
pub use undo::{DisconnectResult, UndoReadError};
pub use validation::ValidationError;
