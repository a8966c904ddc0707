//! Header and block acceptance into the index and onto disk.

use std::fmt;

use utxod_consensus::params::hash256_to_hex;
use utxod_consensus::Hash256;
use utxod_log::{log_debug, log_info, log_warn};
use utxod_pow::difficulty::block_proof;
use utxod_pow::validation::PowError;
use utxod_primitives::block::{Block, BlockHeader};
use utxod_storage::KeyValueStore;

use crate::blockindex::{BlockIndexNode, BlockValidity, NodeId, BLOCK_HAVE_DATA, BLOCK_HAVE_UNDO};
use crate::disk::DiskBlockPos;
use crate::flatfiles::FlatFileError;
use crate::state::ChainState;
use crate::validation::{check_block, contextual_check_block, ValidationError, ValidationFlags};

pub const REJECT_INVALID: u32 = 0x10;

/// Outcome of a successful [`ChainState::accept_block`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AcceptedBlock {
    pub node: NodeId,
    pub pos: DiskBlockPos,
    /// False when the block body was already stored.
    pub is_new: bool,
}

#[derive(Debug)]
pub enum AcceptError {
    HeaderInvalid(ValidationError),
    /// The header is already indexed and marked failed.
    KnownInvalid(NodeId),
    NoParent,
    InvalidParent,
    CheckpointMismatch(&'static str),
    ContextualHeaderInvalid(ValidationError),
    DuplicateOrConflict,
    InsufficientWork,
    TooFarAhead,
    Invalid(ValidationError),
    FindPos(FlatFileError),
    Write(FlatFileError),
}

impl AcceptError {
    pub fn code(&self) -> u32 {
        match self {
            AcceptError::HeaderInvalid(_) | AcceptError::Invalid(_) => REJECT_INVALID,
            AcceptError::InvalidParent | AcceptError::CheckpointMismatch(_) => 3100,
            AcceptError::ContextualHeaderInvalid(_) => 3101,
            AcceptError::NoParent => 3102,
            AcceptError::KnownInvalid(_) => 3103,
            AcceptError::DuplicateOrConflict => 3104,
            AcceptError::TooFarAhead => 3007,
            AcceptError::InsufficientWork => 3008,
            AcceptError::FindPos(_) => 2000,
            AcceptError::Write(_) => 2001,
        }
    }

    pub fn reject_reason(&self) -> &'static str {
        match self {
            AcceptError::HeaderInvalid(err)
            | AcceptError::ContextualHeaderInvalid(err)
            | AcceptError::Invalid(err) => err.reject_reason(),
            AcceptError::KnownInvalid(_) => "duplicate-invalid",
            AcceptError::NoParent => "prev-blk-not-found",
            AcceptError::InvalidParent => "bad-prevblk",
            AcceptError::CheckpointMismatch(reason) => reason,
            AcceptError::DuplicateOrConflict => "duplicate",
            AcceptError::InsufficientWork => "insufficient-work",
            AcceptError::TooFarAhead => "too-far-ahead",
            AcceptError::FindPos(_) => "find-block-pos-failed",
            AcceptError::Write(_) => "write-block-failed",
        }
    }

    /// Whether the block itself was shown to be invalid, as opposed to being
    /// unwanted for now or hitting a local failure.
    pub fn is_invalid(&self) -> bool {
        matches!(
            self,
            AcceptError::HeaderInvalid(_)
                | AcceptError::KnownInvalid(_)
                | AcceptError::InvalidParent
                | AcceptError::CheckpointMismatch(_)
                | AcceptError::ContextualHeaderInvalid(_)
                | AcceptError::Invalid(_)
        )
    }
}

impl fmt::Display for AcceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptError::HeaderInvalid(err) => write!(f, "invalid header: {err}"),
            AcceptError::ContextualHeaderInvalid(err) => {
                write!(f, "header rejected in context: {err}")
            }
            AcceptError::Invalid(err) => write!(f, "invalid block: {err}"),
            AcceptError::FindPos(err) => write!(f, "failed to find block position: {err}"),
            AcceptError::Write(err) => write!(f, "failed to write block: {err}"),
            other => write!(f, "{} ({})", other.reject_reason(), other.code()),
        }
    }
}

impl std::error::Error for AcceptError {}

impl<S: KeyValueStore> ChainState<S> {
    /// Add `header` to the index, or return the node it already has.
    ///
    /// A header that fails any check leaves the index untouched.
    pub fn accept_block_header(&mut self, header: &BlockHeader) -> Result<NodeId, AcceptError> {
        let hash = header.hash();
        if let Some(id) = self.index.find(&hash) {
            if self.index.node(id).is_failed() {
                log_debug!("header {} is known invalid", hash256_to_hex(&hash));
                return Err(AcceptError::KnownInvalid(id));
            }
            return Ok(id);
        }

        self.header_rules
            .check_block_header(header)
            .map_err(AcceptError::HeaderInvalid)?;
        let proof = block_proof(header.bits)
            .map_err(|err| AcceptError::HeaderInvalid(PowError::Compact(err).into()))?;

        let mut node = BlockIndexNode::from_header(header);
        if hash == self.params.consensus.hash_genesis_block {
            node.chain_work = proof;
            node.time_max = header.time;
        } else {
            let prev = self
                .index
                .find(&header.prev_block)
                .ok_or(AcceptError::NoParent)?;
            let parent = self.index.node(prev);
            if parent.is_failed() {
                return Err(AcceptError::InvalidParent);
            }
            let height = parent.height + 1;
            if self.config.checkpoints {
                self.check_against_checkpoints(prev, &hash, height)?;
            }
            self.header_rules
                .contextual_check_block_header(header, &self.index, prev, self.adjusted_time())
                .map_err(AcceptError::ContextualHeaderInvalid)?;

            let parent = self.index.node(prev);
            node.prev = Some(prev);
            node.height = height;
            node.chain_work = parent.chain_work + proof;
            node.time_max = parent.time_max.max(header.time);
        }
        node.raise_validity(BlockValidity::Tree);
        self.index_header(node)
    }

    fn index_header(&mut self, node: BlockIndexNode) -> Result<NodeId, AcceptError> {
        let id = self
            .index
            .insert(node)
            .map_err(|_| AcceptError::DuplicateOrConflict)?;
        self.mark_dirty(id);
        Ok(id)
    }

    /// A header at a checkpoint height must match it, and no fork may start
    /// below the last checkpoint already in the index.
    fn check_against_checkpoints(
        &self,
        prev: NodeId,
        hash: &Hash256,
        height: i32,
    ) -> Result<(), AcceptError> {
        let consensus = &self.params.consensus;
        if let Some(checkpoint) = consensus.checkpoint_at(height) {
            if checkpoint.hash != *hash {
                return Err(AcceptError::CheckpointMismatch("checkpoint mismatch"));
            }
        }
        let last = consensus
            .checkpoints
            .iter()
            .rev()
            .find_map(|checkpoint| self.index.find(&checkpoint.hash));
        if let Some(last) = last {
            let last_height = self.index.node(last).height;
            if height < last_height {
                return Err(AcceptError::CheckpointMismatch("bad-fork-prior-to-checkpoint"));
            }
            if self.index.ancestor(prev, last_height) != Some(last) {
                return Err(AcceptError::CheckpointMismatch("bad-fork-prior-to-checkpoint"));
            }
        }
        Ok(())
    }

    /// Validate `block` and store it.
    ///
    /// An unrequested block is only taken when it carries more work than the
    /// active tip and does not sit too far above it. `known_pos` names a
    /// position the body already occupies on disk, as during a reindex.
    pub fn accept_block(
        &mut self,
        block: &mut Block,
        requested: bool,
        known_pos: Option<DiskBlockPos>,
    ) -> Result<AcceptedBlock, AcceptError> {
        let id = self.accept_block_header(&block.header)?;
        let node = self.index.node(id);

        if node.has_data() {
            log_warn!("block {} already stored", hash256_to_hex(&node.hash));
            return Ok(AcceptedBlock {
                node: id,
                pos: node.block_pos().unwrap_or_default(),
                is_new: false,
            });
        }

        if !requested {
            let has_more_work = match self.index.tip() {
                Some(tip) => node.chain_work > self.index.node(tip).chain_work,
                None => true,
            };
            if !has_more_work {
                return Err(AcceptError::InsufficientWork);
            }
            if node.height > self.index.height() + self.config.min_blocks_to_keep {
                return Err(AcceptError::TooFarAhead);
            }
        }

        let prev = node.prev;
        let mut checked = check_block(
            block,
            ValidationFlags::all(),
            self.header_rules.as_ref(),
            self.tx_rules.as_ref(),
            self.config.excessive_block_size,
        );
        if checked.is_ok() {
            checked = contextual_check_block(
                block,
                &self.index,
                prev,
                self.deployments.as_ref(),
                self.tx_rules.as_ref(),
            );
        }
        if let Err(err) = checked {
            log_info!(
                "rejected block {}: {err}",
                hash256_to_hex(&self.index.node(id).hash)
            );
            self.invalidate(id);
            return Err(AcceptError::Invalid(err));
        }

        let pos = self.write_block_to_disk(block, id, known_pos)?;
        self.received_block_transactions(block, id, pos);
        Ok(AcceptedBlock {
            node: id,
            pos,
            is_new: true,
        })
    }

    /// Place the serialized block. With `known_pos` only the file metadata
    /// is updated and nothing is written.
    pub fn write_block_to_disk(
        &mut self,
        block: &Block,
        id: NodeId,
        known_pos: Option<DiskBlockPos>,
    ) -> Result<DiskBlockPos, AcceptError> {
        let bytes = block.consensus_encode();
        let node = self.index.node(id);
        let (height, time) = (node.height, node.time);
        let pos = self
            .files
            .find_block_pos(known_pos, bytes.len() as u64, height, time)
            .map_err(AcceptError::FindPos)?;
        if known_pos.is_none() {
            self.files
                .write_block(pos, &bytes)
                .map_err(AcceptError::Write)?;
        }
        Ok(pos)
    }

    /// Record that the body of `id` is stored at `pos` and link the node into
    /// the branch set, or park it until its parent's body arrives.
    pub fn received_block_transactions(&mut self, block: &Block, id: NodeId, pos: DiskBlockPos) {
        let node = self.index.node_mut(id);
        node.tx_count = block.transactions.len() as u32;
        node.chain_tx_count = 0;
        node.file = pos.file_id;
        node.data_pos = pos.offset;
        node.undo_pos = 0;
        node.status &= !BLOCK_HAVE_UNDO;
        node.status |= BLOCK_HAVE_DATA;
        node.raise_validity(BlockValidity::Transactions);
        self.mark_dirty(id);

        if self.index.is_genesis(id) || self.index.parent_in_branch(id) {
            match self.index.attach_to_branch(id) {
                Ok(attached) if attached.len() > 1 => {
                    log_debug!("{} waiting blocks joined the branch set", attached.len() - 1);
                }
                Ok(_) => {}
                Err(err) => log_warn!("block {id} could not join the branch set: {err}"),
            }
        } else if let Err(err) = self.index.attach_to_orphan(id) {
            log_warn!(
                "block {} has broken ancestry: {err}",
                hash256_to_hex(&self.index.node(id).hash)
            );
        }
    }
}
