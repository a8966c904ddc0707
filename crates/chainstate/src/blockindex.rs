//! Block index nodes and their persisted form.

use primitive_types::U256;
use utxod_consensus::Hash256;
use utxod_primitives::block::BlockHeader;
use utxod_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};

use crate::flatfiles::DiskBlockPos;

const BLOCK_INDEX_VERSION: u8 = 1;

/// Validity levels occupy the low three status bits and only ever increase.
pub const BLOCK_VALID_UNKNOWN: u32 = 0;
pub const BLOCK_VALID_HEADER: u32 = 1;
pub const BLOCK_VALID_TREE: u32 = 2;
pub const BLOCK_VALID_TRANSACTIONS: u32 = 3;
pub const BLOCK_VALID_CHAIN: u32 = 4;
pub const BLOCK_VALID_SCRIPTS: u32 = 5;
pub const BLOCK_VALID_MASK: u32 = 0b111;

pub const BLOCK_HAVE_DATA: u32 = 1 << 3;
pub const BLOCK_HAVE_UNDO: u32 = 1 << 4;
pub const BLOCK_FAILED_VALID: u32 = 1 << 5;
pub const BLOCK_FAILED_CHILD: u32 = 1 << 6;
pub const BLOCK_FAILED_MASK: u32 = BLOCK_FAILED_VALID | BLOCK_FAILED_CHILD;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u32)]
pub enum BlockValidity {
    Unknown = BLOCK_VALID_UNKNOWN,
    /// Parsed, proof of work and timestamps checked.
    Header = BLOCK_VALID_HEADER,
    /// Parent known and contextual header checks passed.
    Tree = BLOCK_VALID_TREE,
    /// Body received and structurally valid.
    Transactions = BLOCK_VALID_TRANSACTIONS,
    /// Outputs connected to the UTXO set.
    Chain = BLOCK_VALID_CHAIN,
    Scripts = BLOCK_VALID_SCRIPTS,
}

impl BlockValidity {
    fn from_bits(bits: u32) -> Self {
        match bits & BLOCK_VALID_MASK {
            BLOCK_VALID_HEADER => Self::Header,
            BLOCK_VALID_TREE => Self::Tree,
            BLOCK_VALID_TRANSACTIONS => Self::Transactions,
            BLOCK_VALID_CHAIN => Self::Chain,
            BLOCK_VALID_SCRIPTS => Self::Scripts,
            _ => Self::Unknown,
        }
    }
}

/// Stable arena handle into a [`crate::index::ChainIndex`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockIndexNode {
    pub hash: Hash256,
    /// Parent inside the same arena; `None` only for genesis.
    pub prev: Option<NodeId>,
    pub height: i32,
    pub chain_work: U256,
    pub status: u32,
    pub tx_count: u32,
    /// Transactions from genesis up to and including this block; zero until
    /// the block is connected.
    pub chain_tx_count: u64,
    pub file: u32,
    pub data_pos: u64,
    pub undo_pos: u64,
    pub time_max: u32,
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockIndexNode {
    /// A fresh node for `header` with nothing but its identity filled in.
    pub fn from_header(header: &BlockHeader) -> Self {
        Self {
            hash: header.hash(),
            prev: None,
            height: 0,
            chain_work: U256::zero(),
            status: BLOCK_VALID_UNKNOWN,
            tx_count: 0,
            chain_tx_count: 0,
            file: 0,
            data_pos: 0,
            undo_pos: 0,
            time_max: header.time,
            version: header.version,
            prev_hash: header.prev_block,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
        }
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_block: self.prev_hash,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    pub fn block_time(&self) -> i64 {
        self.time as i64
    }

    pub fn validity(&self) -> BlockValidity {
        BlockValidity::from_bits(self.status)
    }

    /// Raise the validity level; returns whether it changed. Failed nodes
    /// and lower levels are ignored.
    pub fn raise_validity(&mut self, level: BlockValidity) -> bool {
        if self.is_failed() {
            return false;
        }
        if (self.status & BLOCK_VALID_MASK) < level as u32 {
            self.status = (self.status & !BLOCK_VALID_MASK) | level as u32;
            return true;
        }
        false
    }

    pub fn is_valid(&self, level: BlockValidity) -> bool {
        !self.is_failed() && self.validity() >= level
    }

    pub fn is_failed(&self) -> bool {
        (self.status & BLOCK_FAILED_MASK) != 0
    }

    pub fn mark_failed(&mut self) {
        self.status |= BLOCK_FAILED_VALID;
    }

    pub fn has_data(&self) -> bool {
        (self.status & BLOCK_HAVE_DATA) != 0
    }

    pub fn has_undo(&self) -> bool {
        (self.status & BLOCK_HAVE_UNDO) != 0
    }

    pub fn block_pos(&self) -> Option<DiskBlockPos> {
        self.has_data()
            .then(|| DiskBlockPos::new(self.file, self.data_pos))
    }

    pub fn undo_block_pos(&self) -> Option<DiskBlockPos> {
        self.has_undo()
            .then(|| DiskBlockPos::new(self.file, self.undo_pos))
    }

    /// Persisted form. Chain work, parent id and time-max are rebuilt from
    /// the headers on load.
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_INDEX_VERSION);
        encoder.write_i32_le(self.height);
        encoder.write_u32_le(self.status);
        encoder.write_u32_le(self.tx_count);
        encoder.write_u64_le(self.chain_tx_count);
        encoder.write_u32_le(self.file);
        encoder.write_u64_le(self.data_pos);
        encoder.write_u64_le(self.undo_pos);
        Encodable::consensus_encode(&self.header(), &mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != BLOCK_INDEX_VERSION {
            return Err(DecodeError::InvalidData("unsupported block index version"));
        }
        let height = decoder.read_i32_le()?;
        let status = decoder.read_u32_le()?;
        let tx_count = decoder.read_u32_le()?;
        let chain_tx_count = decoder.read_u64_le()?;
        let file = decoder.read_u32_le()?;
        let data_pos = decoder.read_u64_le()?;
        let undo_pos = decoder.read_u64_le()?;
        let header = <BlockHeader as Decodable>::consensus_decode(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        if height < 0 {
            return Err(DecodeError::InvalidData("negative block height"));
        }
        let mut node = Self::from_header(&header);
        node.height = height;
        node.status = status;
        node.tx_count = tx_count;
        node.chain_tx_count = chain_tx_count;
        node.file = file;
        node.data_pos = data_pos;
        node.undo_pos = undo_pos;
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BlockIndexNode {
        BlockIndexNode::from_header(&BlockHeader {
            version: 4,
            prev_block: [7u8; 32],
            merkle_root: [9u8; 32],
            time: 1_600_000_000,
            bits: 0x207f_ffff,
            nonce: 3,
        })
    }

    #[test]
    fn validity_only_rises() {
        let mut node = sample();
        assert!(node.raise_validity(BlockValidity::Tree));
        assert!(!node.raise_validity(BlockValidity::Header));
        assert_eq!(node.validity(), BlockValidity::Tree);
        assert!(node.raise_validity(BlockValidity::Transactions));
        assert!(node.is_valid(BlockValidity::Tree));

        node.mark_failed();
        assert!(!node.raise_validity(BlockValidity::Chain));
        assert!(!node.is_valid(BlockValidity::Tree));
        assert_eq!(node.validity(), BlockValidity::Transactions);
    }

    #[test]
    fn positions_follow_status_bits() {
        let mut node = sample();
        node.file = 2;
        node.data_pos = 40;
        node.undo_pos = 8;
        assert_eq!(node.block_pos(), None);
        node.status |= BLOCK_HAVE_DATA;
        assert_eq!(node.block_pos(), Some(DiskBlockPos::new(2, 40)));
        assert_eq!(node.undo_block_pos(), None);
        node.status |= BLOCK_HAVE_UNDO;
        assert_eq!(node.undo_block_pos(), Some(DiskBlockPos::new(2, 8)));
    }

    #[test]
    fn persisted_form_keeps_header_and_status() {
        let mut node = sample();
        node.height = 12;
        node.tx_count = 3;
        node.chain_tx_count = 40;
        node.status = BLOCK_VALID_CHAIN | BLOCK_HAVE_DATA;
        node.data_pos = 1_234;

        let decoded = BlockIndexNode::decode(&node.encode()).expect("decode");
        assert_eq!(decoded.hash, node.hash);
        assert_eq!(decoded.height, 12);
        assert_eq!(decoded.status, node.status);
        assert_eq!(decoded.chain_tx_count, 40);
        assert_eq!(decoded.block_pos(), node.block_pos());
        assert_eq!(decoded.header(), node.header());

        let mut bytes = node.encode();
        bytes.push(0);
        assert_eq!(
            BlockIndexNode::decode(&bytes),
            Err(DecodeError::TrailingBytes)
        );
    }
}
