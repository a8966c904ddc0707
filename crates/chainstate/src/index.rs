//! In-memory block tree: an arena of index nodes plus the active chain and
//! the branch / orphan bookkeeping used while blocks arrive out of order.

use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;
use utxod_consensus::constants::MEDIAN_TIME_SPAN;
use utxod_consensus::Hash256;

use crate::blockindex::{BlockIndexNode, BlockValidity, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexError {
    DuplicateOrConflict,
    /// Neither genesis nor a child of a branch member.
    NotAttachable,
    /// Parent missing or below tree validity.
    BrokenAncestry,
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::DuplicateOrConflict => write!(f, "block index already present"),
            IndexError::NotAttachable => write!(f, "parent is not part of a branch"),
            IndexError::BrokenAncestry => write!(f, "parent is missing or not tree-valid"),
        }
    }
}

impl std::error::Error for IndexError {}

pub struct ChainIndex {
    genesis_hash: Hash256,
    nodes: Vec<BlockIndexNode>,
    by_hash: HashMap<Hash256, NodeId>,
    /// Active chain by height.
    active: Vec<NodeId>,
    /// Nodes with data whose ancestry reaches genesis through nodes with data.
    branch: HashSet<NodeId>,
    /// Branch members without a branch child.
    heads: HashSet<NodeId>,
    orphans: HashSet<NodeId>,
    /// Orphans keyed by the parent they wait for.
    waiting: HashMap<NodeId, SmallVec<[NodeId; 2]>>,
}

impl ChainIndex {
    pub fn new(genesis_hash: Hash256) -> Self {
        Self {
            genesis_hash,
            nodes: Vec::new(),
            by_hash: HashMap::new(),
            active: Vec::new(),
            branch: HashSet::new(),
            heads: HashSet::new(),
            orphans: HashSet::new(),
            waiting: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, hash: &Hash256) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    /// Panics on an id that did not come from this index.
    pub fn node(&self, id: NodeId) -> &BlockIndexNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut BlockIndexNode {
        &mut self.nodes[id.index()]
    }

    pub fn get(&self, id: NodeId) -> Option<&BlockIndexNode> {
        self.nodes.get(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &BlockIndexNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (NodeId::from_index(index), node))
    }

    pub fn insert(&mut self, node: BlockIndexNode) -> Result<NodeId, IndexError> {
        if self.by_hash.contains_key(&node.hash) {
            return Err(IndexError::DuplicateOrConflict);
        }
        let id = NodeId::from_index(self.nodes.len());
        self.by_hash.insert(node.hash, id);
        self.nodes.push(node);
        Ok(id)
    }

    pub fn is_genesis(&self, id: NodeId) -> bool {
        self.node(id).hash == self.genesis_hash
    }

    pub fn in_branch(&self, id: NodeId) -> bool {
        self.branch.contains(&id)
    }

    pub fn is_orphan(&self, id: NodeId) -> bool {
        self.orphans.contains(&id)
    }

    pub fn parent_in_branch(&self, id: NodeId) -> bool {
        self.node(id)
            .prev
            .is_some_and(|prev| self.branch.contains(&prev))
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn branch_heads(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.heads.iter().copied()
    }

    /// Add a node to the branch set. Orphans waiting on it follow, depth
    /// first, and every node that joined is returned in attach order.
    pub fn attach_to_branch(&mut self, id: NodeId) -> Result<Vec<NodeId>, IndexError> {
        if !self.is_genesis(id) && !self.parent_in_branch(id) {
            return Err(IndexError::NotAttachable);
        }
        let mut attached = Vec::new();
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            self.orphans.remove(&next);
            if !self.branch.insert(next) {
                continue;
            }
            if let Some(prev) = self.node(next).prev {
                self.heads.remove(&prev);
            }
            self.heads.insert(next);
            attached.push(next);
            if let Some(children) = self.waiting.remove(&next) {
                pending.extend(children.into_iter().rev());
            }
        }
        Ok(attached)
    }

    pub fn attach_to_orphan(&mut self, id: NodeId) -> Result<(), IndexError> {
        let prev = self.node(id).prev.ok_or(IndexError::BrokenAncestry)?;
        if !self.node(prev).is_valid(BlockValidity::Tree) {
            return Err(IndexError::BrokenAncestry);
        }
        if self.branch.contains(&id) || !self.orphans.insert(id) {
            return Ok(());
        }
        self.waiting.entry(prev).or_default().push(id);
        Ok(())
    }

    /// The branch head with the most work; ties go to the earliest inserted.
    pub fn best_branch_head(&self) -> Option<NodeId> {
        self.heads.iter().copied().max_by(|a, b| {
            self.node(*a)
                .chain_work
                .cmp(&self.node(*b).chain_work)
                .then_with(|| b.cmp(a))
        })
    }

    pub fn tip(&self) -> Option<NodeId> {
        self.active.last().copied()
    }

    /// Active chain height, -1 when empty.
    pub fn height(&self) -> i32 {
        self.active.len() as i32 - 1
    }

    pub fn at_height(&self, height: i32) -> Option<NodeId> {
        usize::try_from(height)
            .ok()
            .and_then(|height| self.active.get(height).copied())
    }

    pub fn contains_active(&self, id: NodeId) -> bool {
        self.at_height(self.node(id).height) == Some(id)
    }

    /// Make `tip` the active tip, rewriting only the part of the active
    /// chain above the fork point.
    pub fn set_tip(&mut self, tip: Option<NodeId>) {
        let Some(tip) = tip else {
            self.active.clear();
            return;
        };
        let height = self.node(tip).height as usize;
        self.active.truncate(height + 1);
        self.active.resize(height + 1, tip);
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            let slot = self.node(id).height as usize;
            if self.active[slot] == id && id != tip {
                break;
            }
            self.active[slot] = id;
            cursor = self.node(id).prev;
        }
    }

    /// Ancestor of `id` at `height`, using the active chain when `id` is on it.
    pub fn ancestor(&self, id: NodeId, height: i32) -> Option<NodeId> {
        let node = self.node(id);
        if height < 0 || height > node.height {
            return None;
        }
        if self.contains_active(id) {
            return self.at_height(height);
        }
        let mut cursor = id;
        while self.node(cursor).height > height {
            cursor = self.node(cursor).prev?;
        }
        Some(cursor)
    }

    pub fn median_time_past(&self, id: NodeId) -> i64 {
        let mut times: SmallVec<[i64; MEDIAN_TIME_SPAN]> = SmallVec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let node = self.node(current);
            times.push(node.block_time());
            cursor = node.prev;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::U256;
    use utxod_primitives::block::BlockHeader;

    fn push(index: &mut ChainIndex, prev: Option<NodeId>, tag: u8, time: u32) -> NodeId {
        let prev_hash = prev.map(|id| index.node(id).hash).unwrap_or([0u8; 32]);
        let mut node = BlockIndexNode::from_header(&BlockHeader {
            version: 4,
            prev_block: prev_hash,
            merkle_root: [tag; 32],
            time,
            bits: 0x207f_ffff,
            nonce: tag as u32,
        });
        node.prev = prev;
        node.height = prev.map(|id| index.node(id).height + 1).unwrap_or(0);
        node.chain_work = U256::from(node.height as u64 + 1);
        node.raise_validity(BlockValidity::Tree);
        index.insert(node).expect("insert")
    }

    fn genesis_index() -> (ChainIndex, NodeId) {
        let header = BlockHeader {
            version: 4,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 100,
            bits: 0x207f_ffff,
            nonce: 0,
        };
        let mut index = ChainIndex::new(header.hash());
        let mut node = BlockIndexNode::from_header(&header);
        node.chain_work = U256::one();
        node.raise_validity(BlockValidity::Tree);
        let id = index.insert(node).expect("insert");
        (index, id)
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let (mut index, genesis) = genesis_index();
        let copy = index.node(genesis).clone();
        assert_eq!(index.insert(copy), Err(IndexError::DuplicateOrConflict));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn late_parent_pulls_in_waiting_orphans() {
        let (mut index, genesis) = genesis_index();
        let a = push(&mut index, Some(genesis), 1, 110);
        let b = push(&mut index, Some(a), 2, 120);
        let c = push(&mut index, Some(b), 3, 130);

        assert_eq!(index.attach_to_branch(genesis), Ok(vec![genesis]));
        assert_eq!(index.attach_to_branch(c), Err(IndexError::NotAttachable));
        index.attach_to_orphan(c).expect("orphan c");
        index.attach_to_orphan(b).expect("orphan b");
        assert_eq!(index.orphan_count(), 2);

        let attached = index.attach_to_branch(a).expect("attach a");
        assert_eq!(attached, vec![a, b, c]);
        assert_eq!(index.orphan_count(), 0);
        assert!(index.in_branch(c));
        assert_eq!(index.branch_heads().collect::<Vec<_>>(), vec![c]);
        assert_eq!(index.best_branch_head(), Some(c));
    }

    #[test]
    fn orphan_requires_tree_valid_parent() {
        let (mut index, genesis) = genesis_index();
        let a = push(&mut index, Some(genesis), 1, 110);
        let b = push(&mut index, Some(a), 2, 120);
        index.node_mut(a).mark_failed();
        assert_eq!(index.attach_to_orphan(b), Err(IndexError::BrokenAncestry));
        assert_eq!(
            index.attach_to_orphan(genesis),
            Err(IndexError::BrokenAncestry)
        );
    }

    #[test]
    fn set_tip_rewrites_only_above_fork() {
        let (mut index, genesis) = genesis_index();
        let a1 = push(&mut index, Some(genesis), 1, 110);
        let a2 = push(&mut index, Some(a1), 2, 120);
        let b2 = push(&mut index, Some(a1), 3, 121);
        let b3 = push(&mut index, Some(b2), 4, 130);

        assert_eq!(index.height(), -1);
        index.set_tip(Some(a2));
        assert_eq!(index.height(), 2);
        assert!(index.contains_active(a2));

        index.set_tip(Some(b3));
        assert_eq!(index.tip(), Some(b3));
        assert_eq!(index.at_height(2), Some(b2));
        assert_eq!(index.at_height(1), Some(a1));
        assert!(!index.contains_active(a2));
        assert_eq!(index.ancestor(a2, 1), Some(a1));
        assert_eq!(index.ancestor(b3, 0), Some(genesis));
        assert_eq!(index.ancestor(b3, 4), None);

        index.set_tip(Some(a1));
        assert_eq!(index.height(), 1);
        index.set_tip(None);
        assert_eq!(index.tip(), None);
    }

    #[test]
    fn median_time_past_uses_eleven_blocks() {
        let (mut index, genesis) = genesis_index();
        assert_eq!(index.median_time_past(genesis), 100);
        let mut tip = genesis;
        for i in 1..=14u32 {
            tip = push(&mut index, Some(tip), i as u8, 100 + i * 10);
        }
        // window covers heights 4..=14, times 140..=240
        assert_eq!(index.median_time_past(tip), 190);
    }
}
