//! The chain state context: block index, coins view, block files and the
//! rule sets, behind one owner.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use primitive_types::U256;
use utxod_consensus::constants::COINBASE_MATURITY;
use utxod_consensus::params::hash256_to_hex;
use utxod_consensus::{ChainParams, Hash256};
use utxod_log::{log_debug, log_error, log_info, log_warn};
use utxod_pow::difficulty::block_proof;
use utxod_primitives::block::{Block, BlockDecodeError};
use utxod_primitives::encoding::DecodeError;
use utxod_primitives::outpoint::OutPoint;
use utxod_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blockindex::{BlockIndexNode, BlockValidity, NodeId, BLOCK_HAVE_UNDO};
use crate::coins::{Coin, CoinsCache, UtxoSet};
use crate::config::ChainConfig;
use crate::disk::{BlockFiles, FlatFileBlocks};
use crate::filemeta::{block_file_info_key, parse_block_file_info_key, FlatFileInfo};
use crate::flatfiles::FlatFileError;
use crate::ibd::{guess_verification_progress, IbdInputs, IbdLatch};
use crate::index::{ChainIndex, IndexError};
use crate::rules::{HeaderRules, PowHeaderRules, StandardTxRules, TxRules};
use crate::undo::{
    apply_block_undo, read_block_undo, write_block_undo, BlockUndo, DisconnectResult,
    TxUndo, UndoReadError,
};
use crate::validation::ValidationError;
use crate::versionbits::{BuriedDeployments, DeploymentState};

pub(crate) const BEST_BLOCK_KEY: &[u8] = b"best_block";

#[derive(Debug)]
pub enum ChainStateError {
    Validation(ValidationError),
    Store(StoreError),
    FlatFile(FlatFileError),
    Decode(DecodeError),
    BlockDecode(BlockDecodeError),
    UndoRead(UndoReadError),
    Index(IndexError),
    MissingBlockData,
    MissingUndo,
    EmptyChain,
    NotTipExtension,
    BlockHashMismatch,
    CorruptIndex(&'static str),
    Poisoned,
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Validation(err) => write!(f, "{err}"),
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::FlatFile(err) => write!(f, "{err}"),
            ChainStateError::Decode(err) => write!(f, "{err}"),
            ChainStateError::BlockDecode(err) => write!(f, "{err}"),
            ChainStateError::UndoRead(err) => write!(f, "{err}"),
            ChainStateError::Index(err) => write!(f, "{err}"),
            ChainStateError::MissingBlockData => write!(f, "block data not available"),
            ChainStateError::MissingUndo => write!(f, "undo data not available"),
            ChainStateError::EmptyChain => write!(f, "active chain is empty"),
            ChainStateError::NotTipExtension => write!(f, "block does not extend the active tip"),
            ChainStateError::BlockHashMismatch => write!(f, "stored block hash mismatch"),
            ChainStateError::CorruptIndex(message) => write!(f, "{message}"),
            ChainStateError::Poisoned => write!(f, "chain state lock poisoned"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<ValidationError> for ChainStateError {
    fn from(err: ValidationError) -> Self {
        ChainStateError::Validation(err)
    }
}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<FlatFileError> for ChainStateError {
    fn from(err: FlatFileError) -> Self {
        ChainStateError::FlatFile(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        ChainStateError::Decode(err)
    }
}

impl From<BlockDecodeError> for ChainStateError {
    fn from(err: BlockDecodeError) -> Self {
        ChainStateError::BlockDecode(err)
    }
}

impl From<UndoReadError> for ChainStateError {
    fn from(err: UndoReadError) -> Self {
        ChainStateError::UndoRead(err)
    }
}

impl From<IndexError> for ChainStateError {
    fn from(err: IndexError) -> Self {
        ChainStateError::Index(err)
    }
}

/// Everything block acceptance and the undo engine touch. Callers that share
/// it between threads go through [`SharedChainState`].
pub struct ChainState<S: KeyValueStore> {
    pub(crate) params: ChainParams,
    pub(crate) config: ChainConfig,
    store: Arc<S>,
    pub(crate) index: ChainIndex,
    pub(crate) coins: CoinsCache<Arc<S>>,
    pub(crate) files: Box<dyn BlockFiles>,
    pub(crate) header_rules: Box<dyn HeaderRules>,
    pub(crate) tx_rules: Box<dyn TxRules>,
    pub(crate) deployments: Box<dyn DeploymentState>,
    dirty: BTreeSet<NodeId>,
    importing: bool,
    reindexing: bool,
    mock_time: Option<i64>,
    time_offset: i64,
    ibd: Arc<IbdLatch>,
}

impl<S: KeyValueStore> ChainState<S> {
    /// A fresh state with the default rule sets for `params`.
    pub fn new(
        params: ChainParams,
        config: ChainConfig,
        store: Arc<S>,
        files: Box<dyn BlockFiles>,
    ) -> Self {
        let consensus = params.consensus.clone();
        Self {
            index: ChainIndex::new(consensus.hash_genesis_block),
            coins: CoinsCache::new(UtxoSet::new(Arc::clone(&store))),
            header_rules: Box::new(PowHeaderRules::new(consensus.clone())),
            tx_rules: Box::new(StandardTxRules::new(consensus.clone())),
            deployments: Box::new(BuriedDeployments::new(consensus.upgrades)),
            params,
            config,
            store,
            files,
            dirty: BTreeSet::new(),
            importing: false,
            reindexing: false,
            mock_time: None,
            time_offset: 0,
            ibd: Arc::new(IbdLatch::new()),
        }
    }

    /// Open flat files under `blocks_dir` and load whatever `store` holds.
    pub fn open(
        params: ChainParams,
        config: ChainConfig,
        store: Arc<S>,
        blocks_dir: &Path,
    ) -> Result<Self, ChainStateError> {
        let files = FlatFileBlocks::open(blocks_dir, config.block_file_size)?;
        let mut state = Self::new(params, config, store, Box::new(files));
        state.load_block_index()?;
        Ok(state)
    }

    pub fn with_header_rules(mut self, rules: Box<dyn HeaderRules>) -> Self {
        self.header_rules = rules;
        self
    }

    pub fn with_tx_rules(mut self, rules: Box<dyn TxRules>) -> Self {
        self.tx_rules = rules;
        self
    }

    pub fn with_deployments(mut self, deployments: Box<dyn DeploymentState>) -> Self {
        self.deployments = deployments;
        self
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn index(&self) -> &ChainIndex {
        &self.index
    }

    pub fn node(&self, id: NodeId) -> &BlockIndexNode {
        self.index.node(id)
    }

    pub fn find(&self, hash: &Hash256) -> Option<NodeId> {
        self.index.find(hash)
    }

    pub fn tip(&self) -> Option<NodeId> {
        self.index.tip()
    }

    pub fn height(&self) -> i32 {
        self.index.height()
    }

    pub fn coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainStateError> {
        Ok(self.coins.get(outpoint)?)
    }

    pub fn set_importing(&mut self, importing: bool) {
        self.importing = importing;
    }

    pub fn set_reindexing(&mut self, reindexing: bool) {
        self.reindexing = reindexing;
    }

    pub fn set_mock_time(&mut self, time: Option<i64>) {
        self.mock_time = time;
    }

    /// Offset of the network-adjusted clock from the local one.
    pub fn set_time_offset(&mut self, offset: i64) {
        self.time_offset = offset;
    }

    pub fn now(&self) -> i64 {
        if let Some(time) = self.mock_time {
            return time;
        }
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0)
    }

    pub fn adjusted_time(&self) -> i64 {
        self.now() + self.time_offset
    }

    pub fn ibd_latch(&self) -> Arc<IbdLatch> {
        Arc::clone(&self.ibd)
    }

    pub fn is_initial_block_download(&self) -> bool {
        self.ibd.is_initial_block_download(|| self.ibd_inputs())
    }

    fn ibd_inputs(&self) -> IbdInputs {
        let tip = self.index.tip().map(|id| {
            let node = self.index.node(id);
            (node.chain_work, node.block_time())
        });
        IbdInputs {
            importing: self.importing,
            reindexing: self.reindexing,
            tip,
            minimum_chain_work: U256::from_little_endian(&self.params.consensus.minimum_chain_work),
            now: self.now(),
            max_tip_age: self.config.max_tip_age,
        }
    }

    /// Progress estimate for `id`, or for the active tip when `None`.
    pub fn verification_progress(&self, id: Option<NodeId>) -> f64 {
        let node = id.or_else(|| self.index.tip()).map(|id| self.index.node(id));
        guess_verification_progress(&self.params.chain_tx_data, node, self.now())
    }

    pub(crate) fn mark_dirty(&mut self, id: NodeId) {
        self.dirty.insert(id);
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub(crate) fn invalidate(&mut self, id: NodeId) {
        self.index.node_mut(id).mark_failed();
        self.mark_dirty(id);
    }

    pub fn read_block(&self, id: NodeId) -> Result<Block, ChainStateError> {
        let node = self.index.node(id);
        let pos = node.block_pos().ok_or(ChainStateError::MissingBlockData)?;
        let bytes = self.files.read_block(pos)?;
        let block = Block::consensus_decode(&bytes)?;
        if block.hash() != node.hash {
            return Err(ChainStateError::BlockHashMismatch);
        }
        Ok(block)
    }

    /// Apply the stored body of `id` to the coins view and make it the tip.
    ///
    /// `id` must extend the active tip. An input that is missing, already
    /// spent or an immature coinbase marks the block failed; nothing in the
    /// coins view changes on error.
    pub fn connect_block(&mut self, id: NodeId) -> Result<(), ChainStateError> {
        let node = self.index.node(id);
        if node.prev != self.index.tip() || (node.prev.is_none() && !self.index.is_genesis(id)) {
            return Err(ChainStateError::NotTipExtension);
        }
        let block = self.read_block(id)?;

        self.coins.begin();
        match self.connect_inputs(id, &block) {
            Ok(undo) => {
                let node = self.index.node(id);
                let (hash, file_id) = (node.hash, node.file);
                let pos = match write_block_undo(self.files.as_mut(), &undo, &hash, file_id) {
                    Ok(pos) => pos,
                    Err(err) => {
                        self.coins.rollback();
                        log_error!("failed to write undo for {}: {err}", hash256_to_hex(&hash));
                        return Err(err.into());
                    }
                };
                self.coins.commit();

                let parent_tx = node
                    .prev
                    .map(|prev| self.index.node(prev).chain_tx_count)
                    .unwrap_or(0);
                let node = self.index.node_mut(id);
                node.undo_pos = pos.offset;
                node.status |= BLOCK_HAVE_UNDO;
                node.chain_tx_count = parent_tx + u64::from(node.tx_count);
                node.raise_validity(BlockValidity::Chain);
                let height = node.height;
                self.index.set_tip(Some(id));
                self.mark_dirty(id);
                log_debug!("connected {} at height {height}", hash256_to_hex(&hash));
                Ok(())
            }
            Err(err) => {
                self.coins.rollback();
                if let ChainStateError::Validation(reason) = &err {
                    log_warn!(
                        "block {} failed to connect: {reason}",
                        hash256_to_hex(&self.index.node(id).hash)
                    );
                    self.invalidate(id);
                }
                Err(err)
            }
        }
    }

    fn connect_inputs(&mut self, id: NodeId, block: &Block) -> Result<BlockUndo, ChainStateError> {
        let height = self.index.node(id).height;
        let mut undo = BlockUndo::default();
        for (tx_index, tx) in block.transactions.iter().enumerate() {
            if tx_index > 0 {
                let mut tx_undo = TxUndo::default();
                let mut value_in = 0i64;
                for input in &tx.vin {
                    let coin = self.coins.spend(&input.prevout)?.ok_or(
                        ValidationError::InvalidTransaction("bad-txns-inputs-missingorspent"),
                    )?;
                    if coin.is_coinbase && height - coin.height < COINBASE_MATURITY {
                        return Err(ValidationError::InvalidTransaction(
                            "bad-txns-premature-spend-of-coinbase",
                        )
                        .into());
                    }
                    value_in = value_in
                        .checked_add(coin.out.value)
                        .ok_or(ValidationError::ValueOutOfRange)?;
                    tx_undo.prevouts.push(coin);
                }
                let value_out = tx
                    .total_output_value()
                    .ok_or(ValidationError::ValueOutOfRange)?;
                if value_in < value_out {
                    return Err(ValidationError::InvalidTransaction("bad-txns-in-belowout").into());
                }
                undo.txs.push(tx_undo);
            }

            let txid = tx.txid();
            for (vout, output) in tx.vout.iter().enumerate() {
                if output.is_unspendable() {
                    continue;
                }
                let coin = Coin::new(output.clone(), height, tx_index == 0);
                if self.coins.add(&OutPoint::new(txid, vout as u32), coin)? {
                    log_debug!("output {}:{vout} overwrote an unspent coin", hash256_to_hex(&txid));
                }
            }
        }
        Ok(undo)
    }

    /// Roll the active tip back one block using its undo record.
    ///
    /// `Failed` leaves both the coins view and the tip as they were.
    pub fn disconnect_tip(&mut self) -> Result<DisconnectResult, ChainStateError> {
        let tip = self.index.tip().ok_or(ChainStateError::EmptyChain)?;
        let block = self.read_block(tip)?;
        let node = self.index.node(tip);
        let pos = node.undo_block_pos().ok_or(ChainStateError::MissingUndo)?;
        let (hash, prev) = (node.hash, node.prev);
        let undo = read_block_undo(self.files.as_ref(), pos, &hash)?;

        self.coins.begin();
        let result = apply_block_undo(&undo, &block, &mut self.coins);
        if result == DisconnectResult::Failed {
            self.coins.rollback();
            log_error!("failed to disconnect {}", hash256_to_hex(&hash));
            return Ok(result);
        }
        self.coins.commit();
        self.index.set_tip(prev);
        if result == DisconnectResult::Unclean {
            log_warn!("disconnect of {} was unclean", hash256_to_hex(&hash));
        }
        Ok(result)
    }

    /// Persist dirty index entries, cached coins, block file metadata and
    /// the tip marker in one batch.
    pub fn flush(&mut self) -> Result<(), ChainStateError> {
        let mut batch = WriteBatch::new();
        for id in &self.dirty {
            let node = self.index.node(*id);
            batch.put(Column::BlockIndex, node.hash, node.encode());
        }
        let coins = self.coins.write_into(&mut batch);
        for (file_id, info) in self.files.file_infos() {
            batch.put(Column::FileInfo, block_file_info_key(file_id), info.encode());
        }
        match self.index.tip() {
            Some(tip) => batch.put(Column::Meta, BEST_BLOCK_KEY, self.index.node(tip).hash),
            None => batch.delete(Column::Meta, BEST_BLOCK_KEY),
        }
        if let Err(err) = self.store.write_batch(&batch) {
            log_error!("flush failed, keeping {coins} dirty coins: {err}");
            return Err(err.into());
        }
        self.coins.mark_flushed();
        log_debug!(
            "flushed {} index entries and {coins} coins",
            self.dirty.len()
        );
        self.dirty.clear();
        Ok(())
    }

    /// Rebuild the in-memory index from the store.
    pub fn load_block_index(&mut self) -> Result<(), ChainStateError> {
        let mut nodes = Vec::new();
        for (_, value) in self.store.scan_prefix(Column::BlockIndex, &[])? {
            nodes.push(BlockIndexNode::decode(&value)?);
        }
        nodes.sort_by_key(|node| node.height);

        let mut index = ChainIndex::new(self.params.consensus.hash_genesis_block);
        let mut ids = Vec::with_capacity(nodes.len());
        for mut node in nodes {
            let proof = block_proof(node.bits)
                .map_err(|_| ChainStateError::CorruptIndex("stored header has invalid bits"))?;
            if node.hash == self.params.consensus.hash_genesis_block {
                node.prev = None;
                node.chain_work = proof;
                node.time_max = node.time;
            } else {
                let prev = index
                    .find(&node.prev_hash)
                    .ok_or(ChainStateError::CorruptIndex("block index entry without parent"))?;
                let parent = index.node(prev);
                node.prev = Some(prev);
                node.chain_work = parent.chain_work + proof;
                node.time_max = parent.time_max.max(node.time);
            }
            ids.push(index.insert(node)?);
        }

        for id in ids {
            if !index.node(id).has_data() || index.in_branch(id) {
                continue;
            }
            if index.is_genesis(id) || index.parent_in_branch(id) {
                index.attach_to_branch(id)?;
            } else if index.attach_to_orphan(id).is_err() {
                log_warn!(
                    "stored block {} has no usable ancestry",
                    hash256_to_hex(&index.node(id).hash)
                );
            }
        }

        for (key, value) in self.store.scan_prefix(Column::FileInfo, &[])? {
            let (Some(file_id), Some(info)) =
                (parse_block_file_info_key(&key), FlatFileInfo::decode(&value))
            else {
                return Err(ChainStateError::CorruptIndex("invalid block file info"));
            };
            self.files.restore_file_info(file_id, info);
        }

        if let Some(bytes) = self.store.get(Column::Meta, BEST_BLOCK_KEY)? {
            let hash: Hash256 = bytes
                .as_slice()
                .try_into()
                .map_err(|_| ChainStateError::CorruptIndex("invalid best block marker"))?;
            let tip = index
                .find(&hash)
                .ok_or(ChainStateError::CorruptIndex("best block not in index"))?;
            index.set_tip(Some(tip));
        }

        log_info!(
            "loaded {} block index entries, height {}",
            index.len(),
            index.height()
        );
        self.index = index;
        self.dirty.clear();
        Ok(())
    }
}

/// Thread-safe handle. The IBD answer is read without the lock once the
/// latch has pinned.
pub struct SharedChainState<S: KeyValueStore> {
    inner: Arc<Mutex<ChainState<S>>>,
    ibd: Arc<IbdLatch>,
}

impl<S: KeyValueStore> Clone for SharedChainState<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            ibd: Arc::clone(&self.ibd),
        }
    }
}

impl<S: KeyValueStore> SharedChainState<S> {
    pub fn new(state: ChainState<S>) -> Self {
        let ibd = state.ibd_latch();
        Self {
            inner: Arc::new(Mutex::new(state)),
            ibd,
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, ChainState<S>>, ChainStateError> {
        self.inner.lock().map_err(|_| ChainStateError::Poisoned)
    }

    pub fn is_initial_block_download(&self) -> Result<bool, ChainStateError> {
        if self.ibd.is_done() {
            return Ok(false);
        }
        Ok(self.lock()?.is_initial_block_download())
    }
}
