#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;
use utxod_chainstate::accept::{AcceptError, AcceptedBlock};
use utxod_chainstate::config::ChainConfig;
use utxod_chainstate::disk::{BlockFiles, FlatFileBlocks};
use utxod_chainstate::rules::script_push_int;
use utxod_chainstate::state::ChainState;
use utxod_chainstate::validation::block_merkle_root;
use utxod_chainstate::NodeId;
use utxod_consensus::params::{chain_params, ChainParams, Network};
use utxod_pow::validation::validate_pow_header;
use utxod_primitives::block::{Block, BlockHeader};
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::{Transaction, TxIn, TxOut, SEQUENCE_FINAL};
use utxod_storage::memory::MemoryStore;

pub const REGTEST_BITS: u32 = 0x207f_ffff;
pub const GENESIS_TIME: u32 = 1_600_000_000;
pub const BLOCK_SPACING: u32 = 60;
pub const COIN: i64 = 100_000_000;

pub fn coinbase(height: i32, tag: u8) -> Transaction {
    let mut script_sig = script_push_int(i64::from(height));
    script_sig.extend_from_slice(&[0x00, tag]);
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: 50 * COIN,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

pub fn spend(prevout: OutPoint, value: i64) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout,
            script_sig: vec![0x51],
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![0x52],
        }],
        lock_time: 0,
    }
}

/// Search nonces until the header meets the regtest target.
pub fn mine(header: &mut BlockHeader, params: &ChainParams) {
    while validate_pow_header(header, &params.consensus).is_err() {
        header.nonce = header.nonce.wrapping_add(1);
    }
}

pub fn make_block(
    params: &ChainParams,
    prev_hash: [u8; 32],
    time: u32,
    transactions: Vec<Transaction>,
) -> Block {
    let mut block = Block::new(
        BlockHeader {
            version: 4,
            prev_block: prev_hash,
            merkle_root: [0u8; 32],
            time,
            bits: REGTEST_BITS,
            nonce: 0,
        },
        transactions,
    );
    block.header.merkle_root = block_merkle_root(&block).0;
    mine(&mut block.header, params);
    block
}

pub fn genesis_block() -> Block {
    let params = chain_params(Network::Regtest);
    make_block(&params, [0u8; 32], GENESIS_TIME, vec![coinbase(0, 0)])
}

/// Regtest parameters rooted at [`genesis_block`].
pub fn regtest_params(genesis: &Block) -> ChainParams {
    let mut params = chain_params(Network::Regtest);
    params.consensus.hash_genesis_block = genesis.hash();
    params.consensus.genesis_time = genesis.header.time;
    params
}

pub fn regtest_config() -> ChainConfig {
    let mut config = ChainConfig::for_network(Network::Regtest);
    config.block_file_size = 16 * 1024 * 1024;
    config
}

pub struct Harness {
    pub state: ChainState<MemoryStore>,
    pub store: Arc<MemoryStore>,
    pub params: ChainParams,
    pub genesis: Block,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(regtest_config())
    }

    pub fn with_config(config: ChainConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = FlatFileBlocks::open(dir.path(), config.block_file_size).expect("flatfiles");
        Self::with_files(config, dir, Box::new(files))
    }

    pub fn with_files(config: ChainConfig, dir: TempDir, files: Box<dyn BlockFiles>) -> Self {
        let genesis = genesis_block();
        let params = regtest_params(&genesis);
        Self::assemble(params, genesis, config, dir, files)
    }

    /// A harness over regtest parameters changed by `adjust`.
    pub fn with_params(config: ChainConfig, adjust: impl FnOnce(&mut ChainParams)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = FlatFileBlocks::open(dir.path(), config.block_file_size).expect("flatfiles");
        let genesis = genesis_block();
        let mut params = regtest_params(&genesis);
        adjust(&mut params);
        Self::assemble(params, genesis, config, dir, Box::new(files))
    }

    fn assemble(
        params: ChainParams,
        genesis: Block,
        config: ChainConfig,
        dir: TempDir,
        files: Box<dyn BlockFiles>,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let mut state = ChainState::new(params.clone(), config, Arc::clone(&store), files);
        state.set_mock_time(Some(i64::from(GENESIS_TIME) + 3_600));
        Self {
            state,
            store,
            params,
            genesis,
            dir,
        }
    }

    /// Reopen a state over the same store and block directory.
    pub fn reopen(&self) -> ChainState<MemoryStore> {
        self.reopen_with(regtest_config())
    }

    pub fn reopen_with(&self, config: ChainConfig) -> ChainState<MemoryStore> {
        let mut state = ChainState::open(
            self.params.clone(),
            config,
            Arc::clone(&self.store),
            self.dir.path(),
        )
        .expect("reopen");
        state.set_mock_time(Some(i64::from(GENESIS_TIME) + 3_600));
        state
    }

    pub fn accept(&mut self, block: &mut Block) -> Result<AcceptedBlock, AcceptError> {
        self.state.accept_block(block, true, None)
    }

    pub fn accept_and_connect(&mut self, mut block: Block) -> NodeId {
        let accepted = self.accept(&mut block).expect("accept");
        self.state.connect_block(accepted.node).expect("connect");
        accepted.node
    }

    pub fn connect_genesis(&mut self) -> NodeId {
        let genesis = self.genesis.clone();
        self.accept_and_connect(genesis)
    }

    /// A block on top of `prev` carrying a coinbase plus `extra`.
    pub fn child_of(&self, prev: NodeId, tag: u8, extra: Vec<Transaction>) -> Block {
        let parent = self.state.node(prev);
        let height = parent.height + 1;
        let mut transactions = vec![coinbase(height, tag)];
        transactions.extend(extra);
        make_block(
            &self.params,
            parent.hash,
            parent.time + BLOCK_SPACING,
            transactions,
        )
    }

    /// Connect `count` plain blocks on the active tip.
    pub fn extend(&mut self, count: usize) -> Vec<Block> {
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            let tip = self.state.tip().expect("tip");
            let block = self.child_of(tip, 0, Vec::new());
            blocks.push(block.clone());
            self.accept_and_connect(block);
        }
        blocks
    }
}
