mod common;

use common::{coinbase, make_block, spend, Harness, BLOCK_SPACING};
use utxod_chainstate::accept::AcceptError;
use utxod_chainstate::config::ChainConfig;
use utxod_chainstate::disk::{BlockFiles, DiskBlockPos, FlatFileBlocks};
use utxod_chainstate::filemeta::FlatFileInfo;
use utxod_chainstate::flatfiles::FlatFileError;
use utxod_chainstate::validation::ValidationError;
use utxod_consensus::params::hash256_to_hex;
use utxod_consensus::Network;
use utxod_log::{captured_contains, enable_capture, Level};
use utxod_primitives::outpoint::OutPoint;

#[test]
fn header_acceptance_is_idempotent() {
    let mut harness = Harness::new();
    let header = harness.genesis.header.clone();
    let first = harness.state.accept_block_header(&header).expect("header");
    let second = harness.state.accept_block_header(&header).expect("header again");
    assert_eq!(first, second);
    assert_eq!(harness.state.index().len(), 1);
    assert!(!harness.state.node(first).has_data());
}

#[test]
fn header_without_parent_is_rejected() {
    let mut harness = Harness::new();
    harness.connect_genesis();
    let orphan = make_block(
        &harness.params,
        [7u8; 32],
        harness.genesis.header.time + BLOCK_SPACING,
        vec![coinbase(1, 0)],
    );
    let err = harness
        .state
        .accept_block_header(&orphan.header)
        .expect_err("no parent");
    assert!(matches!(err, AcceptError::NoParent));
    assert_eq!(err.code(), 3102);
    assert_eq!(harness.state.index().len(), 1);
}

#[test]
fn invalid_body_marks_header_known_invalid() {
    let mut harness = Harness::new();
    let genesis = harness.connect_genesis();
    let mut bad = harness.child_of(genesis, 0, Vec::new());
    bad.transactions = vec![spend(OutPoint::new([3u8; 32], 0), 1)];
    bad.header.merkle_root = utxod_chainstate::validation::block_merkle_root(&bad).0;
    common::mine(&mut bad.header, &harness.params);

    let err = harness.accept(&mut bad).expect_err("missing coinbase");
    assert!(matches!(err, AcceptError::Invalid(ValidationError::MissingCoinbase)));
    assert_eq!(err.reject_reason(), "bad-cb-missing");
    assert_eq!(err.code(), 0x10);

    let id = harness.state.find(&bad.hash()).expect("header kept");
    assert!(harness.state.node(id).is_failed());

    let again = harness
        .state
        .accept_block_header(&bad.header)
        .expect_err("known invalid");
    assert!(matches!(again, AcceptError::KnownInvalid(known) if known == id));
    assert_eq!(again.code(), 3103);

    let child = make_block(
        &harness.params,
        bad.hash(),
        bad.header.time + BLOCK_SPACING,
        vec![coinbase(2, 0)],
    );
    let err = harness
        .state
        .accept_block_header(&child.header)
        .expect_err("failed parent");
    assert!(matches!(err, AcceptError::InvalidParent));
}

#[test]
fn duplicated_transactions_are_rejected() {
    let mut harness = Harness::new();
    let genesis = harness.connect_genesis();
    let parent = harness.state.node(genesis).clone();
    let cb = coinbase(1, 0);
    let mut block = make_block(
        &harness.params,
        parent.hash,
        parent.time + BLOCK_SPACING,
        vec![cb.clone(), cb],
    );
    let err = harness.accept(&mut block).expect_err("duplicate");
    assert_eq!(err.reject_reason(), "bad-txns-duplicate");
}

#[test]
fn already_stored_block_is_not_new() {
    let mut harness = Harness::new();
    enable_capture(1024);
    let mut genesis = harness.genesis.clone();
    let first = harness.accept(&mut genesis).expect("accept");
    assert!(first.is_new);
    let second = harness.accept(&mut genesis).expect("accept again");
    assert!(!second.is_new);
    assert_eq!(first.node, second.node);
    assert_eq!(first.pos, second.pos);
    assert!(captured_contains(
        Level::Warn,
        &format!("block {} already stored", hash256_to_hex(&genesis.hash()))
    ));
}

#[test]
fn unrequested_block_needs_more_work() {
    let mut harness = Harness::new();
    let genesis = harness.connect_genesis();
    let block_a = harness.child_of(genesis, 1, Vec::new());
    let a = harness.accept_and_connect(block_a);

    let mut block_b = harness.child_of(genesis, 2, Vec::new());
    let err = harness
        .state
        .accept_block(&mut block_b, false, None)
        .expect_err("equal work");
    assert!(matches!(err, AcceptError::InsufficientWork));
    assert_eq!(err.code(), 3008);

    let b = harness.state.find(&block_b.hash()).expect("header kept");
    let node = harness.state.node(b);
    assert!(!node.is_failed());
    assert!(!node.has_data());
    assert_eq!(node.chain_work, harness.state.node(a).chain_work);
    assert_eq!(harness.state.tip(), Some(a));
}

#[test]
fn unrequested_block_too_far_ahead_is_not_written() {
    let mut config = common::regtest_config();
    config.min_blocks_to_keep = 1;
    let mut harness = Harness::with_config(config);
    let genesis = harness.connect_genesis();

    let mut block1 = harness.child_of(genesis, 0, Vec::new());
    let first = harness.accept(&mut block1).expect("requested");
    let mut block2 = harness.child_of(first.node, 0, Vec::new());

    let err = harness
        .state
        .accept_block(&mut block2, false, None)
        .expect_err("too far ahead");
    assert!(matches!(err, AcceptError::TooFarAhead));
    assert_eq!(err.code(), 3007);
    let id = harness.state.find(&block2.hash()).expect("header kept");
    assert!(!harness.state.node(id).has_data());
    assert!(!harness.state.node(id).is_failed());
}

struct ReadOnlyFiles(FlatFileBlocks);

impl BlockFiles for ReadOnlyFiles {
    fn find_block_pos(
        &mut self,
        known: Option<DiskBlockPos>,
        size: u64,
        height: i32,
        time: u32,
    ) -> Result<DiskBlockPos, FlatFileError> {
        self.0.find_block_pos(known, size, height, time)
    }

    fn write_block(&mut self, _pos: DiskBlockPos, _bytes: &[u8]) -> Result<(), FlatFileError> {
        Err(FlatFileError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only",
        )))
    }

    fn read_block(&self, pos: DiskBlockPos) -> Result<Vec<u8>, FlatFileError> {
        self.0.read_block(pos)
    }

    fn write_undo(&mut self, file_id: u32, bytes: &[u8]) -> Result<DiskBlockPos, FlatFileError> {
        self.0.write_undo(file_id, bytes)
    }

    fn open_undo_file(&self, pos: DiskBlockPos) -> Result<Vec<u8>, FlatFileError> {
        self.0.open_undo_file(pos)
    }

    fn file_infos(&self) -> Vec<(u32, FlatFileInfo)> {
        self.0.file_infos()
    }
}

#[test]
fn write_failure_is_reported_without_marking_invalid() {
    let dir = tempfile::tempdir().expect("tempdir");
    let files = FlatFileBlocks::open(dir.path(), 1 << 20).expect("flatfiles");
    let mut harness = Harness::with_files(
        ChainConfig::for_network(Network::Regtest),
        dir,
        Box::new(ReadOnlyFiles(files)),
    );
    let mut genesis = harness.genesis.clone();
    let err = harness.accept(&mut genesis).expect_err("write fails");
    assert!(matches!(err, AcceptError::Write(_)));
    assert_eq!(err.code(), 2001);
    assert!(!err.is_invalid());

    let id = harness.state.find(&genesis.hash()).expect("header kept");
    assert!(!harness.state.node(id).has_data());
    assert!(!harness.state.node(id).is_failed());
}

#[test]
fn orphan_joins_branch_when_parent_body_arrives() {
    let mut harness = Harness::new();
    let genesis = harness.connect_genesis();
    let mut block1 = harness.child_of(genesis, 0, Vec::new());
    let id1 = harness
        .state
        .accept_block_header(&block1.header)
        .expect("header 1");
    let mut block2 = harness.child_of(id1, 0, Vec::new());

    let id2 = harness.accept(&mut block2).expect("body 2").node;
    assert!(harness.state.index().is_orphan(id2));
    assert!(!harness.state.index().in_branch(id2));

    harness.accept(&mut block1).expect("body 1");
    assert!(harness.state.index().in_branch(id1));
    assert!(harness.state.index().in_branch(id2));
    assert!(!harness.state.index().is_orphan(id2));
    assert_eq!(harness.state.index().best_branch_head(), Some(id2));
}

#[test]
fn chain_work_and_time_max_accumulate() {
    let mut harness = Harness::new();
    let genesis = harness.connect_genesis();
    let block = harness.child_of(genesis, 0, Vec::new());
    let id = harness.accept_and_connect(block);
    let parent = harness.state.node(genesis);
    let node = harness.state.node(id);
    assert_eq!(node.height, 1);
    assert!(node.chain_work > parent.chain_work);
    assert_eq!(node.chain_work, parent.chain_work + parent.chain_work);
    assert_eq!(node.time_max, node.time);
}

#[test]
fn body_under_failed_parent_logs_broken_ancestry() {
    enable_capture(1024);
    let mut harness = Harness::new();
    let genesis = harness.connect_genesis();
    let block1 = harness.child_of(genesis, 5, Vec::new());
    let id1 = harness
        .state
        .accept_block_header(&block1.header)
        .expect("header 1");
    let mut block2 = harness.child_of(id1, 5, Vec::new());
    harness
        .state
        .accept_block_header(&block2.header)
        .expect("header 2");

    let mut tampered = block1.clone();
    tampered.transactions = vec![coinbase(1, 6)];
    let err = harness.accept(&mut tampered).expect_err("merkle mismatch");
    assert_eq!(err.reject_reason(), "bad-txnmrklroot");
    assert!(harness.state.node(id1).is_failed());

    let id2 = harness.accept(&mut block2).expect("body 2").node;
    assert!(harness.state.node(id2).has_data());
    assert!(!harness.state.index().is_orphan(id2));
    assert!(!harness.state.index().in_branch(id2));
    assert!(captured_contains(
        Level::Warn,
        &format!("block {} has broken ancestry", hash256_to_hex(&block2.hash()))
    ));
}
