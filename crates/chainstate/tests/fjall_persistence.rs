#![cfg(feature = "fjall")]

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{
    coinbase, genesis_block, make_block, regtest_config, regtest_params, BLOCK_SPACING,
    GENESIS_TIME,
};
use utxod_chainstate::state::ChainState;
use utxod_primitives::outpoint::OutPoint;
use utxod_storage::fjall::FjallStore;
use utxod_storage::{Column, KeyValueStore};

fn open_state(data_dir: &Path, store: Arc<FjallStore>) -> ChainState<FjallStore> {
    let genesis = genesis_block();
    let mut state = ChainState::open(
        regtest_params(&genesis),
        regtest_config(),
        store,
        &data_dir.join("blocks"),
    )
    .expect("open chainstate");
    state.set_mock_time(Some(i64::from(GENESIS_TIME) + 3_600));
    state
}

#[test]
fn chainstate_reloads_from_fjall() {
    let dir = tempfile::tempdir().expect("tempdir");
    let genesis = genesis_block();
    let params = regtest_params(&genesis);

    let mut blocks = vec![genesis];
    for height in 1..=2 {
        let parent = &blocks[blocks.len() - 1];
        let block = make_block(
            &params,
            parent.hash(),
            parent.header.time + BLOCK_SPACING,
            vec![coinbase(height, 0)],
        );
        blocks.push(block);
    }
    let newest = OutPoint::new(blocks[2].transactions[0].txid(), 0);

    let store = Arc::new(FjallStore::open(dir.path().join("db")).expect("open fjall"));
    let mut state = open_state(dir.path(), Arc::clone(&store));
    for block in &blocks {
        let mut block = block.clone();
        let accepted = state.accept_block(&mut block, true, None).expect("accept");
        state.connect_block(accepted.node).expect("connect");
    }
    state.flush().expect("flush");
    drop(state);
    store.persist().expect("persist");
    drop(store);

    let store = Arc::new(FjallStore::open(dir.path().join("db")).expect("reopen fjall"));
    assert_eq!(store.scan_prefix(Column::Utxo, &[]).expect("scan").len(), 3);
    assert_eq!(store.scan_prefix(Column::BlockIndex, &[]).expect("scan").len(), 3);

    let mut state = open_state(dir.path(), store);
    assert_eq!(state.height(), 2);
    let tip = state.tip().expect("tip");
    assert_eq!(state.node(tip).hash, blocks[2].hash());
    assert!(state.coin(&newest).expect("coin").is_some());
    assert_eq!(state.read_block(tip).expect("read block"), blocks[2]);

    state.disconnect_tip().expect("disconnect");
    assert_eq!(state.height(), 1);
    assert!(state.coin(&newest).expect("coin").is_none());
    state.flush().expect("flush after disconnect");
}
