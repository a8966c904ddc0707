//! Initial block download detection.
//!
//! The answer only ever moves from "syncing" to "done". Once done it is
//! pinned for the life of the latch and the inputs are never looked at again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use primitive_types::U256;
use utxod_consensus::ChainTxData;
use utxod_log::log_info;

use crate::blockindex::BlockIndexNode;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IbdState {
    Syncing,
    Done,
}

/// Chain state snapshot the latch evaluates before pinning.
#[derive(Clone, Copy, Debug)]
pub struct IbdInputs {
    pub importing: bool,
    pub reindexing: bool,
    /// Work and timestamp of the active tip, `None` for an empty chain.
    pub tip: Option<(U256, i64)>,
    pub minimum_chain_work: U256,
    pub now: i64,
    pub max_tip_age: i64,
}

impl IbdInputs {
    /// Why the node still counts as syncing, or `None` when it does not.
    pub fn reason(&self) -> Option<&'static str> {
        if self.importing {
            return Some("importing");
        }
        if self.reindexing {
            return Some("reindexing");
        }
        let Some((work, time)) = self.tip else {
            return Some("empty chain");
        };
        if work < self.minimum_chain_work {
            return Some("tip work below minimum");
        }
        if time < self.now - self.max_tip_age {
            return Some("tip too old");
        }
        None
    }
}

#[derive(Debug, Default)]
pub struct IbdLatch {
    done: AtomicBool,
    transition: Mutex<()>,
}

impl IbdLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> IbdState {
        if self.is_done() {
            IbdState::Done
        } else {
            IbdState::Syncing
        }
    }

    /// `inputs` is only evaluated while the latch is still open.
    pub fn is_initial_block_download<F>(&self, inputs: F) -> bool
    where
        F: FnOnce() -> IbdInputs,
    {
        if self.done.load(Ordering::Relaxed) {
            return false;
        }
        let _guard = self
            .transition
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.done.load(Ordering::Acquire) {
            return false;
        }
        if inputs().reason().is_some() {
            return true;
        }
        self.done.store(true, Ordering::Release);
        log_info!("leaving initial block download");
        false
    }
}

/// Estimated fraction of all transactions up to `now` that `node` covers.
pub fn guess_verification_progress(
    data: &ChainTxData,
    node: Option<&BlockIndexNode>,
    now: i64,
) -> f64 {
    let Some(node) = node else {
        return 0.0;
    };
    let chain_tx = node.chain_tx_count as f64;
    let total = if node.chain_tx_count <= data.tx_count {
        data.tx_count as f64 + (now - data.time) as f64 * data.tx_rate
    } else {
        chain_tx + (now - node.block_time()) as f64 * data.tx_rate
    };
    if total <= 0.0 {
        return 0.0;
    }
    chain_tx / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use utxod_primitives::block::BlockHeader;

    fn synced() -> IbdInputs {
        IbdInputs {
            importing: false,
            reindexing: false,
            tip: Some((U256::from(10u64), 1_000)),
            minimum_chain_work: U256::from(5u64),
            now: 1_100,
            max_tip_age: 500,
        }
    }

    #[test]
    fn reasons_are_checked_in_order() {
        let mut inputs = synced();
        assert_eq!(inputs.reason(), None);
        inputs.tip = Some((U256::from(1u64), 1_000));
        assert_eq!(inputs.reason(), Some("tip work below minimum"));
        inputs.tip = None;
        assert_eq!(inputs.reason(), Some("empty chain"));
        inputs.reindexing = true;
        assert_eq!(inputs.reason(), Some("reindexing"));
        inputs.importing = true;
        assert_eq!(inputs.reason(), Some("importing"));

        let mut stale = synced();
        stale.now = 2_000;
        assert_eq!(stale.reason(), Some("tip too old"));
    }

    #[test]
    fn latch_pins_once_done() {
        let latch = IbdLatch::new();
        assert!(latch.is_initial_block_download(|| IbdInputs {
            tip: None,
            ..synced()
        }));
        assert_eq!(latch.state(), IbdState::Syncing);
        assert!(!latch.is_initial_block_download(synced));
        assert_eq!(latch.state(), IbdState::Done);

        let evaluated = Cell::new(false);
        assert!(!latch.is_initial_block_download(|| {
            evaluated.set(true);
            IbdInputs {
                importing: true,
                ..synced()
            }
        }));
        assert!(!evaluated.get());
    }

    #[test]
    fn progress_estimate() {
        let data = ChainTxData {
            time: 1_000,
            tx_count: 100,
            tx_rate: 1.0,
        };
        let mut node = BlockIndexNode::from_header(&BlockHeader {
            version: 4,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 900,
            bits: 0x207f_ffff,
            nonce: 0,
        });
        assert_eq!(guess_verification_progress(&data, None, 1_100), 0.0);

        node.chain_tx_count = 50;
        let progress = guess_verification_progress(&data, Some(&node), 1_100);
        assert!((progress - 0.25).abs() < 1e-9);

        node.chain_tx_count = 300;
        let progress = guess_verification_progress(&data, Some(&node), 1_000);
        assert!((progress - 300.0 / 400.0).abs() < 1e-9);

        let empty = ChainTxData {
            time: 0,
            tx_count: 0,
            tx_rate: 0.0,
        };
        node.chain_tx_count = 0;
        assert_eq!(guess_verification_progress(&empty, Some(&node), 0), 0.0);
    }
}
