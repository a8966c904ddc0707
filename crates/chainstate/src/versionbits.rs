//! Deployment activation as seen from a given parent block.

use utxod_consensus::upgrades::{network_upgrade_active, NetworkUpgrade, UpgradeIndex, MAX_NETWORK_UPGRADES};

use crate::blockindex::NodeId;
use crate::index::ChainIndex;

pub trait DeploymentState: Send {
    /// Whether `upgrade` applies to a block built on `prev`. No parent means
    /// the genesis block, for which nothing is active.
    fn is_active(&self, upgrade: UpgradeIndex, index: &ChainIndex, prev: Option<NodeId>) -> bool;
}

/// Deployments with a fixed activation height or median-time threshold.
pub struct BuriedDeployments {
    upgrades: [NetworkUpgrade; MAX_NETWORK_UPGRADES],
}

impl BuriedDeployments {
    pub fn new(upgrades: [NetworkUpgrade; MAX_NETWORK_UPGRADES]) -> Self {
        Self { upgrades }
    }
}

impl DeploymentState for BuriedDeployments {
    fn is_active(&self, upgrade: UpgradeIndex, index: &ChainIndex, prev: Option<NodeId>) -> bool {
        let Some(prev) = prev else {
            return false;
        };
        let height = index.node(prev).height + 1;
        let prev_mtp = index.median_time_past(prev);
        network_upgrade_active(height, prev_mtp, &self.upgrades, upgrade)
    }
}
