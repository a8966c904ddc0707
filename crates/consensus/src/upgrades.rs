//! Network upgrade schedule.
//!
//! Upgrades activate either at a fixed height (buried soft forks) or once the
//! median time past of the previous block reaches a unix timestamp.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum UpgradeIndex {
    Bip34 = 0,
    Csv = 1,
    Uahf = 2,
    Monolith = 3,
}

pub const MAX_NETWORK_UPGRADES: usize = 4;

impl UpgradeIndex {
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            UpgradeIndex::Bip34 => "bip34",
            UpgradeIndex::Csv => "csv",
            UpgradeIndex::Uahf => "uahf",
            UpgradeIndex::Monolith => "monolith",
        }
    }
}

pub type Hash256 = [u8; 32];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Activation {
    /// Active for every block at or above this height.
    Height(i32),
    /// Active once the previous block's median time past reaches this time.
    MedianTime(i64),
    Never,
}

#[derive(Clone, Copy, Debug)]
pub struct NetworkUpgrade {
    pub activation: Activation,
}

impl NetworkUpgrade {
    pub const ALWAYS_ACTIVE: NetworkUpgrade = NetworkUpgrade {
        activation: Activation::Height(0),
    };
    pub const NEVER: NetworkUpgrade = NetworkUpgrade {
        activation: Activation::Never,
    };

    pub const fn at_height(height: i32) -> Self {
        Self {
            activation: Activation::Height(height),
        }
    }

    pub const fn at_time(time: i64) -> Self {
        Self {
            activation: Activation::MedianTime(time),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpgradeState {
    Disabled,
    Pending,
    Active,
}

/// State of an upgrade for the block at `height` whose parent has median
/// time past `prev_median_time_past`.
pub fn network_upgrade_state(
    height: i32,
    prev_median_time_past: i64,
    upgrades: &[NetworkUpgrade; MAX_NETWORK_UPGRADES],
    idx: UpgradeIndex,
) -> UpgradeState {
    match upgrades[idx.as_usize()].activation {
        Activation::Never => UpgradeState::Disabled,
        Activation::Height(activation) if height >= activation => UpgradeState::Active,
        Activation::MedianTime(activation) if prev_median_time_past >= activation => {
            UpgradeState::Active
        }
        _ => UpgradeState::Pending,
    }
}

pub fn network_upgrade_active(
    height: i32,
    prev_median_time_past: i64,
    upgrades: &[NetworkUpgrade; MAX_NETWORK_UPGRADES],
    idx: UpgradeIndex,
) -> bool {
    network_upgrade_state(height, prev_median_time_past, upgrades, idx) == UpgradeState::Active
}
