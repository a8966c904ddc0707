//! Consensus parameter definitions.

use crate::upgrades::{Hash256, NetworkUpgrade, UpgradeIndex, MAX_NETWORK_UPGRADES};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Some(Network::Mainnet),
            "test" | "testnet" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub genesis_time: u32,
    pub upgrades: [NetworkUpgrade; MAX_NETWORK_UPGRADES],
    pub checkpoints: Vec<Checkpoint>,
    pub pow_limit: Hash256,
    pub pow_target_spacing: i64,
    pub pow_target_timespan: i64,
    pub pow_allow_min_difficulty_blocks: bool,
    pub pow_no_retargeting: bool,
    pub minimum_chain_work: Hash256,
}

impl ConsensusParams {
    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan / self.pow_target_spacing
    }

    pub fn activation_height(&self, idx: UpgradeIndex) -> Option<i32> {
        match self.upgrades[idx.as_usize()].activation {
            crate::upgrades::Activation::Height(height) => Some(height),
            _ => None,
        }
    }

    pub fn checkpoint_at(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hash hex must be 1 to 64 digits"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parse a big-endian display hex string into little-endian hash bytes.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let padded = format!("{hex:0>64}");
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();

    Ok(bytes)
}

/// Inverse of [`hash256_from_hex`].
pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

/// Transaction throughput snapshot used to estimate sync progress.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChainTxData {
    /// Unix time of the last known transaction count.
    pub time: i64,
    /// Total transactions between genesis and `time`.
    pub tx_count: u64,
    /// Estimated transactions per second after `time`.
    pub tx_rate: f64,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    pub chain_tx_data: ChainTxData,
    pub message_start: [u8; 4],
    pub default_port: u16,
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            consensus: mainnet_consensus_params(),
            chain_tx_data: ChainTxData {
                time: 1_522_608_381,
                tx_count: 248_589_038,
                tx_rate: 3.2,
            },
            message_start: [0xe3, 0xe1, 0xf3, 0xe8],
            default_port: 8_333,
        },
        Network::Testnet => ChainParams {
            network,
            consensus: testnet_consensus_params(),
            chain_tx_data: ChainTxData {
                time: 1_522_608_016,
                tx_count: 15_052_068,
                tx_rate: 0.15,
            },
            message_start: [0xf4, 0xe5, 0xf3, 0xf4],
            default_port: 18_333,
        },
        Network::Regtest => ChainParams {
            network,
            consensus: regtest_consensus_params(),
            chain_tx_data: ChainTxData {
                time: 0,
                tx_count: 0,
                tx_rate: 0.0,
            },
            message_start: [0xda, 0xb5, 0xbf, 0xfa],
            default_port: 18_444,
        },
    }
}

const MONOLITH_ACTIVATION_TIME: i64 = 1_526_400_000;

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: hash256_from_hex(
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        )
        .expect("mainnet genesis hash"),
        genesis_time: 1_231_006_505,
        upgrades: [
            NetworkUpgrade::at_height(227_931),
            NetworkUpgrade::at_height(419_328),
            NetworkUpgrade::at_height(478_559),
            NetworkUpgrade::at_time(MONOLITH_ACTIVATION_TIME),
        ],
        checkpoints: parse_checkpoints(&[
            (
                11_111,
                "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
            ),
            (
                33_333,
                "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6",
            ),
            (
                478_559,
                "000000000000000000651ef99cb9fcbe0dadde1d424bd9f15ff20136191a5eec",
            ),
        ]),
        pow_limit: hash256_from_hex(
            "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("mainnet pow limit"),
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_allow_min_difficulty_blocks: false,
        pow_no_retargeting: false,
        minimum_chain_work: hash256_from_hex(
            "000000000000000000000000000000000000000000a0f3064330647e2f6c4828",
        )
        .expect("mainnet minimum chain work"),
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        hash_genesis_block: hash256_from_hex(
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
        )
        .expect("testnet genesis hash"),
        genesis_time: 1_296_688_602,
        upgrades: [
            NetworkUpgrade::at_height(21_111),
            NetworkUpgrade::at_height(770_112),
            NetworkUpgrade::at_height(1_155_876),
            NetworkUpgrade::at_time(MONOLITH_ACTIVATION_TIME),
        ],
        checkpoints: parse_checkpoints(&[(
            546,
            "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
        )]),
        pow_limit: hash256_from_hex(
            "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("testnet pow limit"),
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: false,
        minimum_chain_work: hash256_from_hex(
            "00000000000000000000000000000000000000000000002a650f6ff7649485da",
        )
        .expect("testnet minimum chain work"),
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        hash_genesis_block: hash256_from_hex(
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
        )
        .expect("regtest genesis hash"),
        genesis_time: 1_296_688_602,
        upgrades: [
            NetworkUpgrade::at_height(100_000_000),
            NetworkUpgrade::at_height(576),
            NetworkUpgrade::ALWAYS_ACTIVE,
            NetworkUpgrade::at_time(MONOLITH_ACTIVATION_TIME),
        ],
        checkpoints: Vec::new(),
        pow_limit: hash256_from_hex(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("regtest pow limit"),
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: true,
        minimum_chain_work: [0u8; 32],
    }
}

fn parse_checkpoints(entries: &[(i32, &str)]) -> Vec<Checkpoint> {
    entries
        .iter()
        .map(|(height, hash)| Checkpoint {
            height: *height,
            hash: hash256_from_hex(hash).expect("checkpoint hash"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip_is_display_order() {
        let hash = hash256_from_hex("0x01").expect("hash");
        assert_eq!(hash[0], 1);
        assert!(hash[1..].iter().all(|byte| *byte == 0));
        assert_eq!(
            hash256_to_hex(&hash),
            "0000000000000000000000000000000000000000000000000000000000000001"
        );
        assert!(matches!(
            hash256_from_hex(""),
            Err(HexError::InvalidLength)
        ));
        assert!(matches!(hash256_from_hex("zz"), Err(HexError::InvalidHex)));
    }

    #[test]
    fn mainnet_params_are_consistent() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(
            hash256_to_hex(&params.hash_genesis_block),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(params.difficulty_adjustment_interval(), 2016);
        assert_eq!(params.activation_height(UpgradeIndex::Csv), Some(419_328));
        assert_eq!(params.activation_height(UpgradeIndex::Monolith), None);
        let checkpoint = params.checkpoint_at(11_111).expect("checkpoint");
        assert_eq!(
            hash256_to_hex(&checkpoint.hash),
            "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"
        );
        assert!(params.checkpoint_at(11_112).is_none());
    }

    #[test]
    fn regtest_never_retargets() {
        let params = chain_params(Network::Regtest);
        assert!(params.consensus.pow_no_retargeting);
        assert!(params.consensus.checkpoints.is_empty());
        assert_eq!(params.consensus.minimum_chain_work, [0u8; 32]);
        assert_eq!(Network::parse("RegTest"), Some(Network::Regtest));
        assert_eq!(Network::parse("main"), Some(Network::Mainnet));
        assert_eq!(Network::parse("signet"), None);
    }
}
