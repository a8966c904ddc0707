//! Chain state configuration and the `utxod.conf` reader.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use utxod_consensus::constants::{
    DEFAULT_MAX_BLOCK_SIZE, DEFAULT_MAX_TIP_AGE, LEGACY_MAX_BLOCK_SIZE, MIN_BLOCKS_TO_KEEP,
    ONE_MEGABYTE,
};
use utxod_consensus::Network;
use utxod_log::{log_debug, Format, Level, LogConfig};

use crate::disk::DEFAULT_BLOCK_FILE_SIZE;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainConfig {
    pub network: Network,
    /// Largest block body accepted by the structural check.
    pub excessive_block_size: u64,
    /// How far above the active tip an unrequested block may land.
    pub min_blocks_to_keep: i32,
    /// Seconds a tip may lag behind now before the node counts as syncing.
    pub max_tip_age: i64,
    pub checkpoints: bool,
    pub block_file_size: u64,
    pub log: LogConfig,
}

impl ChainConfig {
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            excessive_block_size: DEFAULT_MAX_BLOCK_SIZE,
            min_blocks_to_keep: MIN_BLOCKS_TO_KEEP,
            max_tip_age: DEFAULT_MAX_TIP_AGE,
            checkpoints: true,
            block_file_size: DEFAULT_BLOCK_FILE_SIZE,
            log: LogConfig::default(),
        }
    }

    /// Read `path`; a missing file yields the mainnet defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let entries = parse_conf(contents);

        let mut network = match last_value(&entries, "network") {
            Some(value) => Network::parse(value)
                .ok_or_else(|| ConfigError::UnknownNetwork(value.to_string()))?,
            None => Network::Mainnet,
        };
        if let Some(value) = last_value(&entries, "testnet") {
            if parse_bool("testnet", value)? {
                network = Network::Testnet;
            }
        }
        if let Some(value) = last_value(&entries, "regtest") {
            if parse_bool("regtest", value)? {
                network = Network::Regtest;
            }
        }

        let mut config = Self::for_network(network);
        if let Some(value) = last_value(&entries, "excessiveblocksize") {
            let size: u64 = parse_number("excessiveblocksize", value)?;
            if size <= ONE_MEGABYTE {
                return Err(ConfigError::invalid("excessiveblocksize", value));
            }
            config.excessive_block_size = size;
        }
        if let Some(value) = last_value(&entries, "minblockstokeep") {
            let keep: i32 = parse_number("minblockstokeep", value)?;
            if keep < 0 {
                return Err(ConfigError::invalid("minblockstokeep", value));
            }
            config.min_blocks_to_keep = keep;
        }
        if let Some(value) = last_value(&entries, "maxtipage") {
            config.max_tip_age = parse_number("maxtipage", value)?;
        }
        if let Some(value) = last_value(&entries, "checkpoints") {
            config.checkpoints = parse_bool("checkpoints", value)?;
        }
        if let Some(value) = last_value(&entries, "blockfilesize") {
            let size: u64 = parse_number("blockfilesize", value)?;
            if size < LEGACY_MAX_BLOCK_SIZE {
                return Err(ConfigError::invalid("blockfilesize", value));
            }
            config.block_file_size = size;
        }
        if let Some(value) = last_value(&entries, "loglevel") {
            config.log.level =
                Level::parse(value).ok_or_else(|| ConfigError::invalid("loglevel", value))?;
        }
        if let Some(value) = last_value(&entries, "logformat") {
            config.log.format =
                Format::parse(value).ok_or_else(|| ConfigError::invalid("logformat", value))?;
        }
        if let Some(value) = last_value(&entries, "logtimestamps") {
            config.log.timestamps = parse_bool("logtimestamps", value)?;
        }

        for key in entries.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                log_debug!("ignoring unknown config key {key}");
            }
        }
        Ok(config)
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::for_network(Network::Mainnet)
    }
}

const KNOWN_KEYS: &[&str] = &[
    "network",
    "testnet",
    "regtest",
    "excessiveblocksize",
    "minblockstokeep",
    "maxtipage",
    "checkpoints",
    "blockfilesize",
    "loglevel",
    "logformat",
    "logtimestamps",
];

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    InvalidValue { key: String, value: String },
    UnknownNetwork(String),
}

impl ConfigError {
    fn invalid(key: &str, value: &str) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "failed to read config: {err}"),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value for {key}: {value}")
            }
            ConfigError::UnknownNetwork(value) => write!(f, "unknown network {value}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

/// `key=value` lines; `#` and `;` start comments and a bare key means `1`.
fn parse_conf(contents: &str) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find('#') {
            line = &line[..idx];
        }
        if let Some(idx) = line.find(';') {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    out
}

fn last_value<'a>(entries: &'a HashMap<String, Vec<String>>, key: &str) -> Option<&'a str> {
    entries
        .get(key)
        .and_then(|values| values.last())
        .map(String::as_str)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::invalid(key, value)),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, value))
}
