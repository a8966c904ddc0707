//! Block undo records and their application during disconnection.
//!
//! On disk an undo record is the encoded [`BlockUndo`] immediately followed
//! by the 32-byte hash of the block it belongs to. The hash is the only
//! integrity check performed on read.

use std::fmt;

use utxod_consensus::Hash256;
use utxod_log::{log_debug, log_error, log_warn};
use utxod_primitives::block::Block;
use utxod_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use utxod_primitives::outpoint::OutPoint;
use utxod_storage::{KeyValueStore, StoreError};

use crate::coins::{Coin, CoinsCache};
use crate::disk::BlockFiles;
use crate::flatfiles::{DiskBlockPos, FlatFileError};

/// Previous outputs spent by one transaction, in input order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxUndo {
    pub prevouts: Vec<Coin>,
}

/// One [`TxUndo`] per non-coinbase transaction of the block, in block order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

impl Encodable for TxUndo {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_compact_size(self.prevouts.len() as u64);
        for coin in &self.prevouts {
            coin.consensus_encode(encoder);
        }
    }
}

impl Decodable for TxUndo {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let count = decoder.read_compact_size()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut prevouts = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            prevouts.push(Coin::consensus_decode(decoder)?);
        }
        Ok(Self { prevouts })
    }
}

impl Encodable for BlockUndo {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_compact_size(self.txs.len() as u64);
        for tx in &self.txs {
            tx.consensus_encode(encoder);
        }
    }
}

impl Decodable for BlockUndo {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let count = decoder.read_compact_size()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut txs = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            txs.push(TxUndo::consensus_decode(decoder)?);
        }
        Ok(Self { txs })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectResult {
    Ok,
    /// Applied, but the coins set did not hold exactly what the block left.
    Unclean,
    Failed,
}

impl DisconnectResult {
    fn fold(self, other: DisconnectResult) -> DisconnectResult {
        match (self, other) {
            (DisconnectResult::Failed, _) | (_, DisconnectResult::Failed) => {
                DisconnectResult::Failed
            }
            (DisconnectResult::Unclean, _) | (_, DisconnectResult::Unclean) => {
                DisconnectResult::Unclean
            }
            _ => DisconnectResult::Ok,
        }
    }
}

#[derive(Debug)]
pub enum UndoReadError {
    Io(FlatFileError),
    /// The record could not be decoded, or its framing is inconsistent.
    CorruptData(DecodeError),
    ChecksumMismatch { expected: Hash256, found: Hash256 },
}

impl fmt::Display for UndoReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UndoReadError::Io(err) => write!(f, "undo read failed: {err}"),
            UndoReadError::CorruptData(err) => write!(f, "undo data corrupt: {err}"),
            UndoReadError::ChecksumMismatch { .. } => write!(f, "undo checksum mismatch"),
        }
    }
}

impl std::error::Error for UndoReadError {}

impl From<FlatFileError> for UndoReadError {
    fn from(err: FlatFileError) -> Self {
        match err {
            FlatFileError::LengthMismatch => {
                UndoReadError::CorruptData(DecodeError::InvalidData("undo record overruns file"))
            }
            other => UndoReadError::Io(other),
        }
    }
}

impl From<DecodeError> for UndoReadError {
    fn from(err: DecodeError) -> Self {
        UndoReadError::CorruptData(err)
    }
}

pub fn encode_block_undo(undo: &BlockUndo, block_hash: &Hash256) -> Vec<u8> {
    let mut encoder = Encoder::new();
    undo.consensus_encode(&mut encoder);
    encoder.write_bytes(block_hash);
    encoder.into_inner()
}

pub fn decode_block_undo(bytes: &[u8], expected_hash: &Hash256) -> Result<BlockUndo, UndoReadError> {
    let mut decoder = Decoder::new(bytes);
    let undo = BlockUndo::consensus_decode(&mut decoder)?;
    let found: Hash256 = decoder.read_fixed::<32>()?;
    if !decoder.is_empty() {
        return Err(UndoReadError::CorruptData(DecodeError::TrailingBytes));
    }
    if &found != expected_hash {
        return Err(UndoReadError::ChecksumMismatch {
            expected: *expected_hash,
            found,
        });
    }
    Ok(undo)
}

pub fn read_block_undo(
    files: &dyn BlockFiles,
    pos: DiskBlockPos,
    expected_hash: &Hash256,
) -> Result<BlockUndo, UndoReadError> {
    let bytes = files.open_undo_file(pos)?;
    decode_block_undo(&bytes, expected_hash)
}

/// Boolean-style wrapper over [`read_block_undo`]; failures are logged.
pub fn undo_read_from_disk(
    files: &dyn BlockFiles,
    pos: DiskBlockPos,
    expected_hash: &Hash256,
) -> Option<BlockUndo> {
    match read_block_undo(files, pos, expected_hash) {
        Ok(undo) => Some(undo),
        Err(err) => {
            log_error!("undo record at {pos}: {err}");
            None
        }
    }
}

pub fn write_block_undo(
    files: &mut dyn BlockFiles,
    undo: &BlockUndo,
    block_hash: &Hash256,
    file_id: u32,
) -> Result<DiskBlockPos, FlatFileError> {
    files.write_undo(file_id, &encode_block_undo(undo, block_hash))
}

/// Put a spent coin back. Overwriting an existing coin is reported as
/// unclean; the restored coin always wins.
pub fn undo_coin_spend<S: KeyValueStore>(
    coin: Coin,
    coins: &mut CoinsCache<S>,
    outpoint: &OutPoint,
) -> Result<DisconnectResult, StoreError> {
    if coins.add(outpoint, coin)? {
        log_debug!(
            "undo overwrote an unspent coin at {}:{}",
            hex_short(&outpoint.hash),
            outpoint.index
        );
        return Ok(DisconnectResult::Unclean);
    }
    Ok(DisconnectResult::Ok)
}

/// Reverse the effect `block` had on `coins`.
///
/// A record count that does not match the block leaves `coins` untouched.
pub fn apply_block_undo<S: KeyValueStore>(
    undo: &BlockUndo,
    block: &Block,
    coins: &mut CoinsCache<S>,
) -> DisconnectResult {
    if undo.txs.len() + 1 != block.transactions.len() {
        log_error!(
            "block undo has {} records for {} transactions",
            undo.txs.len(),
            block.transactions.len()
        );
        return DisconnectResult::Failed;
    }
    match apply_checked(undo, block, coins) {
        Ok(result) => result,
        Err(err) => {
            log_error!("coins view failed during undo: {err}");
            DisconnectResult::Failed
        }
    }
}

fn apply_checked<S: KeyValueStore>(
    undo: &BlockUndo,
    block: &Block,
    coins: &mut CoinsCache<S>,
) -> Result<DisconnectResult, StoreError> {
    let mut result = DisconnectResult::Ok;
    for (tx_index, tx) in block.transactions.iter().enumerate().rev() {
        let txid = tx.txid();
        for (vout, output) in tx.vout.iter().enumerate() {
            if output.is_unspendable() {
                continue;
            }
            let outpoint = OutPoint::new(txid, vout as u32);
            match coins.spend(&outpoint)? {
                Some(coin) if coin.out == *output => {}
                _ => result = result.fold(DisconnectResult::Unclean),
            }
        }

        if tx_index == 0 {
            continue;
        }
        let tx_undo = &undo.txs[tx_index - 1];
        if tx_undo.prevouts.len() != tx.vin.len() {
            log_warn!(
                "undo record for tx {} has {} prevouts for {} inputs",
                tx_index,
                tx_undo.prevouts.len(),
                tx.vin.len()
            );
            return Ok(DisconnectResult::Failed);
        }
        for (input, coin) in tx.vin.iter().zip(tx_undo.prevouts.iter()).rev() {
            let restored = undo_coin_spend(coin.clone(), coins, &input.prevout)?;
            if restored == DisconnectResult::Failed {
                return Ok(DisconnectResult::Failed);
            }
            result = result.fold(restored);
        }
    }
    Ok(result)
}

fn hex_short(hash: &Hash256) -> String {
    utxod_consensus::params::hash256_to_hex(hash)[..16].to_string()
}
