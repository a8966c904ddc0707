//! Header and transaction rule sets plugged into the validators.

use std::collections::HashSet;

use rayon::prelude::*;
use utxod_consensus::constants::{
    LOCKTIME_THRESHOLD, MAX_COINBASE_SCRIPT_SIZE, MAX_FUTURE_BLOCK_TIME, MAX_TX_SIGOPS_COUNT,
    MAX_TX_SIZE, MIN_COINBASE_SCRIPT_SIZE,
};
use utxod_consensus::money::{money_range, MAX_MONEY};
use utxod_consensus::upgrades::{network_upgrade_active, UpgradeIndex};
use utxod_consensus::ConsensusParams;
use utxod_pow::difficulty::{get_next_work_required, HeaderInfo};
use utxod_pow::validation as pow_validation;
use utxod_primitives::block::BlockHeader;
use utxod_primitives::transaction::{Transaction, SEQUENCE_FINAL};

use crate::blockindex::NodeId;
use crate::index::ChainIndex;
use crate::validation::ValidationError;

/// Header checks: the context-free part and the part that needs the parent.
pub trait HeaderRules: Send {
    fn check_block_header(&self, header: &BlockHeader) -> Result<(), ValidationError>;

    fn contextual_check_block_header(
        &self,
        header: &BlockHeader,
        index: &ChainIndex,
        prev: NodeId,
        adjusted_time: i64,
    ) -> Result<(), ValidationError>;
}

/// Transaction checks applied to a whole block body.
pub trait TxRules: Send {
    /// Structural rules and the aggregate sig-op budget.
    fn check_block_transactions(
        &self,
        txs: &[Transaction],
        max_sigops: u64,
    ) -> Result<(), ValidationError>;

    /// Finality against `lock_time_cutoff` and the coinbase height commitment.
    fn contextual_check_block_transactions(
        &self,
        txs: &[Transaction],
        height: i32,
        lock_time_cutoff: i64,
    ) -> Result<(), ValidationError>;
}

pub struct PowHeaderRules {
    params: ConsensusParams,
}

impl PowHeaderRules {
    pub fn new(params: ConsensusParams) -> Self {
        Self { params }
    }
}

fn header_info(index: &ChainIndex, id: NodeId) -> HeaderInfo {
    let node = index.node(id);
    HeaderInfo {
        height: i64::from(node.height),
        time: node.block_time(),
        bits: node.bits,
    }
}

impl HeaderRules for PowHeaderRules {
    fn check_block_header(&self, header: &BlockHeader) -> Result<(), ValidationError> {
        pow_validation::validate_pow_header(header, &self.params)?;
        Ok(())
    }

    fn contextual_check_block_header(
        &self,
        header: &BlockHeader,
        index: &ChainIndex,
        prev: NodeId,
        adjusted_time: i64,
    ) -> Result<(), ValidationError> {
        let last = header_info(index, prev);
        let expected = get_next_work_required(&last, i64::from(header.time), &self.params, |height| {
            let height = i32::try_from(height).ok()?;
            index.ancestor(prev, height).map(|id| header_info(index, id))
        })
        .map_err(|_| ValidationError::InvalidHeader("bad-diffbits"))?;
        if header.bits != expected {
            return Err(ValidationError::InvalidHeader("bad-diffbits"));
        }

        if i64::from(header.time) <= index.median_time_past(prev) {
            return Err(ValidationError::InvalidHeader("time-too-old"));
        }
        if i64::from(header.time) > adjusted_time + MAX_FUTURE_BLOCK_TIME {
            return Err(ValidationError::InvalidHeader("time-too-new"));
        }

        let height = index.node(prev).height + 1;
        let prev_mtp = index.median_time_past(prev);
        if header.version < 2
            && network_upgrade_active(height, prev_mtp, &self.params.upgrades, UpgradeIndex::Bip34)
        {
            return Err(ValidationError::InvalidHeader("bad-version"));
        }
        Ok(())
    }
}

pub struct StandardTxRules {
    params: ConsensusParams,
}

impl StandardTxRules {
    pub fn new(params: ConsensusParams) -> Self {
        Self { params }
    }
}

impl TxRules for StandardTxRules {
    fn check_block_transactions(
        &self,
        txs: &[Transaction],
        max_sigops: u64,
    ) -> Result<(), ValidationError> {
        match txs.first() {
            Some(first) if first.is_coinbase() => {}
            _ => return Err(ValidationError::MissingCoinbase),
        }
        if txs.iter().skip(1).any(Transaction::is_coinbase) {
            return Err(ValidationError::InvalidBlock("bad-cb-multiple"));
        }

        // Checked in parallel; the first failure in block order is reported.
        let results: Vec<Result<u64, ValidationError>> =
            txs.par_iter().map(check_transaction).collect();
        let mut sigops = 0u64;
        for result in results {
            sigops += result?;
            if sigops > max_sigops {
                return Err(ValidationError::InvalidBlock("bad-blk-sigops"));
            }
        }
        Ok(())
    }

    fn contextual_check_block_transactions(
        &self,
        txs: &[Transaction],
        height: i32,
        lock_time_cutoff: i64,
    ) -> Result<(), ValidationError> {
        for tx in txs {
            if !is_final_tx(tx, height, lock_time_cutoff) {
                return Err(ValidationError::InvalidTransaction("bad-txns-nonfinal"));
            }
        }

        let bip34 = self
            .params
            .activation_height(UpgradeIndex::Bip34)
            .is_some_and(|activation| height >= activation);
        if bip34 {
            let coinbase = txs.first().ok_or(ValidationError::MissingCoinbase)?;
            if !coinbase_height_matches(coinbase, height) {
                return Err(ValidationError::InvalidBlock("bad-cb-height"));
            }
        }
        Ok(())
    }
}

/// Context-free transaction rules; returns the legacy sig-op count.
fn check_transaction(tx: &Transaction) -> Result<u64, ValidationError> {
    if tx.vin.is_empty() {
        return Err(ValidationError::InvalidTransaction("bad-txns-vin-empty"));
    }
    if tx.vout.is_empty() {
        return Err(ValidationError::InvalidTransaction("bad-txns-vout-empty"));
    }
    if tx.encoded_size() as u64 > MAX_TX_SIZE {
        return Err(ValidationError::InvalidTransaction("bad-txns-oversize"));
    }

    let mut total = 0i64;
    for output in &tx.vout {
        if output.value < 0 {
            return Err(ValidationError::InvalidTransaction("bad-txns-vout-negative"));
        }
        if output.value > MAX_MONEY {
            return Err(ValidationError::ValueOutOfRange);
        }
        total += output.value;
        if !money_range(total) {
            return Err(ValidationError::InvalidTransaction(
                "bad-txns-txouttotal-toolarge",
            ));
        }
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(&input.prevout) {
            return Err(ValidationError::DuplicateInput);
        }
    }

    if tx.is_coinbase() {
        let len = tx.vin[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&len) {
            return Err(ValidationError::InvalidTransaction("bad-cb-length"));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(ValidationError::InvalidTransaction("bad-txns-prevout-null"));
    }

    let sigops = transaction_sigops(tx);
    if sigops > MAX_TX_SIGOPS_COUNT {
        return Err(ValidationError::InvalidTransaction("bad-txn-sigops"));
    }
    Ok(sigops)
}

fn transaction_sigops(tx: &Transaction) -> u64 {
    let input_ops: u64 = tx
        .vin
        .iter()
        .map(|input| legacy_sigops(&input.script_sig))
        .sum();
    let output_ops: u64 = tx
        .vout
        .iter()
        .map(|output| legacy_sigops(&output.script_pubkey))
        .sum();
    input_ops + output_ops
}

pub fn is_final_tx(tx: &Transaction, height: i32, lock_time_cutoff: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let lock_time = i64::from(tx.lock_time);
    let compare = if tx.lock_time < LOCKTIME_THRESHOLD {
        i64::from(height)
    } else {
        lock_time_cutoff
    };
    if lock_time < compare {
        return true;
    }
    tx.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

fn coinbase_height_matches(tx: &Transaction, height: i32) -> bool {
    if tx.vin.is_empty() {
        return false;
    }
    let expected = script_push_int(i64::from(height));
    tx.vin[0].script_sig.starts_with(&expected)
}

/// Minimal script push of `value`, as a coinbase height commitment.
pub fn script_push_int(value: i64) -> Vec<u8> {
    const OP_0: u8 = 0x00;
    const OP_1NEGATE: u8 = 0x4f;
    const OP_1: u8 = 0x51;
    if value == 0 {
        return vec![OP_0];
    }
    if value == -1 {
        return vec![OP_1NEGATE];
    }
    if (1..=16).contains(&value) {
        return vec![OP_1 + (value as u8 - 1)];
    }
    let data = script_num_to_vec(value);
    let mut script = Vec::new();
    push_data(&mut script, &data);
    script
}

fn script_num_to_vec(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let mut abs = value.unsigned_abs();
    let mut result = Vec::new();
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let sign_bit = 0x80u8;
    if let Some(last) = result.last_mut() {
        if (*last & sign_bit) != 0 {
            result.push(if value < 0 { sign_bit } else { 0 });
        } else if value < 0 {
            *last |= sign_bit;
        }
    }
    result
}

fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    const OP_PUSHDATA1: u8 = 0x4c;
    const OP_PUSHDATA2: u8 = 0x4d;
    const OP_PUSHDATA4: u8 = 0x4e;

    if data.len() < OP_PUSHDATA1 as usize {
        script.push(data.len() as u8);
    } else if data.len() <= u8::MAX as usize {
        script.push(OP_PUSHDATA1);
        script.push(data.len() as u8);
    } else if data.len() <= u16::MAX as usize {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(data.len() as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(data.len() as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}

/// Sig-ops counted without executing the script: one per CHECKSIG, twenty
/// per CHECKMULTISIG. Parsing stops at a truncated push.
pub fn legacy_sigops(script: &[u8]) -> u64 {
    const OP_CHECKSIG: u8 = 0xac;
    const OP_CHECKSIGVERIFY: u8 = 0xad;
    const OP_CHECKMULTISIG: u8 = 0xae;
    const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
    const OP_PUSHDATA1: u8 = 0x4c;
    const OP_PUSHDATA2: u8 = 0x4d;
    const OP_PUSHDATA4: u8 = 0x4e;

    let mut count = 0u64;
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        let push_len = match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                count += 1;
                continue;
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += 20;
                continue;
            }
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => {
                let Some(len) = script.get(cursor) else {
                    break;
                };
                cursor += 1;
                *len as usize
            }
            OP_PUSHDATA2 => {
                let Some(bytes) = script.get(cursor..cursor + 2) else {
                    break;
                };
                cursor += 2;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let Some(bytes) = script.get(cursor..cursor + 4) else {
                    break;
                };
                cursor += 4;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            _ => continue,
        };
        if cursor + push_len > script.len() {
            break;
        }
        cursor += push_len;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use utxod_consensus::{consensus_params, Network};
    use utxod_primitives::outpoint::OutPoint;
    use utxod_primitives::transaction::{TxIn, TxOut};

    fn coinbase(script_sig: Vec<u8>) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig,
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![TxOut {
                value: 50,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn spend(prevouts: Vec<OutPoint>) -> Transaction {
        Transaction {
            version: 1,
            vin: prevouts
                .into_iter()
                .map(|prevout| TxIn {
                    prevout,
                    script_sig: vec![0xac],
                    sequence: 0,
                })
                .collect(),
            vout: vec![TxOut {
                value: 1,
                script_pubkey: vec![0xac],
            }],
            lock_time: 0,
        }
    }

    fn rules() -> StandardTxRules {
        StandardTxRules::new(consensus_params(Network::Regtest))
    }

    #[test]
    fn coinbase_script_length_is_bounded() {
        let rules = rules();
        assert!(rules
            .check_block_transactions(&[coinbase(vec![1, 2])], 100)
            .is_ok());
        assert_eq!(
            rules.check_block_transactions(&[coinbase(vec![1])], 100),
            Err(ValidationError::InvalidTransaction("bad-cb-length"))
        );
    }

    #[test]
    fn first_error_in_block_order_wins() {
        let rules = rules();
        let dup = OutPoint::new([1u8; 32], 0);
        let mut empty_vout = spend(vec![OutPoint::new([2u8; 32], 0)]);
        empty_vout.vout.clear();
        let txs = [
            coinbase(vec![1, 2]),
            spend(vec![dup.clone(), dup]),
            empty_vout,
        ];
        assert_eq!(
            rules.check_block_transactions(&txs, 100),
            Err(ValidationError::DuplicateInput)
        );
        assert_eq!(
            rules.check_block_transactions(&txs[1..], 100),
            Err(ValidationError::MissingCoinbase)
        );
    }

    #[test]
    fn block_sigops_are_budgeted() {
        let rules = rules();
        let txs = [
            coinbase(vec![1, 2]),
            spend(vec![OutPoint::new([3u8; 32], 0)]),
        ];
        assert!(rules.check_block_transactions(&txs, 2).is_ok());
        assert_eq!(
            rules.check_block_transactions(&txs, 1),
            Err(ValidationError::InvalidBlock("bad-blk-sigops"))
        );
    }

    #[test]
    fn finality_uses_height_or_cutoff() {
        let mut tx = spend(vec![OutPoint::new([4u8; 32], 0)]);
        tx.lock_time = 10;
        assert!(!is_final_tx(&tx, 10, 0));
        assert!(is_final_tx(&tx, 11, 0));

        tx.lock_time = LOCKTIME_THRESHOLD + 5;
        assert!(!is_final_tx(&tx, 1, i64::from(LOCKTIME_THRESHOLD) + 5));
        assert!(is_final_tx(&tx, 1, i64::from(LOCKTIME_THRESHOLD) + 6));

        tx.vin[0].sequence = SEQUENCE_FINAL;
        assert!(is_final_tx(&tx, 1, 0));
    }

    #[test]
    fn coinbase_height_commitment() {
        let mut params = consensus_params(Network::Regtest);
        params.upgrades[UpgradeIndex::Bip34.as_usize()] =
            utxod_consensus::upgrades::NetworkUpgrade::at_height(0);
        let rules = StandardTxRules::new(params);

        let good = coinbase(vec![0x02, 0x2c, 0x01, 0xff]);
        assert!(rules
            .contextual_check_block_transactions(&[good], 300, 0)
            .is_ok());
        let bad = coinbase(vec![0x01, 0x2c]);
        assert_eq!(
            rules.contextual_check_block_transactions(&[bad], 300, 0),
            Err(ValidationError::InvalidBlock("bad-cb-height"))
        );
    }

    #[test]
    fn push_int_encoding() {
        assert_eq!(script_push_int(0), vec![0x00]);
        assert_eq!(script_push_int(16), vec![0x60]);
        assert_eq!(script_push_int(128), vec![0x02, 0x80, 0x00]);
        assert_eq!(script_push_int(-1), vec![0x4f]);
    }

    #[test]
    fn sigops_skip_pushed_data() {
        assert_eq!(legacy_sigops(&[0xac, 0xae]), 21);
        assert_eq!(legacy_sigops(&[0x01, 0xac, 0xac]), 1);
        assert_eq!(legacy_sigops(&[0x4c, 0x05, 0xac]), 0);
    }
}
