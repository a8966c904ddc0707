use utxod_consensus::params::{hash256_from_hex, hash256_to_hex};
use utxod_primitives::block::{Block, BlockHeader};
use utxod_primitives::encoding::DecodeError;
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::{Transaction, TxIn, TxOut, SEQUENCE_FINAL};

fn hex_bytes(input: &str) -> Vec<u8> {
    (0..input.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&input[i..i + 2], 16).expect("hex"))
        .collect()
}

fn genesis_coinbase() -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: hex_bytes(
                "04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73",
            ),
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: 50 * 100_000_000,
            script_pubkey: hex_bytes(
                "4104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac",
            ),
        }],
        lock_time: 0,
    }
}

fn genesis_block() -> Block {
    let coinbase = genesis_coinbase();
    Block::new(
        BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: coinbase.txid(),
            time: 1_231_006_505,
            bits: 0x1d00ffff,
            nonce: 2_083_236_893,
        },
        vec![coinbase],
    )
}

#[test]
fn mainnet_genesis_hashes() {
    let block = genesis_block();
    assert_eq!(
        hash256_to_hex(&block.transactions[0].txid()),
        "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
    );
    assert_eq!(
        block.hash(),
        hash256_from_hex("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f")
            .expect("hash")
    );
    assert!(block.transactions[0].is_coinbase());
}

#[test]
fn block_size_matches_encoding() {
    let block = genesis_block();
    let encoded = block.consensus_encode();
    assert_eq!(encoded.len(), 285);
    assert_eq!(block.encoded_size(), encoded.len());
    assert_eq!(
        block.transactions[0].encoded_size(),
        block.transactions[0].consensus_encode().len()
    );

    let decoded = Block::consensus_decode(&encoded).expect("decode");
    assert_eq!(decoded, block);
    assert!(!decoded.checked);
}

#[test]
fn block_decode_rejects_trailing_bytes() {
    let mut encoded = genesis_block().consensus_encode();
    encoded.push(0);
    assert!(Block::consensus_decode(&encoded).is_err());

    let header = genesis_block().header.consensus_encode();
    assert_eq!(header.len(), 80);
    assert_eq!(
        BlockHeader::consensus_decode(&header[..79]),
        Err(DecodeError::UnexpectedEof)
    );
}

#[test]
fn empty_transaction_is_minimal() {
    let tx = Transaction::empty();
    assert_eq!(tx.encoded_size(), 10);
    assert_eq!(tx.consensus_encode().len(), 10);
    assert!(!tx.is_coinbase());
}

#[test]
fn unspendable_outputs() {
    let op_return = TxOut {
        value: 0,
        script_pubkey: vec![0x6a, 0x01, 0x00],
    };
    assert!(op_return.is_unspendable());
    let normal = TxOut {
        value: 1,
        script_pubkey: vec![0x51],
    };
    assert!(!normal.is_unspendable());
    let empty = TxOut {
        value: 1,
        script_pubkey: Vec::new(),
    };
    assert!(!empty.is_unspendable());
}
