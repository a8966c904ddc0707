use primitive_types::U256;
use utxod_consensus::{consensus_params, Network};
use utxod_pow::difficulty::{
    block_proof, calculate_next_work_required, compact_to_target, compact_to_u256,
    get_next_work_required, hash_meets_target, target_to_compact, CompactError,
    DifficultyError, HeaderInfo,
};
use utxod_pow::validation::{check_proof_of_work, PowError};

#[test]
fn compact_to_target_roundtrip() {
    let bits = 0x1d00ffff;
    let target = compact_to_target(bits).expect("target");
    let back = target_to_compact(&target);
    assert_eq!(back, bits);
}

#[test]
fn compact_target_layout() {
    let bits = 0x207fffff;
    let target = compact_to_target(bits).expect("target");
    assert!(target[..29].iter().all(|b| *b == 0));
    assert_eq!(target[29], 0xff);
    assert_eq!(target[30], 0xff);
    assert_eq!(target[31], 0x7f);
}

#[test]
fn compact_sign_and_overflow() {
    assert_eq!(compact_to_u256(0x04923456), Err(CompactError::Negative));
    assert_eq!(compact_to_u256(0xff123456), Err(CompactError::Overflow));
    // A zero mantissa is never negative.
    assert_eq!(compact_to_u256(0x01800000), Ok(U256::zero()));
}

#[test]
fn hash_meets_target_cmp() {
    let target = [0x10u8; 32];
    let smaller = [0x00u8; 32];
    let larger = [0xffu8; 32];
    assert!(hash_meets_target(&smaller, &target));
    assert!(!hash_meets_target(&larger, &target));
}

#[test]
fn block_proof_grows_with_difficulty() {
    let easy = block_proof(0x207fffff).expect("proof");
    let hard = block_proof(0x1d00ffff).expect("proof");
    assert_eq!(easy, U256::from(2u64));
    assert_eq!(hard, U256::from(0x0001_0001_0001u64));
    assert!(hard > easy);
    assert_eq!(block_proof(0).expect("proof"), U256::zero());
}

#[test]
fn retarget_matches_reference_vectors() {
    let params = consensus_params(Network::Mainnet);

    let last = HeaderInfo {
        height: 32_255,
        time: 1_262_152_739,
        bits: 0x1d00ffff,
    };
    assert_eq!(
        calculate_next_work_required(&last, 1_261_130_161, &params),
        Ok(0x1d00d86a)
    );

    let at_limit = HeaderInfo {
        height: 2_015,
        time: 1_233_061_996,
        bits: 0x1d00ffff,
    };
    assert_eq!(
        calculate_next_work_required(&at_limit, 1_231_006_505, &params),
        Ok(0x1d00ffff)
    );
}

#[test]
fn next_work_keeps_bits_inside_interval() {
    let params = consensus_params(Network::Mainnet);
    let last = HeaderInfo {
        height: 100,
        time: 1_000_000,
        bits: 0x1c0ffff0,
    };
    let bits = get_next_work_required(&last, 1_000_600, &params, |_| None).expect("bits");
    assert_eq!(bits, 0x1c0ffff0);

    let boundary = HeaderInfo {
        height: 2_015,
        time: 1_233_061_996,
        bits: 0x1d00ffff,
    };
    assert_eq!(
        get_next_work_required(&boundary, 1_233_062_000, &params, |_| None),
        Err(DifficultyError::MissingAncestor(0))
    );
}

#[test]
fn regtest_never_retargets() {
    let params = consensus_params(Network::Regtest);
    let last = HeaderInfo {
        height: 2_015,
        time: 10,
        bits: 0x207fffff,
    };
    let first = HeaderInfo {
        height: 0,
        time: 0,
        bits: 0x207fffff,
    };
    let bits = get_next_work_required(&last, 20, &params, |height| {
        (height == 0).then_some(first)
    })
    .expect("bits");
    assert_eq!(bits, 0x207fffff);
}

#[test]
fn pow_limit_is_enforced() {
    let params = consensus_params(Network::Mainnet);
    assert_eq!(
        check_proof_of_work(&[0u8; 32], 0x207fffff, &params),
        Err(PowError::InvalidBits("pow target above limit"))
    );
    assert_eq!(
        check_proof_of_work(&[0xffu8; 32], 0x1d00ffff, &params),
        Err(PowError::HashMismatch)
    );
    assert!(check_proof_of_work(&[0u8; 32], 0x1d00ffff, &params).is_ok());
}
