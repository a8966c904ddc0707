//! Consensus-wide constants shared across validation.

/// One megabyte as the block size rules count it (decimal, not binary).
pub const ONE_MEGABYTE: u64 = 1_000_000;
/// Hard block size cap enforced until the monolith upgrade activates.
pub const LEGACY_MAX_BLOCK_SIZE: u64 = 8 * ONE_MEGABYTE;
/// Default value for the configurable excessive block size.
pub const DEFAULT_MAX_BLOCK_SIZE: u64 = 32 * ONE_MEGABYTE;
/// The maximum allowed size for a serialized transaction (network rule).
pub const MAX_TX_SIZE: u64 = ONE_MEGABYTE;
/// Signature operations allowed per started megabyte of block data.
pub const MAX_BLOCK_SIGOPS_PER_MB: u64 = 20_000;
/// The maximum allowed number of signature check operations per transaction.
pub const MAX_TX_SIGOPS_COUNT: u64 = 20_000;
/// Coinbase transaction outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;
/// Blocks this far past the tip are never stored unless explicitly requested.
pub const MIN_BLOCKS_TO_KEEP: i32 = 288;
/// Maximum seconds a header timestamp may run ahead of adjusted network time.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// A tip older than this keeps the node in initial block download.
pub const DEFAULT_MAX_TIP_AGE: i64 = 24 * 60 * 60;
/// Number of ancestors sampled for median time past.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Lock times below this value are block heights, above it unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
/// Use GetMedianTimePast() instead of nTime for end point timestamp.
pub const LOCKTIME_MEDIAN_TIME_PAST: u32 = 1 << 1;
/// Standard locktime verify flags used by non-consensus code.
pub const STANDARD_LOCKTIME_VERIFY_FLAGS: u32 = LOCKTIME_MEDIAN_TIME_PAST;

/// Coinbase script length bounds (network rule).
pub const MIN_COINBASE_SCRIPT_SIZE: usize = 2;
pub const MAX_COINBASE_SCRIPT_SIZE: usize = 100;
/// Maximum script size (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Sig-op budget for a block of `block_size` bytes.
///
/// Every started megabyte grants another `MAX_BLOCK_SIGOPS_PER_MB`.
pub fn max_block_sigops_count(block_size: u64) -> u64 {
    let megabytes = 1 + block_size.saturating_sub(1) / ONE_MEGABYTE;
    megabytes * MAX_BLOCK_SIGOPS_PER_MB
}
