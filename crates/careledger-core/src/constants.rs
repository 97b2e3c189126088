pub const HASH_SIZE: usize = 32;
pub const HASH_HEX_SIZE: usize = HASH_SIZE * 2;

/// `previousHash` of block 0.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";
pub const GENESIS_RECORD_ID: &str = "genesis";

pub const POW_TARGET_DIFFICULTY: u32 = 2;
pub const MAX_MINING_ITERATIONS: u64 = 1_000_000;
pub const MAX_APPEND_ATTEMPTS: u32 = 3;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;
pub(crate) const MAX_REPORTED_GAPS: usize = 1024;
