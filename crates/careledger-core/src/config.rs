use serde::{Deserialize, Serialize};

use crate::constants::{MAX_APPEND_ATTEMPTS, MAX_MINING_ITERATIONS, POW_TARGET_DIFFICULTY};

/// Tunables for sealing and appending blocks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerConfig {
    /// Required number of leading `'0'` hex digits in a block hash.
    pub difficulty: u32,
    /// Nonce search ceiling per block.
    pub max_iterations: u64,
    /// Search nonces on the rayon pool instead of the calling thread.
    pub parallel_mining: bool,
    /// Tip re-reads allowed when a conditional append loses a race.
    pub max_append_attempts: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            difficulty: POW_TARGET_DIFFICULTY,
            max_iterations: MAX_MINING_ITERATIONS,
            parallel_mining: false,
            max_append_attempts: MAX_APPEND_ATTEMPTS,
        }
    }
}

impl LedgerConfig {
    pub fn with_difficulty(mut self, difficulty: u32) -> Self {
        self.difficulty = difficulty;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_parallel_mining(mut self, parallel: bool) -> Self {
        self.parallel_mining = parallel;
        self
    }
}
