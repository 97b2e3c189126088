use rayon::prelude::*;
use tracing::debug;

use crate::{
    config::LedgerConfig,
    error::{LedgerError, Result},
    pow, seal_hash, BlockHeader,
};

/// Searches nonces `1..=max_iterations` across the rayon pool and returns the
/// lowest satisfying nonce, i.e. the same answer as [`pow::mine`].
pub fn mine_parallel(
    header: &BlockHeader,
    difficulty: u32,
    max_iterations: u64,
) -> Result<(String, u64)> {
    let (prefix, suffix) = header.preimage_parts();

    let found = (1u64..max_iterations.saturating_add(1))
        .into_par_iter()
        .find_first(|nonce| {
            pow::meets_difficulty(&seal_hash(&prefix, *nonce, &suffix), difficulty)
        });

    match found {
        Some(nonce) => {
            let hash = seal_hash(&prefix, nonce, &suffix);
            debug!(
                block = header.block_number,
                nonce, "parallel search found nonce"
            );
            Ok((hash, nonce))
        }
        None => Err(LedgerError::MiningExhausted {
            block_number: header.block_number,
            attempts: max_iterations,
        }),
    }
}

/// Seals `header` using the strategy selected in `config`.
pub fn mine_with(config: &LedgerConfig, header: &BlockHeader) -> Result<(String, u64)> {
    if config.parallel_mining {
        mine_parallel(header, config.difficulty, config.max_iterations)
    } else {
        pow::mine(header, config.difficulty, config.max_iterations)
    }
}
