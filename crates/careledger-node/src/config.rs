use std::{path::PathBuf, time::Duration};

use careledger_core::{
    constants::{MAX_MINING_ITERATIONS, POW_TARGET_DIFFICULTY},
    LedgerConfig,
};
use clap::Parser;

use crate::constants::DEFAULT_REQUEST_TIMEOUT_SECS;

#[derive(Parser, Debug, Clone)]
#[command(name = "careledger-node")]
#[command(about = "HTTP node for the healthcare audit ledger")]
pub struct Args {
    /// Address to listen on, e.g. 127.0.0.1:8080
    #[arg(long, env = "CARELEDGER_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen: String,

    /// Data directory for sled
    #[arg(long, env = "CARELEDGER_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Keep the chain in memory only
    #[arg(long, env = "CARELEDGER_IN_MEMORY")]
    pub in_memory: bool,

    /// Leading zero hex digits required of every block hash
    #[arg(long, env = "CARELEDGER_DIFFICULTY", default_value_t = POW_TARGET_DIFFICULTY,
          value_parser = clap::value_parser!(u32).range(0..=64))]
    pub difficulty: u32,

    /// Nonce search ceiling per block
    #[arg(long, env = "CARELEDGER_MAX_ITERATIONS", default_value_t = MAX_MINING_ITERATIONS)]
    pub max_iterations: u64,

    /// Search nonces on all cores
    #[arg(long, env = "CARELEDGER_PARALLEL_MINING")]
    pub parallel_mining: bool,

    /// Bearer token required by the authenticated routes
    #[arg(long, env = "CARELEDGER_API_TOKEN")]
    pub api_token: Option<String>,

    /// Upper bound on a single anchor request, in seconds
    #[arg(
        long,
        env = "CARELEDGER_REQUEST_TIMEOUT_SECS",
        default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS
    )]
    pub request_timeout_secs: u64,
}

impl Args {
    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig::default()
            .with_difficulty(self.difficulty)
            .with_max_iterations(self.max_iterations)
            .with_parallel_mining(self.parallel_mining)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}
