#![allow(dead_code)]

use std::fs;
use std::sync::Arc;

use careledger_core::{
  chain::Chain, constants::GENESIS_HASH, hash_data, pow, Block, BlockHeader, LedgerConfig,
  RecordType,
};
use careledger_storage::{MemoryStore, SledStore};
use serde_json::json;
use tempfile::{tempdir, TempDir};

pub fn create_temp_store() -> (TempDir, SledStore) {
  // Create a temporary directory for the sled database
  let temp_dir = tempdir().expect("Failed to create temp dir");
  let db_path = temp_dir.path().to_path_buf();
  (temp_dir, SledStore::open(&db_path).expect("Failed to open SledStore"))
}

pub fn teardown_store(temp_dir: TempDir, store: SledStore) {
  let db_path = temp_dir.path().to_path_buf();
  store.clear().expect("Failed to clear the store");
  drop(store);
  temp_dir.close().expect("Failed to delete temp dir");
  let _ = fs::remove_dir_all(&db_path);
  assert!(!db_path.exists(), "Database directory should be removed");
}

pub fn memory_chain() -> Chain<MemoryStore> {
  Chain::new(Arc::new(MemoryStore::new()))
}

pub fn memory_chain_with(config: LedgerConfig) -> Chain<MemoryStore> {
  Chain::with_config(Arc::new(MemoryStore::new()), config)
}

/// Builds a sealed block on top of `prev` (or a genesis block) without
/// going through the service, for exercising stores directly.
pub fn next_block(prev: Option<&Block>, record_id: &str) -> Block {
  let (number, prev_hash) = match prev {
    Some(b) => (b.block_number + 1, b.hash.clone()),
    None => (0, GENESIS_HASH.to_string()),
  };
  let data_hash = hash_data(&json!({ "record": record_id, "n": number })).expect("payload hashes");
  let header = BlockHeader::new(number, prev_hash, data_hash, RecordType::AuditLog, record_id);
  let (hash, nonce) = pow::mine(&header, 1, 1_000_000).expect("mined");
  header.seal(hash, nonce, None, None, Default::default())
}

pub fn build_chain(len: usize) -> Vec<Block> {
  let mut blocks: Vec<Block> = Vec::with_capacity(len);
  for i in 0..len {
    let block = next_block(blocks.last(), &format!("REC-{i}"));
    blocks.push(block);
  }
  blocks
}
