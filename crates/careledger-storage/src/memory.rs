use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use careledger_core::{
  chain::{BlockIter, ChainStore, Checkpoint},
  Block, LedgerError, Result,
};

#[derive(Default)]
struct Inner {
  blocks: BTreeMap<u64, Block>,
  checkpoint: Option<Checkpoint>,
}

/// In-process store for tests and throwaway nodes. Same append rules as
/// [`crate::SledStore`], nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
  inner: RwLock<Inner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn read(&self) -> RwLockReadGuard<'_, Inner> {
    self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn write(&self) -> RwLockWriteGuard<'_, Inner> {
    self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Edits a stored block in place, bypassing the append-only rules.
  /// Simulates out-of-band tampering; returns false if the block is absent.
  pub fn tamper_with(&self, number: u64, edit: impl FnOnce(&mut Block)) -> bool {
    match self.write().blocks.get_mut(&number) {
      Some(block) => {
        edit(block);
        true
      }
      None => false,
    }
  }

  /// Removes a stored block, bypassing the append-only rules.
  pub fn remove_unchecked(&self, number: u64) -> Option<Block> {
    self.write().blocks.remove(&number)
  }

  fn snapshot<F>(&self, keep: F) -> Vec<Block>
  where
    F: Fn(&Block) -> bool,
  {
    self.read().blocks.values().filter(|b| keep(b)).cloned().collect()
  }
}

impl ChainStore for MemoryStore {
  fn append_block(&self, block: &Block) -> Result<()> {
    let mut inner = self.write();
    let expected = inner.blocks.keys().next_back().map_or(0, |n| n + 1);
    let conflict = |reason: String| LedgerError::WriteConflict {
      block_number: block.block_number,
      reason,
    };
    if block.block_number != expected {
      return Err(conflict(format!("next block number is {expected}")));
    }
    if inner.blocks.values().any(|b| b.hash == block.hash) {
      return Err(conflict("block hash already present".to_string()));
    }
    inner.blocks.insert(block.block_number, block.clone());
    Ok(())
  }

  fn get_block(&self, number: u64) -> Result<Option<Block>> {
    Ok(self.read().blocks.get(&number).cloned())
  }

  fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>> {
    Ok(self.read().blocks.values().find(|b| b.hash == hash).cloned())
  }

  fn blocks_by_data_hash(&self, data_hash: &str) -> Result<Vec<Block>> {
    Ok(self.snapshot(|b| b.data_hash == data_hash))
  }

  fn blocks_by_record(&self, record_id: &str) -> Result<Vec<Block>> {
    Ok(self.snapshot(|b| b.record_id == record_id))
  }

  fn tip(&self) -> Result<Option<Block>> {
    Ok(self.read().blocks.values().next_back().cloned())
  }

  fn block_count(&self) -> Result<u64> {
    Ok(self.read().blocks.len() as u64)
  }

  fn blocks_from(&self, start: u64) -> BlockIter<'_> {
    let blocks: Vec<Block> = self.read().blocks.range(start..).map(|(_, b)| b.clone()).collect();
    Box::new(blocks.into_iter().map(Ok))
  }

  fn blocks_rev(&self) -> BlockIter<'_> {
    let blocks: Vec<Block> = self.read().blocks.values().rev().cloned().collect();
    Box::new(blocks.into_iter().map(Ok))
  }

  fn checkpoint(&self) -> Result<Option<Checkpoint>> {
    Ok(self.read().checkpoint.clone())
  }

  fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
    self.write().checkpoint = Some(checkpoint.clone());
    Ok(())
  }

  fn flush(&self) -> Result<()> {
    Ok(())
  }
}
