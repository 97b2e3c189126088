use std::path::Path;

use careledger_core::{
  chain::{BlockIter, ChainStore, Checkpoint},
  Block, LedgerError, Result,
};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, IVec, Tree};
use tracing::{debug, info};

const TREE_BLOCKS: &str = "blocks";
const TREE_BY_HASH: &str = "by_hash";
const TREE_BY_DATA_HASH: &str = "by_data_hash";
const TREE_BY_RECORD: &str = "by_record";
const TREE_META: &str = "meta";
const KEY_TIP_HEIGHT: &[u8] = b"tip_height";
const KEY_CHECKPOINT: &[u8] = b"checkpoint";

/// Durable block store. Blocks are keyed by big-endian block number so tree
/// order is chain order; secondary trees map hash, data hash and record id
/// back to block numbers.
#[derive(Clone)]
pub struct SledStore {
  db: Db,
  blocks: Tree,
  by_hash: Tree,
  by_data_hash: Tree,
  by_record: Tree,
  meta: Tree,
}

impl SledStore {
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
    let db = sled::open(path).map_err(LedgerError::unavailable)?;
    let open = |name: &str| db.open_tree(name).map_err(LedgerError::unavailable);
    let store = Self {
      blocks: open(TREE_BLOCKS)?,
      by_hash: open(TREE_BY_HASH)?,
      by_data_hash: open(TREE_BY_DATA_HASH)?,
      by_record: open(TREE_BY_RECORD)?,
      meta: open(TREE_META)?,
      db,
    };
    info!(blocks = store.blocks.len(), "sled store opened");
    Ok(store)
  }

  /// Raw database handle, bypassing every chain invariant. For maintenance
  /// tooling and tests that simulate out-of-band tampering.
  pub fn raw_db(&self) -> &Db {
    &self.db
  }

  /// Drops every block, index and checkpoint.
  pub fn clear(&self) -> Result<()> {
    for tree in [&self.blocks, &self.by_hash, &self.by_data_hash, &self.by_record, &self.meta] {
      tree.clear().map_err(LedgerError::unavailable)?;
    }
    self.flush()
  }

  pub fn close(&self) -> Result<()> {
    self.flush()
  }

  fn block_at(&self, key: &[u8]) -> Result<Option<Block>> {
    match self.blocks.get(key).map_err(LedgerError::unavailable)? {
      Some(bytes) => decode_block(&bytes).map(Some),
      None => Ok(None),
    }
  }

  /// Resolves `prefix ‖ 0x00 ‖ number` index entries to blocks, ascending.
  fn resolve_index(&self, tree: &Tree, value: &str) -> Result<Vec<Block>> {
    let mut out = Vec::new();
    for entry in tree.scan_prefix(index_prefix(value)) {
      let (_, number_key) = entry.map_err(LedgerError::unavailable)?;
      if let Some(block) = self.block_at(&number_key)? {
        out.push(block);
      }
    }
    Ok(out)
  }
}

impl ChainStore for SledStore {
  fn append_block(&self, block: &Block) -> Result<()> {
    let number = block.block_number;
    let key = number.to_be_bytes();
    let bytes = bincode::serialize(block).map_err(LedgerError::unavailable)?;
    let data_key = index_key(&block.data_hash, number);
    let record_key = index_key(&block.record_id, number);

    let outcome = (&self.blocks, &self.by_hash, &self.by_data_hash, &self.by_record, &self.meta)
      .transaction(|(blocks, by_hash, by_data_hash, by_record, meta)| {
        let expected = match meta.get(KEY_TIP_HEIGHT)? {
          Some(tip) => match decode_u64(&tip) {
            Some(height) => height + 1,
            None => {
              return Err(ConflictableTransactionError::Abort("corrupt tip marker".to_string()))
            }
          },
          None => 0,
        };
        if number != expected {
          return Err(ConflictableTransactionError::Abort(format!(
            "next block number is {expected}"
          )));
        }
        if blocks.get(&key[..])?.is_some() {
          return Err(ConflictableTransactionError::Abort("block number already taken".to_string()));
        }
        if by_hash.get(block.hash.as_bytes())?.is_some() {
          return Err(ConflictableTransactionError::Abort("block hash already present".to_string()));
        }

        blocks.insert(&key[..], bytes.as_slice())?;
        by_hash.insert(block.hash.as_bytes(), &key[..])?;
        by_data_hash.insert(data_key.as_slice(), &key[..])?;
        by_record.insert(record_key.as_slice(), &key[..])?;
        meta.insert(KEY_TIP_HEIGHT, &key[..])?;
        Ok(())
      });

    match outcome {
      Ok(()) => {
        self.flush()?;
        debug!(block = number, "block appended");
        Ok(())
      }
      Err(TransactionError::Abort(reason)) => Err(LedgerError::WriteConflict {
        block_number: number,
        reason,
      }),
      Err(TransactionError::Storage(err)) => Err(LedgerError::unavailable(err)),
    }
  }

  fn get_block(&self, number: u64) -> Result<Option<Block>> {
    self.block_at(&number.to_be_bytes())
  }

  fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>> {
    match self.by_hash.get(hash.as_bytes()).map_err(LedgerError::unavailable)? {
      Some(number_key) => self.block_at(&number_key),
      None => Ok(None),
    }
  }

  fn blocks_by_data_hash(&self, data_hash: &str) -> Result<Vec<Block>> {
    self.resolve_index(&self.by_data_hash, data_hash)
  }

  fn blocks_by_record(&self, record_id: &str) -> Result<Vec<Block>> {
    self.resolve_index(&self.by_record, record_id)
  }

  fn tip(&self) -> Result<Option<Block>> {
    match self.blocks.last().map_err(LedgerError::unavailable)? {
      Some((_, bytes)) => decode_block(&bytes).map(Some),
      None => Ok(None),
    }
  }

  fn block_count(&self) -> Result<u64> {
    Ok(self.blocks.len() as u64)
  }

  fn blocks_from(&self, start: u64) -> BlockIter<'_> {
    Box::new(
      self
        .blocks
        .range(start.to_be_bytes()..)
        .map(|entry| entry.map_err(LedgerError::unavailable).and_then(|(_, v)| decode_block(&v))),
    )
  }

  fn blocks_rev(&self) -> BlockIter<'_> {
    Box::new(
      self
        .blocks
        .iter()
        .rev()
        .map(|entry| entry.map_err(LedgerError::unavailable).and_then(|(_, v)| decode_block(&v))),
    )
  }

  fn checkpoint(&self) -> Result<Option<Checkpoint>> {
    match self.meta.get(KEY_CHECKPOINT).map_err(LedgerError::unavailable)? {
      Some(bytes) => bincode::deserialize(&bytes)
        .map(Some)
        .map_err(|e| LedgerError::StoreUnavailable(format!("undecodable checkpoint: {e}"))),
      None => Ok(None),
    }
  }

  fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
    let bytes = bincode::serialize(checkpoint).map_err(LedgerError::unavailable)?;
    self
      .meta
      .insert(KEY_CHECKPOINT, bytes)
      .map_err(LedgerError::unavailable)?;
    self.flush()
  }

  fn flush(&self) -> Result<()> {
    self.db.flush().map_err(LedgerError::unavailable)?;
    Ok(())
  }
}

fn decode_block(bytes: &IVec) -> Result<Block> {
  bincode::deserialize(bytes)
    .map_err(|e| LedgerError::StoreUnavailable(format!("undecodable block: {e}")))
}

fn decode_u64(bytes: &[u8]) -> Option<u64> {
  let arr: [u8; 8] = bytes.try_into().ok()?;
  Some(u64::from_be_bytes(arr))
}

fn index_prefix(value: &str) -> Vec<u8> {
  let mut key = Vec::with_capacity(value.len() + 1);
  key.extend_from_slice(value.as_bytes());
  key.push(0);
  key
}

fn index_key(value: &str, number: u64) -> Vec<u8> {
  let mut key = index_prefix(value);
  key.extend_from_slice(&number.to_be_bytes());
  key
}
