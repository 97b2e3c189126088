use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    anchors::AnchorRequest,
    config::LedgerConfig,
    constants::{GENESIS_HASH, GENESIS_RECORD_ID, MAX_REPORTED_GAPS},
    error::{LedgerError, Result},
    format_timestamp, hash_data, mine, now_millis, Block, BlockHeader, RecordType,
};

pub type BlockIter<'a> = Box<dyn Iterator<Item = Result<Block>> + 'a>;

/// Persistence contract for the ledger. Lives here so storage backends can
/// depend on core without a cycle.
///
/// No update or delete: a block, once appended, is only ever read.
pub trait ChainStore: Send + Sync {
    /// Appends `block` only if its number is exactly one past the current tip
    /// (or 0 on an empty store) and its hash is unused. Anything else is a
    /// [`LedgerError::WriteConflict`].
    fn append_block(&self, block: &Block) -> Result<()>;
    fn get_block(&self, number: u64) -> Result<Option<Block>>;
    fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>>;
    /// Ascending by block number.
    fn blocks_by_data_hash(&self, data_hash: &str) -> Result<Vec<Block>>;
    /// Ascending by block number.
    fn blocks_by_record(&self, record_id: &str) -> Result<Vec<Block>>;
    fn tip(&self) -> Result<Option<Block>>;
    fn block_count(&self) -> Result<u64>;
    /// Ascending walk starting at block number `start`.
    fn blocks_from(&self, start: u64) -> BlockIter<'_>;
    /// Descending walk from the tip.
    fn blocks_rev(&self) -> BlockIter<'_>;
    fn checkpoint(&self) -> Result<Option<Checkpoint>>;
    fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
    fn flush(&self) -> Result<()>;
}

/// Last block known to be good, so later scans can start after it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub block_number: u64,
    pub hash: String,
    pub verified_at: DateTime<Utc>,
}

/// Caller-supplied annotations for an anchored block. None of it is hashed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnchorContext {
    pub actor_id: Option<String>,
    pub subject_id: Option<String>,
    pub summary: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl AnchorContext {
    pub fn actor(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: Some(actor_id.into()),
            ..Default::default()
        }
    }

    fn into_block_metadata(self) -> (Option<String>, Option<String>, BTreeMap<String, String>) {
        let mut metadata = self.metadata;
        metadata.insert(
            "anchored_by".to_string(),
            self.actor_id.clone().unwrap_or_else(|| "system".to_string()),
        );
        if let Some(summary) = self.summary {
            metadata.insert("record_summary".to_string(), summary);
        }
        (self.actor_id, self.subject_id, metadata)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordVerification {
    pub verified: bool,
    pub block: Option<Block>,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokenLink {
    pub block_number: u64,
    pub expected: String,
    pub got: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub valid: bool,
    pub total_blocks: u64,
    pub checked_blocks: u64,
    /// First block number examined; non-zero for checkpointed scans.
    pub checked_from: u64,
    pub invalid_blocks: Vec<u64>,
    pub broken_links: Vec<BrokenLink>,
    pub missing_blocks: Vec<u64>,
    pub last_block: Option<u64>,
    pub last_hash: Option<String>,
    pub message: String,
}

/// The ledger service: genesis, anchoring and verification over a [`ChainStore`].
pub struct Chain<S: ChainStore + ?Sized> {
    store: Arc<S>,
    config: LedgerConfig,
    write_lock: Arc<Mutex<()>>,
}

impl<S: ChainStore + ?Sized> Clone for Chain<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            write_lock: Arc::clone(&self.write_lock),
        }
    }
}

impl<S: ChainStore + ?Sized> Chain<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, LedgerConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: LedgerConfig) -> Self {
        Self {
            store,
            config,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Ensure a genesis block exists. Idempotent.
    pub fn ensure_genesis(&self) -> Result<Block> {
        let _guard = self.lock_writer();
        self.ensure_genesis_locked()
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, ()> {
        // The guarded value is `()`, so a poisoned lock carries no broken state.
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_genesis_locked(&self) -> Result<Block> {
        if let Some(genesis) = self.store.get_block(0)? {
            return Ok(genesis);
        }
        if self.store.block_count()? > 0 {
            return Err(LedgerError::TamperDetected {
                block_number: 0,
                detail: "chain has blocks but no genesis block".to_string(),
            });
        }

        let timestamp = now_millis();
        let data_hash = hash_data(&json!({
            "genesis": true,
            "created": format_timestamp(&timestamp),
        }))?;
        let mut header = BlockHeader::new(
            0,
            GENESIS_HASH,
            data_hash,
            RecordType::AuditLog,
            GENESIS_RECORD_ID,
        );
        header.timestamp = timestamp;
        let (hash, nonce) = mine::mine_with(&self.config, &header)?;

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "message".to_string(),
            "Genesis block - healthcare audit ledger initialized".to_string(),
        );
        let genesis = header.seal(hash, nonce, None, None, metadata);
        self.store.append_block(&genesis)?;
        info!(hash = %genesis.hash, "genesis block created");
        Ok(genesis)
    }

    /// Anchors the digest of `payload` as a new block on top of the tip.
    ///
    /// The read-tip, mine, append sequence runs under the chain's write lock;
    /// the store's conditional append catches writers outside this process.
    pub fn anchor_record<P>(
        &self,
        record_type: RecordType,
        record_id: &str,
        payload: &P,
        context: AnchorContext,
    ) -> Result<Block>
    where
        P: Serialize + ?Sized,
    {
        if record_id.trim().is_empty() {
            return Err(LedgerError::InvalidInput("record id is empty".to_string()));
        }
        let data_hash = hash_data(payload)?;
        let (user_id, subject_id, metadata) = context.into_block_metadata();

        let _guard = self.lock_writer();
        self.ensure_genesis_locked()?;

        let attempts = self.config.max_append_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let tip = self
                .store
                .tip()?
                .ok_or_else(|| LedgerError::NotFound("chain tip".to_string()))?;
            if !tip.is_self_consistent() {
                warn!(block = tip.block_number, "refusing to extend a tampered tip");
                return Err(LedgerError::TamperDetected {
                    block_number: tip.block_number,
                    detail: "tip hash does not match its contents".to_string(),
                });
            }

            let header = BlockHeader::new(
                tip.block_number + 1,
                tip.hash.clone(),
                data_hash.clone(),
                record_type,
                record_id,
            );
            let (hash, nonce) = mine::mine_with(&self.config, &header)?;
            let block = header.seal(
                hash,
                nonce,
                user_id.clone(),
                subject_id.clone(),
                metadata.clone(),
            );

            match self.store.append_block(&block) {
                Ok(()) => {
                    info!(
                        block = block.block_number,
                        hash = %block.hash,
                        record_type = %block.record_type,
                        record_id = %block.record_id,
                        nonce = block.nonce,
                        "block mined"
                    );
                    return Ok(block);
                }
                Err(err @ LedgerError::WriteConflict { .. }) if attempt < attempts => {
                    warn!(attempt, error = %err, "append lost a race, re-reading tip");
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn anchor(&self, request: AnchorRequest) -> Result<Block> {
        self.anchor_record(
            request.record_type,
            &request.record_id,
            &request.payload,
            request.context,
        )
    }

    /// Looks up a payload digest and re-checks the block that anchored it.
    /// "Not found" only means the record was never anchored.
    pub fn verify_record(&self, data_hash: &str) -> Result<RecordVerification> {
        let Some(block) = self.store.blocks_by_data_hash(data_hash)?.into_iter().next() else {
            debug!(data_hash, "digest not anchored");
            return Ok(RecordVerification {
                verified: false,
                block: None,
                reason: "not found".to_string(),
            });
        };

        let verified = block.is_self_consistent();
        let reason = if verified {
            "Record verified and untampered".to_string()
        } else {
            warn!(block = block.block_number, "stored hash mismatch on verify");
            "WARNING: block hash mismatch - possible tampering detected".to_string()
        };
        Ok(RecordVerification {
            verified,
            block: Some(block),
            reason,
        })
    }

    /// Walks every block in order and reports every anomaly found.
    pub fn verify_chain_integrity(&self) -> Result<IntegrityReport> {
        let report = self.scan(0, None)?;
        if report.valid {
            self.advance_checkpoint(&report)?;
        }
        Ok(report)
    }

    /// Re-verifies only blocks after the stored checkpoint, falling back to a
    /// full scan when there is no checkpoint or it no longer matches.
    pub fn verify_since_checkpoint(&self) -> Result<IntegrityReport> {
        let checkpoint = match self.store.checkpoint()? {
            Some(cp) => cp,
            None => return self.verify_chain_integrity(),
        };

        let anchor_ok = match self.store.get_block(checkpoint.block_number)? {
            Some(block) => block.hash == checkpoint.hash && block.is_self_consistent(),
            None => false,
        };
        if !anchor_ok {
            warn!(
                block = checkpoint.block_number,
                "checkpoint block changed, rescanning whole chain"
            );
            return self.verify_chain_integrity();
        }

        let report = self.scan(
            checkpoint.block_number + 1,
            Some((checkpoint.block_number, checkpoint.hash)),
        )?;
        if report.valid {
            self.advance_checkpoint(&report)?;
        }
        Ok(report)
    }

    /// Full scan that leaves the checkpoint alone.
    pub(crate) fn scan_read_only(&self) -> Result<IntegrityReport> {
        self.scan(0, None)
    }

    fn advance_checkpoint(&self, report: &IntegrityReport) -> Result<()> {
        if let (Some(block_number), Some(hash)) = (report.last_block, report.last_hash.clone()) {
            self.store.set_checkpoint(&Checkpoint {
                block_number,
                hash,
                verified_at: Utc::now(),
            })?;
        }
        Ok(())
    }

    fn scan(&self, start: u64, prior: Option<(u64, String)>) -> Result<IntegrityReport> {
        let total_blocks = self.store.block_count()?;
        let mut invalid_blocks = Vec::new();
        let mut broken_links = Vec::new();
        let mut missing_blocks = Vec::new();
        let mut checked_blocks = 0u64;
        let mut expected_number = start;
        let mut previous = prior;

        for item in self.store.blocks_from(start) {
            let block = item?;
            checked_blocks += 1;

            while expected_number < block.block_number && missing_blocks.len() < MAX_REPORTED_GAPS {
                missing_blocks.push(expected_number);
                expected_number += 1;
            }

            if !block.is_self_consistent() {
                warn!(block = block.block_number, "block hash mismatch");
                invalid_blocks.push(block.block_number);
            }

            let expected_prev = if block.is_genesis() {
                Some(GENESIS_HASH.to_string())
            } else {
                previous.as_ref().map(|(_, hash)| hash.clone())
            };
            if let Some(expected) = expected_prev {
                if block.previous_hash != expected {
                    warn!(block = block.block_number, "broken chain link");
                    broken_links.push(BrokenLink {
                        block_number: block.block_number,
                        expected,
                        got: block.previous_hash.clone(),
                    });
                }
            }

            expected_number = block.block_number + 1;
            previous = Some((block.block_number, block.hash));
        }

        let valid =
            invalid_blocks.is_empty() && broken_links.is_empty() && missing_blocks.is_empty();
        let message = if checked_blocks == 0 && start == 0 {
            "Empty chain".to_string()
        } else if valid {
            format!("Chain integrity verified: {checked_blocks} blocks checked, all valid")
        } else {
            format!(
                "Chain integrity FAILED: {} invalid blocks, {} broken links, {} missing blocks",
                invalid_blocks.len(),
                broken_links.len(),
                missing_blocks.len()
            )
        };

        let (last_block, last_hash) = match previous {
            Some((number, hash)) => (Some(number), Some(hash)),
            None => (None, None),
        };

        Ok(IntegrityReport {
            valid,
            total_blocks,
            checked_blocks,
            checked_from: start,
            invalid_blocks,
            broken_links,
            missing_blocks,
            last_block,
            last_hash,
            message,
        })
    }
}
