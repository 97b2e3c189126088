//! Read-only lookups over the chain. Nothing here recomputes hashes except
//! the validity flag in [`ChainStats`].

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    chain::{Chain, ChainStore},
    constants::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE},
    error::{LedgerError, Result},
    Block, RecordType,
};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionFilter {
    pub record_type: Option<RecordType>,
    /// Matches the block's `userId`.
    pub actor_id: Option<String>,
    pub subject_id: Option<String>,
    /// Case-insensitive substring of `hash`, `dataHash` or `recordId`.
    pub search: Option<String>,
}

impl TransactionFilter {
    pub fn matches(&self, block: &Block) -> bool {
        if let Some(record_type) = self.record_type {
            if block.record_type != record_type {
                return false;
            }
        }
        if let Some(actor) = &self.actor_id {
            if block.user_id.as_deref() != Some(actor.as_str()) {
                return false;
            }
        }
        if let Some(subject) = &self.subject_id {
            if block.subject_id.as_deref() != Some(subject.as_str()) {
                return false;
            }
        }
        if let Some(term) = &self.search {
            let term = term.to_lowercase();
            let hit = block.hash.to_lowercase().contains(&term)
                || block.data_hash.to_lowercase().contains(&term)
                || block.record_id.to_lowercase().contains(&term);
            if !hit {
                return false;
            }
        }
        true
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPage {
    pub transactions: Vec<Block>,
    pub total: u64,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStats {
    pub total_blocks: u64,
    pub latest_block_number: Option<u64>,
    pub latest_block_hash: Option<String>,
    pub latest_block_time: Option<DateTime<Utc>>,
    pub blocks_last_24h: u64,
    pub type_counts: BTreeMap<String, u64>,
    pub chain_valid: bool,
    pub difficulty: u32,
    pub checkpoint: Option<u64>,
}

impl<S: ChainStore + ?Sized> Chain<S> {
    pub fn get_block_by_hash(&self, hash: &str) -> Result<Block> {
        self.store()
            .get_block_by_hash(hash)?
            .ok_or_else(|| LedgerError::NotFound(format!("block with hash {hash}")))
    }

    pub fn get_block_by_number(&self, number: u64) -> Result<Block> {
        self.store()
            .get_block(number)?
            .ok_or_else(|| LedgerError::NotFound(format!("block #{number}")))
    }

    /// Every block anchoring `record_id`, oldest first. Empty if none.
    pub fn get_record_history(&self, record_id: &str) -> Result<Vec<Block>> {
        self.store().blocks_by_record(record_id)
    }

    /// Newest-first listing. `page` is 1-based; `page_size` is clamped to
    /// `1..=MAX_PAGE_SIZE` and defaults to `DEFAULT_PAGE_SIZE`.
    pub fn list_transactions(
        &self,
        filter: &TransactionFilter,
        page: Option<usize>,
        page_size: Option<usize>,
    ) -> Result<TransactionPage> {
        let page = page.unwrap_or(1).max(1);
        let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let skip = (page - 1).saturating_mul(page_size);

        let mut total = 0u64;
        let mut transactions = Vec::with_capacity(page_size);
        for item in self.store().blocks_rev() {
            let block = item?;
            if !filter.matches(&block) {
                continue;
            }
            if total >= skip as u64 && transactions.len() < page_size {
                transactions.push(block);
            }
            total += 1;
        }
        debug!(total, page, page_size, "listed transactions");

        Ok(TransactionPage {
            transactions,
            total,
            page,
            page_size,
            total_pages: total.div_ceil(page_size as u64),
        })
    }

    /// Aggregates over the whole chain. Creates genesis on an empty store.
    /// `chainValid` comes from a full scan; the checkpoint is left untouched.
    pub fn get_chain_stats(&self) -> Result<ChainStats> {
        self.ensure_genesis()?;

        let since = Utc::now() - Duration::hours(24);
        let mut total_blocks = 0u64;
        let mut blocks_last_24h = 0u64;
        let mut type_counts: BTreeMap<String, u64> = BTreeMap::new();
        for item in self.store().blocks_from(0) {
            let block = item?;
            total_blocks += 1;
            if block.timestamp >= since {
                blocks_last_24h += 1;
            }
            *type_counts.entry(block.record_type.to_string()).or_default() += 1;
        }

        let latest = self.store().tip()?;
        let integrity = self.scan_read_only()?;
        let checkpoint = self.store().checkpoint()?.map(|cp| cp.block_number);

        Ok(ChainStats {
            total_blocks,
            latest_block_number: latest.as_ref().map(|b| b.block_number),
            latest_block_hash: latest.as_ref().map(|b| b.hash.clone()),
            latest_block_time: latest.as_ref().map(|b| b.timestamp),
            blocks_last_24h,
            type_counts,
            chain_valid: integrity.valid,
            difficulty: self.config().difficulty,
            checkpoint,
        })
    }
}
