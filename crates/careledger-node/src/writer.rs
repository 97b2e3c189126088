//! Single writer for the chain. Every anchor, whether an HTTP request or a
//! fire-and-forget workflow hook, goes through one queue so blocks are mined
//! one at a time against the current tip.

use std::time::Duration;

use careledger_core::{anchors::AnchorRequest, chain::Chain, Block, LedgerError};
use careledger_storage::ChainStore;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::constants::{ANCHOR_QUEUE_DEPTH, BACKGROUND_RETRY_BACKOFF_MS, BACKGROUND_RETRY_LIMIT};

struct AnchorJob {
    request: AnchorRequest,
    reply: Option<oneshot::Sender<Result<Block, LedgerError>>>,
    attempt: u32,
}

#[derive(Clone)]
pub struct AnchorHandle {
    tx: mpsc::Sender<AnchorJob>,
}

impl AnchorHandle {
    /// Starts the writer task. It runs until every handle is dropped.
    pub fn spawn(chain: Chain<dyn ChainStore>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(ANCHOR_QUEUE_DEPTH);
        let task = tokio::spawn(run_writer(chain, tx.downgrade(), rx));
        (Self { tx }, task)
    }

    /// Queues `request` and waits for the committed block.
    pub async fn anchor(&self, request: AnchorRequest) -> Result<Block, LedgerError> {
        let (reply, receiver) = oneshot::channel();
        self.tx
            .send(AnchorJob { request, reply: Some(reply), attempt: 1 })
            .await
            .map_err(|_| writer_stopped())?;
        receiver.await.map_err(|_| writer_stopped())?
    }

    /// Queues `request` without waiting. Retryable failures go back on the
    /// queue after a backoff; anything else is logged and dropped, leaving
    /// the business record unanchored. Returns false if the queue is full.
    pub fn submit(&self, request: AnchorRequest) -> bool {
        let record_id = request.record_id.clone();
        match self.tx.try_send(AnchorJob { request, reply: None, attempt: 1 }) {
            Ok(()) => true,
            Err(err) => {
                warn!(record_id = %record_id, error = %err, "anchor queue rejected record");
                false
            }
        }
    }
}

fn writer_stopped() -> LedgerError {
    LedgerError::unavailable("anchor writer is not running")
}

async fn run_writer(
    chain: Chain<dyn ChainStore>,
    requeue: mpsc::WeakSender<AnchorJob>,
    mut rx: mpsc::Receiver<AnchorJob>,
) {
    debug!("anchor writer started");
    while let Some(job) = rx.recv().await {
        match job.reply {
            Some(reply) => {
                let result = anchor_blocking(&chain, job.request).await;
                // The caller may have timed out and gone away.
                let _ = reply.send(result);
            }
            None => {
                let result = anchor_blocking(&chain, job.request.clone()).await;
                settle_background(&requeue, job.request, job.attempt, result);
            }
        }
    }
    info!("anchor writer stopped");
}

async fn anchor_blocking(
    chain: &Chain<dyn ChainStore>,
    request: AnchorRequest,
) -> Result<Block, LedgerError> {
    let chain = chain.clone();
    tokio::task::spawn_blocking(move || chain.anchor(request))
        .await
        .map_err(|err| LedgerError::unavailable(format!("anchor task failed: {err}")))?
}

/// Never blocks the writer: a retry sleeps in its own task and then
/// re-enters the queue behind whatever arrived meanwhile.
fn settle_background(
    requeue: &mpsc::WeakSender<AnchorJob>,
    request: AnchorRequest,
    attempt: u32,
    result: Result<Block, LedgerError>,
) {
    match result {
        Ok(block) => {
            debug!(
                block_number = block.block_number,
                record_id = %block.record_id,
                "background anchor committed"
            );
        }
        Err(err) if err.is_retryable() && attempt < BACKGROUND_RETRY_LIMIT => {
            warn!(
                attempt,
                record_id = %request.record_id,
                error = %err,
                "background anchor failed, retrying"
            );
            let requeue = requeue.clone();
            let delay = Duration::from_millis(BACKGROUND_RETRY_BACKOFF_MS * u64::from(attempt));
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let record_id = request.record_id.clone();
                let job = AnchorJob { request, reply: None, attempt: attempt + 1 };
                let queued = match requeue.upgrade() {
                    Some(tx) => tx.try_send(job).is_ok(),
                    None => false,
                };
                if !queued {
                    warn!(record_id = %record_id, "retry not queued, record left unanchored");
                }
            });
        }
        Err(err) => {
            warn!(
                record_type = %request.record_type,
                record_id = %request.record_id,
                attempts = attempt,
                error = %err,
                "record left unanchored"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use careledger_core::{
        chain::{BlockIter, Checkpoint},
        LedgerConfig, RecordType, Result as LedgerResult,
    };
    use careledger_storage::MemoryStore;
    use serde_json::json;

    use super::*;

    /// Fails every append for one record id with a retryable error.
    struct RefusingStore {
        inner: MemoryStore,
        refused_record: &'static str,
        refusals: AtomicU32,
    }

    impl ChainStore for RefusingStore {
        fn append_block(&self, block: &Block) -> LedgerResult<()> {
            if block.record_id == self.refused_record {
                self.refusals.fetch_add(1, Ordering::SeqCst);
                return Err(LedgerError::unavailable("disk full"));
            }
            self.inner.append_block(block)
        }
        fn get_block(&self, number: u64) -> LedgerResult<Option<Block>> {
            self.inner.get_block(number)
        }
        fn get_block_by_hash(&self, hash: &str) -> LedgerResult<Option<Block>> {
            self.inner.get_block_by_hash(hash)
        }
        fn blocks_by_data_hash(&self, data_hash: &str) -> LedgerResult<Vec<Block>> {
            self.inner.blocks_by_data_hash(data_hash)
        }
        fn blocks_by_record(&self, record_id: &str) -> LedgerResult<Vec<Block>> {
            self.inner.blocks_by_record(record_id)
        }
        fn tip(&self) -> LedgerResult<Option<Block>> {
            self.inner.tip()
        }
        fn block_count(&self) -> LedgerResult<u64> {
            self.inner.block_count()
        }
        fn blocks_from(&self, start: u64) -> BlockIter<'_> {
            self.inner.blocks_from(start)
        }
        fn blocks_rev(&self) -> BlockIter<'_> {
            self.inner.blocks_rev()
        }
        fn checkpoint(&self) -> LedgerResult<Option<Checkpoint>> {
            self.inner.checkpoint()
        }
        fn set_checkpoint(&self, checkpoint: &Checkpoint) -> LedgerResult<()> {
            self.inner.set_checkpoint(checkpoint)
        }
        fn flush(&self) -> LedgerResult<()> {
            self.inner.flush()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn background_retries_do_not_hold_up_awaited_anchors() {
        let store = Arc::new(RefusingStore {
            inner: MemoryStore::new(),
            refused_record: "MR-stuck",
            refusals: AtomicU32::new(0),
        });
        let shared: Arc<dyn ChainStore> = store.clone();
        let chain = Chain::with_config(shared, LedgerConfig::default().with_difficulty(1));
        chain.ensure_genesis().unwrap();
        let (anchors, _writer) = AnchorHandle::spawn(chain);

        let stuck =
            AnchorRequest::new(RecordType::MedicalRecord, "MR-stuck", json!({"file": "scan.png"}));
        assert!(anchors.submit(stuck));

        let rx =
            AnchorRequest::new(RecordType::Prescription, "RX-1", json!({"drug": "Amoxicillin"}));
        let block = tokio::time::timeout(
            Duration::from_millis(BACKGROUND_RETRY_BACKOFF_MS),
            anchors.anchor(rx),
        )
        .await
        .expect("awaited anchor sat behind a retry backoff")
        .unwrap();
        assert_eq!(block.block_number, 1);
        assert_eq!(block.record_id, "RX-1");

        for _ in 0..100 {
            if store.refusals.load(Ordering::SeqCst) >= BACKGROUND_RETRY_LIMIT {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(store.refusals.load(Ordering::SeqCst), BACKGROUND_RETRY_LIMIT);

        // No attempts beyond the limit
        tokio::time::sleep(Duration::from_millis(BACKGROUND_RETRY_BACKOFF_MS * 4)).await;
        assert_eq!(store.refusals.load(Ordering::SeqCst), BACKGROUND_RETRY_LIMIT);
        assert_eq!(store.block_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn terminal_background_failures_are_not_retried() {
        let store = Arc::new(RefusingStore {
            inner: MemoryStore::new(),
            refused_record: "unused",
            refusals: AtomicU32::new(0),
        });
        let shared: Arc<dyn ChainStore> = store.clone();
        let chain = Chain::new(shared);
        chain.ensure_genesis().unwrap();
        let (anchors, _writer) = AnchorHandle::spawn(chain);

        // Blank record ids are rejected before mining; the next job still lands
        assert!(anchors.submit(AnchorRequest::new(RecordType::AuditLog, " ", json!({}))));
        let block = anchors
            .anchor(AnchorRequest::new(RecordType::AuditLog, "LOG-1", json!({})))
            .await
            .unwrap();
        assert_eq!(block.block_number, 1);
        assert_eq!(store.block_count().unwrap(), 2);
    }
}
