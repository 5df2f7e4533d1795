//! Bounded-size batch transfers with aggregated outcomes.

use crate::cancel::CancelFlag;
use crate::error::{SyncError, SyncResult};
use crate::remote::PushOutcome;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use driftsync_model::SyncableRecord;

/// Operation applied to each chunk of a batch.
#[async_trait]
pub trait ChunkOperation<I: Send + Sync>: Send + Sync {
    /// Processes one chunk, yielding one outcome per item in input order.
    async fn run(&self, chunk_index: usize, chunk: &[I]) -> SyncResult<Vec<PushOutcome>>;
}

/// Aggregate result of a batch run.
///
/// Ordering within the three outcome lists follows input order; chunk order
/// follows input order.
#[derive(Debug)]
pub struct BatchOutcome<I> {
    /// Items the remote call accepted, with the server's copy when returned.
    pub successful: Vec<(I, Option<SyncableRecord>)>,
    /// Items whose retries were exhausted or whose error was fatal.
    pub failed: Vec<(I, SyncError)>,
    /// Items the server reported conflicted, with its copy when returned.
    pub conflicts: Vec<(I, Option<SyncableRecord>)>,
    /// Set when processing stopped early: the remaining chunks were never
    /// attempted. Everything recorded above still reflects fully-completed
    /// chunks.
    pub aborted: Option<SyncError>,
}

impl<I> BatchOutcome<I> {
    fn empty() -> Self {
        Self {
            successful: Vec::new(),
            failed: Vec::new(),
            conflicts: Vec::new(),
            aborted: None,
        }
    }

    /// Returns true if every chunk was attempted.
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }

    /// Number of items with a recorded outcome.
    pub fn processed(&self) -> usize {
        self.successful.len() + self.failed.len() + self.conflicts.len()
    }
}

/// Splits work into bounded-size chunks and aggregates per-item outcomes.
///
/// Each chunk runs under the retry policy. One chunk's failure does not
/// abort the remaining chunks; only cycle-level errors (auth, parse, store,
/// cancellation) stop processing early.
pub struct BatchProcessor {
    batch_size: usize,
    retry: RetryPolicy,
}

impl BatchProcessor {
    /// Creates a processor with the given chunk size.
    pub fn new(batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            batch_size: batch_size.max(1),
            retry,
        }
    }

    /// Processes `items` chunk by chunk.
    ///
    /// Cancellation is honored between chunks, never mid-call: the outcome
    /// stays consistent with the last fully-completed chunk.
    pub async fn process<I, Op>(
        &self,
        items: &[I],
        cancel: &CancelFlag,
        op: &Op,
    ) -> BatchOutcome<I>
    where
        I: Clone + Send + Sync,
        Op: ChunkOperation<I>,
    {
        let mut outcome = BatchOutcome::empty();

        for (index, chunk) in items.chunks(self.batch_size).enumerate() {
            if cancel.is_cancelled() {
                outcome.aborted = Some(SyncError::Cancelled);
                break;
            }

            match self.retry.execute(cancel, || op.run(index, chunk)).await {
                Ok(results) => {
                    if results.len() != chunk.len() {
                        outcome.aborted = Some(SyncError::Unknown(format!(
                            "chunk {index} returned {} outcomes for {} items",
                            results.len(),
                            chunk.len()
                        )));
                        break;
                    }
                    for (item, result) in chunk.iter().zip(results) {
                        match result {
                            PushOutcome::Accepted { server_record } => {
                                outcome.successful.push((item.clone(), server_record));
                            }
                            PushOutcome::Conflicted { remote } => {
                                outcome.conflicts.push((item.clone(), remote));
                            }
                            PushOutcome::Rejected { error } => {
                                outcome.failed.push((item.clone(), error));
                            }
                        }
                    }
                }
                Err(error) if error.aborts_cycle() => {
                    outcome.aborted = Some(error);
                    break;
                }
                Err(error) if error.is_conflict() => {
                    for item in chunk {
                        outcome.conflicts.push((item.clone(), None));
                    }
                }
                Err(error) => {
                    // Retries exhausted; report the chunk failed and move on.
                    tracing::warn!(
                        chunk = index,
                        items = chunk.len(),
                        error = %error,
                        "chunk failed after retries"
                    );
                    for item in chunk {
                        outcome.failed.push((item.clone(), error.clone()));
                    }
                }
            }
        }

        outcome
    }
}
