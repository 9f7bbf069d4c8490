use super::batch::{write_pool, WriteBatch};
use crate::blocking::store::{DocumentContainer, DocumentDatabase, ItemFilter};
use crate::cancel::CancelToken;
use crate::error::{CopyError, Result};
use chrono::{DateTime, Utc};
use rayon::ThreadPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Counters of one collection copy.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyProgress {
    /// documents read from source.
    pub items_read: u64,
    /// documents whose upsert completed.
    pub items_written: u64,
    /// source pages processed.
    pub pages: u64,
    /// batches flushed because they reached the concurrency limit.
    pub full_batches: u64,
    /// batches flushed before reaching the limit, only the last one can be partial.
    pub partial_batches: u64,
    /// when the copy started.
    pub started_at: DateTime<Utc>,
    /// time from the first page request to the last batch completion.
    pub duration: Duration,
}

impl CopyProgress {
    fn new() -> Self {
        CopyProgress {
            items_read: 0,
            items_written: 0,
            pages: 0,
            full_batches: 0,
            partial_batches: 0,
            started_at: Utc::now(),
            duration: Duration::ZERO,
        }
    }

    fn record_batch(&mut self, size: usize, limit: usize) {
        if size == 0 {
            return;
        }
        if size >= limit {
            self.full_batches += 1;
        } else {
            self.partial_batches += 1;
        }
        self.items_written += size as u64;
    }
}

/// Copy documents of `source` into collection `dest_name` of `destination`.
///
/// The destination collection is created with the source's partition key and unique keys when
/// it doesn't exist. Only documents whose `createdAt` >= `cutoff` are copied when `cutoff` is
/// given. At most `concurrency_limit` upserts are in flight; the copier waits for the whole batch
/// before reading on.
///
/// Nothing is rolled back on failure, documents written before the failing batch stay in the
/// destination. Copying again is safe because documents are upserted by `_id` and partition key.
pub fn copy_container<S, D>(
    source: &S,
    destination: &D,
    dest_name: &str,
    cutoff: Option<DateTime<Utc>>,
    concurrency_limit: usize,
    cancel: &CancelToken,
) -> Result<CopyProgress>
where
    S: DocumentContainer,
    D: DocumentDatabase,
{
    if concurrency_limit == 0 {
        return Err(CopyError::InvalidConcurrency(concurrency_limit));
    }
    let pool = write_pool(concurrency_limit)?;
    copy_container_on(
        &pool,
        source,
        destination,
        dest_name,
        cutoff,
        concurrency_limit,
        cancel,
    )
}

/// [copy_container] with upserts running on `pool`, which has `concurrency_limit` threads.
pub(crate) fn copy_container_on<S, D>(
    pool: &Arc<ThreadPool>,
    source: &S,
    destination: &D,
    dest_name: &str,
    cutoff: Option<DateTime<Utc>>,
    concurrency_limit: usize,
    cancel: &CancelToken,
) -> Result<CopyProgress>
where
    S: DocumentContainer,
    D: DocumentDatabase,
{
    info!(
        source = source.name(),
        dest_db = destination.name(),
        dest = dest_name,
        ?cutoff,
        "Begin to copy collection. "
    );

    let descriptor = source.descriptor()?;
    debug!(coll = source.name(), partition_key_path = ?descriptor.partition_key_path, "Read source collection properties. ");
    let partition_key = descriptor.partition_key_field();
    debug!(?partition_key, "Normalized partition key. ");

    let target = destination.get_or_create_container(
        dest_name,
        descriptor.partition_key_path.as_deref(),
        &descriptor.unique_key_policy,
    )?;

    let filter = ItemFilter::from_cutoff(cutoff);
    match &filter {
        Some(f) => debug!(query = %f.to_query(), "Query source with cutoff. "),
        None => debug!("Query source with full scan. "),
    }

    let mut batch = WriteBatch::new(pool.clone(), target, partition_key, concurrency_limit)?;
    let mut progress = CopyProgress::new();
    let started = Instant::now();
    let mut pages = source.query_items(filter.as_ref())?;

    // an early return drops `batch`, which still waits for its in-flight upserts.
    loop {
        if cancel.is_cancelled() {
            let flushed = batch.flush()?;
            progress.record_batch(flushed, concurrency_limit);
            progress.duration = started.elapsed();
            info!(dest = dest_name, read = progress.items_read, written = progress.items_written, "Copy collection cancelled. ");
            return Err(CopyError::Cancelled);
        }

        let page = match pages.next() {
            Some(page) => page?,
            None => break,
        };
        progress.pages += 1;
        info!(
            page = progress.pages,
            count = page.len(),
            source = source.name(),
            "Processing page. "
        );

        for doc in page {
            progress.items_read += 1;
            if let Some(flushed) = batch.submit(doc)? {
                progress.record_batch(flushed, concurrency_limit);
                debug!(dest = dest_name, count = flushed, "Flushed a batch of upserts. ");
                if cancel.is_cancelled() {
                    progress.duration = started.elapsed();
                    info!(dest = dest_name, read = progress.items_read, written = progress.items_written, "Copy collection cancelled. ");
                    return Err(CopyError::Cancelled);
                }
            }
        }
    }

    let flushed = batch.flush()?;
    if flushed > 0 {
        progress.record_batch(flushed, concurrency_limit);
        debug!(dest = dest_name, count = flushed, "Flushed final batch of upserts. ");
    }
    progress.duration = started.elapsed();

    info!(
        dest_db = destination.name(),
        dest = dest_name,
        copied = progress.items_written,
        pages = progress.pages,
        duration = ?progress.duration,
        "Copy collection complete. "
    );
    Ok(progress)
}
