use crate::blocking::store::DocumentContainer;
use crate::error::{CopyError, Result};
use bson::Document;
use crossbeam::channel::{self, Receiver, Sender};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;
use tracing::warn;

/// Build the pool which runs upserts of one copy run, with `limit` threads.
///
/// The pool is shared by every collection of the run.
pub fn write_pool(limit: usize) -> Result<Arc<ThreadPool>> {
    if limit == 0 {
        return Err(CopyError::InvalidConcurrency(limit));
    }
    let pool = ThreadPoolBuilder::new()
        .num_threads(limit)
        .thread_name(|i| format!("upsert-{}", i))
        .build()?;
    Ok(Arc::new(pool))
}

/// A bounded set of in-flight upserts against one destination collection.
///
/// Upserts run on a [write_pool]. Once `limit` upserts are in flight,
/// [submit](WriteBatch::submit) waits for all of them before it returns, so at most `limit`
/// documents are held and at most `limit` requests are outstanding.
pub struct WriteBatch<C: DocumentContainer> {
    pool: Arc<ThreadPool>,
    container: C,
    partition_key: Option<Arc<str>>,
    limit: usize,
    in_flight: usize,
    sender: Sender<Result<()>>,
    receiver: Receiver<Result<()>>,
}

impl<C: DocumentContainer> WriteBatch<C> {
    /// create a batch which writes to `container` on `pool`, with at most `limit` upserts in flight.
    pub fn new(
        pool: Arc<ThreadPool>,
        container: C,
        partition_key: Option<&str>,
        limit: usize,
    ) -> Result<Self> {
        if limit == 0 {
            return Err(CopyError::InvalidConcurrency(limit));
        }
        let (sender, receiver) = channel::bounded(limit);
        Ok(WriteBatch {
            pool,
            container,
            partition_key: partition_key.map(Arc::from),
            limit,
            in_flight: 0,
            sender,
            receiver,
        })
    }

    /// Start upserting `doc`.
    ///
    /// Returns the size of the flushed batch when this submission filled it.
    pub fn submit(&mut self, doc: Document) -> Result<Option<usize>> {
        let container = self.container.clone();
        let partition_key = self.partition_key.clone();
        let sender = self.sender.clone();
        self.pool.spawn(move || {
            let res = container.upsert_item(doc, partition_key.as_deref());
            let _ = sender.send(res);
        });
        self.in_flight += 1;

        if self.in_flight >= self.limit {
            self.flush().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Wait for every in-flight upsert, returns how many were waited for.
    ///
    /// All of them are awaited even when some fail, then the first failure is returned.
    pub fn flush(&mut self) -> Result<usize> {
        let count = self.in_flight;
        let mut first_error = None;
        while self.in_flight > 0 {
            let res = self.receiver.recv().unwrap_or_else(|_| {
                Err(CopyError::Store("upsert worker disconnected".to_string()))
            });
            self.in_flight -= 1;
            if let Err(e) = res {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            None => Ok(count),
            Some(e) => Err(CopyError::write(self.container.name(), e)),
        }
    }

    /// number of upserts which are not awaited yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
}

impl<C: DocumentContainer> Drop for WriteBatch<C> {
    fn drop(&mut self) {
        // pool threads are detached, so observe what they are still doing before going away.
        if let Err(e) = self.flush() {
            warn!(container = self.container.name(), error = %e, "Upserts failed while abandoning batch. ");
        }
    }
}
