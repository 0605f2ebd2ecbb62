//! Double-buffered flush pipeline.
//!
//! Request handlers append their encoded mutations to the active buffer and
//! return immediately with a [`FlushFuture`]. A single drain thread swaps
//! the active buffer for an empty one, writes the swapped batch to the
//! store as one atomic transaction, evicts the overlay entries the store
//! now covers and then completes every future of that batch.
//!
//! Transactions carrying ops must be added in non-decreasing log index
//! order. A failed batch write halts the pipeline: the batch's futures
//! fail and so does everything added afterwards, because later entries
//! could depend on the lost ones.

use crate::store::{BatchOp, MetaStoreResult};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;
use strata_common::LogIndex;
use strata_common::config::DoubleBufferConfig;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Destination of flushed batches
pub trait FlushTarget: Send + Sync {
    /// Persist `ops` and record `last_index` as durable, atomically
    fn flush_batch(&self, ops: &[BatchOp], last_index: LogIndex) -> MetaStoreResult<()>;

    /// Called after a successful flush for every op, with the log index of
    /// the transaction that produced it
    fn evict(&self, op: &BatchOp, log_index: LogIndex);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlushError {
    #[error("failed to persist batch ending at log index {last_index}: {reason}")]
    WriteFailed { last_index: LogIndex, reason: String },
    #[error("flush pipeline halted after batch ending at log index {failed_at} failed")]
    Halted { failed_at: LogIndex },
    #[error("log index {index} added after log index {last}")]
    OutOfOrder { index: LogIndex, last: LogIndex },
    #[error("flush pipeline is stopped")]
    Stopped,
}

type FlushOutcome = Result<(), FlushError>;

/// Completes once the transaction it was returned for is durable.
///
/// All transactions of one batch share the same underlying completion.
/// Can be awaited or waited on from a plain thread.
#[derive(Clone)]
pub struct FlushFuture {
    inner: Shared<BoxFuture<'static, FlushOutcome>>,
}

impl FlushFuture {
    fn channel() -> (oneshot::Sender<FlushOutcome>, Self) {
        let (tx, rx) = oneshot::channel();
        // Sender dropped without a result: the pipeline went away
        let inner = rx
            .map(|r| r.unwrap_or(Err(FlushError::Stopped)))
            .boxed()
            .shared();
        (tx, Self { inner })
    }

    /// A future that is already resolved
    #[must_use]
    pub fn completed(outcome: Result<(), FlushError>) -> Self {
        Self {
            inner: futures::future::ready(outcome).boxed().shared(),
        }
    }

    /// Block the current thread until the flush outcome is known
    pub fn wait(self) -> Result<(), FlushError> {
        futures::executor::block_on(self)
    }

    /// Outcome if already known
    #[must_use]
    pub fn try_result(&self) -> Option<Result<(), FlushError>> {
        self.inner.clone().now_or_never()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.try_result().is_some()
    }
}

impl Future for FlushFuture {
    type Output = Result<(), FlushError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl fmt::Debug for FlushFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushFuture")
            .field("result", &self.try_result())
            .finish()
    }
}

struct PendingTransaction {
    log_index: LogIndex,
    ops: Vec<BatchOp>,
}

struct Batch {
    entries: Vec<PendingTransaction>,
    completion: oneshot::Sender<FlushOutcome>,
    future: FlushFuture,
}

impl Batch {
    fn with_entries(entries: Vec<PendingTransaction>) -> Self {
        let (completion, future) = FlushFuture::channel();
        Self {
            entries,
            completion,
            future,
        }
    }

    fn complete(self, outcome: FlushOutcome) {
        // Receivers may all be gone; nobody to tell
        let _ = self.completion.send(outcome);
    }
}

struct BufferState {
    current: Batch,
    in_flight: Option<FlushFuture>,
    last_added: Option<LogIndex>,
    running: bool,
    flush_requested: bool,
    failed_at: Option<LogIndex>,
}

#[derive(Default)]
struct Counters {
    flush_iterations: AtomicU64,
    flushed_transactions: AtomicU64,
    max_batch_size: AtomicU64,
    durable_index: AtomicU64,
}

/// Point-in-time statistics of the flush pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoubleBufferStats {
    pub flush_iterations: u64,
    pub flushed_transactions: u64,
    pub max_batch_size: u64,
    pub durable_index: LogIndex,
    pub pending: usize,
}

struct Inner {
    state: Mutex<BufferState>,
    wake: Condvar,
    target: Arc<dyn FlushTarget>,
    flush_interval: Duration,
    max_batch_size: usize,
    counters: Counters,
}

/// Double-buffered flush pipeline with its drain thread
pub struct DoubleBuffer {
    inner: Arc<Inner>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DoubleBuffer {
    /// Start the drain thread. `durable_index` is the highest log index the
    /// store already holds; recorded transaction info never moves below it.
    pub fn start(
        target: Arc<dyn FlushTarget>,
        config: &DoubleBufferConfig,
        durable_index: LogIndex,
    ) -> MetaStoreResult<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(BufferState {
                current: Batch::with_entries(Vec::new()),
                in_flight: None,
                last_added: None,
                running: true,
                flush_requested: false,
                failed_at: None,
            }),
            wake: Condvar::new(),
            target,
            flush_interval: config.flush_interval(),
            max_batch_size: config.max_batch_size.max(1),
            counters: Counters::default(),
        });
        inner
            .counters
            .durable_index
            .store(durable_index, Ordering::SeqCst);

        let drain = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("om-double-buffer".to_string())
            .spawn(move || drain_loop(&drain))?;

        Ok(Self {
            inner,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue the ops of the transaction at `log_index`. Never blocks on I/O.
    pub fn add(&self, log_index: LogIndex, ops: Vec<BatchOp>) -> FlushFuture {
        let mut state = self.inner.state.lock();
        if let Some(failed_at) = state.failed_at {
            return FlushFuture::completed(Err(FlushError::Halted { failed_at }));
        }
        if !state.running {
            return FlushFuture::completed(Err(FlushError::Stopped));
        }
        let last = state.last_added.unwrap_or(0);
        if log_index < last && !ops.is_empty() {
            error!(
                "Rejecting transaction {} added after transaction {}",
                log_index, last
            );
            return FlushFuture::completed(Err(FlushError::OutOfOrder {
                index: log_index,
                last,
            }));
        }

        // A transaction without ops below the last one (a replay or a
        // failed command) rides along with the current batch
        state.last_added = Some(last.max(log_index));
        state
            .current
            .entries
            .push(PendingTransaction { log_index, ops });
        let pending = state.current.entries.len();
        if pending == 1 || pending >= self.inner.max_batch_size {
            self.inner.wake.notify_one();
        }
        state.current.future.clone()
    }

    /// Ask the drain thread to flush without waiting for the batching
    /// window. The returned future completes once everything added so far
    /// is durable.
    pub fn flush_now(&self) -> FlushFuture {
        let mut state = self.inner.state.lock();
        if !state.current.entries.is_empty() {
            state.flush_requested = true;
            self.inner.wake.notify_one();
            return state.current.future.clone();
        }
        if let Some(in_flight) = &state.in_flight {
            return in_flight.clone();
        }
        match state.failed_at {
            Some(failed_at) => FlushFuture::completed(Err(FlushError::Halted { failed_at })),
            None => FlushFuture::completed(Ok(())),
        }
    }

    /// Flush what is queued, then stop the drain thread. Later adds fail
    /// with [`FlushError::Stopped`].
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            self.inner.wake.notify_all();
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("Double buffer flush thread panicked");
            }
        }
    }

    pub fn stats(&self) -> DoubleBufferStats {
        let pending = self.inner.state.lock().current.entries.len();
        let counters = &self.inner.counters;
        DoubleBufferStats {
            flush_iterations: counters.flush_iterations.load(Ordering::Relaxed),
            flushed_transactions: counters.flushed_transactions.load(Ordering::Relaxed),
            max_batch_size: counters.max_batch_size.load(Ordering::Relaxed),
            durable_index: counters.durable_index.load(Ordering::SeqCst),
            pending,
        }
    }

    /// Highest log index known to be durable
    pub fn durable_index(&self) -> LogIndex {
        self.inner.counters.durable_index.load(Ordering::SeqCst)
    }

    /// Log index of the batch that halted the pipeline, if any
    pub fn failed_at(&self) -> Option<LogIndex> {
        self.inner.state.lock().failed_at
    }
}

impl Drop for DoubleBuffer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drain_loop(inner: &Inner) {
    info!("Double buffer flush thread started");
    let mut spare = Vec::new();

    loop {
        let batch = {
            let mut state = inner.state.lock();
            while state.current.entries.is_empty() && state.running {
                inner.wake.wait(&mut state);
            }
            if state.current.entries.is_empty() {
                break;
            }
            // Batching window; cut short by a full buffer, flush_now or stop
            if state.running
                && !state.flush_requested
                && state.current.entries.len() < inner.max_batch_size
            {
                inner.wake.wait_for(&mut state, inner.flush_interval);
            }
            state.flush_requested = false;
            let batch = std::mem::replace(
                &mut state.current,
                Batch::with_entries(std::mem::take(&mut spare)),
            );
            state.in_flight = Some(batch.future.clone());
            batch
        };

        let Batch {
            mut entries,
            completion,
            future: _,
        } = batch;
        let outcome = flush(inner, &mut entries);

        // Record a failure before anyone observes it through a future
        {
            let mut state = inner.state.lock();
            state.in_flight = None;
            if let Err(FlushError::WriteFailed { last_index, .. }) = &outcome {
                state.failed_at = Some(*last_index);
                // Anything queued behind the failed batch cannot be persisted
                let queued = std::mem::replace(
                    &mut state.current,
                    Batch::with_entries(Vec::new()),
                );
                queued.complete(Err(FlushError::Halted {
                    failed_at: *last_index,
                }));
            }
        }
        let _ = completion.send(outcome);
        entries.clear();
        spare = entries;
    }

    info!("Double buffer flush thread stopped");
}

fn flush(inner: &Inner, entries: &mut Vec<PendingTransaction>) -> FlushOutcome {
    let transactions = entries.len() as u64;
    let batch_last = entries.iter().map(|t| t.log_index).max().unwrap_or(0);
    let durable = inner.counters.durable_index.load(Ordering::SeqCst);
    let last_index = batch_last.max(durable);

    let mut ops = Vec::new();
    let mut op_indices = Vec::new();
    for txn in entries.drain(..) {
        op_indices.extend(std::iter::repeat_n(txn.log_index, txn.ops.len()));
        ops.extend(txn.ops);
    }

    if !ops.is_empty() || batch_last > durable {
        if let Err(e) = inner.target.flush_batch(&ops, last_index) {
            error!(
                "Failed to flush {} transactions ending at log index {}: {}",
                transactions, batch_last, e
            );
            return Err(FlushError::WriteFailed {
                last_index: batch_last,
                reason: e.to_string(),
            });
        }
    }
    for (op, log_index) in ops.iter().zip(op_indices) {
        inner.target.evict(op, log_index);
    }

    let counters = &inner.counters;
    counters.durable_index.store(last_index, Ordering::SeqCst);
    counters.flush_iterations.fetch_add(1, Ordering::Relaxed);
    counters
        .flushed_transactions
        .fetch_add(transactions, Ordering::Relaxed);
    counters
        .max_batch_size
        .fetch_max(transactions, Ordering::Relaxed);
    debug!(
        "Flushed {} transactions ({} ops) up to log index {}",
        transactions,
        ops.len(),
        last_index
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::PersistentStore;
    use crate::tables::TableName;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingTarget {
        store: MemoryStore,
        evicted: Mutex<Vec<(String, LogIndex)>>,
    }

    impl FlushTarget for RecordingTarget {
        fn flush_batch(&self, ops: &[BatchOp], last_index: LogIndex) -> MetaStoreResult<()> {
            self.store.batch_write(ops, last_index)
        }

        fn evict(&self, op: &BatchOp, log_index: LogIndex) {
            self.evicted.lock().push((op.key.clone(), log_index));
        }
    }

    fn config(flush_interval_ms: u64, max_batch_size: usize) -> DoubleBufferConfig {
        DoubleBufferConfig {
            flush_interval_ms,
            max_batch_size,
        }
    }

    fn put(key: &str) -> Vec<BatchOp> {
        vec![BatchOp::put(TableName::Keys, key, key.as_bytes().to_vec())]
    }

    #[test]
    fn test_transactions_become_durable() {
        let target = Arc::new(RecordingTarget::default());
        let buffer = DoubleBuffer::start(target.clone(), &config(5, 100), 0).unwrap();

        let futures: Vec<FlushFuture> = (1..=3)
            .map(|i| buffer.add(i, put(&format!("/v/b/k{i}"))))
            .collect();
        for f in futures {
            f.wait().unwrap();
        }

        assert_eq!(target.store.len(TableName::Keys), 3);
        assert_eq!(target.store.transaction_info().unwrap().unwrap().log_index, 3);
        let evicted = target.evicted.lock().clone();
        assert!(evicted.contains(&("/v/b/k2".to_string(), 2)));
        assert_eq!(buffer.stats().flushed_transactions, 3);
        assert_eq!(buffer.durable_index(), 3);
    }

    #[test]
    fn test_flush_now_cuts_batching_window() {
        let target = Arc::new(RecordingTarget::default());
        let buffer = DoubleBuffer::start(target.clone(), &config(60_000, 100), 0).unwrap();

        for i in 1..=3 {
            let _ = buffer.add(i, put(&format!("/v/b/k{i}")));
        }
        buffer.flush_now().wait().unwrap();
        for i in 4..=5 {
            let _ = buffer.add(i, put(&format!("/v/b/k{i}")));
        }
        buffer.flush_now().wait().unwrap();

        let stats = buffer.stats();
        assert_eq!(stats.flushed_transactions, 5);
        assert_eq!(stats.pending, 0);
        assert!(stats.max_batch_size >= 2);
        assert_eq!(target.store.len(TableName::Keys), 5);

        // Nothing queued: resolves immediately
        assert_eq!(buffer.flush_now().try_result(), Some(Ok(())));
    }

    #[test]
    fn test_add_does_not_wait_for_slow_store() {
        let target = Arc::new(RecordingTarget::default());
        target.store.set_write_delay(Duration::from_millis(300));
        let buffer = DoubleBuffer::start(target.clone(), &config(1, 100), 0).unwrap();

        let first = buffer.add(1, put("/v/b/a"));
        // Let the drain thread pick up the first batch
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        let second = buffer.add(2, put("/v/b/b"));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(!second.is_complete());

        first.wait().unwrap();
        second.wait().unwrap();
        assert_eq!(target.store.len(TableName::Keys), 2);
    }

    #[test]
    fn test_out_of_order_add_rejected() {
        let target = Arc::new(RecordingTarget::default());
        let buffer = DoubleBuffer::start(target, &config(5, 100), 0).unwrap();

        let ok = buffer.add(5, put("/v/b/a"));
        let rejected = buffer.add(3, put("/v/b/b"));
        assert_eq!(
            rejected.try_result(),
            Some(Err(FlushError::OutOfOrder { index: 3, last: 5 }))
        );
        ok.wait().unwrap();
        // Equal index is accepted
        buffer.add(5, Vec::new()).wait().unwrap();
        // So is a lower index that carries nothing
        buffer.add(2, Vec::new()).wait().unwrap();
        assert_eq!(
            buffer.add(4, put("/v/b/c")).try_result(),
            Some(Err(FlushError::OutOfOrder { index: 4, last: 5 }))
        );
        assert_eq!(buffer.durable_index(), 5);
    }

    #[test]
    fn test_write_failure_halts_pipeline() {
        let target = Arc::new(RecordingTarget::default());
        target.store.set_fail_writes(true);
        let buffer = DoubleBuffer::start(target.clone(), &config(1, 100), 0).unwrap();

        let err = buffer.add(1, put("/v/b/a")).wait().unwrap_err();
        assert!(matches!(err, FlushError::WriteFailed { last_index: 1, .. }));
        assert!(target.evicted.lock().is_empty());
        assert_eq!(buffer.failed_at(), Some(1));

        target.store.set_fail_writes(false);
        assert_eq!(
            buffer.add(2, put("/v/b/b")).try_result(),
            Some(Err(FlushError::Halted { failed_at: 1 }))
        );
        assert_eq!(buffer.durable_index(), 0);
    }

    #[test]
    fn test_stop_flushes_then_rejects() {
        let target = Arc::new(RecordingTarget::default());
        let buffer = DoubleBuffer::start(target.clone(), &config(60_000, 100), 0).unwrap();

        let pending = buffer.add(1, put("/v/b/a"));
        buffer.stop();
        pending.wait().unwrap();
        assert_eq!(target.store.len(TableName::Keys), 1);
        assert_eq!(
            buffer.add(2, put("/v/b/b")).try_result(),
            Some(Err(FlushError::Stopped))
        );
    }

    #[test]
    fn test_durable_index_never_regresses() {
        let target = Arc::new(RecordingTarget::default());
        let buffer = DoubleBuffer::start(target.clone(), &config(1, 100), 10).unwrap();

        // Replayed entry below the durable index with no mutation
        buffer.add(4, Vec::new()).wait().unwrap();
        assert_eq!(target.store.batch_count(), 0);

        buffer.add(11, put("/v/b/a")).wait().unwrap();
        assert_eq!(target.store.transaction_info().unwrap().unwrap().log_index, 11);
        assert_eq!(buffer.durable_index(), 11);
    }

    #[tokio::test]
    async fn test_future_can_be_awaited() {
        let target = Arc::new(RecordingTarget::default());
        let buffer = DoubleBuffer::start(target, &config(1, 100), 0).unwrap();
        let future = buffer.add(1, put("/v/b/a"));
        let shared = future.clone();
        future.await.unwrap();
        assert_eq!(shared.try_result(), Some(Ok(())));
    }
}
