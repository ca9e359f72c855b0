//! Result collector (spec §4.4): single-threaded reorderer that owns the
//! `output_tx_num` serialisation point, drives validation and apply, and
//! runs the checkpoint protocol.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use recon_types::{KvBackend, KvWriteTxn, ReconResult, TxTask};
use tracing::{debug, info, warn};

use crate::metrics;
use crate::recon_state::ReconState;

/// Orders `TxTask`s by `tx_num` alone for the min-heap (spec §4.4: `rws`).
struct HeapEntry(TxTask);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.tx_num == other.0.tx_num
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.tx_num.cmp(&other.0.tx_num)
    }
}

/// State shared with the producer for backpressure (spec §4.5): the
/// heap's length and its accounted result-set bytes, guarded by one lock
/// with one condition variable, matching spec §5's "the heap has its own"
/// mutex.
pub struct Backpressure {
    heap: Mutex<BinaryHeap<Reverse<HeapEntry>>>,
    can_feed: Condvar,
    results_size: AtomicU64,
    done: AtomicBool,
}

impl Backpressure {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(BinaryHeap::new()),
            can_feed: Condvar::new(),
            results_size: AtomicU64::new(0),
            done: AtomicBool::new(false),
        })
    }

    /// Blocks the producer until all of `rws.len < bound`,
    /// `results_size < results_threshold`, `size_estimate < commit_threshold`
    /// hold (spec §4.5), or until the run is finished.
    pub fn wait_until_ready(&self, state: &ReconState, bound: usize, results_threshold: u64, commit_threshold: u64) {
        let mut heap = self.heap.lock();
        loop {
            if self.done.load(Ordering::Acquire) {
                return;
            }
            let ready = heap.len() < bound
                && self.results_size.load(Ordering::Acquire) < results_threshold
                && (state.size_estimate() as u64) < commit_threshold;
            if ready {
                return;
            }
            self.can_feed.wait(&mut heap);
        }
    }

    fn push(&self, task: TxTask) {
        let mut heap = self.heap.lock();
        self.results_size.fetch_add(task.results_size as u64, Ordering::AcqRel);
        heap.push(Reverse(HeapEntry(task)));
    }

    fn peek_is(&self, tx_num: u64) -> bool {
        matches!(self.heap.lock().peek(), Some(Reverse(entry)) if entry.0.tx_num == tx_num)
    }

    fn pop(&self) -> TxTask {
        let task = self.heap.lock().pop().expect("peek_is confirmed non-empty").0 .0;
        self.results_size.fetch_sub(task.results_size as u64, Ordering::AcqRel);
        task
    }

    fn drain_all(&self) -> Vec<TxTask> {
        let mut heap = self.heap.lock();
        let drained: Vec<TxTask> = std::mem::take(&mut *heap).into_iter().map(|Reverse(e)| e.0).collect();
        self.results_size.store(0, Ordering::Release);
        drained
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    fn finish(&self) {
        self.done.store(true, Ordering::Release);
        self.can_feed.notify_all();
    }
}

/// What a completed run reports back to the driver.
#[derive(Clone, Copy, Debug, Default)]
pub struct CollectorOutcome {
    pub output_tx_num: u64,
    pub output_block_num: u64,
    pub repeat_count: u64,
}

pub struct Collector {
    backpressure: Arc<Backpressure>,
    results_rx: crossbeam_channel::Receiver<TxTask>,
    state: Arc<ReconState>,
    kv: Arc<dyn KvBackend>,
    max_tx_num: Arc<AtomicU64>,
    output_tx_num: u64,
    output_block_num: u64,
    repeat_count: u64,
    commit_threshold: u64,
}

impl Collector {
    pub fn new(
        backpressure: Arc<Backpressure>,
        results_rx: crossbeam_channel::Receiver<TxTask>,
        state: Arc<ReconState>,
        kv: Arc<dyn KvBackend>,
        max_tx_num: Arc<AtomicU64>,
        commit_threshold: u64,
        start_tx_num: u64,
    ) -> Self {
        Self {
            backpressure,
            results_rx,
            state,
            kv,
            max_tx_num,
            output_tx_num: start_tx_num,
            output_block_num: 0,
            repeat_count: 0,
            commit_threshold,
        }
    }

    /// Runs the main loop until `output_tx_num >= max_tx_num` (spec §4.4).
    pub fn run(mut self) -> ReconResult<CollectorOutcome> {
        let mut apply_txn = self.kv.begin_rw()?;
        loop {
            match self.results_rx.recv_timeout(Duration::from_millis(500)) {
                Ok(task) => {
                    self.backpressure.push(task);
                    self.drain_prefix(&mut *apply_txn)?;
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    info!(
                        output_tx_num = self.output_tx_num,
                        output_block_num = self.output_block_num,
                        heap_len = self.backpressure.len(),
                        "progress"
                    );
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    self.drain_prefix(&mut *apply_txn)?;
                    break;
                }
            }
            self.backpressure.can_feed.notify_all();
            metrics::record_size_estimate(self.state.size_estimate());

            if self.state.size_estimate() as u64 >= self.commit_threshold {
                apply_txn = self.checkpoint(apply_txn)?;
            }

            if self.output_tx_num >= self.max_tx_num.load(Ordering::Acquire) {
                break;
            }
        }
        apply_txn.commit()?;
        self.backpressure.finish();
        Ok(CollectorOutcome {
            output_tx_num: self.output_tx_num,
            output_block_num: self.output_block_num,
            repeat_count: self.repeat_count,
        })
    }

    /// Drains the heap's ascending-`tx_num` prefix: validate, apply or
    /// re-queue, release any parked sender sibling. Stops as soon as the
    /// heap's minimum is no longer `output_tx_num` (spec §4.4).
    fn drain_prefix(&mut self, apply_txn: &mut dyn KvWriteTxn) -> ReconResult<()> {
        while self.backpressure.peek_is(self.output_tx_num) {
            let task = self.backpressure.pop();
            let valid = task.error.is_none() && self.state.reads_valid(task.tx_num, &task.read_lists);
            if valid {
                let sender = task.sender;
                let tx_num = task.tx_num;
                let block_num = task.block_num;
                self.state.apply(&task, apply_txn)?;
                self.output_tx_num += 1;
                self.output_block_num = block_num;
                metrics::record_applied();
                metrics::record_output_block_number(block_num);
                self.state.commit_tx_num(sender, tx_num);
            } else {
                let tx_num = task.tx_num;
                let sender = task.sender;
                let mut task = task;
                task.reset_outputs();
                self.repeat_count += 1;
                metrics::record_repeat();
                warn!(tx_num, ?sender, "re-queueing after stale read or revert");
                self.state.add_work(task);
            }
        }
        Ok(())
    }

    /// The checkpoint protocol (spec §4.4, numbered steps in comments).
    fn checkpoint(&mut self, apply_txn: Box<dyn KvWriteTxn>) -> ReconResult<Box<dyn KvWriteTxn>> {
        info!(output_tx_num = self.output_tx_num, "checkpoint starting");
        metrics::record_checkpoint();
        let mut apply_txn = apply_txn;

        // 1. Drain the channel and the heap's applicable prefix fully.
        while let Ok(task) = self.results_rx.try_recv() {
            self.backpressure.push(task);
        }
        self.drain_prefix(&mut *apply_txn)?;

        // 2. Exclusive lock: no worker starts a new task past this point.
        let _guard = self.state.checkpoint_guard();

        // 3. Drain anything produced between steps 1 and 2; requeue rather
        // than apply, since the flush below is about to invalidate every
        // in-flight read-set.
        while let Ok(task) = self.results_rx.try_recv() {
            self.backpressure.push(task);
        }
        let leftovers = self.backpressure.drain_all();
        let requeued = leftovers.len();
        for task in leftovers {
            self.state.add_work(task);
        }

        // 4. Commit the apply-side transaction.
        apply_txn.commit()?;

        // 5. Per-worker KV read transactions would be reset here against a
        // real backend; the in-memory fakes hold no transaction snapshot
        // that can go stale, so there is nothing to do.

        // 6. Flush the overlay under a fresh write transaction.
        let mut flush_txn = self.kv.begin_rw()?;
        self.state.flush(&mut *flush_txn)?;
        flush_txn.commit()?;

        if requeued > 0 {
            debug!(requeued, "checkpoint requeued in-flight tasks");
        }

        // 7. Re-open the apply transaction; `_guard` releases on return.
        self.kv.begin_rw()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use recon_types::{ChainRules, Header, TxTask};

    use super::*;
    use crate::test_utils::FakeAggregator;

    fn task(tx_num: u64) -> TxTask {
        TxTask::new(tx_num, 0, [0; 32], Arc::new(Header::default()), ChainRules::default(), -1, None, None, false)
    }

    #[test]
    fn backpressure_pops_in_ascending_tx_num_order() {
        let bp = Backpressure::new();
        bp.push(task(5));
        bp.push(task(1));
        bp.push(task(3));

        assert!(bp.peek_is(1));
        assert_eq!(bp.pop().tx_num, 1);
        assert!(bp.peek_is(3));
        assert_eq!(bp.pop().tx_num, 3);
        assert_eq!(bp.pop().tx_num, 5);
    }

    #[test]
    fn wait_until_ready_returns_immediately_below_bounds() {
        let state = ReconState::new(Arc::new(FakeAggregator::default()));
        let bp = Backpressure::new();
        // Below every bound: must not block.
        bp.wait_until_ready(&state, 128, 1 << 30, 1 << 30);
    }

    #[test]
    fn drain_all_empties_the_heap_and_resets_accounting() {
        let bp = Backpressure::new();
        let mut t = task(0);
        t.results_size = 10;
        bp.push(t);
        assert_eq!(bp.len(), 1);

        let drained = bp.drain_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(bp.len(), 0);
    }
}
