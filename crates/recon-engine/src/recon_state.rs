use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use recon_types::{
    Address, BucketId, HistoricalAggregator, KvWriteTxn, ReadList, ReconError, ReconResult,
    StateView, TxTask, WriteList,
};
use tracing::{debug, trace, warn};

/// One sender's in-flight bookkeeping (spec §4.3).
///
/// The spec's pseudocode stores `senders[sender] -> last_committed_tx_num`
/// and checks contiguity against the *global* `tx_num - 1`, which cannot be
/// right for a sender whose transactions are interleaved with other
/// senders' in the same block. We resolve this (documented in DESIGN.md) by
/// tracking whether the sender currently has an uncommitted task in flight,
/// independent of the numeric gap between tx_nums: that is the predicate
/// the rest of §4.3 and invariant 4 actually need.
struct SenderEntry {
    last_seen_tx_num: u64,
    in_flight: bool,
}

/// A single overlay entry: the tx_num that produced it (for monotonicity,
/// invariant 5) and the value itself.
struct OverlayEntry {
    tx_num: u64,
    val: Vec<u8>,
}

type OverlayKey = (BucketId, Vec<u8>);

/// The scheduler's heart (spec §3, §4.1). Shared by every worker, the
/// collector, and the producer; none of them own it outright (spec §9's
/// note on cyclic references — `ReconState` is an independently-owned
/// value everyone borrows).
pub struct ReconState {
    // Held behind a lock so `shutdown` can drop it, closing the channel once
    // the queue drains. Plain field storage would keep the channel open for
    // as long as any `Arc<ReconState>` is alive, i.e. forever.
    ready_tx: Mutex<Option<crossbeam_channel::Sender<TxTask>>>,
    ready_rx: crossbeam_channel::Receiver<TxTask>,

    overlay: RwLock<HashMap<OverlayKey, OverlayEntry>>,
    senders: Mutex<HashMap<Address, SenderEntry>>,
    triggered: Mutex<HashMap<Address, VecDeque<TxTask>>>,
    balances: Mutex<HashMap<Address, i128>>,

    // The "global exclusive lock" from spec §4.4 step 2: workers hold it
    // shared for the duration of one task's execution; the collector takes
    // it exclusive for the span of a checkpoint, so no worker starts a new
    // task while a checkpoint is underway. Deliberately a distinct lock from
    // `overlay`, which only ever needs to be held for the length of a single
    // read or the write-heavy tail of a checkpoint, not a whole task.
    checkpoint_lock: RwLock<()>,

    aggregator: Arc<dyn HistoricalAggregator>,

    done_count: AtomicU64,
    size_estimate: AtomicUsize,
}

impl ReconState {
    pub fn new(aggregator: Arc<dyn HistoricalAggregator>) -> Self {
        let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
        Self {
            ready_tx: Mutex::new(Some(ready_tx)),
            ready_rx,
            overlay: RwLock::new(HashMap::new()),
            senders: Mutex::new(HashMap::new()),
            triggered: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            checkpoint_lock: RwLock::new(()),
            aggregator,
            done_count: AtomicU64::new(0),
            size_estimate: AtomicUsize::new(0),
        }
    }

    /// Blocking pull of one ready task. `None` signals shutdown (the ready
    /// channel was closed by `shutdown`).
    pub fn schedule(&self) -> Option<TxTask> {
        self.ready_rx.recv().ok()
    }

    /// Non-blocking drain of whatever is currently ready, used by the
    /// checkpoint protocol (spec §4.4 step 3) to pull tasks back out of the
    /// queue before discarding them is unnecessary -- tasks already queued
    /// but not yet executing remain valid across a checkpoint, since a
    /// checkpoint only invalidates *in-flight* read-sets.
    pub fn try_schedule(&self) -> Option<TxTask> {
        self.ready_rx.try_recv().ok()
    }

    /// Pushes a task back onto the ready queue (re-queue on invalidation,
    /// or first enqueue from the producer once `register_sender` accepts).
    pub fn add_work(&self, task: TxTask) {
        trace!(tx_num = task.tx_num, "add_work");
        if let Some(tx) = self.ready_tx.lock().as_ref() {
            let _ = tx.send(task);
        } else {
            warn!(tx_num = task.tx_num, "add_work called after shutdown, dropping task");
        }
    }

    /// Closes the ready queue. Every worker's blocking `schedule()` call
    /// returns `None` once the queue drains. Must only be called once the
    /// producer and collector are done enqueueing work.
    pub fn shutdown(&self) {
        self.ready_tx.lock().take();
    }

    /// Called by the producer before first enqueue of a task with a sender.
    /// Returns whether the task may be enqueued immediately; if not, it is
    /// parked in `triggered` and the caller must not enqueue it.
    pub fn register_sender(&self, task: &TxTask) -> bool {
        let Some(sender) = task.sender else {
            return true;
        };
        let mut senders = self.senders.lock();
        let accept = match senders.get(&sender) {
            None => true,
            Some(entry) => !entry.in_flight,
        };
        if accept {
            senders.insert(sender, SenderEntry { last_seen_tx_num: task.tx_num, in_flight: true });
        }
        accept
    }

    /// Parks a task that `register_sender` rejected. Must be called with
    /// the exact task that was just rejected, in increasing `tx_num` order
    /// per sender (the producer enqueues in canonical chain order, so this
    /// holds automatically).
    pub fn park(&self, task: TxTask) {
        debug!(tx_num = task.tx_num, sender = ?task.sender, "parking task behind sender predecessor");
        let sender = task.sender.expect("park called for a task without a sender");
        self.triggered.lock().entry(sender).or_default().push_back(task);
    }

    /// Called by the collector after applying one task. Releases the next
    /// parked task for `sender`, if any, onto the ready queue. Returns the
    /// number of tasks released (0 or 1), matching spec's `released_count`.
    pub fn commit_tx_num(&self, sender: Option<Address>, tx_num: u64) -> usize {
        let Some(sender) = sender else {
            return 0;
        };
        let next = {
            let mut triggered = self.triggered.lock();
            match triggered.get_mut(&sender) {
                Some(queue) => queue.pop_front(),
                None => None,
            }
        };
        let mut senders = self.senders.lock();
        match next {
            Some(next_task) => {
                let entry = senders.get_mut(&sender).expect("sender must be registered");
                entry.last_seen_tx_num = next_task.tx_num;
                entry.in_flight = true;
                drop(senders);
                self.add_work(next_task);
                1
            }
            None => {
                if let Some(entry) = senders.get_mut(&sender) {
                    entry.last_seen_tx_num = tx_num;
                    entry.in_flight = false;
                }
                0
            }
        }
    }

    /// Builds a read-only state view at `tx_num`: overlay first, historical
    /// aggregator as fallback (spec §4.2 step 3).
    pub fn view_at(&self, tx_num: u64) -> OverlayView<'_> {
        OverlayView { state: self, tx_num }
    }

    /// Re-checks every key in `read_lists` against the current overlay and
    /// historical aggregator. Returns `false` (stale) if any observed value
    /// differs from the value the task originally read.
    pub fn reads_valid(&self, tx_num: u64, read_lists: &ReadList) -> bool {
        let overlay = self.overlay.read();
        for (bucket, key, observed) in read_lists.iter() {
            let current = match overlay.get(&(bucket, key.to_vec())) {
                Some(entry) => Some(entry.val.clone()),
                None => match self.aggregator.read(bucket, key, tx_num) {
                    Ok(v) => v,
                    Err(err) => {
                        warn!(?err, "historical aggregator read failed during validation");
                        return false;
                    }
                },
            };
            if current.as_deref() != observed {
                return false;
            }
        }
        true
    }

    /// Atomically merges `task.write_lists` and `task.balance_increase_set`
    /// into the overlay and into the aggregator's write buffer
    /// (`kv_writer`), and bumps the done-task counter. The inverse-diff
    /// fields (`account_prevs`/`account_dels`/`storage_prevs`/`code_prevs`)
    /// are carried on the task for a future unwind path; nothing in this
    /// workspace consumes them yet.
    pub fn apply(&self, task: &TxTask, kv_writer: &mut dyn KvWriteTxn) -> ReconResult<()> {
        {
            let mut overlay = self.overlay.write();
            for (bucket, key, val) in task.write_lists.iter() {
                let entry_key = (bucket, key.to_vec());
                // Invariant 5: the overlay is monotonic by tx_num per key.
                if let Some(existing) = overlay.get(&entry_key) {
                    if existing.tx_num > task.tx_num {
                        return Err(ReconError::Invariant(format!(
                            "overlay regression: key already written by tx_num {} > {}",
                            existing.tx_num, task.tx_num
                        )));
                    }
                }
                overlay.insert(entry_key, OverlayEntry { tx_num: task.tx_num, val: val.to_vec() });
                kv_writer.put(bucket, key, val)?;
            }
        }
        if !task.balance_increase_set.is_empty() {
            let mut balances = self.balances.lock();
            for (addr, delta) in &task.balance_increase_set {
                *balances.entry(*addr).or_insert(0) += delta;
            }
        }
        self.size_estimate.fetch_add(task.write_lists.byte_size(), Ordering::Relaxed);
        self.done_count.fetch_add(1, Ordering::Relaxed);
        self.aggregator.set_tx(task.tx_num);
        Ok(())
    }

    pub fn size_estimate(&self) -> usize {
        self.size_estimate.load(Ordering::Relaxed)
    }

    pub fn done_count(&self) -> u64 {
        self.done_count.load(Ordering::Relaxed)
    }

    /// Bulk-persists the overlay to the KV backend and clears it. Called by
    /// the collector's checkpoint protocol (spec §4.4 step 6).
    pub fn flush(&self, kv_writer: &mut dyn KvWriteTxn) -> ReconResult<()> {
        let mut overlay = self.overlay.write();
        for ((bucket, key), entry) in overlay.iter() {
            kv_writer.put(*bucket, key, &entry.val)?;
        }
        overlay.clear();
        self.size_estimate.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Held by a worker for the span of one task's execution (spec §4.4
    /// step 2: "workers take it in shared mode while executing").
    pub fn task_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.checkpoint_lock.read()
    }

    /// Held by the collector for the span of a checkpoint; blocks every
    /// worker from starting a new task until dropped.
    pub fn checkpoint_guard(&self) -> RwLockWriteGuard<'_, ()> {
        self.checkpoint_lock.write()
    }

    #[cfg(test)]
    pub fn overlay_len(&self) -> usize {
        self.overlay.read().len()
    }
}

/// A [`StateView`] over `ReconState`'s overlay, falling back to the
/// historical aggregator at a fixed `tx_num`.
pub struct OverlayView<'a> {
    state: &'a ReconState,
    tx_num: u64,
}

impl StateView for OverlayView<'_> {
    fn get(&self, bucket: BucketId, key: &[u8]) -> ReconResult<Option<Vec<u8>>> {
        if let Some(entry) = self.state.overlay.read().get(&(bucket, key.to_vec())) {
            return Ok(Some(entry.val.clone()));
        }
        self.state.aggregator.read(bucket, key, self.tx_num)
    }
}

#[cfg(test)]
mod tests {
    use recon_types::{ChainRules, Header, TxTask};
    use std::sync::Arc;

    use super::*;
    use crate::test_utils::{FakeAggregator, FakeKvWriter};

    fn sender_task(tx_num: u64, sender: Address) -> TxTask {
        TxTask::new(
            tx_num,
            1,
            [0; 32],
            Arc::new(Header::default()),
            ChainRules::default(),
            0,
            None,
            Some(sender),
            false,
        )
    }

    #[test]
    fn first_task_for_a_sender_is_accepted() {
        let state = ReconState::new(Arc::new(FakeAggregator::default()));
        let task = sender_task(0, [1; 20]);
        assert!(state.register_sender(&task));
    }

    #[test]
    fn second_task_for_in_flight_sender_is_rejected_and_released_on_commit() {
        let state = ReconState::new(Arc::new(FakeAggregator::default()));
        let a = [1; 20];
        let t1 = sender_task(0, a);
        assert!(state.register_sender(&t1));

        let t2 = sender_task(2, a);
        assert!(!state.register_sender(&t2));
        state.park(t2);

        // Nothing queued yet for sender a's second task.
        assert!(state.try_schedule().is_none());

        let released = state.commit_tx_num(Some(a), t1.tx_num);
        assert_eq!(released, 1);
        let released_task = state.try_schedule().expect("t2 should now be queued");
        assert_eq!(released_task.tx_num, 2);
    }

    #[test]
    fn commit_with_no_parked_task_marks_sender_idle() {
        let state = ReconState::new(Arc::new(FakeAggregator::default()));
        let a = [1; 20];
        let t1 = sender_task(0, a);
        assert!(state.register_sender(&t1));
        assert_eq!(state.commit_tx_num(Some(a), 0), 0);

        // Sender is idle again: the next task is accepted immediately.
        let t2 = sender_task(5, a);
        assert!(state.register_sender(&t2));
    }

    #[test]
    fn apply_updates_overlay_and_counters() {
        let state = ReconState::new(Arc::new(FakeAggregator::default()));
        let mut task = sender_task(0, [1; 20]);
        task.write_lists.push(BucketId::HashedAccounts, b"k".to_vec(), b"v".to_vec());
        let mut writer = FakeKvWriter::default();
        state.apply(&task, &mut writer).unwrap();

        assert_eq!(state.done_count(), 1);
        assert_eq!(state.overlay_len(), 1);
        assert!(state.size_estimate() > 0);

        let view = state.view_at(0);
        assert_eq!(view.get(BucketId::HashedAccounts, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn reads_valid_detects_staleness_after_conflicting_apply() {
        let state = ReconState::new(Arc::new(FakeAggregator::default()));
        let mut reader_reads = ReadList::default();
        reader_reads.push(BucketId::HashedAccounts, b"k".to_vec(), None);
        assert!(state.reads_valid(0, &reader_reads));

        let mut writer_task = sender_task(1, [2; 20]);
        writer_task.write_lists.push(BucketId::HashedAccounts, b"k".to_vec(), b"new".to_vec());
        let mut writer = FakeKvWriter::default();
        state.apply(&writer_task, &mut writer).unwrap();

        assert!(!state.reads_valid(0, &reader_reads));
    }

    #[test]
    fn flush_clears_overlay_and_resets_size_estimate() {
        let state = ReconState::new(Arc::new(FakeAggregator::default()));
        let mut task = sender_task(0, [1; 20]);
        task.write_lists.push(BucketId::HashedAccounts, b"k".to_vec(), b"v".to_vec());
        let mut writer = FakeKvWriter::default();
        state.apply(&task, &mut writer).unwrap();

        let mut flush_writer = FakeKvWriter::default();
        state.flush(&mut flush_writer).unwrap();
        assert_eq!(state.overlay_len(), 0);
        assert_eq!(state.size_estimate(), 0);
    }

    #[test]
    fn task_guard_allows_concurrent_readers_but_checkpoint_guard_is_exclusive() {
        let state = ReconState::new(Arc::new(FakeAggregator::default()));
        let g1 = state.task_guard();
        let g2 = state.task_guard();
        drop((g1, g2));

        let _checkpoint = state.checkpoint_guard();
        assert!(state.checkpoint_lock.try_read().is_none());
    }
}
