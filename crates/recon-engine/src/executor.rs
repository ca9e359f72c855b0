//! Stateless executor worker loop (spec §4.2). Each worker runs this as the
//! body of its own `std::thread::spawn` (spec §5); none of them mutate
//! shared state directly, only through the task they hand to the result
//! channel.

use std::sync::Arc;

use recon_types::{
    BucketId, Evm, ExecCtx, ExecOutcome, KvBackend, KvReadTxn, ReconResult, StateView, TxKind,
    TxTask,
};
use tracing::{debug, trace};

use crate::recon_state::{OverlayView, ReconState};

pub struct Worker {
    id: usize,
    state: Arc<ReconState>,
    evm: Arc<dyn Evm>,
    /// Opened once per worker (spec §4.2 step 2: "amortised"), not per
    /// task. Falls back to the persisted KV backend for keys neither the
    /// overlay nor the historical aggregator know about.
    kv_ro: Box<dyn KvReadTxn + Send>,
    results_tx: crossbeam_channel::Sender<TxTask>,
}

impl Worker {
    pub fn new(
        id: usize,
        state: Arc<ReconState>,
        kv: Arc<dyn KvBackend>,
        evm: Arc<dyn Evm>,
        results_tx: crossbeam_channel::Sender<TxTask>,
    ) -> ReconResult<Self> {
        let kv_ro = kv.begin_ro()?;
        Ok(Self { id, state, evm, kv_ro, results_tx })
    }

    /// Runs until `ReconState::schedule` reports shutdown (`None`).
    pub fn run(self) {
        debug!(worker = self.id, "worker started");
        while let Some(mut task) = self.state.schedule() {
            self.execute_one(&mut task);
            trace!(worker = self.id, tx_num = task.tx_num, "executed task");
            if self.results_tx.send(task).is_err() {
                break;
            }
        }
        debug!(worker = self.id, "worker exiting");
    }

    fn execute_one(&self, task: &mut TxTask) {
        // Held for the whole execution span, not just individual reads, so
        // a checkpoint can never interleave with a task that started before
        // it (spec §4.4 step 2).
        let _task_guard = self.state.task_guard();

        let view = WorkerView { overlay: self.state.view_at(task.tx_num), kv_ro: self.kv_ro.as_ref() };
        let ctx = ExecCtx {
            block_num: task.block_num,
            header: (*task.header).clone(),
            rules: task.rules,
            tx: task.tx.clone(),
            sender: task.sender,
        };
        let outcome: ExecOutcome = match task.kind() {
            TxKind::Genesis => self.evm.genesis(&ctx, &view),
            TxKind::DaoFork => self.evm.apply_dao_fork(&ctx, &view),
            TxKind::Prologue => ExecOutcome::default(),
            TxKind::Finalization => self.evm.finalize_block(&ctx, &view),
            TxKind::Transaction => self.evm.execute(&ctx, &view),
        };

        debug_assert!(
            outcome.error.is_none() || outcome.write_lists.is_empty(),
            "evm must discard writes on revert (spec open question, resolved in DESIGN.md)",
        );

        task.error = outcome.error;
        task.read_lists = outcome.read_lists;
        task.results_size = outcome.write_lists.byte_size();
        task.write_lists = outcome.write_lists;
        task.balance_increase_set = outcome.balance_increase_set;
        task.account_prevs = outcome.account_prevs;
        task.account_dels = outcome.account_dels;
        task.storage_prevs = outcome.storage_prevs;
        task.code_prevs = outcome.code_prevs;
    }
}

/// Layers a worker's amortised KV read transaction beneath the
/// overlay/aggregator view `ReconState` builds per task (spec §4.2 steps 2
/// and 3): a key absent from both the overlay and the aggregator's history
/// falls back to the persisted base state.
struct WorkerView<'a> {
    overlay: OverlayView<'a>,
    kv_ro: &'a dyn KvReadTxn,
}

impl StateView for WorkerView<'_> {
    fn get(&self, bucket: BucketId, key: &[u8]) -> ReconResult<Option<Vec<u8>>> {
        if let Some(val) = self.overlay.get(bucket, key)? {
            return Ok(Some(val));
        }
        self.kv_ro.get(bucket, key)
    }
}
