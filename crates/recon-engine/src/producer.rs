//! Producer / feeder (spec §4.5): materialises canonical blocks in order,
//! enqueues `len(txs)+2` tasks per block, and applies backpressure before
//! every enqueue.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use recon_types::{BlockReader, ReconResult, TxTask};
use tracing::info;

use crate::collector::Backpressure;
use crate::recon_state::ReconState;

#[derive(Clone, Copy, Debug, Default)]
pub struct ProducerOutcome {
    /// `None` if the run was cancelled before a single block's tasks were
    /// fully enqueued; resuming should restart at `start_block` unchanged.
    pub last_enqueued_block: Option<u64>,
    pub last_enqueued_tx_num: u64,
}

pub struct Producer<R: BlockReader + ?Sized> {
    reader: Arc<R>,
    state: Arc<ReconState>,
    backpressure: Arc<Backpressure>,
    heap_backpressure_bound: usize,
    results_threshold: u64,
    commit_threshold: u64,
    cancel: Arc<AtomicBool>,
    max_tx_num: Arc<AtomicU64>,
}

impl<R: BlockReader + ?Sized> Producer<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reader: Arc<R>,
        state: Arc<ReconState>,
        backpressure: Arc<Backpressure>,
        heap_backpressure_bound: usize,
        results_threshold: u64,
        commit_threshold: u64,
        cancel: Arc<AtomicBool>,
        max_tx_num: Arc<AtomicU64>,
    ) -> Self {
        Self {
            reader,
            state,
            backpressure,
            heap_backpressure_bound,
            results_threshold,
            commit_threshold,
            cancel,
            max_tx_num,
        }
    }

    /// Feeds blocks `start_block..=max_block_num` in order. Returns the
    /// progress actually made, for the driver to persist (spec §4.5:
    /// shutdown is cooperative, resuming at `last_enqueued_block + 1`).
    pub fn run(self, start_block: u64, max_block_num: u64) -> ReconResult<ProducerOutcome> {
        let bodies = self.reader.iter_bodies()?;
        let base_tx_num = bodies.iter().find(|b| b.block_num == start_block).map(|b| b.base_tx_num).unwrap_or(0);

        let mut tx_num = base_tx_num;
        let mut outcome = ProducerOutcome { last_enqueued_block: None, last_enqueued_tx_num: base_tx_num };

        for block_num in start_block..=max_block_num {
            if self.cancel.load(Ordering::Acquire) {
                info!(block_num, "producer stopping on interrupt");
                break;
            }

            let header = Arc::new(self.reader.header_by_number(block_num)?);
            let rules = self.reader.rules_at(block_num)?;
            let (txs, senders) = self.reader.block_with_senders(block_num)?;
            let tx_count = txs.len() as i64;

            self.enqueue(TxTask::new(tx_num, block_num, header.root, header.clone(), rules, -1, None, None, false));
            outcome.last_enqueued_tx_num = tx_num;
            tx_num += 1;

            // Genesis computation is a one-shot special case (spec §8
            // scenario 1: a genesis-only run applies exactly one task), not
            // a block run through the normal prologue/tx/finalisation
            // triple -- there is no "finalisation" of a block that was
            // never executed.
            if block_num != 0 {
                for (tx_index, (tx, sender)) in txs.into_iter().zip(senders).enumerate() {
                    let task = TxTask::new(
                        tx_num,
                        block_num,
                        header.root,
                        header.clone(),
                        rules,
                        tx_index as i64,
                        Some(tx),
                        sender,
                        false,
                    );
                    self.enqueue(task);
                    outcome.last_enqueued_tx_num = tx_num;
                    tx_num += 1;
                }

                self.enqueue(TxTask::new(tx_num, block_num, header.root, header.clone(), rules, tx_count, None, None, true));
                outcome.last_enqueued_tx_num = tx_num;
                tx_num += 1;
            }

            outcome.last_enqueued_block = Some(block_num);
            info!(block_num, tx_num, "block enqueued");
        }

        self.max_tx_num.store(tx_num, Ordering::Release);
        Ok(outcome)
    }

    fn enqueue(&self, task: TxTask) {
        self.backpressure.wait_until_ready(
            &self.state,
            self.heap_backpressure_bound,
            self.results_threshold,
            self.commit_threshold,
        );
        if self.state.register_sender(&task) {
            self.state.add_work(task);
        } else {
            self.state.park(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use recon_types::{ChainRules, Header};

    use super::*;
    use crate::collector::Backpressure;
    use crate::test_utils::{FakeAggregator, FakeBlock, FakeBlockReader};

    fn producer(reader: FakeBlockReader) -> Producer<FakeBlockReader> {
        Producer::new(
            Arc::new(reader),
            Arc::new(ReconState::new(Arc::new(FakeAggregator::default()))),
            Backpressure::new(),
            128,
            1 << 30,
            1 << 30,
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicU64::new(u64::MAX)),
        )
    }

    #[test]
    fn genesis_block_enqueues_exactly_one_task() {
        let mut reader = FakeBlockReader::default();
        reader.insert(FakeBlock {
            header: Header { number: 0, root: [0; 32], ..Default::default() },
            rules: ChainRules::default(),
            txs: vec![],
            senders: vec![],
        });
        let outcome = producer(reader).run(0, 0).unwrap();
        assert_eq!(outcome.last_enqueued_tx_num, 0);
    }

    #[test]
    fn interrupt_before_any_block_enqueues_nothing() {
        let mut reader = FakeBlockReader::default();
        reader.insert(FakeBlock {
            header: Header { number: 0, root: [0; 32], ..Default::default() },
            rules: ChainRules::default(),
            txs: vec![],
            senders: vec![],
        });

        let p = Producer::new(
            Arc::new(reader),
            Arc::new(ReconState::new(Arc::new(FakeAggregator::default()))),
            Backpressure::new(),
            128,
            1 << 30,
            1 << 30,
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicU64::new(u64::MAX)),
        );
        let outcome = p.run(0, 0).unwrap();
        assert_eq!(outcome.last_enqueued_block, None);
    }
}
