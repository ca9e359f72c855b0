//! Wires the producer, executor workers, and collector together into one
//! run (spec §2, §5). Signal handling lives in the `recon-node` binary, not
//! here: this function takes a cancellation flag instead of installing one,
//! so it can be driven from tests without touching process-wide state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use recon_types::{BlockReader, Evm, HistoricalAggregator, KvBackend, ReconError, RootVerifier};
use thiserror::Error;
use tracing::info;

use crate::collector::{Backpressure, Collector};
use crate::config::ReconConfig;
use crate::executor::Worker;
use crate::producer::Producer;
use crate::recon_state::ReconState;
use crate::verify;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Recon(#[from] ReconError),
    #[error("producer thread panicked")]
    ProducerPanicked,
    #[error("worker thread panicked")]
    WorkerPanicked,
}

/// The external collaborators a run needs (spec §1's "out of scope,
/// referenced only by interface" list plus the EVM).
pub struct Collaborators {
    pub block_reader: Arc<dyn BlockReader>,
    pub aggregator: Arc<dyn HistoricalAggregator>,
    pub kv: Arc<dyn KvBackend>,
    pub evm: Arc<dyn Evm>,
    pub root_verifier: Arc<dyn RootVerifier>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RunOutcome {
    pub output_tx_num: u64,
    pub output_block_num: u64,
    pub repeat_count: u64,
    /// `None` when the run was interrupted before verification ran (spec
    /// §8 scenario 5: an interrupt exits 0 without attempting root
    /// verification).
    pub root_matches: Option<bool>,
}

/// Runs the engine from `config.start_block` to `config.max_block_num`,
/// then performs post-pass root verification unless `cancel` was observed.
pub fn run(
    config: &ReconConfig,
    collaborators: Collaborators,
    cancel: Arc<AtomicBool>,
    expected_root: [u8; 32],
) -> Result<RunOutcome, RunnerError> {
    let state = Arc::new(ReconState::new(collaborators.aggregator.clone()));
    let backpressure = Backpressure::new();
    let max_tx_num = Arc::new(AtomicU64::new(u64::MAX));
    let (results_tx, results_rx) = crossbeam_channel::bounded(config.result_channel_capacity);

    let bodies = collaborators.block_reader.iter_bodies()?;
    let start_tx_num =
        bodies.iter().find(|b| b.block_num == config.start_block).map(|b| b.base_tx_num).unwrap_or(0);

    let collector = Collector::new(
        Arc::clone(&backpressure),
        results_rx,
        Arc::clone(&state),
        Arc::clone(&collaborators.kv),
        Arc::clone(&max_tx_num),
        config.commit_threshold,
        start_tx_num,
    );

    let mut worker_handles = Vec::with_capacity(config.num_workers);
    for id in 0..config.num_workers {
        let worker = Worker::new(
            id,
            Arc::clone(&state),
            Arc::clone(&collaborators.kv),
            Arc::clone(&collaborators.evm),
            results_tx.clone(),
        )?;
        worker_handles.push(thread::spawn(move || worker.run()));
    }
    drop(results_tx);

    let producer = Producer::new(
        Arc::clone(&collaborators.block_reader),
        Arc::clone(&state),
        Arc::clone(&backpressure),
        config.heap_backpressure_bound,
        config.results_threshold,
        config.commit_threshold,
        Arc::clone(&cancel),
        Arc::clone(&max_tx_num),
    );
    let start_block = config.start_block;
    let max_block_num = config.max_block_num;
    let producer_handle = thread::spawn(move || producer.run(start_block, max_block_num));

    let collector_outcome = collector.run()?;

    // Every enqueued task has been applied; the ready queue is drained and
    // every worker is parked on `schedule()` with nothing left to do.
    state.shutdown();
    for handle in worker_handles {
        handle.join().map_err(|_| RunnerError::WorkerPanicked)?;
    }
    let producer_outcome =
        producer_handle.join().map_err(|_| RunnerError::ProducerPanicked)?.map_err(RunnerError::from)?;
    info!(
        last_enqueued_block = ?producer_outcome.last_enqueued_block,
        output_block_num = collector_outcome.output_block_num,
        "run finished"
    );

    let root_matches = if cancel.load(Ordering::Acquire) {
        None
    } else {
        Some(verify::verify(&state, &*collaborators.kv, &*collaborators.root_verifier, &expected_root)?)
    };

    Ok(RunOutcome {
        output_tx_num: collector_outcome.output_tx_num,
        output_block_num: collector_outcome.output_block_num,
        repeat_count: collector_outcome.repeat_count,
        root_matches,
    })
}
