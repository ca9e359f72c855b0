//! End-to-end scenarios against in-memory fakes (spec §8's literal list).

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use recon_engine::config::ReconConfig;
use recon_engine::runner::{self, Collaborators};
use recon_engine::test_utils::{FakeAggregator, FakeBlock, FakeBlockReader, FakeEvm, FakeKvBackend, FakeRootVerifier};
use recon_types::{Address, BucketId, ChainRules, Header, KvBackend, KvReadTxn, RawTx};

fn addr(b: u8) -> Address {
    [b; 20]
}

fn collaborators(reader: FakeBlockReader, root_matches: bool) -> Collaborators {
    Collaborators {
        block_reader: Arc::new(reader),
        aggregator: Arc::new(FakeAggregator::default()),
        kv: Arc::new(FakeKvBackend::default()),
        evm: Arc::new(FakeEvm),
        root_verifier: Arc::new(FakeRootVerifier { matches: root_matches }),
    }
}

fn config(max_block_num: u64, num_workers: usize) -> ReconConfig {
    ReconConfig { max_block_num, num_workers, ..ReconConfig::default() }.validated().unwrap()
}

/// Scenario 1: genesis only. One task applied (the prologue), and the
/// genesis allocation ends up in the flushed KV state.
#[test]
fn genesis_only() {
    let alloc_addr = addr(0xAA);
    let mut reader = FakeBlockReader::default();
    reader.insert(FakeBlock {
        header: Header { number: 0, root: [0; 32], genesis_alloc: vec![(alloc_addr, b"100".to_vec())] },
        rules: ChainRules::default(),
        txs: vec![],
        senders: vec![],
    });

    let kv = Arc::new(FakeKvBackend::default());
    let cfg = config(0, 2);
    let outcome = runner::run(
        &cfg,
        Collaborators {
            block_reader: Arc::new(reader),
            aggregator: Arc::new(FakeAggregator::default()),
            kv: kv.clone(),
            evm: Arc::new(FakeEvm),
            root_verifier: Arc::new(FakeRootVerifier { matches: true }),
        },
        Arc::new(AtomicBool::new(false)),
        [0; 32],
    )
    .unwrap();

    assert_eq!(outcome.output_tx_num, 1);
    assert_eq!(outcome.output_block_num, 0);
    assert_eq!(outcome.repeat_count, 0);
    assert_eq!(outcome.root_matches, Some(true));

    let ro = kv.begin_ro().unwrap();
    assert_eq!(ro.get(BucketId::HashedAccounts, &alloc_addr).unwrap(), Some(b"100".to_vec()));
}

/// A block with zero transactions still produces exactly 2 applied tasks
/// (prologue + finalisation) -- spec §8's round-trip property.
#[test]
fn empty_block_produces_exactly_two_tasks() {
    let mut reader = FakeBlockReader::default();
    reader.insert(FakeBlock {
        header: Header { number: 0, root: [0; 32], ..Default::default() },
        rules: ChainRules::default(),
        txs: vec![],
        senders: vec![],
    });
    reader.insert(FakeBlock {
        header: Header { number: 1, root: [0; 32], ..Default::default() },
        rules: ChainRules::default(),
        txs: vec![],
        senders: vec![],
    });

    let cfg = config(1, 2);
    let outcome =
        runner::run(&cfg, collaborators(reader, true), Arc::new(AtomicBool::new(false)), [0; 32]).unwrap();

    // Block 0: 1 prologue (genesis). Block 1: prologue + final = 2.
    assert_eq!(outcome.output_tx_num, 3);
    assert_eq!(outcome.output_block_num, 1);
}

/// Scenario 2: two independent senders, two transactions each, one block.
/// 6 tasks total (prologue, 4 txs, final); every tx_num is applied exactly
/// once regardless of how workers interleave. Block 1, not block 0: the
/// genesis block is a one-shot pseudo-tx and never runs ordinary
/// transactions (see `producer.rs`'s genesis special case).
#[test]
fn two_independent_senders_serialize_internally_but_run_concurrently() {
    let mut reader = FakeBlockReader::default();
    reader.insert(FakeBlock {
        header: Header { number: 1, root: [0; 32], ..Default::default() },
        rules: ChainRules::default(),
        txs: vec![
            RawTx(b"a1".to_vec()),
            RawTx(b"b1".to_vec()),
            RawTx(b"a2".to_vec()),
            RawTx(b"b2".to_vec()),
        ],
        senders: vec![Some(addr(0xA)), Some(addr(0xB)), Some(addr(0xA)), Some(addr(0xB))],
    });

    let cfg = ReconConfig { start_block: 1, max_block_num: 1, num_workers: 4, ..ReconConfig::default() }
        .validated()
        .unwrap();
    let outcome =
        runner::run(&cfg, collaborators(reader, true), Arc::new(AtomicBool::new(false)), [0; 32]).unwrap();

    assert_eq!(outcome.output_tx_num, 6);
    assert_eq!(outcome.output_block_num, 1);
}

/// Scenario 3: a conflicting write forces at least one re-execution.
/// Sender A and sender B's transactions both target the explicit shared
/// key `k` (the `key=value` payload convention, see `FakeEvm`). Whichever
/// of the two is applied second must observe the conflict and, having read
/// a stale value, be re-queued. Block 1, not block 0, for the same reason
/// as the independent-senders scenario above.
#[test]
fn conflicting_writes_are_detected_and_may_trigger_a_requeue() {
    let mut reader = FakeBlockReader::default();
    reader.insert(FakeBlock {
        header: Header { number: 1, root: [0; 32], ..Default::default() },
        rules: ChainRules::default(),
        txs: vec![RawTx(b"k=v1".to_vec()), RawTx(b"k=v2".to_vec())],
        senders: vec![Some(addr(0xA)), Some(addr(0xB))],
    });

    let cfg = ReconConfig { start_block: 1, max_block_num: 1, num_workers: 2, ..ReconConfig::default() }
        .validated()
        .unwrap();
    let outcome =
        runner::run(&cfg, collaborators(reader, true), Arc::new(AtomicBool::new(false)), [0; 32]).unwrap();

    // Density holds regardless of how many re-executions happened.
    assert_eq!(outcome.output_tx_num, 4);
    assert!(outcome.repeat_count >= 1, "two senders racing on the same key must trigger a requeue");
}

/// Scenario 4: a tiny commit threshold forces at least one checkpoint
/// mid-run. The run must still converge to the same final tx_num.
#[test]
fn small_commit_threshold_forces_a_checkpoint_but_still_converges() {
    let mut reader = FakeBlockReader::default();
    for n in 1..=3u64 {
        reader.insert(FakeBlock {
            header: Header { number: n, root: [0; 32], ..Default::default() },
            rules: ChainRules::default(),
            txs: vec![RawTx(format!("tx{n}").into_bytes())],
            senders: vec![Some(addr(n as u8))],
        });
    }

    let cfg = ReconConfig {
        start_block: 1,
        max_block_num: 3,
        num_workers: 2,
        commit_threshold: 1,
        ..ReconConfig::default()
    }
    .validated()
    .unwrap();
    let outcome =
        runner::run(&cfg, collaborators(reader, true), Arc::new(AtomicBool::new(false)), [0; 32]).unwrap();

    // 3 blocks, none of them genesis, each prologue + 1 tx + final = 9.
    assert_eq!(outcome.output_tx_num, 9);
    assert_eq!(outcome.output_block_num, 3);
}

/// Scenario 5: interrupting after enqueue completes still drains cleanly
/// and reports no root verification attempt.
#[test]
fn interrupt_before_run_skips_verification_but_exits_cleanly() {
    let mut reader = FakeBlockReader::default();
    reader.insert(FakeBlock {
        header: Header { number: 0, root: [0; 32], ..Default::default() },
        rules: ChainRules::default(),
        txs: vec![],
        senders: vec![],
    });

    let cfg = config(0, 1);
    let cancel = Arc::new(AtomicBool::new(true));
    let outcome = runner::run(&cfg, collaborators(reader, true), cancel, [0; 32]).unwrap();

    assert_eq!(outcome.root_matches, None);
}

/// Scenario 6: a corrupted root is reported but does not fail the run.
#[test]
fn root_mismatch_is_reported_without_failing_the_run() {
    let mut reader = FakeBlockReader::default();
    reader.insert(FakeBlock {
        header: Header { number: 0, root: [0; 32], ..Default::default() },
        rules: ChainRules::default(),
        txs: vec![],
        senders: vec![],
    });

    let cfg = config(0, 1);
    let outcome =
        runner::run(&cfg, collaborators(reader, false), Arc::new(AtomicBool::new(false)), [0; 32]).unwrap();

    assert_eq!(outcome.root_matches, Some(false));
}
