//! In-memory fakes for every external-collaborator trait (spec §6),
//! mirroring the teacher's `MockForestStorage`/`test_utils.rs` pattern: real
//! enough to drive the scheduler end-to-end, with none of the actual
//! storage engine or EVM behind them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use recon_types::{
    Address, BlockReader, BodyMeta, BucketId, ChainRules, Evm, ExecCtx, ExecOutcome, Header,
    HistoricalAggregator, KvBackend, KvReadTxn, KvWriteTxn, RawTx, ReconError, ReconResult,
    RootVerifier, StateView,
};

/// A block's worth of raw transactions plus resolved senders, as the
/// fixture builder hands to [`FakeBlockReader`].
#[derive(Clone, Default)]
pub struct FakeBlock {
    pub header: Header,
    pub rules: ChainRules,
    pub txs: Vec<RawTx>,
    pub senders: Vec<Option<Address>>,
}

#[derive(Default)]
pub struct FakeBlockReader {
    blocks: HashMap<u64, FakeBlock>,
}

impl FakeBlockReader {
    pub fn insert(&mut self, block: FakeBlock) {
        self.blocks.insert(block.header.number, block);
    }
}

impl BlockReader for FakeBlockReader {
    fn header_by_number(&self, n: u64) -> ReconResult<Header> {
        self.blocks
            .get(&n)
            .map(|b| b.header.clone())
            .ok_or_else(|| ReconError::Invariant(format!("missing header for block {n}")))
    }

    fn block_with_senders(&self, n: u64) -> ReconResult<(Vec<RawTx>, Vec<Option<Address>>)> {
        let block = self
            .blocks
            .get(&n)
            .ok_or_else(|| ReconError::Invariant(format!("missing body for block {n}")))?;
        Ok((block.txs.clone(), block.senders.clone()))
    }

    fn rules_at(&self, n: u64) -> ReconResult<ChainRules> {
        Ok(self.blocks.get(&n).map(|b| b.rules).unwrap_or_default())
    }

    fn iter_bodies(&self) -> ReconResult<Vec<BodyMeta>> {
        let mut metas: Vec<_> = Vec::new();
        let mut numbers: Vec<_> = self.blocks.keys().copied().collect();
        numbers.sort_unstable();
        let mut base_tx_num = 0u64;
        for n in numbers {
            let block = &self.blocks[&n];
            // Genesis (block 0) is a single pseudo-tx, not a normal block
            // (spec §8 scenario 1); every other block is prologue + txs +
            // finalisation (+2), matching the producer's own split.
            let tx_amount = if n == 0 { 1 } else { block.txs.len() as u64 + 2 };
            metas.push(BodyMeta { block_num: n, base_tx_num, tx_amount });
            base_tx_num += tx_amount;
        }
        Ok(metas)
    }
}

/// A historical aggregator backed by a flat in-memory map, keyed by
/// `(bucket, key)`. Values are not actually versioned by `tx_num` (there is
/// no "history" here, only "current committed state as of the last
/// `set_tx`") since the fake has no append-only log; tests that need
/// point-in-time semantics pre-seed it before the run rather than relying
/// on it to version writes.
#[derive(Default)]
pub struct FakeAggregator {
    data: Mutex<HashMap<(BucketId, Vec<u8>), Vec<u8>>>,
}

impl FakeAggregator {
    pub fn seed(&self, bucket: BucketId, key: &[u8], val: &[u8]) {
        self.data.lock().insert((bucket, key.to_vec()), val.to_vec());
    }
}

impl HistoricalAggregator for FakeAggregator {
    fn read(&self, bucket: BucketId, key: &[u8], _tx_num: u64) -> ReconResult<Option<Vec<u8>>> {
        Ok(self.data.lock().get(&(bucket, key.to_vec())).cloned())
    }

    fn set_tx(&self, _tx_num: u64) {}
}

#[derive(Default)]
pub struct FakeKvWriter {
    pub writes: Vec<(BucketId, Vec<u8>, Vec<u8>)>,
    pub committed: bool,
}

impl KvWriteTxn for FakeKvWriter {
    fn put(&mut self, bucket: BucketId, key: &[u8], val: &[u8]) -> ReconResult<()> {
        self.writes.push((bucket, key.to_vec(), val.to_vec()));
        Ok(())
    }

    fn commit(self: Box<Self>) -> ReconResult<()> {
        Ok(())
    }

    fn rollback(self: Box<Self>) -> ReconResult<()> {
        Ok(())
    }
}

pub struct FakeKvReader {
    snapshot: HashMap<(BucketId, Vec<u8>), Vec<u8>>,
}

impl KvReadTxn for FakeKvReader {
    fn get(&self, bucket: BucketId, key: &[u8]) -> ReconResult<Option<Vec<u8>>> {
        Ok(self.snapshot.get(&(bucket, key.to_vec())).cloned())
    }
}

#[derive(Default)]
pub struct FakeKvBackend {
    data: Arc<Mutex<HashMap<(BucketId, Vec<u8>), Vec<u8>>>>,
}

impl KvBackend for FakeKvBackend {
    fn begin_ro(&self) -> ReconResult<Box<dyn KvReadTxn + Send>> {
        Ok(Box::new(FakeKvReader { snapshot: self.data.lock().clone() }))
    }

    fn begin_rw(&self) -> ReconResult<Box<dyn KvWriteTxn + Send>> {
        struct CommittingWriter {
            backing: Arc<Mutex<HashMap<(BucketId, Vec<u8>), Vec<u8>>>>,
            pending: HashMap<(BucketId, Vec<u8>), Vec<u8>>,
        }
        impl KvWriteTxn for CommittingWriter {
            fn put(&mut self, bucket: BucketId, key: &[u8], val: &[u8]) -> ReconResult<()> {
                self.pending.insert((bucket, key.to_vec()), val.to_vec());
                Ok(())
            }
            fn commit(self: Box<Self>) -> ReconResult<()> {
                self.backing.lock().extend(self.pending);
                Ok(())
            }
            fn rollback(self: Box<Self>) -> ReconResult<()> {
                Ok(())
            }
        }
        Ok(Box::new(CommittingWriter { backing: self.data.clone(), pending: HashMap::new() }))
    }

    fn clear_bucket(&self, bucket: BucketId) -> ReconResult<()> {
        self.data.lock().retain(|(b, _), _| *b != bucket);
        Ok(())
    }
}

/// Splits a transaction payload into a target `(key, value)` pair.
/// `key=value` payloads target an explicit shared key, so two different
/// senders' transactions can be made to collide on purpose (conflict
/// tests); any other payload falls back to keying on the sender's own
/// slot, modeling a nonce/balance dependency private to that sender.
fn target_of(tx: &RawTx, sender: Address) -> (Vec<u8>, Vec<u8>) {
    match tx.0.iter().position(|&b| b == b'=') {
        Some(pos) => (tx.0[..pos].to_vec(), tx.0[pos + 1..].to_vec()),
        None => (sender.to_vec(), tx.0.clone()),
    }
}

/// A deterministic, non-EVM "interpreter" for tests: see [`target_of`] for
/// how a transaction's payload picks its target key. Transactions whose
/// payload is exactly `b"revert"` fail. A successful transaction also
/// reports a one-unit `balance_increase_set` entry and the pre-write value
/// as `account_prevs`, so the inverse-diff path has something real to
/// carry (spec §4.2 step 5).
#[derive(Default)]
pub struct FakeEvm;

impl Evm for FakeEvm {
    fn execute(&self, ctx: &ExecCtx, view: &dyn StateView) -> ExecOutcome {
        let mut outcome = ExecOutcome::default();
        let Some(tx) = &ctx.tx else {
            return outcome;
        };
        if tx.0 == b"revert" {
            outcome.error = Some("execution reverted".to_string());
            return outcome;
        }
        let Some(sender) = ctx.sender else {
            return outcome;
        };

        let (key, val) = target_of(tx, sender);
        let prev = view.get(BucketId::HashedAccounts, &key).unwrap_or(None);
        outcome.read_lists.push(BucketId::HashedAccounts, key.clone(), prev.clone());
        outcome.write_lists.push(BucketId::HashedAccounts, key, val);
        outcome.account_prevs.insert(sender, prev);
        outcome.balance_increase_set.insert(sender, 1);
        outcome
    }

    fn apply_dao_fork(&self, _ctx: &ExecCtx, _view: &dyn StateView) -> ExecOutcome {
        ExecOutcome::default()
    }

    fn finalize_block(&self, _ctx: &ExecCtx, _view: &dyn StateView) -> ExecOutcome {
        ExecOutcome::default()
    }

    /// Writes every `(address, value)` pair from the block header's genesis
    /// allocation (empty for every block but block 0).
    fn genesis(&self, ctx: &ExecCtx, _view: &dyn StateView) -> ExecOutcome {
        let mut outcome = ExecOutcome::default();
        for (address, val) in &ctx.header.genesis_alloc {
            outcome.write_lists.push(BucketId::HashedAccounts, address.to_vec(), val.clone());
        }
        outcome
    }
}

/// Always reports the root as matching, since the fake never computes a
/// real trie.
pub struct FakeRootVerifier {
    pub matches: bool,
}

impl Default for FakeRootVerifier {
    fn default() -> Self {
        Self { matches: true }
    }
}

impl RootVerifier for FakeRootVerifier {
    fn verify_root(&self, _expected: &[u8; 32]) -> ReconResult<bool> {
        Ok(self.matches)
    }
}
