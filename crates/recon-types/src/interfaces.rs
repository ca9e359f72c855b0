//! External-collaborator interfaces (spec §6). Every trait here is a pure
//! seam: the core depends only on these, never on a concrete EVM, block
//! store, aggregator, or KV engine. Production wiring supplies real
//! implementations; tests use in-memory fakes (see `recon-engine`'s
//! `test_utils` module).

use std::collections::HashMap;

use crate::errors::ReconResult;
use crate::read_write::{BucketId, ReadList, WriteList};
use crate::tx_task::{Address, ChainRules, Hash32, Header, RawTx, TxTask};

/// Metadata for one block's body, as surfaced by `iter_bodies` at startup
/// when the driver builds the `block_num -> last_tx_num` array.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BodyMeta {
    pub block_num: u64,
    pub base_tx_num: u64,
    pub tx_amount: u64,
}

/// The immutable block/body/transaction store (spec §1: content-addressed,
/// range-partitioned segment reader). Out of scope to implement; the core
/// only calls through this trait.
pub trait BlockReader: Send + Sync {
    fn header_by_number(&self, n: u64) -> ReconResult<Header>;
    /// Returns the block's transactions plus resolved sender for each
    /// (`None` for transactions whose sender could not be recovered, which
    /// should not happen for a canonical, already-validated chain).
    fn block_with_senders(&self, n: u64) -> ReconResult<(Vec<RawTx>, Vec<Option<Address>>)>;
    fn rules_at(&self, n: u64) -> ReconResult<ChainRules>;
    fn iter_bodies(&self) -> ReconResult<Vec<BodyMeta>>;
}

/// Consistent point-in-time reads by `tx_num` (spec §1). State views
/// consult this for any key not present in `ReconState`'s overlay.
pub trait HistoricalAggregator: Send + Sync {
    fn read(&self, bucket: BucketId, key: &[u8], tx_num: u64) -> ReconResult<Option<Vec<u8>>>;
    /// Advances the aggregator's read horizon; called once per committed
    /// `tx_num` so later reads see the latest history.
    fn set_tx(&self, tx_num: u64);
}

/// A read-only KV transaction.
pub trait KvReadTxn {
    fn get(&self, bucket: BucketId, key: &[u8]) -> ReconResult<Option<Vec<u8>>>;
}

/// A read-write KV transaction. Owned exclusively by the collector for the
/// apply-side transaction (spec §5).
pub trait KvWriteTxn {
    fn put(&mut self, bucket: BucketId, key: &[u8], val: &[u8]) -> ReconResult<()>;
    fn commit(self: Box<Self>) -> ReconResult<()>;
    fn rollback(self: Box<Self>) -> ReconResult<()>;
}

/// The persistent key-value backend (spec §6).
pub trait KvBackend: Send + Sync {
    fn begin_ro(&self) -> ReconResult<Box<dyn KvReadTxn + Send>>;
    fn begin_rw(&self) -> ReconResult<Box<dyn KvWriteTxn + Send>>;
    fn clear_bucket(&self, bucket: BucketId) -> ReconResult<()>;
}

/// A read-only view over account/storage/code state at a fixed `tx_num`,
/// overlaid by `ReconState`'s committed-but-unflushed writes. Built fresh
/// by each worker for each task (spec §4.2 step 3).
pub trait StateView {
    fn get(&self, bucket: BucketId, key: &[u8]) -> ReconResult<Option<Vec<u8>>>;
}

/// Per-task execution context handed to the `Evm` collaborator.
#[derive(Clone, Debug)]
pub struct ExecCtx {
    pub block_num: u64,
    pub header: Header,
    pub rules: ChainRules,
    pub tx: Option<RawTx>,
    pub sender: Option<Address>,
}

/// What an `Evm::execute` call produces: the read/write sets the worker
/// needs to populate a `TxTask`, plus an optional revert error. Per spec
/// §9's open question, `write_lists` must be empty whenever `error` is
/// `Some` — implementations are expected to mirror the EVM's own revert
/// semantics (effects discarded), and this is asserted by the executor.
///
/// `balance_increase_set` and the four `*_prevs`/`*_dels` fields are the
/// inverse-diff metadata spec.md §4.2 step 5 requires alongside the
/// read/write sets: sender balance deltas and the pre-write values needed
/// to unwind this task's effects later. Populated on the same terms as
/// `write_lists` — empty whenever `error` is `Some`.
#[derive(Clone, Debug, Default)]
pub struct ExecOutcome {
    pub error: Option<String>,
    pub read_lists: ReadList,
    pub write_lists: WriteList,
    pub balance_increase_set: HashMap<Address, i128>,
    pub account_prevs: HashMap<Address, Option<Vec<u8>>>,
    pub account_dels: Vec<Address>,
    pub storage_prevs: HashMap<(Address, Vec<u8>), Option<Vec<u8>>>,
    pub code_prevs: HashMap<Address, Option<Vec<u8>>>,
}

/// The EVM interpreter, treated as a pure function of
/// `(block_ctx, tx_ctx, pre_state_view) -> (read_set, write_set, error?)`
/// (spec §1). Never mutates shared state; all effects flow back through the
/// returned `ExecOutcome`.
pub trait Evm: Send + Sync {
    fn execute(&self, ctx: &ExecCtx, view: &dyn StateView) -> ExecOutcome;
    /// Applies the DAO hard-fork balance migration. Modeled separately from
    /// `execute` because it is not a transaction execution: it has no
    /// `ExecCtx::tx` and always succeeds.
    fn apply_dao_fork(&self, ctx: &ExecCtx, view: &dyn StateView) -> ExecOutcome;
    /// Invokes the consensus engine's block finalisation (rewards, uncles).
    fn finalize_block(&self, ctx: &ExecCtx, view: &dyn StateView) -> ExecOutcome;
    /// Computes genesis state.
    fn genesis(&self, ctx: &ExecCtx, view: &dyn StateView) -> ExecOutcome;
}

/// The post-execution hashed-state/trie rebuild used only for root
/// verification (spec §4.6). Out of scope to implement for real; the core
/// only calls through this trait after the main loop terminates.
pub trait RootVerifier {
    /// Recomputes the state root from the buckets named in spec §6 and
    /// compares it to `expected`. A mismatch is the caller's responsibility
    /// to handle (spec §4.6 step 4): it must not cause this call to error.
    fn verify_root(&self, expected: &Hash32) -> ReconResult<bool>;
}
