use std::collections::HashMap;
use std::sync::Arc;

use crate::read_write::{ReadList, WriteList};

/// 20-byte account address. A real engine would reuse the EVM crate's type;
/// this is a stand-in since the interpreter is out of scope (spec §1).
pub type Address = [u8; 20];
/// 32-byte hash (block hash, state root, ...).
pub type Hash32 = [u8; 32];

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Header {
    pub number: u64,
    pub root: Hash32,
    /// Genesis account allocations (`address -> initial value`), non-empty
    /// only on block 0's header. Carried here rather than on `TxTask`
    /// directly since the genesis pseudo-tx has no `tx` payload of its own.
    pub genesis_alloc: Vec<(Address, Vec<u8>)>,
}

/// Chain-fork rules in effect at a given block. Only the two predicates the
/// scheduler itself branches on are modeled (spec §9, open question on DAO).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChainRules {
    pub dao_fork_supported: bool,
    pub dao_fork_block: u64,
}

impl ChainRules {
    pub fn is_dao_fork_block(&self, block_num: u64) -> bool {
        self.dao_fork_supported && block_num == self.dao_fork_block
    }
}

/// A transaction, opaque to the scheduler. The real payload (signed fields,
/// calldata, ...) is produced by the block store and consumed only by the
/// `Evm` collaborator.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RawTx(pub Vec<u8>);

/// Derived view over `(tx_index, final)` so callers match on intent instead
/// of re-deriving it from the raw fields at every call site.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxKind {
    /// `block_num == 0 && tx_index == -1`: compute genesis state.
    Genesis,
    /// `tx_index == -1` at the DAO fork block, rules permitting.
    DaoFork,
    /// `tx_index == -1`, any other block: reserved no-op hook.
    Prologue,
    /// `0 <= tx_index < n`: a real user transaction.
    Transaction,
    /// `tx_index == n`: block finalisation (rewards, uncles).
    Finalization,
}

/// One executable unit of work: a single (block, tx_index) position plus
/// the outputs a worker populates after running it (spec §3).
#[derive(Clone, Debug)]
pub struct TxTask {
    /// Globally monotonic ordinal across the whole chain. Primary ordering
    /// key for the collector's heap and the overlay's monotonicity.
    pub tx_num: u64,
    pub block_num: u64,
    pub block_hash: Hash32,
    pub header: Arc<Header>,
    pub rules: ChainRules,

    /// `-1` = prologue, `0..n-1` = real transactions, `n` = finalisation.
    pub tx_index: i64,
    pub tx: Option<RawTx>,
    pub sender: Option<Address>,

    /// True iff `tx_index == n` (the last task of the block).
    pub is_final: bool,

    // --- outputs, populated by the worker ---
    /// `Some` iff the EVM reverted or otherwise rejected the transaction.
    /// Per spec §9's open question, the write set is discarded in this case
    /// (mirrors the EVM's own revert semantics), so `write_lists` is empty
    /// whenever `error` is `Some`.
    pub error: Option<String>,
    pub read_lists: ReadList,
    pub write_lists: WriteList,
    pub balance_increase_set: HashMap<Address, i128>,
    /// Inverse diff needed to unwind this task's effects (previous values).
    pub account_prevs: HashMap<Address, Option<Vec<u8>>>,
    pub account_dels: Vec<Address>,
    pub storage_prevs: HashMap<(Address, Vec<u8>), Option<Vec<u8>>>,
    pub code_prevs: HashMap<Address, Option<Vec<u8>>>,
    pub results_size: usize,
}

impl TxTask {
    pub fn new(
        tx_num: u64,
        block_num: u64,
        block_hash: Hash32,
        header: Arc<Header>,
        rules: ChainRules,
        tx_index: i64,
        tx: Option<RawTx>,
        sender: Option<Address>,
        is_final: bool,
    ) -> Self {
        Self {
            tx_num,
            block_num,
            block_hash,
            header,
            rules,
            tx_index,
            tx,
            sender,
            is_final,
            error: None,
            read_lists: ReadList::default(),
            write_lists: WriteList::default(),
            balance_increase_set: HashMap::new(),
            account_prevs: HashMap::new(),
            account_dels: Vec::new(),
            storage_prevs: HashMap::new(),
            code_prevs: HashMap::new(),
            results_size: 0,
        }
    }

    /// Classify this task per spec §4.2's branch, including the DAO-fork
    /// predicate from spec §9: only when chain rules enable DAO support AND
    /// block number equals the DAO fork block.
    pub fn kind(&self) -> TxKind {
        if self.block_num == 0 && self.tx_index == -1 {
            TxKind::Genesis
        } else if self.tx_index == -1 && self.rules.is_dao_fork_block(self.block_num) {
            TxKind::DaoFork
        } else if self.tx_index == -1 {
            TxKind::Prologue
        } else if self.is_final {
            TxKind::Finalization
        } else {
            TxKind::Transaction
        }
    }

    /// Discards all execution outputs. Used when a task is re-queued after
    /// a stale-read validation failure: the next worker to pick it up starts
    /// from a clean slate.
    pub fn reset_outputs(&mut self) {
        self.error = None;
        self.read_lists = ReadList::default();
        self.write_lists = WriteList::default();
        self.balance_increase_set.clear();
        self.account_prevs.clear();
        self.account_dels.clear();
        self.storage_prevs.clear();
        self.code_prevs.clear();
        self.results_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Arc<Header> {
        Arc::new(Header::default())
    }

    #[test]
    fn kind_classifies_genesis() {
        let t = TxTask::new(0, 0, [0; 32], header(), ChainRules::default(), -1, None, None, false);
        assert_eq!(t.kind(), TxKind::Genesis);
    }

    #[test]
    fn kind_classifies_dao_fork_only_when_rules_enable_it() {
        let rules = ChainRules { dao_fork_supported: true, dao_fork_block: 5 };
        let t = TxTask::new(1, 5, [0; 32], header(), rules, -1, None, None, false);
        assert_eq!(t.kind(), TxKind::DaoFork);

        let rules_disabled = ChainRules { dao_fork_supported: false, dao_fork_block: 5 };
        let t2 = TxTask::new(1, 5, [0; 32], header(), rules_disabled, -1, None, None, false);
        assert_eq!(t2.kind(), TxKind::Prologue);
    }

    #[test]
    fn kind_classifies_prologue_transaction_and_finalization() {
        let rules = ChainRules::default();
        let prologue = TxTask::new(1, 7, [0; 32], header(), rules, -1, None, None, false);
        assert_eq!(prologue.kind(), TxKind::Prologue);

        let tx = TxTask::new(2, 7, [0; 32], header(), rules, 0, None, Some([1; 20]), false);
        assert_eq!(tx.kind(), TxKind::Transaction);

        let fin = TxTask::new(3, 7, [0; 32], header(), rules, 1, None, None, true);
        assert_eq!(fin.kind(), TxKind::Finalization);
    }

    #[test]
    fn reset_outputs_clears_everything() {
        let rules = ChainRules::default();
        let mut t = TxTask::new(2, 7, [0; 32], header(), rules, 0, None, Some([1; 20]), false);
        t.error = Some("reverted".to_string());
        t.write_lists.push(crate::read_write::BucketId::HashedAccounts, vec![1], vec![2]);
        t.results_size = 42;
        t.reset_outputs();
        assert!(t.error.is_none());
        assert!(t.write_lists.is_empty());
        assert_eq!(t.results_size, 0);
    }
}
