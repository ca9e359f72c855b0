pub mod errors;
pub mod interfaces;
pub mod read_write;
pub mod tx_task;

pub use errors::{ReconError, ReconResult};
pub use interfaces::{
    BlockReader,
    BodyMeta,
    Evm,
    ExecCtx,
    ExecOutcome,
    HistoricalAggregator,
    KvBackend,
    KvReadTxn,
    KvWriteTxn,
    RootVerifier,
    StateView,
};
pub use read_write::{BucketId, ReadList, WriteList};
pub use tx_task::{Address, ChainRules, Hash32, Header, RawTx, TxKind, TxTask};
