//! Builds the collaborator set `recon-node` runs against today: in-memory
//! fakes seeded with a small demonstration chain. Swapping these for a real
//! EVM, MDBX-backed `KvBackend`, and segment-backed `BlockReader` is future
//! work outside this crate (spec §1: those are external collaborators,
//! referenced only by interface, with no production implementation here).

use std::sync::Arc;

use recon_engine::runner::Collaborators;
use recon_engine::test_utils::{FakeAggregator, FakeBlock, FakeBlockReader, FakeEvm, FakeKvBackend, FakeRootVerifier};
use recon_engine::ReconConfig;
use recon_types::{ChainRules, Header, RawTx};

pub fn build(config: &ReconConfig) -> Collaborators {
    let mut reader = FakeBlockReader::default();
    for block_num in config.start_block..=config.max_block_num {
        reader.insert(FakeBlock {
            header: Header { number: block_num, root: [0; 32], ..Default::default() },
            rules: ChainRules::default(),
            txs: if block_num == 0 { Vec::new() } else { vec![RawTx(format!("tx-{block_num}").into_bytes())] },
            senders: if block_num == 0 { Vec::new() } else { vec![Some([block_num as u8; 20])] },
        });
    }

    Collaborators {
        block_reader: Arc::new(reader),
        aggregator: Arc::new(FakeAggregator::default()),
        kv: Arc::new(FakeKvBackend::default()),
        evm: Arc::new(FakeEvm),
        root_verifier: Arc::new(FakeRootVerifier::default()),
    }
}

pub fn expected_root(_config: &ReconConfig) -> [u8; 32] {
    [0; 32]
}
