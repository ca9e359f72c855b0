use serde::{Deserialize, Serialize};

/// The KV buckets the core touches. A real deployment also has the
/// aggregator's internal history buckets, but those are owned and iterated
/// entirely by the `HistoricalAggregator` collaborator and never named here.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum BucketId {
    HashedAccounts,
    HashedStorage,
    ContractCode,
}

/// One bucket's worth of reads or writes captured during a single
/// speculative execution, in the exact order the EVM issued them.
///
/// `keys` and `vals` are parallel arrays rather than a `Vec<(Key, Val)>` so
/// that validation (`ReconState::reads_valid`) can walk both without
/// allocating tuples, matching the shape the aggregator's own diff lists
/// use.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReadList {
    pub bucket: Vec<BucketId>,
    pub keys: Vec<Vec<u8>>,
    /// The value observed at the time of the read, or `None` if the key was
    /// absent. Absence is itself a read that must be re-validated.
    pub vals: Vec<Option<Vec<u8>>>,
}

impl ReadList {
    pub fn push(&mut self, bucket: BucketId, key: Vec<u8>, val: Option<Vec<u8>>) {
        self.bucket.push(bucket);
        self.keys.push(key);
        self.vals.push(val);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BucketId, &[u8], Option<&[u8]>)> {
        self.bucket
            .iter()
            .copied()
            .zip(self.keys.iter().map(Vec::as_slice))
            .zip(self.vals.iter().map(|v| v.as_deref()))
            .map(|((bucket, key), val)| (bucket, key, val))
    }
}

/// One bucket's worth of writes captured during a single speculative
/// execution. Ordering mirrors [`ReadList`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WriteList {
    pub bucket: Vec<BucketId>,
    pub keys: Vec<Vec<u8>>,
    pub vals: Vec<Vec<u8>>,
}

impl WriteList {
    pub fn push(&mut self, bucket: BucketId, key: Vec<u8>, val: Vec<u8>) {
        self.bucket.push(bucket);
        self.keys.push(key);
        self.vals.push(val);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BucketId, &[u8], &[u8])> {
        self.bucket
            .iter()
            .copied()
            .zip(self.keys.iter().map(Vec::as_slice))
            .zip(self.vals.iter().map(Vec::as_slice))
            .map(|((bucket, key), val)| (bucket, key, val))
    }

    /// Rough byte size of this write-set, used for `TxTask::results_size`
    /// and the collector's memory-pressure accounting.
    pub fn byte_size(&self) -> usize {
        self.keys.iter().map(Vec::len).sum::<usize>() + self.vals.iter().map(Vec::len).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_list_iter_preserves_order() {
        let mut rl = ReadList::default();
        rl.push(BucketId::HashedAccounts, b"a".to_vec(), Some(b"1".to_vec()));
        rl.push(BucketId::HashedStorage, b"b".to_vec(), None);
        let collected: Vec<_> = rl.iter().map(|(b, k, v)| (b, k.to_vec(), v.map(<[u8]>::to_vec))).collect();
        assert_eq!(
            collected,
            vec![
                (BucketId::HashedAccounts, b"a".to_vec(), Some(b"1".to_vec())),
                (BucketId::HashedStorage, b"b".to_vec(), None),
            ]
        );
    }

    #[test]
    fn write_list_byte_size_sums_keys_and_vals() {
        let mut wl = WriteList::default();
        wl.push(BucketId::ContractCode, vec![1, 2], vec![3, 4, 5]);
        assert_eq!(wl.byte_size(), 5);
    }
}
