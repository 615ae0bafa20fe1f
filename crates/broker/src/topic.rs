use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use tidemark_storage::{StorageError, Store};

use crate::partition::Partition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// Append-only message log, fetched by offset range.
    Log,
    /// Keyed records collapsed by the storage merge operator.
    Compacted,
}

#[derive(Debug)]
pub struct Topic {
    name: String,
    kind: TopicKind,
    partitions: Vec<Arc<Partition>>,
}

impl Topic {
    pub(crate) fn new(
        name: &str,
        kind: TopicKind,
        partitions: u32,
        store: Arc<dyn Store>,
    ) -> Result<Self, StorageError> {
        let count = partitions.max(1);
        let mut parts = Vec::with_capacity(count as usize);
        for id in 0..count {
            parts.push(Arc::new(Partition::new(name, id, kind, store.clone())?));
        }
        Ok(Self {
            name: name.to_string(),
            kind,
            partitions: parts,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TopicKind {
        self.kind
    }

    pub fn partition(&self, id: u32) -> Option<&Arc<Partition>> {
        self.partitions.get(id as usize)
    }

    pub fn partitions(&self) -> &[Arc<Partition>] {
        &self.partitions
    }

    pub fn choose_partition(&self) -> &Arc<Partition> {
        &self.partitions[fastrand::usize(..self.partitions.len())]
    }

    pub fn partition_for_key(&self, key: &[u8]) -> &Arc<Partition> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.partitions.len() as u64) as usize;
        &self.partitions[idx]
    }
}
