use std::path::Path;

use rocksdb::{
    DBRawIteratorWithThreadMode, DBWithThreadMode, MergeOperands, MultiThreaded, Options,
    WriteBatch,
};

use crate::{Batch, Entry, IterOptions, MergeOperator, RangeIter, Store, StorageError};

type Db = DBWithThreadMode<MultiThreaded>;

#[derive(Debug)]
pub struct RocksStore {
    db: Db,
}

impl RocksStore {
    pub fn open(
        path: impl AsRef<Path>,
        operators: Vec<MergeOperator>,
    ) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        if !operators.is_empty() {
            opts.set_merge_operator_associative(
                "tidemark-merge",
                move |_key: &[u8], existing: Option<&[u8]>, operands: &MergeOperands| {
                    full_merge(&operators, existing, operands)
                },
            );
        }

        let db = Db::open(&opts, path)?;
        Ok(Self { db })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

fn full_merge(
    operators: &[MergeOperator],
    existing: Option<&[u8]>,
    operands: &MergeOperands,
) -> Option<Vec<u8>> {
    let mut current = existing.map(|v| v.to_vec());
    for operand in operands.iter() {
        let merged = operators
            .iter()
            .find_map(|op| (op.merge)(current.as_deref(), operand));
        match merged {
            Some(v) => current = Some(v),
            // malformed operand: keep what we have rather than losing the key
            None => {}
        }
    }
    current.or_else(|| operands.iter().last().map(|v| v.to_vec()))
}

impl Store for RocksStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key)?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db.put(key, value)?;
        Ok(())
    }

    fn batch_put(&self, entries: &[Entry]) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        for e in entries {
            batch.put(&e.key, &e.value);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn merge(&self, key: &[u8], operand: &[u8]) -> Result<(), StorageError> {
        self.db.merge(key, operand)?;
        Ok(())
    }

    fn write(&self, ops: Batch) -> Result<(), StorageError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        for e in &ops.puts {
            batch.put(&e.key, &e.value);
        }
        for e in &ops.merges {
            batch.merge(&e.key, &e.value);
        }
        for key in &ops.deletes {
            batch.delete(key);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.db.delete(key)?;
        Ok(())
    }

    fn batch_delete(&self, keys: &[Vec<u8>]) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        for key in keys {
            batch.delete(key);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn iter(&self, opts: IterOptions) -> Box<dyn RangeIter + '_> {
        Box::new(RocksIter {
            iter: self.db.raw_iterator(),
            reverse: opts.reverse,
        })
    }

    fn truncate(&self, prefix: &[u8], min: &[u8], batch_size: usize) -> Result<(), StorageError> {
        let batch_size = batch_size.max(1);
        loop {
            let mut buf: Vec<Vec<u8>> = Vec::with_capacity(batch_size);
            {
                let mut it = self.iter(IterOptions::default());
                it.seek(min);
                while it.valid_for_prefix(prefix) && buf.len() < batch_size {
                    match it.key() {
                        Some(k) => buf.push(k.to_vec()),
                        None => break,
                    }
                    it.next();
                }
            }

            if buf.is_empty() {
                return Ok(());
            }

            self.batch_delete(&buf)?;
        }
    }
}

struct RocksIter<'a> {
    iter: DBRawIteratorWithThreadMode<'a, Db>,
    reverse: bool,
}

impl RangeIter for RocksIter<'_> {
    fn seek(&mut self, key: &[u8]) {
        if self.reverse {
            self.iter.seek_for_prev(key);
        } else {
            self.iter.seek(key);
        }
    }

    fn valid(&self) -> bool {
        self.iter.valid()
    }

    fn valid_for_prefix(&self, prefix: &[u8]) -> bool {
        self.iter.valid() && self.iter.key().is_some_and(|k| k.starts_with(prefix))
    }

    fn key(&self) -> Option<&[u8]> {
        self.iter.key()
    }

    fn value(&self) -> Option<&[u8]> {
        self.iter.value()
    }

    fn next(&mut self) {
        if self.reverse {
            self.iter.prev();
        } else {
            self.iter.next();
        }
    }
}
