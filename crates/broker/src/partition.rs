use std::sync::Arc;
use std::time::Duration;

use tidemark_storage::{Batch, Entry, IterOptions, StorageError, Store};
use tidemark_util::unix_millis;

use crate::BrokerError;
use crate::mark::CLUSTER_KEY_LEN;
use crate::message::Message;
use crate::offset::{OFFSET_LEN, Offset, OffsetGen};
use crate::topic::TopicKind;

/// One shard of a topic: an append-only message log (or a compacted record
/// set) living under its own key prefix in the shared store. Appends are
/// serialized by the offset-generator lock, so offsets are assigned in write
/// order and every batch lands atomically.
#[derive(Debug)]
pub struct Partition {
    topic: String,
    id: u32,
    kind: TopicKind,
    store: Arc<dyn Store>,
    offset_gen: tokio::sync::Mutex<OffsetGen>,
    appended: tokio::sync::Notify,
}

fn partition_prefix(topic: &str, id: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(topic.len() + 8);
    key.push(b't');
    key.push(0);
    key.extend_from_slice(topic.as_bytes());
    key.push(0);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn log_prefix(topic: &str, id: u32, channel: &str) -> Vec<u8> {
    let mut key = partition_prefix(topic, id);
    key.push(b'm');
    key.extend_from_slice(channel.as_bytes());
    key.push(0);
    key
}

fn log_key(topic: &str, id: u32, channel: &str, offset: Offset) -> Vec<u8> {
    let mut key = log_prefix(topic, id, channel);
    key.extend_from_slice(offset.as_bytes());
    key
}

fn compact_prefix(topic: &str, id: u32) -> Vec<u8> {
    let mut key = partition_prefix(topic, id);
    key.push(b'k');
    key
}

fn meta_key(topic: &str, id: u32) -> Vec<u8> {
    let mut key = partition_prefix(topic, id);
    key.push(b'o');
    key
}

impl Partition {
    pub(crate) fn new(
        topic: &str,
        id: u32,
        kind: TopicKind,
        store: Arc<dyn Store>,
    ) -> Result<Self, StorageError> {
        let offset_gen = match store.get(&meta_key(topic, id))? {
            Some(tail) => {
                let tail = Offset::try_from_slice(&tail).ok_or_else(|| {
                    StorageError::KeyDecode(format!(
                        "invalid tail offset for {topic}/{id}: {} bytes",
                        tail.len()
                    ))
                })?;
                OffsetGen::seeded(tail)
            }
            None => OffsetGen::new(),
        };

        Ok(Self {
            topic: topic.to_string(),
            id,
            kind,
            store,
            offset_gen: tokio::sync::Mutex::new(offset_gen),
            appended: tokio::sync::Notify::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Assign a fresh offset to every message and write the batch atomically.
    /// Offsets are strictly greater than anything assigned before; the batch
    /// is all-or-nothing.
    pub(crate) async fn batch_put(&self, mut msgs: Vec<Message>) -> Result<Vec<Offset>, BrokerError> {
        if msgs.is_empty() {
            return Ok(Vec::new());
        }

        let mut offset_gen = self.offset_gen.lock().await;
        let now = unix_millis();
        let mut batch = Batch::default();
        let mut offsets = Vec::with_capacity(msgs.len());

        for msg in &mut msgs {
            let offset = offset_gen.next(now);
            msg.offset = offset;
            offsets.push(offset);

            match self.kind {
                TopicKind::Log => {
                    let key = log_key(&self.topic, self.id, &msg.channel, offset);
                    batch.puts.push(Entry::new(key, msg.encode()?));
                }
                TopicKind::Compacted => {
                    if msg.clustering_key.len() < CLUSTER_KEY_LEN {
                        return Err(BrokerError::Codec(format!(
                            "compacted message needs a {CLUSTER_KEY_LEN}-byte clustering key, got {}",
                            msg.clustering_key.len()
                        )));
                    }
                    let mut key = compact_prefix(&self.topic, self.id);
                    key.extend_from_slice(&msg.key);
                    key.extend_from_slice(&msg.clustering_key[..OFFSET_LEN]);

                    let mut record =
                        Vec::with_capacity(msg.clustering_key.len() + msg.value.len());
                    record.extend_from_slice(&msg.clustering_key);
                    record.extend_from_slice(&msg.value);
                    batch.merges.push(Entry::new(key, record));
                }
            }
        }

        if let Some(last) = offsets.last() {
            batch
                .puts
                .push(Entry::new(meta_key(&self.topic, self.id), last.as_bytes().to_vec()));
        }

        self.store.write(batch)?;
        drop(offset_gen);

        self.appended.notify_waiters();
        Ok(offsets)
    }

    /// Stream stored messages of `channel` with `from <= offset <= to`, in
    /// offset order, through `f`. The boundary message at `from` is included
    /// when present.
    pub(crate) async fn scan_range<F>(
        &self,
        channel: &str,
        from: Offset,
        to: Offset,
        f: &mut F,
    ) -> Result<(), BrokerError>
    where
        F: AsyncFnMut(Message) -> Result<(), BrokerError> + Send,
    {
        let prefix = log_prefix(&self.topic, self.id, channel);
        let mut it = self.store.iter(IterOptions {
            reverse: false,
            fetch_values: true,
        });
        it.seek(&log_key(&self.topic, self.id, channel, from));

        while it.valid_for_prefix(&prefix) {
            let value = it
                .value()
                .ok_or_else(|| StorageError::Internal("iterator lost its value".into()))?;
            let msg = Message::decode(value)?;
            if msg.offset.after(&to) {
                break;
            }
            f(msg).await?;
            it.next();
        }

        Ok(())
    }

    pub(crate) fn compact_get(&self, suffix: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let mut key = compact_prefix(&self.topic, self.id);
        key.extend_from_slice(suffix);
        self.store.get(&key)
    }

    /// Walk compacted records under `suffix_prefix`, largest key first. The
    /// callback sees (key suffix past the prefix, record) and returns false
    /// to stop.
    pub(crate) fn compact_scan_rev(
        &self,
        suffix_prefix: &[u8],
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), StorageError> {
        let mut prefix = compact_prefix(&self.topic, self.id);
        prefix.extend_from_slice(suffix_prefix);

        let mut upper = prefix.clone();
        upper.extend_from_slice(&[0xff; OFFSET_LEN + 1]);

        let mut it = self.store.iter(IterOptions::reverse());
        it.seek(&upper);
        while it.valid_for_prefix(&prefix) {
            let (Some(key), Some(value)) = (it.key(), it.value()) else {
                break;
            };
            if !f(&key[prefix.len()..], value) {
                break;
            }
            it.next();
        }

        Ok(())
    }

    /// Park until something is appended here, or `timeout` elapses. Tailing
    /// loops use this instead of a poll interval when the partition is local.
    pub(crate) async fn wait_for_append(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.appended.notified()).await;
    }
}
