use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tidemark_storage::{MergeOperator, RocksStore, Store};
use tidemark_util::{BrokerStats, StatsSnapshot};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::consumer_group::ConsumerGroup;
use crate::mark;
use crate::message::{
    CONSUMER_OFFSETS_TOPIC, DEFAULT_CHANNEL, MarkKind, MarkState, Message,
};
use crate::offset::Offset;
use crate::router::{NodeId, Router};
use crate::topic::{Topic, TopicKind};
use crate::{BrokerConfig, BrokerError, TaskGroup};

#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub topic: String,
    /// Target partition; omitted picks one uniformly at random.
    pub partition: Option<u32>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone)]
pub struct ProduceResponse {
    /// Assigned offsets, in the order the messages were submitted.
    pub offsets: Vec<Offset>,
}

#[derive(Debug, Clone)]
pub struct FetchRangeRequest {
    pub topic: String,
    pub partition: u32,
    pub channel: String,
    pub from: Offset,
    pub to: Offset,
}

#[derive(Debug, Clone)]
pub struct MarkRequest {
    pub topic: String,
    pub partition: u32,
    pub channel: String,
    pub consumer_group: String,
    pub offsets: Vec<Offset>,
    pub state: Option<MarkState>,
}

#[derive(Debug, Clone)]
pub struct GetMarkRequest {
    pub topic: String,
    pub partition: u32,
    pub channel: String,
    pub consumer_group: String,
    pub offset: Offset,
}

#[derive(Debug, Clone)]
pub struct LastOffsetRequest {
    pub topic: String,
    pub partition: u32,
    pub channel: String,
    pub consumer_group: String,
    pub kind: MarkKind,
}

type GroupKey = (String, u32, String, String);

/// Broker node: owns the local store, the topic registry and the consumer
/// groups attached here. Produce and fetch are transparently routed to the
/// partition leader through the [`Router`].
pub struct Broker<R: Router> {
    pub config: BrokerConfig,
    router: Arc<R>,
    store: Arc<dyn Store>,
    stats: Arc<BrokerStats>,
    topics: DashMap<String, Arc<Topic>>,
    groups: DashMap<GroupKey, Arc<ConsumerGroup<R>>>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) task_group: Arc<TaskGroup>,
}

impl<R: Router> Broker<R> {
    /// Open a broker over a RocksDB store at `path`, with the mark merge
    /// operator registered.
    pub fn open(
        path: impl AsRef<Path>,
        router: Arc<R>,
        config: BrokerConfig,
    ) -> Result<Arc<Self>, BrokerError> {
        let store = RocksStore::open(
            path,
            vec![MergeOperator {
                name: "mark-max-kind",
                merge: mark::max_kind_merge,
            }],
        )?;
        Self::with_store(Arc::new(store), router, config)
    }

    pub fn with_store(
        store: Arc<dyn Store>,
        router: Arc<R>,
        config: BrokerConfig,
    ) -> Result<Arc<Self>, BrokerError> {
        let offsets_partitions = config.offsets_topic_partitions;
        let broker = Arc::new(Self {
            config,
            router,
            store,
            stats: Arc::new(BrokerStats::default()),
            topics: DashMap::new(),
            groups: DashMap::new(),
            shutdown: CancellationToken::new(),
            task_group: Arc::new(TaskGroup::new()),
        });

        broker.create_topic(CONSUMER_OFFSETS_TOPIC, TopicKind::Compacted, offsets_partitions)?;

        Ok(broker)
    }

    pub fn node(&self) -> &NodeId {
        &self.config.node
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn stats_handle(&self) -> &BrokerStats {
        &self.stats
    }

    /// Idempotent: an existing topic is returned as-is.
    pub fn create_topic(
        &self,
        name: &str,
        kind: TopicKind,
        partitions: u32,
    ) -> Result<Arc<Topic>, BrokerError> {
        match self.topics.entry(name.to_string()) {
            dashmap::Entry::Occupied(e) => Ok(e.get().clone()),
            dashmap::Entry::Vacant(v) => {
                let topic = Arc::new(Topic::new(name, kind, partitions, self.store.clone())?);
                v.insert(topic.clone());
                Ok(topic)
            }
        }
    }

    pub fn topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.get(name).map(|t| t.clone())
    }

    fn topic_or_err(&self, name: &str) -> Result<Arc<Topic>, BrokerError> {
        self.topic(name)
            .ok_or_else(|| BrokerError::TopicNotFound(name.to_string()))
    }

    /// Append a batch of messages, routing to the partition leader.
    pub async fn produce(&self, req: &ProduceRequest) -> Result<ProduceResponse, BrokerError> {
        tracing::debug!(
            topic = %req.topic,
            partition = ?req.partition,
            messages = req.messages.len(),
            "produce"
        );

        if req.messages.is_empty() {
            return Err(BrokerError::NoMessagesToProduce);
        }

        let topic = self.topic_or_err(&req.topic)?;
        let partition = match req.partition {
            Some(id) => topic
                .partition(id)
                .ok_or(BrokerError::UnknownPartition(id))?,
            None => topic.choose_partition(),
        };

        let leader = self
            .router
            .leader_of(&req.topic, partition.id())
            .await
            .ok_or(BrokerError::NoLeaderFound)?;

        if leader != self.config.node {
            return self.router.forward_produce(&leader, req).await;
        }

        let mut msgs = req.messages.clone();
        for msg in &mut msgs {
            if msg.channel.is_empty() {
                msg.channel = DEFAULT_CHANNEL.to_string();
            }
        }

        let offsets = partition.batch_put(msgs).await?;
        self.stats.produced(offsets.len() as u64);

        Ok(ProduceResponse { offsets })
    }

    /// Stream every message of the channel with `from <= offset <= to`
    /// through `f`, in offset order, via the partition leader. The boundary
    /// message at `from` is included when present; the stream ends at `to`
    /// or the current tail, whichever comes first.
    pub async fn fetch_range_fn<F>(
        &self,
        req: &FetchRangeRequest,
        mut f: F,
    ) -> Result<(), BrokerError>
    where
        F: AsyncFnMut(Message) -> Result<(), BrokerError> + Send,
    {
        let topic = self.topic_or_err(&req.topic)?;
        let partition = topic
            .partition(req.partition)
            .ok_or(BrokerError::UnknownPartition(req.partition))?;

        let leader = self
            .router
            .leader_of(&req.topic, req.partition)
            .await
            .ok_or(BrokerError::NoLeaderFound)?;

        if leader != self.config.node {
            let (tx, mut rx) = mpsc::channel::<Message>(1);
            let router = self.router.clone();
            let fwd_req = req.clone();
            let handle =
                tokio::spawn(
                    async move { router.forward_fetch_range(&leader, &fwd_req, tx).await },
                );

            while let Some(msg) = rx.recv().await {
                f(msg).await?;
            }

            return handle.await.map_err(|_| BrokerError::ChannelClosed)?;
        }

        let channel = if req.channel.is_empty() {
            DEFAULT_CHANNEL
        } else {
            &req.channel
        };
        partition.scan_range(channel, req.from, req.to, &mut f).await
    }

    /// Record a delivery state for each offset. Without an explicit state
    /// this marks the first delivery, `{Consumed, 1}`.
    pub async fn mark(&self, req: &MarkRequest) -> Result<(), BrokerError> {
        let state = req
            .state
            .unwrap_or(MarkState::new(MarkKind::Consumed, 1));
        self.produce_marks(req, state).await?;
        self.stats.marked(req.offsets.len() as u64);
        Ok(())
    }

    /// Advance the replay watermark: everything at or below these offsets is
    /// settled. Any state on the request is ignored.
    pub async fn commit(&self, req: &MarkRequest) -> Result<(), BrokerError> {
        self.produce_marks(req, MarkState::new(MarkKind::Committed, 0))
            .await?;
        self.stats.committed(req.offsets.len() as u64);
        Ok(())
    }

    pub async fn acknowledge(
        &self,
        topic: &str,
        partition: u32,
        channel: &str,
        group: &str,
        offsets: &[Offset],
    ) -> Result<(), BrokerError> {
        self.mark(&MarkRequest {
            topic: topic.to_string(),
            partition,
            channel: channel.to_string(),
            consumer_group: group.to_string(),
            offsets: offsets.to_vec(),
            state: Some(MarkState::new(MarkKind::Acknowledged, 0)),
        })
        .await
    }

    pub async fn mark_consumed(
        &self,
        topic: &str,
        partition: u32,
        channel: &str,
        group: &str,
        offsets: &[Offset],
    ) -> Result<(), BrokerError> {
        self.mark(&MarkRequest {
            topic: topic.to_string(),
            partition,
            channel: channel.to_string(),
            consumer_group: group.to_string(),
            offsets: offsets.to_vec(),
            state: Some(MarkState::new(MarkKind::Consumed, 1)),
        })
        .await
    }

    pub async fn not_acknowledged(
        &self,
        topic: &str,
        partition: u32,
        channel: &str,
        group: &str,
        offsets: &[Offset],
    ) -> Result<(), BrokerError> {
        self.mark(&MarkRequest {
            topic: topic.to_string(),
            partition,
            channel: channel.to_string(),
            consumer_group: group.to_string(),
            offsets: offsets.to_vec(),
            state: Some(MarkState::new(MarkKind::NotAcknowledged, 0)),
        })
        .await
    }

    async fn produce_marks(&self, req: &MarkRequest, state: MarkState) -> Result<(), BrokerError> {
        let mut messages = Vec::with_capacity(req.offsets.len());
        for offset in &req.offsets {
            messages.push(mark::mark_message(
                &req.topic,
                req.partition,
                &req.channel,
                &req.consumer_group,
                *offset,
                state,
            )?);
        }

        let key = mark::mark_key(&req.topic, req.partition, &req.channel, &req.consumer_group);
        let offsets_topic = self.topic_or_err(CONSUMER_OFFSETS_TOPIC)?;
        let partition = offsets_topic.partition_for_key(&key).id();

        self.produce(&ProduceRequest {
            topic: CONSUMER_OFFSETS_TOPIC.to_string(),
            partition: Some(partition),
            messages,
        })
        .await?;

        Ok(())
    }

    /// Stored state for one (group, offset); `None` when no mark exists yet
    /// (the caller treats that as `Unknown`).
    pub async fn get_mark_state(
        &self,
        req: &GetMarkRequest,
    ) -> Result<Option<MarkState>, BrokerError> {
        let key = mark::mark_key(&req.topic, req.partition, &req.channel, &req.consumer_group);
        let offsets_topic = self.topic_or_err(CONSUMER_OFFSETS_TOPIC)?;
        let partition = offsets_topic.partition_for_key(&key);

        let leader = self
            .router
            .leader_of(CONSUMER_OFFSETS_TOPIC, partition.id())
            .await
            .ok_or(BrokerError::NoLeaderFound)?;
        if leader != self.config.node {
            return self.router.forward_get_mark_state(&leader, req).await;
        }

        let mut suffix = key;
        suffix.extend_from_slice(req.offset.as_bytes());
        match partition.compact_get(&suffix)? {
            None => Ok(None),
            Some(record) => Ok(Some(mark::decode_record(&record))),
        }
    }

    /// Largest offset carrying a mark of at least `kind`; the zero offset
    /// when the group has no such mark.
    pub async fn last_offset(&self, req: &LastOffsetRequest) -> Result<Offset, BrokerError> {
        let key = mark::mark_key(&req.topic, req.partition, &req.channel, &req.consumer_group);
        let offsets_topic = self.topic_or_err(CONSUMER_OFFSETS_TOPIC)?;
        let partition = offsets_topic.partition_for_key(&key);

        let leader = self
            .router
            .leader_of(CONSUMER_OFFSETS_TOPIC, partition.id())
            .await
            .ok_or(BrokerError::NoLeaderFound)?;
        if leader != self.config.node {
            return self.router.forward_last_offset(&leader, req).await;
        }

        let mut found = Offset::ZERO;
        partition.compact_scan_rev(&key, |suffix, record| {
            let Some(offset) = Offset::try_from_slice(suffix) else {
                return true;
            };
            match mark::record_kind(record) {
                Some(kind) if kind >= req.kind => {
                    found = offset;
                    false
                }
                _ => true,
            }
        })?;

        Ok(found)
    }

    /// Attach `consumer_name` to the consumer group, creating the group and
    /// its consume loop on the first attach. Returns the delivery channel and
    /// the detach token; cancelling the token (or dropping the receiver)
    /// detaches the consumer at the next dispatch.
    ///
    /// Delivery is at-least-once: a crash between a delivery and its mark
    /// means the message comes again on the next attach.
    pub async fn consume(
        self: &Arc<Self>,
        topic: &str,
        partition: u32,
        channel: &str,
        group: &str,
        consumer_name: &str,
    ) -> Result<(mpsc::Receiver<Message>, CancellationToken), BrokerError> {
        let t = self.topic_or_err(topic)?;
        if t.partition(partition).is_none() {
            return Err(BrokerError::UnknownPartition(partition));
        }

        let channel = if channel.is_empty() { DEFAULT_CHANNEL } else { channel };
        let key = (
            topic.to_string(),
            partition,
            channel.to_string(),
            group.to_string(),
        );

        let cg = self
            .groups
            .entry(key)
            .or_insert_with(|| {
                Arc::new(ConsumerGroup::new(
                    Arc::downgrade(self),
                    topic,
                    partition,
                    channel,
                    group,
                ))
            })
            .clone();

        cg.attach(consumer_name)
    }

    /// Park until something lands on the partition, or the poll interval
    /// elapses (remote partitions never notify locally).
    pub(crate) async fn wait_for_append(&self, topic: &str, partition: u32) {
        let poll = self.config.tail_poll_interval;
        let part = match self.topics.get(topic) {
            Some(t) => t.partition(partition).cloned(),
            None => None,
        };
        match part {
            Some(p) => p.wait_for_append(poll).await,
            None => tokio::time::sleep(poll).await,
        }
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.task_group.shutdown().await;
        self.groups.clear();
    }
}
