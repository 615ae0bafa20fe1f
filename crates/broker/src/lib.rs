pub mod broker;
mod consumer_group;
pub mod mark;
pub mod message;
pub mod offset;
pub mod partition;
pub mod router;
pub mod test_util;
pub mod topic;

pub use broker::{
    Broker, FetchRangeRequest, GetMarkRequest, LastOffsetRequest, MarkRequest, ProduceRequest,
    ProduceResponse,
};
pub use message::{
    CONSUMER_OFFSETS_TOPIC, DEAD_LETTER_CHANNEL, DEFAULT_CHANNEL, MarkKind, MarkState, Message,
};
pub use offset::{Offset, OffsetGen};
pub use router::{LocalRouter, NodeId, Router};
pub use topic::{Topic, TopicKind};

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::queue::SegQueue;
use tidemark_storage::StorageError;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("no messages to produce")]
    NoMessagesToProduce,

    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("unknown partition '{0}'")]
    UnknownPartition(u32),

    #[error("no leader found")]
    NoLeaderFound,

    #[error("consumer '{0}' is already attached")]
    ConsumerAlreadyAttached(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("routing error: {0}")]
    Routing(String),

    #[error("channel closed")]
    ChannelClosed,
}

impl From<bincode::Error> for BrokerError {
    fn from(err: bincode::Error) -> Self {
        BrokerError::Codec(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Name this node answers to in `Router::leader_of` results.
    pub node: NodeId,
    /// Base redelivery delay; scaled by the delivery count per message.
    pub redelivery_timeout: Duration,
    /// Deliveries before a message is acknowledged and dead-lettered.
    pub max_redelivery_count: u32,
    /// Fallback wake-up interval for tailing loops on remote partitions.
    pub tail_poll_interval: Duration,
    pub offsets_topic_partitions: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            node: "local".to_string(),
            redelivery_timeout: Duration::from_secs(10),
            max_redelivery_count: 5,
            tail_poll_interval: Duration::from_millis(500),
            offsets_topic_partitions: 8,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TaskGroup {
    handles: SegQueue<tokio::task::JoinHandle<()>>,
    shutdown: AtomicBool,
}

impl TaskGroup {
    pub(crate) fn new() -> Self {
        Self {
            handles: SegQueue::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Hard gate: no tasks after shutdown
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }

        let handle = tokio::spawn(fut);

        if self.shutdown.load(Ordering::Acquire) {
            handle.abort();
        } else {
            self.handles.push(handle);
        }
    }

    pub(crate) async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);

        while let Some(handle) = self.handles.pop() {
            handle.abort();
        }
    }
}
