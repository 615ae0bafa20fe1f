//! Helpers shared by the integration tests: temp-dir brokers, an in-process
//! cluster router, and receive/assert utilities.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::mpsc;

use crate::broker::{
    FetchRangeRequest, GetMarkRequest, LastOffsetRequest, ProduceRequest, ProduceResponse,
};
use crate::message::{MarkState, Message};
use crate::offset::Offset;
use crate::router::{LocalRouter, NodeId, Router};
use crate::{Broker, BrokerConfig, BrokerError};

pub fn test_store_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("tidemark-{tag}-{}", fastrand::u64(..)))
}

/// Config with timers shrunk so redelivery tests run in milliseconds.
pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        redelivery_timeout: Duration::from_millis(300),
        tail_poll_interval: Duration::from_millis(50),
        ..BrokerConfig::default()
    }
}

pub fn open_test_broker(tag: &str, config: BrokerConfig) -> Arc<Broker<LocalRouter>> {
    tidemark_util::init_tracing();
    let router = Arc::new(LocalRouter::new(config.node.clone()));
    Broker::open(test_store_path(tag), router, config).unwrap()
}

pub fn text_messages(payloads: &[&str]) -> Vec<Message> {
    payloads
        .iter()
        .map(|p| Message::new(Vec::new(), p.as_bytes()))
        .collect()
}

pub async fn produce_texts<R: Router>(
    broker: &Broker<R>,
    topic: &str,
    partition: u32,
    payloads: &[&str],
) -> Vec<Offset> {
    broker
        .produce(&ProduceRequest {
            topic: topic.to_string(),
            partition: Some(partition),
            messages: text_messages(payloads),
        })
        .await
        .unwrap()
        .offsets
}

pub async fn recv_timeout(rx: &mut mpsc::Receiver<Message>, ms: u64) -> Option<Message> {
    tokio::time::timeout(Duration::from_millis(ms), rx.recv())
        .await
        .ok()
        .flatten()
}

pub async fn expect_no_message(rx: &mut mpsc::Receiver<Message>, ms: u64) {
    if let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(ms), rx.recv()).await {
        panic!("unexpected message at offset {}", msg.offset);
    }
}

/// Collect everything currently stored in a channel range, for assertions.
pub async fn collect_range<R: Router>(
    broker: &Broker<R>,
    topic: &str,
    partition: u32,
    channel: &str,
) -> Vec<Message> {
    let mut out = Vec::new();
    broker
        .fetch_range_fn(
            &FetchRangeRequest {
                topic: topic.to_string(),
                partition,
                channel: channel.to_string(),
                from: Offset::ZERO,
                to: Offset::MAX,
            },
            async |msg| {
                out.push(msg);
                Ok(())
            },
        )
        .await
        .unwrap();
    out
}

/// In-process cluster wiring: a shared leader table plus direct handles to
/// every broker, standing in for membership and the RPC transport.
#[derive(Default)]
pub struct ClusterRouter {
    brokers: RwLock<HashMap<NodeId, Arc<Broker<ClusterRouter>>>>,
    leaders: RwLock<HashMap<(String, u32), NodeId>>,
    default_leader: RwLock<Option<NodeId>>,
}

impl ClusterRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_broker(&self, broker: Arc<Broker<ClusterRouter>>) {
        self.brokers
            .write()
            .unwrap()
            .insert(broker.node().clone(), broker);
    }

    pub fn set_leader(&self, topic: &str, partition: u32, node: &str) {
        self.leaders
            .write()
            .unwrap()
            .insert((topic.to_string(), partition), node.to_string());
    }

    /// Leader for every partition without an explicit entry.
    pub fn set_default_leader(&self, node: &str) {
        *self.default_leader.write().unwrap() = Some(node.to_string());
    }

    fn broker(&self, node: &NodeId) -> Result<Arc<Broker<ClusterRouter>>, BrokerError> {
        self.brokers
            .read()
            .unwrap()
            .get(node)
            .cloned()
            .ok_or_else(|| BrokerError::Routing(format!("unknown node '{node}'")))
    }
}

#[async_trait]
impl Router for ClusterRouter {
    async fn leader_of(&self, topic: &str, partition: u32) -> Option<NodeId> {
        self.leaders
            .read()
            .unwrap()
            .get(&(topic.to_string(), partition))
            .cloned()
            .or_else(|| self.default_leader.read().unwrap().clone())
    }

    async fn forward_produce(
        &self,
        node: &NodeId,
        req: &ProduceRequest,
    ) -> Result<ProduceResponse, BrokerError> {
        self.broker(node)?.produce(req).await
    }

    async fn forward_fetch_range(
        &self,
        node: &NodeId,
        req: &FetchRangeRequest,
        sink: mpsc::Sender<Message>,
    ) -> Result<(), BrokerError> {
        self.broker(node)?
            .fetch_range_fn(req, async |msg| {
                sink.send(msg).await.map_err(|_| BrokerError::ChannelClosed)
            })
            .await
    }

    async fn forward_get_mark_state(
        &self,
        node: &NodeId,
        req: &GetMarkRequest,
    ) -> Result<Option<MarkState>, BrokerError> {
        self.broker(node)?.get_mark_state(req).await
    }

    async fn forward_last_offset(
        &self,
        node: &NodeId,
        req: &LastOffsetRequest,
    ) -> Result<Offset, BrokerError> {
        self.broker(node)?.last_offset(req).await
    }
}
