use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::BrokerError;
use crate::broker::{
    FetchRangeRequest, GetMarkRequest, LastOffsetRequest, ProduceRequest, ProduceResponse,
};
use crate::message::{MarkState, Message};
use crate::offset::Offset;

pub type NodeId = String;

/// The broker's only view of the cluster: who leads a partition, and a way
/// to hand a request to that node. Membership, election and the transport
/// live behind this seam.
#[async_trait]
pub trait Router: Send + Sync + 'static {
    async fn leader_of(&self, topic: &str, partition: u32) -> Option<NodeId>;

    async fn forward_produce(
        &self,
        node: &NodeId,
        req: &ProduceRequest,
    ) -> Result<ProduceResponse, BrokerError>;

    /// Stream the requested range from `node` into `sink`. Returns once the
    /// remote side reaches the end of the range or fails.
    async fn forward_fetch_range(
        &self,
        node: &NodeId,
        req: &FetchRangeRequest,
        sink: mpsc::Sender<Message>,
    ) -> Result<(), BrokerError>;

    async fn forward_get_mark_state(
        &self,
        node: &NodeId,
        req: &GetMarkRequest,
    ) -> Result<Option<MarkState>, BrokerError>;

    async fn forward_last_offset(
        &self,
        node: &NodeId,
        req: &LastOffsetRequest,
    ) -> Result<Offset, BrokerError>;
}

/// Single-node router: this node leads everything, forwarding never happens.
#[derive(Debug)]
pub struct LocalRouter {
    node: NodeId,
}

impl LocalRouter {
    pub fn new(node: impl Into<NodeId>) -> Self {
        Self { node: node.into() }
    }
}

#[async_trait]
impl Router for LocalRouter {
    async fn leader_of(&self, _topic: &str, _partition: u32) -> Option<NodeId> {
        Some(self.node.clone())
    }

    async fn forward_produce(
        &self,
        node: &NodeId,
        _req: &ProduceRequest,
    ) -> Result<ProduceResponse, BrokerError> {
        Err(BrokerError::Routing(format!(
            "no route to '{node}' on a single-node deployment"
        )))
    }

    async fn forward_fetch_range(
        &self,
        node: &NodeId,
        _req: &FetchRangeRequest,
        _sink: mpsc::Sender<Message>,
    ) -> Result<(), BrokerError> {
        Err(BrokerError::Routing(format!(
            "no route to '{node}' on a single-node deployment"
        )))
    }

    async fn forward_get_mark_state(
        &self,
        node: &NodeId,
        _req: &GetMarkRequest,
    ) -> Result<Option<MarkState>, BrokerError> {
        Err(BrokerError::Routing(format!(
            "no route to '{node}' on a single-node deployment"
        )))
    }

    async fn forward_last_offset(
        &self,
        node: &NodeId,
        _req: &LastOffsetRequest,
    ) -> Result<Offset, BrokerError> {
        Err(BrokerError::Routing(format!(
            "no route to '{node}' on a single-node deployment"
        )))
    }
}
