use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tidemark_util::unix_millis;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::BrokerError;
use crate::broker::{
    Broker, FetchRangeRequest, GetMarkRequest, LastOffsetRequest, MarkRequest, ProduceRequest,
};
use crate::message::{DEAD_LETTER_CHANNEL, MarkKind, MarkState, Message};
use crate::offset::Offset;
use crate::router::Router;

/// While walking an all-acknowledged prefix, push the commit watermark
/// forward every this many messages so the next recovery starts near the
/// tail.
const COMMIT_STRIDE: usize = 10_000;

#[derive(Debug)]
struct Receiver {
    name: String,
    msg_tx: mpsc::Sender<Message>,
    done: CancellationToken,
}

/// Shared-work cohort on one (topic, partition, channel). The first attached
/// receiver spawns the consume loop; the loop recovers the unsettled range,
/// tails live traffic, round-robins deliveries across receivers and drives
/// the per-offset mark state machine. The loop is the sole closer of
/// receiver channels.
pub(crate) struct ConsumerGroup<R: Router> {
    broker: Weak<Broker<R>>,
    topic: String,
    partition: u32,
    channel: String,
    name: String,
    receivers: RwLock<Vec<Arc<Receiver>>>,
}

impl<R: Router> ConsumerGroup<R> {
    pub(crate) fn new(
        broker: Weak<Broker<R>>,
        topic: &str,
        partition: u32,
        channel: &str,
        name: &str,
    ) -> Self {
        Self {
            broker,
            topic: topic.to_string(),
            partition,
            channel: channel.to_string(),
            name: name.to_string(),
            receivers: RwLock::new(Vec::new()),
        }
    }

    /// Register a receiver. The 0 -> 1 transition spawns the consume loop;
    /// re-attaching a name that is still registered is rejected, since the
    /// delivery channel was already handed to its first owner.
    pub(crate) fn attach(
        self: &Arc<Self>,
        consumer: &str,
    ) -> Result<(mpsc::Receiver<Message>, CancellationToken), BrokerError> {
        let broker = self.broker.upgrade().ok_or(BrokerError::ChannelClosed)?;

        let spawn_loop;
        let (msg_tx, msg_rx) = mpsc::channel(1);
        let done = CancellationToken::new();
        {
            let mut receivers = self.receivers.write().unwrap();
            if receivers.iter().any(|r| r.name == consumer) {
                return Err(BrokerError::ConsumerAlreadyAttached(consumer.to_string()));
            }
            receivers.push(Arc::new(Receiver {
                name: consumer.to_string(),
                msg_tx,
                done: done.clone(),
            }));
            spawn_loop = receivers.len() == 1;
        }

        if spawn_loop {
            let cg = self.clone();
            broker.task_group.spawn(async move { cg.consume_loop().await });
        }

        Ok((msg_rx, done))
    }

    async fn consume_loop(self: Arc<Self>) {
        tracing::debug!(
            topic = %self.topic,
            partition = self.partition,
            channel = %self.channel,
            group = %self.name,
            "consume loop started"
        );

        if let Err(err) = self.run_loop().await {
            tracing::warn!(group = %self.name, "consume loop failed: {err}");
        }

        self.teardown();
    }

    async fn run_loop(self: &Arc<Self>) -> Result<(), BrokerError> {
        let broker = self.broker.upgrade().ok_or(BrokerError::ChannelClosed)?;

        let committed = broker
            .last_offset(&self.last_offset_request(MarkKind::Committed))
            .await?;
        let consumed = broker
            .last_offset(&self.last_offset_request(MarkKind::Consumed))
            .await?;

        let (in_tx, mut in_rx) = mpsc::channel::<Message>(1);

        {
            let cg = self.clone();
            let broker = broker.clone();
            let task_group = broker.task_group.clone();
            task_group.spawn(async move {
                let recovery = async {
                    if committed != consumed {
                        cg.recovery_scan(&broker, committed, consumed, &in_tx).await
                    } else {
                        Ok(())
                    }
                };
                let tail = async { cg.tail_scan(&broker, consumed, &in_tx).await };

                // first error cancels the other scan; in_tx drops here,
                // which ends the dispatcher below
                if let Err(err) = tokio::try_join!(recovery, tail) {
                    if in_tx.is_closed() {
                        tracing::debug!(group = %cg.name, "scan ended after dispatcher exit: {err}");
                    } else {
                        tracing::warn!(group = %cg.name, "scan failed: {err}");
                    }
                }
            });
        }

        let last = self.dispatch(&broker, &mut in_rx).await;
        drop(in_rx);

        // record the tail watermark so the next loop knows where recovery ends
        if let Some(offset) = last
            && offset != consumed
            && let Err(err) = broker
                .mark_consumed(&self.topic, self.partition, &self.channel, &self.name, &[offset])
                .await
        {
            tracing::debug!(group = %self.name, "unable to mark consumed watermark: {err}");
        }

        Ok(())
    }

    /// Walk `(committed, consumed]`, advancing the commit watermark over the
    /// acknowledged prefix and re-delivering anything whose redelivery timer
    /// has run out. A message that exhausts its redelivery budget is marked
    /// acknowledged and re-produced on the dead-letter channel.
    async fn recovery_scan(
        self: &Arc<Self>,
        broker: &Arc<Broker<R>>,
        committed: Offset,
        consumed: Offset,
        in_tx: &mpsc::Sender<Message>,
    ) -> Result<(), BrokerError> {
        tracing::debug!(
            group = %self.name,
            %committed,
            %consumed,
            "recovering unsettled range"
        );

        let req = self.fetch_request(committed, consumed);
        let mut last_message: Option<Message> = None;
        let mut watermark_settled = false;
        let mut scanned = 0usize;

        broker
            .fetch_range_fn(&req, async |msg: Message| {
                if msg.offset == committed {
                    // the boundary message is already terminal
                    last_message = Some(msg);
                    return Ok(());
                }
                scanned += 1;

                let state = broker
                    .get_mark_state(&GetMarkRequest {
                        topic: self.topic.clone(),
                        partition: self.partition,
                        channel: self.channel.clone(),
                        consumer_group: self.name.clone(),
                        offset: msg.offset,
                    })
                    .await?
                    .unwrap_or_default();

                if !watermark_settled && let Some(last) = &last_message {
                    if state.kind != MarkKind::Acknowledged {
                        // first unsettled message: everything before it is done
                        if last.offset != committed {
                            self.commit_watermark(broker, last.offset).await;
                        }
                        watermark_settled = true;
                    } else if scanned % COMMIT_STRIDE == 0 {
                        let cg = self.clone();
                        let broker = broker.clone();
                        let offset = last.offset;
                        tokio::spawn(async move { cg.commit_watermark(&broker, offset).await });
                    }
                }
                last_message = Some(msg.clone());

                if !self.should_redeliver(&msg, state, broker.config.redelivery_timeout) {
                    return Ok(());
                }

                in_tx
                    .send(msg.clone())
                    .await
                    .map_err(|_| BrokerError::ChannelClosed)?;
                broker.stats_handle().redelivered();

                if state.kind == MarkKind::Unknown {
                    // first recorded delivery
                    broker
                        .mark(&self.mark_request(vec![msg.offset], MarkState::new(MarkKind::Consumed, 1)))
                        .await?;
                } else {
                    let mut next = state;
                    next.delivery_count += 1;

                    if next.delivery_count >= broker.config.max_redelivery_count {
                        next.kind = MarkKind::Acknowledged;

                        let mut dead = msg.clone();
                        dead.channel = DEAD_LETTER_CHANNEL.to_string();
                        dead.offset = Offset::ZERO;

                        let mark_req = self.mark_request(vec![msg.offset], next);
                        let republish_req = ProduceRequest {
                            topic: self.topic.clone(),
                            partition: Some(self.partition),
                            messages: vec![dead],
                        };
                        tokio::try_join!(broker.mark(&mark_req), broker.produce(&republish_req))?;

                        broker.stats_handle().dead_lettered(1);
                        tracing::warn!(
                            group = %self.name,
                            offset = %msg.offset,
                            "redelivery budget exhausted, message dead-lettered"
                        );
                    } else {
                        broker.mark(&self.mark_request(vec![msg.offset], next)).await?;
                    }
                }

                Ok(())
            })
            .await?;

        if !watermark_settled
            && let Some(last) = last_message
            && last.offset != committed
        {
            self.commit_watermark(broker, last.offset).await;
        }

        Ok(())
    }

    /// Tail live traffic from the consumed watermark: fetch up to "now",
    /// then wait for the next append and fetch again. New messages are
    /// delivered unconditionally and stay Unknown until acked or recovered.
    async fn tail_scan(
        &self,
        broker: &Arc<Broker<R>>,
        consumed: Offset,
        in_tx: &mpsc::Sender<Message>,
    ) -> Result<(), BrokerError> {
        let mut cursor = consumed;
        loop {
            if broker.shutdown.is_cancelled() || in_tx.is_closed() {
                return Ok(());
            }

            let from = cursor;
            let req = self.fetch_request(from, Offset::upper_bound(unix_millis()));
            broker
                .fetch_range_fn(&req, async |msg: Message| {
                    // the boundary was delivered by the previous round
                    if msg.offset == from {
                        return Ok(());
                    }
                    let offset = msg.offset;
                    in_tx.send(msg).await.map_err(|_| BrokerError::ChannelClosed)?;
                    cursor = offset;
                    Ok(())
                })
                .await?;

            if cursor == from {
                broker.wait_for_append(&self.topic, self.partition).await;
            }
        }
    }

    /// Round-robin messages across receivers, dropping receivers whose done
    /// token fired or whose channel went away. Returns the offset of the
    /// last successful delivery.
    async fn dispatch(
        &self,
        broker: &Broker<R>,
        in_rx: &mut mpsc::Receiver<Message>,
    ) -> Option<Offset> {
        let mut i: usize = 0;
        let mut last: Option<Offset> = None;

        'messages: while let Some(msg) = in_rx.recv().await {
            i = i.wrapping_add(1);
            loop {
                let receiver = {
                    let receivers = self.receivers.read().unwrap();
                    if receivers.is_empty() {
                        break 'messages;
                    }
                    receivers[i % receivers.len()].clone()
                };

                tokio::select! {
                    biased;

                    _ = receiver.done.cancelled() => {
                        // keep the index: the shrunk list maps it to a
                        // different live receiver
                        self.remove_receiver(&receiver.name);
                    }
                    permit = receiver.msg_tx.reserve() => {
                        match permit {
                            Ok(permit) => {
                                let offset = msg.offset;
                                permit.send(msg);
                                last = Some(offset);
                                broker.stats_handle().delivered();
                                continue 'messages;
                            }
                            Err(_) => {
                                // consumer dropped its receiving half
                                self.remove_receiver(&receiver.name);
                            }
                        }
                    }
                }
            }
        }

        last
    }

    fn should_redeliver(&self, msg: &Message, state: MarkState, timeout: Duration) -> bool {
        match state.kind {
            MarkKind::NotAcknowledged => true,
            MarkKind::Consumed | MarkKind::Unknown => {
                // inflight: back off linearly with the delivery count
                let mut wait = timeout.as_millis() as u64;
                if state.delivery_count > 0 {
                    wait = wait.saturating_mul(state.delivery_count as u64);
                }
                msg.produced_at.saturating_add(wait) < unix_millis()
            }
            MarkKind::Acknowledged | MarkKind::Committed => false,
        }
    }

    async fn commit_watermark(&self, broker: &Broker<R>, offset: Offset) {
        let req = MarkRequest {
            topic: self.topic.clone(),
            partition: self.partition,
            channel: self.channel.clone(),
            consumer_group: self.name.clone(),
            offsets: vec![offset],
            state: None,
        };
        if let Err(err) = broker.commit(&req).await {
            tracing::debug!(group = %self.name, %offset, "unable to commit watermark: {err}");
        }
    }

    fn remove_receiver(&self, name: &str) -> bool {
        let mut receivers = self.receivers.write().unwrap();
        let before = receivers.len();
        receivers.retain(|r| r.name != name);
        receivers.len() != before
    }

    /// Close every receiver and clear the list; the next attach starts a
    /// fresh loop.
    fn teardown(&self) {
        let mut receivers = self.receivers.write().unwrap();
        for r in receivers.iter() {
            r.done.cancel();
        }
        receivers.clear();
        tracing::debug!(group = %self.name, "consume loop ended, receivers closed");
    }

    fn fetch_request(&self, from: Offset, to: Offset) -> FetchRangeRequest {
        FetchRangeRequest {
            topic: self.topic.clone(),
            partition: self.partition,
            channel: self.channel.clone(),
            from,
            to,
        }
    }

    fn last_offset_request(&self, kind: MarkKind) -> LastOffsetRequest {
        LastOffsetRequest {
            topic: self.topic.clone(),
            partition: self.partition,
            channel: self.channel.clone(),
            consumer_group: self.name.clone(),
            kind,
        }
    }

    fn mark_request(&self, offsets: Vec<Offset>, state: MarkState) -> MarkRequest {
        MarkRequest {
            topic: self.topic.clone(),
            partition: self.partition,
            channel: self.channel.clone(),
            consumer_group: self.name.clone(),
            offsets,
            state: Some(state),
        }
    }
}
