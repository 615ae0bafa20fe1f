use std::sync::Arc;
use std::time::Duration;

use tidemark_broker::test_util::*;
use tidemark_broker::*;

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

async fn state_of<R: Router>(broker: &Broker<R>, topic: &str, offset: Offset) -> Option<MarkState> {
    broker
        .get_mark_state(&GetMarkRequest {
            topic: topic.to_string(),
            partition: 0,
            channel: DEFAULT_CHANNEL.to_string(),
            consumer_group: "g".to_string(),
            offset,
        })
        .await
        .unwrap()
}

/// Wait until the group's mark for `offset` satisfies `pred`; marks are
/// written after the delivery, so tests poll briefly.
async fn wait_for_state<R: Router>(
    broker: &Broker<R>,
    topic: &str,
    offset: Offset,
    pred: impl Fn(&MarkState) -> bool,
) -> MarkState {
    for _ in 0..100 {
        if let Some(state) = state_of(broker, topic, offset).await
            && pred(&state)
        {
            return state;
        }
        sleep_ms(30).await;
    }
    panic!("mark state for {offset} never reached the expected shape");
}

#[tokio::test]
async fn s1_happy_path_and_recovery_skipped_after_restart() {
    let path = test_store_path("s1");
    let config = test_config();

    let (committed, consumed) = {
        let broker =
            Broker::open(&path, Arc::new(LocalRouter::new("local")), config.clone()).unwrap();
        broker.create_topic("orders", TopicKind::Log, 1).unwrap();
        let offsets = produce_texts(&broker, "orders", 0, &["m1", "m2", "m3"]).await;

        let (mut rx, _done) = broker.consume("orders", 0, "", "g", "c1").await.unwrap();
        for expected in &offsets {
            let msg = recv_timeout(&mut rx, 3000).await.expect("delivery");
            assert_eq!(msg.offset, *expected);
            broker
                .acknowledge("orders", 0, DEFAULT_CHANNEL, "g", &[msg.offset])
                .await
                .unwrap();
        }

        broker
            .commit(&MarkRequest {
                topic: "orders".to_string(),
                partition: 0,
                channel: DEFAULT_CHANNEL.to_string(),
                consumer_group: "g".to_string(),
                offsets: vec![offsets[2]],
                state: None,
            })
            .await
            .unwrap();

        broker.shutdown().await;
        (offsets[2], offsets[2])
    };

    sleep_ms(300).await;

    // fresh broker over the same store: watermarks are equal, so the
    // recovery scan is skipped and nothing is redelivered
    let broker = Broker::open(&path, Arc::new(LocalRouter::new("local")), config).unwrap();
    broker.create_topic("orders", TopicKind::Log, 1).unwrap();

    let last = |kind| LastOffsetRequest {
        topic: "orders".to_string(),
        partition: 0,
        channel: DEFAULT_CHANNEL.to_string(),
        consumer_group: "g".to_string(),
        kind,
    };
    assert_eq!(broker.last_offset(&last(MarkKind::Committed)).await.unwrap(), committed);
    assert_eq!(broker.last_offset(&last(MarkKind::Consumed)).await.unwrap(), consumed);

    let (mut rx, _done) = broker.consume("orders", 0, "", "g", "c2").await.unwrap();
    expect_no_message(&mut rx, 600).await;

    broker.shutdown().await;
}

#[tokio::test]
async fn s2_inflight_message_is_redelivered_after_timeout() {
    let broker = open_test_broker("s2", test_config());
    broker.create_topic("orders", TopicKind::Log, 1).unwrap();
    let offsets = produce_texts(&broker, "orders", 0, &["m1"]).await;
    let o1 = offsets[0];

    // first delivery, never acked
    let (mut rx, done) = broker.consume("orders", 0, "", "g", "c1").await.unwrap();
    let msg = recv_timeout(&mut rx, 3000).await.expect("first delivery");
    assert_eq!(msg.offset, o1);

    // detach; the next message pushes the loop over the edge so it exits
    // and records the consumed watermark
    done.cancel();
    produce_texts(&broker, "orders", 0, &["m2"]).await;
    let state = wait_for_state(&broker, "orders", o1, |s| s.kind == MarkKind::Consumed).await;
    assert_eq!(state.delivery_count, 1);

    // past the redelivery timeout, a new attach recovers the message;
    // the wait also lets the previous loop finish tearing down
    sleep_ms(500).await;
    let (mut rx2, _done2) = broker.consume("orders", 0, "", "g", "c2").await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        seen.push(recv_timeout(&mut rx2, 3000).await.expect("delivery").value);
    }
    seen.sort();
    assert_eq!(seen, vec![b"m1".to_vec(), b"m2".to_vec()]);

    let state = wait_for_state(&broker, "orders", o1, |s| s.delivery_count == 2).await;
    assert_eq!(state.kind, MarkKind::Consumed);

    broker.shutdown().await;
}

#[tokio::test]
async fn s3_poison_message_is_dead_lettered() {
    let mut config = test_config();
    config.max_redelivery_count = 2;
    let broker = open_test_broker("s3", config);
    broker.create_topic("orders", TopicKind::Log, 1).unwrap();
    let offsets = produce_texts(&broker, "orders", 0, &["m1"]).await;
    let o1 = offsets[0];

    let (mut rx, done) = broker.consume("orders", 0, "", "g", "c1").await.unwrap();
    recv_timeout(&mut rx, 3000).await.expect("first delivery");
    done.cancel();
    produce_texts(&broker, "orders", 0, &["m2"]).await;
    wait_for_state(&broker, "orders", o1, |s| s.kind == MarkKind::Consumed).await;

    sleep_ms(700).await;

    // the final redelivery is still handed out, then the message is
    // acknowledged and re-produced on the dead-letter channel
    let (mut rx2, _done2) = broker.consume("orders", 0, "", "g", "c2").await.unwrap();
    let mut seen = Vec::new();
    for _ in 0..2 {
        seen.push(recv_timeout(&mut rx2, 3000).await.expect("delivery").value);
    }
    assert!(seen.contains(&b"m1".to_vec()));

    let state = wait_for_state(&broker, "orders", o1, |s| s.kind == MarkKind::Acknowledged).await;
    assert_eq!(state.delivery_count, 2);

    let mut dead = Vec::new();
    for _ in 0..100 {
        dead = collect_range(&broker, "orders", 0, DEAD_LETTER_CHANNEL).await;
        if !dead.is_empty() {
            break;
        }
        sleep_ms(30).await;
    }
    assert_eq!(dead.len(), 1, "poison message appears exactly once on the dead-letter channel");
    assert_eq!(dead[0].value, b"m1");
    assert!(o1.before(&dead[0].offset), "re-producing assigns a fresh offset");

    // a consumer on the dead-letter channel receives it
    let (mut dl_rx, _dl_done) = broker
        .consume("orders", 0, DEAD_LETTER_CHANNEL, "dlg", "dl1")
        .await
        .unwrap();
    let msg = recv_timeout(&mut dl_rx, 3000).await.expect("dead letter delivery");
    assert_eq!(msg.value, b"m1");

    let stats = broker.stats();
    assert_eq!(stats.dead_lettered, 1);
    assert!(stats.redelivered >= 1);

    broker.shutdown().await;
}

#[tokio::test]
async fn s4_round_robin_splits_work_evenly() {
    let broker = open_test_broker("s4", test_config());
    broker.create_topic("jobs", TopicKind::Log, 1).unwrap();

    let (mut rx1, _d1) = broker.consume("jobs", 0, "", "g", "c1").await.unwrap();
    let (mut rx2, _d2) = broker.consume("jobs", 0, "", "g", "c2").await.unwrap();

    let payloads: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
    let payload_refs: Vec<&str> = payloads.iter().map(String::as_str).collect();
    let offsets = produce_texts(&broker, "jobs", 0, &payload_refs).await;

    let h1 = tokio::spawn(async move {
        let mut got = Vec::new();
        for _ in 0..5 {
            got.push(recv_timeout(&mut rx1, 3000).await.expect("c1 delivery").offset);
        }
        got
    });
    let h2 = tokio::spawn(async move {
        let mut got = Vec::new();
        for _ in 0..5 {
            got.push(recv_timeout(&mut rx2, 3000).await.expect("c2 delivery").offset);
        }
        got
    });

    let got1 = h1.await.unwrap();
    let got2 = h2.await.unwrap();

    assert!(got1.windows(2).all(|w| w[0].before(&w[1])), "c1 sees increasing offsets");
    assert!(got2.windows(2).all(|w| w[0].before(&w[1])), "c2 sees increasing offsets");

    let mut all: Vec<Offset> = got1.into_iter().chain(got2).collect();
    all.sort();
    let mut expected = offsets;
    expected.sort();
    assert_eq!(all, expected, "every message delivered exactly once across the group");
    assert_eq!(broker.stats().delivered, 10);

    broker.shutdown().await;
}

#[tokio::test]
async fn s5_detached_consumer_stops_receiving() {
    let broker = open_test_broker("s5", test_config());
    broker.create_topic("jobs", TopicKind::Log, 1).unwrap();

    let (mut rx1, done1) = broker.consume("jobs", 0, "", "g", "c1").await.unwrap();
    let (mut rx2, _done2) = broker.consume("jobs", 0, "", "g", "c2").await.unwrap();

    produce_texts(&broker, "jobs", 0, &["a", "b"]).await;
    let first2 = recv_timeout(&mut rx2, 3000).await.expect("c2 delivery");
    let first1 = recv_timeout(&mut rx1, 3000).await.expect("c1 delivery");
    assert_eq!(first2.value, b"a");
    assert_eq!(first1.value, b"b");

    done1.cancel();

    let offsets = produce_texts(&broker, "jobs", 0, &["c", "d", "e", "f"]).await;
    let mut got = Vec::new();
    for _ in 0..4 {
        got.push(recv_timeout(&mut rx2, 3000).await.expect("c2 delivery").offset);
    }
    assert_eq!(got, offsets, "everything after the detach routes to c2, in order");

    // c1 is gone: either silence or a closed channel, never a message
    expect_no_message(&mut rx1, 300).await;

    broker.shutdown().await;
}

#[tokio::test]
async fn s6_produce_on_non_leader_forwards_to_the_leader() {
    tidemark_util::init_tracing();
    let router = ClusterRouter::new();

    let b1 = Broker::open(
        test_store_path("s6-n1"),
        router.clone(),
        BrokerConfig {
            node: "n1".to_string(),
            ..test_config()
        },
    )
    .unwrap();
    let b2 = Broker::open(
        test_store_path("s6-n2"),
        router.clone(),
        BrokerConfig {
            node: "n2".to_string(),
            ..test_config()
        },
    )
    .unwrap();
    router.add_broker(b1.clone());
    router.add_broker(b2.clone());
    router.set_default_leader("n2");

    b1.create_topic("orders", TopicKind::Log, 1).unwrap();
    b2.create_topic("orders", TopicKind::Log, 1).unwrap();

    // produced through the non-leader; offsets come back from the leader
    let resp = b1
        .produce(&ProduceRequest {
            topic: "orders".to_string(),
            partition: Some(0),
            messages: text_messages(&["x", "y"]),
        })
        .await
        .unwrap();
    assert_eq!(resp.offsets.len(), 2);
    assert!(resp.offsets[0].before(&resp.offsets[1]));

    // the leader has them, and fetching through the non-leader streams them
    let on_leader = collect_range(&b2, "orders", 0, DEFAULT_CHANNEL).await;
    assert_eq!(
        on_leader.iter().map(|m| m.offset).collect::<Vec<_>>(),
        resp.offsets
    );
    let via_follower = collect_range(&b1, "orders", 0, DEFAULT_CHANNEL).await;
    assert_eq!(
        via_follower.iter().map(|m| m.offset).collect::<Vec<_>>(),
        resp.offsets
    );

    // the non-leader never wrote its local log
    router.set_leader("orders", 0, "n1");
    let local = collect_range(&b1, "orders", 0, DEFAULT_CHANNEL).await;
    assert!(local.is_empty());

    b1.shutdown().await;
    b2.shutdown().await;
}

#[tokio::test]
async fn nacked_message_is_redelivered_and_acked_is_not() {
    let broker = open_test_broker("nack", test_config());
    broker.create_topic("orders", TopicKind::Log, 1).unwrap();
    let offsets = produce_texts(&broker, "orders", 0, &["m1", "m2"]).await;

    let (mut rx, done) = broker.consume("orders", 0, "", "g", "c1").await.unwrap();
    let m1 = recv_timeout(&mut rx, 3000).await.expect("m1");
    let m2 = recv_timeout(&mut rx, 3000).await.expect("m2");
    assert_eq!(m1.offset, offsets[0]);
    assert_eq!(m2.offset, offsets[1]);

    broker
        .not_acknowledged("orders", 0, DEFAULT_CHANNEL, "g", &[m1.offset])
        .await
        .unwrap();
    broker
        .acknowledge("orders", 0, DEFAULT_CHANNEL, "g", &[m2.offset])
        .await
        .unwrap();

    done.cancel();
    produce_texts(&broker, "orders", 0, &["m3"]).await;
    wait_for_state(&broker, "orders", offsets[1], |s| s.kind == MarkKind::Acknowledged).await;
    sleep_ms(300).await; // let the previous loop finish tearing down

    // no redelivery delay for a nack, and the acked message never returns
    let (mut rx2, _done2) = broker.consume("orders", 0, "", "g", "c2").await.unwrap();
    let mut seen = Vec::new();
    for _ in 0..2 {
        seen.push(recv_timeout(&mut rx2, 3000).await.expect("delivery").value);
    }
    seen.sort();
    assert_eq!(seen, vec![b"m1".to_vec(), b"m3".to_vec()]);
    expect_no_message(&mut rx2, 400).await;

    broker.shutdown().await;
}

#[tokio::test]
async fn second_attach_with_a_live_name_is_rejected() {
    let broker = open_test_broker("attach-twice", test_config());
    broker.create_topic("t", TopicKind::Log, 1).unwrap();

    let (_rx, _done) = broker.consume("t", 0, "", "g", "c1").await.unwrap();
    let err = broker.consume("t", 0, "", "g", "c1").await.unwrap_err();
    assert!(matches!(err, BrokerError::ConsumerAlreadyAttached(_)));

    // a different name joins the same group just fine
    let (_rx2, _done2) = broker.consume("t", 0, "", "g", "c2").await.unwrap();

    broker.shutdown().await;
}

#[tokio::test]
async fn consume_validates_topic_and_partition() {
    let broker = open_test_broker("consume-validate", test_config());
    broker.create_topic("t", TopicKind::Log, 1).unwrap();

    let err = broker.consume("nope", 0, "", "g", "c1").await.unwrap_err();
    assert!(matches!(err, BrokerError::TopicNotFound(_)));

    let err = broker.consume("t", 7, "", "g", "c1").await.unwrap_err();
    assert!(matches!(err, BrokerError::UnknownPartition(7)));

    broker.shutdown().await;
}
