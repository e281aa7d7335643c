//! Consuming: consumer setup, fan-out, acknowledgement and rejection of
//! inbound messages.


use busterbunny::testing::{MockBroker, NackRecord};
use busterbunny::{BusError, BusSignal, InboundMessage, SignalKind, UsageError};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use test_helpers::*;

type Inbox = Arc<Mutex<Vec<(Arc<Value>, Arc<InboundMessage>)>>>;

/// Subscriber that only records what it receives
fn collecting_subscriber(inbox: &Inbox) -> impl Fn(Arc<Value>, Arc<InboundMessage>) + Send + Sync {
    let inbox = inbox.clone();
    move |event, message| inbox.lock().unwrap().push((event, message))
}

async fn consuming_bus(
    queues: &[&str],
    broker: &MockBroker,
) -> (busterbunny::EventBus, busterbunny::testing::SignalRecorder, Inbox) {
    let (bus, recorder) = ready_bus(config_with_queues(queues), broker).await;
    let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(collecting_subscriber(&inbox)).unwrap();
    for queue in queues {
        assert!(wait_until(|| broker.consumer_count(queue) == 1).await);
    }
    (bus, recorder, inbox)
}

#[tokio::test]
async fn test_subscribe_without_queues_is_usage_error() {
    let broker = MockBroker::new();
    let (bus, _recorder) = ready_bus(test_config(), &broker).await;

    let result = bus.subscribe(|_, _| {});

    let error = result.unwrap_err();
    assert_eq!(error, UsageError::NoQueueConfigured);
    assert_eq!(error.to_string(), "No queue configured");
    assert_eq!(bus.get_stats().subscribers, 0);
}

#[tokio::test]
async fn test_first_subscriber_opens_one_consumer_channel_for_all_queues() {
    let broker = MockBroker::new();
    let (bus, _recorder, _inbox) = consuming_bus(&["orders", "payments"], &broker).await;

    bus.subscribe(|_, _| {}).unwrap();

    assert_eq!(broker.declared_queues(), vec!["orders", "payments"]);
    // publishing channel plus one consumer channel
    assert_eq!(broker.channels_created(), 2);
    assert_eq!(bus.get_stats().subscribers, 2);
}

#[tokio::test]
async fn test_prefetch_is_applied_when_configured() {
    let broker = MockBroker::new();
    let mut config = config_with_queues(&["orders"]);
    config.channel_prefetch_count = 5;
    let (bus, _recorder) = ready_bus(config, &broker).await;

    bus.subscribe(|_, _| {}).unwrap();

    assert!(wait_until(|| broker.consumer_count("orders") == 1).await);
    assert_eq!(broker.prefetch_calls(), vec![5]);
}

#[tokio::test]
async fn test_zero_prefetch_leaves_channel_default() {
    let broker = MockBroker::new();
    let (_bus, _recorder, _inbox) = consuming_bus(&["orders"], &broker).await;

    assert!(broker.prefetch_calls().is_empty());
}

#[tokio::test]
async fn test_consumer_warning_at_threshold() {
    let broker = MockBroker::new();
    let mut config = config_with_queues(&["orders"]);
    config.thresholds.max_consumers = 2;
    let (bus, recorder) = ready_bus(config, &broker).await;

    bus.subscribe(|_, _| {}).unwrap();
    assert!(recorder.warnings().is_empty());

    bus.subscribe(|_, _| {}).unwrap();
    assert_eq!(
        recorder.warnings(),
        vec!["2 consumers is greater than or equal to max of 2".to_string()]
    );
}

#[tokio::test]
async fn test_acknowledge_updates_stats_and_emits_signal() {
    let broker = MockBroker::new();
    let (bus, recorder, inbox) = consuming_bus(&["orders"], &broker).await;

    let tag = broker
        .deliver("orders", r#"{"order":42}"#.as_bytes().to_vec())
        .unwrap();
    assert!(wait_until(|| inbox.lock().unwrap().len() == 1).await);

    let (event, message) = inbox.lock().unwrap()[0].clone();
    assert_eq!(*event, json!({"order": 42}));
    message.acknowledge().unwrap();

    assert_eq!(bus.get_stats().messages_acknowledged, 1);
    let acknowledged = recorder
        .signals()
        .into_iter()
        .find_map(|signal| match signal {
            BusSignal::EventAcknowledged { event, timestamp } => Some((event, timestamp)),
            _ => None,
        })
        .unwrap();
    assert_eq!(*acknowledged.0, json!({"order": 42}));
    assert!(acknowledged.1 > 0);

    assert!(wait_until(|| broker.acks() == vec![tag]).await);
}

#[tokio::test]
async fn test_reject_with_requeue_counts_as_retry() {
    let broker = MockBroker::new();
    let (bus, recorder, inbox) = consuming_bus(&["orders"], &broker).await;

    let tag = broker.deliver("orders", &b"{}"[..]).unwrap();
    assert!(wait_until(|| inbox.lock().unwrap().len() == 1).await);
    let message = inbox.lock().unwrap()[0].1.clone();
    message.reject(true).unwrap();

    let stats = bus.get_stats();
    assert_eq!(stats.messages_rejected_with_retry, 1);
    assert_eq!(stats.messages_rejected, 0);
    assert!(recorder.signals().iter().any(|signal| matches!(
        signal,
        BusSignal::EventNacked { event: Some(_), requeue: true, .. }
    )));
    assert!(
        wait_until(|| broker.nacks()
            == vec![NackRecord {
                delivery_tag: tag,
                multiple: false,
                requeue: true
            }])
        .await
    );
}

#[tokio::test]
async fn test_reject_without_requeue_counts_as_rejected() {
    let broker = MockBroker::new();
    let (bus, recorder, inbox) = consuming_bus(&["orders"], &broker).await;

    broker.deliver("orders", &b"[1,2,3]"[..]).unwrap();
    assert!(wait_until(|| inbox.lock().unwrap().len() == 1).await);
    let message = inbox.lock().unwrap()[0].1.clone();
    message.reject(false).unwrap();

    let stats = bus.get_stats();
    assert_eq!(stats.messages_rejected, 1);
    assert_eq!(stats.messages_rejected_with_retry, 0);
    assert!(recorder.signals().iter().any(|signal| matches!(
        signal,
        BusSignal::EventNacked { event: Some(_), requeue: false, .. }
    )));
}

#[tokio::test]
async fn test_second_settlement_is_refused() {
    let broker = MockBroker::new();
    let (bus, recorder, inbox) = consuming_bus(&["orders"], &broker).await;

    broker.deliver("orders", &b"{}"[..]).unwrap();
    assert!(wait_until(|| inbox.lock().unwrap().len() == 1).await);
    let message = inbox.lock().unwrap()[0].1.clone();

    message.acknowledge().unwrap();
    assert!(matches!(message.acknowledge(), Err(BusError::AlreadySettled)));
    assert!(matches!(message.reject(true), Err(BusError::AlreadySettled)));

    let stats = bus.get_stats();
    assert_eq!(stats.messages_acknowledged, 1);
    assert_eq!(stats.messages_rejected_with_retry, 0);
    assert_eq!(recorder.count(SignalKind::EventAcknowledged), 1);
    assert_eq!(recorder.count(SignalKind::EventNacked), 0);
    assert!(message.is_settled());
}

#[tokio::test]
async fn test_undecodable_message_is_rejected_and_never_dispatched() {
    let broker = MockBroker::new();
    let (bus, recorder, inbox) = consuming_bus(&["orders"], &broker).await;

    let tag = broker.deliver("orders", &b"{not json"[..]).unwrap();

    assert!(recorder.wait_for(SignalKind::EventNacked, 1, WAIT).await);
    assert!(inbox.lock().unwrap().is_empty());
    assert_eq!(bus.get_stats().messages_rejected, 1);
    assert!(recorder.signals().iter().any(|signal| matches!(
        signal,
        BusSignal::EventNacked { event: None, requeue: false, .. }
    )));
    assert_eq!(
        broker.nacks(),
        vec![NackRecord {
            delivery_tag: tag,
            multiple: false,
            requeue: false
        }]
    );
}

#[tokio::test]
async fn test_subscribers_share_one_message_in_registration_order() {
    let broker = MockBroker::new();
    let (bus, _recorder) = ready_bus(config_with_queues(&["orders"]), &broker).await;

    let calls: Arc<Mutex<Vec<(usize, Arc<InboundMessage>)>>> = Arc::new(Mutex::new(Vec::new()));
    for index in 1..=3 {
        let calls = calls.clone();
        bus.subscribe(move |_, message| calls.lock().unwrap().push((index, message)))
            .unwrap();
    }
    assert!(wait_until(|| broker.consumer_count("orders") == 1).await);

    broker.deliver("orders", &b"{\"n\":1}"[..]).unwrap();
    assert!(wait_until(|| calls.lock().unwrap().len() == 3).await);

    let calls = calls.lock().unwrap();
    let order: Vec<usize> = calls.iter().map(|(index, _)| *index).collect();
    assert_eq!(order, vec![1, 2, 3]);
    assert!(Arc::ptr_eq(&calls[0].1, &calls[1].1));
    assert!(Arc::ptr_eq(&calls[1].1, &calls[2].1));
}

#[tokio::test]
async fn test_deliveries_keep_broker_order() {
    let broker = MockBroker::new();
    let (_bus, _recorder, inbox) = consuming_bus(&["orders"], &broker).await;

    for n in 0..5 {
        broker.deliver("orders", format!("{{\"n\":{n}}}").into_bytes());
    }
    assert!(wait_until(|| inbox.lock().unwrap().len() == 5).await);

    let seen: Vec<Value> = inbox
        .lock()
        .unwrap()
        .iter()
        .map(|(event, _)| (**event).clone())
        .collect();
    let expected: Vec<Value> = (0..5).map(|n| json!({ "n": n })).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_message_exposes_delivery_metadata() {
    let broker = MockBroker::new();
    let (_bus, _recorder, inbox) = consuming_bus(&["orders", "payments"], &broker).await;

    let tag = broker.deliver("payments", &b"{}"[..]).unwrap();
    assert!(wait_until(|| inbox.lock().unwrap().len() == 1).await);

    let message = inbox.lock().unwrap()[0].1.clone();
    assert_eq!(message.queue(), "payments");
    assert_eq!(message.delivery_tag(), tag);
    assert!(!message.redelivered());
    assert!(!message.is_settled());
}

#[tokio::test]
async fn test_subscriber_registered_while_disconnected_consumes_after_connect() {
    let broker = MockBroker::new();
    broker.fail_next_connects(1, "connection refused");
    let mut config = config_with_queues(&["orders"]);
    config.reconnect.sustained_delay_ms = 100;
    let (bus, recorder) = start_bus(config, &broker);

    assert!(recorder.wait_for(SignalKind::Reconnecting, 1, WAIT).await);
    let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(collecting_subscriber(&inbox)).unwrap();
    assert!(broker.declared_queues().is_empty());

    assert!(recorder.wait_for(SignalKind::Ready, 1, WAIT).await);
    assert_eq!(broker.consumer_count("orders"), 1);

    broker.deliver("orders", &b"{}"[..]).unwrap();
    assert!(wait_until(|| inbox.lock().unwrap().len() == 1).await);
}

#[tokio::test]
async fn test_consumer_is_reestablished_after_connection_loss() {
    let broker = MockBroker::new();
    let (_bus, recorder, inbox) = consuming_bus(&["orders"], &broker).await;

    broker.cause_connection_error("connection reset");
    assert!(recorder.wait_for(SignalKind::Ready, 2, WAIT).await);

    assert_eq!(broker.consumer_count("orders"), 1);
    assert_eq!(broker.declared_queues(), vec!["orders", "orders"]);

    broker.deliver("orders", &b"{\"after\":true}"[..]).unwrap();
    assert!(wait_until(|| inbox.lock().unwrap().len() == 1).await);
    assert_eq!(*inbox.lock().unwrap()[0].0, json!({"after": true}));
}
