//! Publishing behavior of the event bus facade
//!
//! Argument resolution, the queued-events counter, backlog warnings, drain
//! order and publish failure reporting, all against the mock broker.


use busterbunny::testing::MockBroker;
use busterbunny::{BusError, DrainOrder, PublishOptions, RaiseArg, SignalKind, UsageError};
use serde_json::json;
use std::sync::{Arc, Mutex};
use test_helpers::*;

#[tokio::test]
async fn test_raise_increments_queued_counter_before_drain() {
    let broker = MockBroker::new();
    broker.hang_next_connect();
    let (bus, _recorder) = start_bus(test_config(), &broker);

    let (callback, _rx) = completion();
    bus.raise_events("order.placed", &json!({"id": 1}), None, Some(callback))
        .unwrap();

    assert_eq!(bus.get_stats().queued_events_to_raise, 1);
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn test_options_without_callback_is_usage_error() {
    let broker = MockBroker::new();
    let (bus, _recorder) = start_bus(test_config(), &broker);

    let result = bus.raise_events(
        "id",
        &json!({}),
        Some(PublishOptions::default().into()),
        None,
    );

    let error = result.unwrap_err();
    assert_eq!(error, UsageError::MissingCallback);
    assert!(error.to_string().contains("afterRaised must be a callback"));
    assert_eq!(bus.get_stats().queued_events_to_raise, 0);
}

#[tokio::test]
async fn test_two_callbacks_is_ambiguous_usage_error() {
    let broker = MockBroker::new();
    let (bus, _recorder) = start_bus(test_config(), &broker);

    let (second, _rx) = completion();
    let result = bus.raise_events(
        "id",
        &json!({}),
        Some(RaiseArg::callback(|_| {})),
        Some(second),
    );

    assert_eq!(result.unwrap_err(), UsageError::AmbiguousCallback);
    assert_eq!(bus.get_stats().queued_events_to_raise, 0);
}

#[tokio::test]
async fn test_missing_event_id_is_reported_through_callback() {
    let broker = MockBroker::new();
    let (bus, _recorder) = start_bus(test_config(), &broker);

    let (callback, rx) = completion();
    let raised = bus.raise_events(
        None::<&str>,
        &json!({}),
        Some(PublishOptions::default().into()),
        Some(callback),
    );
    assert!(raised.is_ok());

    let result = within(rx).await.unwrap();
    let error = result.unwrap_err();
    assert!(matches!(error, BusError::InvalidEventId));
    assert!(error.to_string().contains("eventId must be a string"));
    assert_eq!(bus.get_stats().queued_events_to_raise, 0);
}

#[tokio::test]
async fn test_empty_event_id_is_reported_through_callback() {
    let broker = MockBroker::new();
    let (bus, _recorder) = start_bus(test_config(), &broker);

    let (callback, rx) = completion();
    bus.raise_events("", &json!({}), Some(RaiseArg::Callback(callback)), None)
        .unwrap();

    assert!(matches!(
        within(rx).await.unwrap(),
        Err(BusError::InvalidEventId)
    ));
}

#[tokio::test]
async fn test_callback_in_third_position_publishes() {
    let broker = MockBroker::new();
    let (bus, _recorder) = ready_bus(test_config(), &broker).await;

    let (callback, rx) = completion();
    bus.raise_events(
        "invoice.paid",
        &json!({"invoice": 9}),
        Some(RaiseArg::Callback(callback)),
        None,
    )
    .unwrap();

    within(rx).await.unwrap().unwrap();
    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "domain-events");
    assert_eq!(published[0].routing_key, "invoice.paid");
    assert_eq!(published[0].event(), json!({"invoice": 9}));
    assert_eq!(published[0].options, PublishOptions::default());
}

#[tokio::test]
async fn test_publish_options_reach_the_broker() {
    let broker = MockBroker::new();
    let (bus, _recorder) = ready_bus(test_config(), &broker).await;

    let options = PublishOptions {
        persistent: true,
        message_id: Some("m-1".to_string()),
        content_type: Some("application/json".to_string()),
        ..Default::default()
    };
    bus.publish("user.created", &json!({"user": "ada"}), Some(options.clone()))
        .await
        .unwrap();

    assert_eq!(broker.published()[0].options, options);
}

#[tokio::test]
async fn test_successful_publish_decrements_queued_counter() {
    let broker = MockBroker::new();
    let (bus, _recorder) = ready_bus(test_config(), &broker).await;

    within(bus.publish("order.placed", &json!({"id": 1}), None))
        .await
        .unwrap();

    assert_eq!(bus.get_stats().queued_events_to_raise, 0);
}

#[tokio::test]
async fn test_backlog_warning_once_per_crossing() {
    let broker = MockBroker::new();
    broker.hang_next_connect();
    let mut config = test_config();
    config.thresholds.max_raised_events = 2;
    let (bus, recorder) = start_bus(config, &broker);

    for id in ["a", "b", "c"] {
        bus.raise_event(id, &json!({}), |_| {});
    }

    assert_eq!(
        recorder.warnings(),
        vec!["2 events queued is greater than or equal to max of 2".to_string()]
    );
    assert_eq!(bus.get_stats().queued_events_to_raise, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backlog_warning_runs_on_raising_thread() {
    let broker = MockBroker::new();
    broker.hang_next_connect();
    let mut config = test_config();
    config.thresholds.max_raised_events = 1;
    let (bus, _recorder) = start_bus(config, &broker);

    let threads = Arc::new(Mutex::new(Vec::new()));
    let seen = threads.clone();
    bus.on(SignalKind::WarningRaised, move |_| {
        seen.lock().unwrap().push(std::thread::current().id());
    });

    bus.raise_event("a", &json!({}), |_| {});

    assert_eq!(*threads.lock().unwrap(), vec![std::thread::current().id()]);
}

#[tokio::test]
async fn test_default_drain_is_most_recent_first() {
    let broker = MockBroker::new();
    broker.fail_next_connects(1, "refused");
    let mut config = test_config();
    config.reconnect.sustained_delay_ms = 300;
    let (bus, recorder) = start_bus(config, &broker);

    assert!(recorder.wait_for(SignalKind::Reconnecting, 1, WAIT).await);
    for id in ["first", "second", "third"] {
        bus.raise_event(id, &json!({"id": id}), |_| {});
    }

    assert!(recorder.wait_for(SignalKind::Ready, 1, WAIT).await);
    assert!(wait_until(|| broker.published().len() == 3).await);
    assert_eq!(broker.published_ids(), vec!["third", "second", "first"]);
    assert_eq!(bus.get_stats().queued_events_to_raise, 0);
}

#[tokio::test]
async fn test_fifo_drain_preserves_submission_order() {
    let broker = MockBroker::new();
    broker.fail_next_connects(1, "refused");
    let mut config = test_config();
    config.drain_order = DrainOrder::Fifo;
    config.reconnect.sustained_delay_ms = 300;
    let (bus, recorder) = start_bus(config, &broker);

    assert!(recorder.wait_for(SignalKind::Reconnecting, 1, WAIT).await);
    for id in ["first", "second", "third"] {
        bus.raise_event(id, &json!({"id": id}), |_| {});
    }

    assert!(recorder.wait_for(SignalKind::Ready, 1, WAIT).await);
    assert!(wait_until(|| broker.published().len() == 3).await);
    assert_eq!(broker.published_ids(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_publish_failure_names_event_and_cause() {
    let broker = MockBroker::new();
    let (bus, _recorder) = ready_bus(test_config(), &broker).await;
    broker.fail_publishes_with("channel closed by broker");

    let result = within(bus.publish("order.placed", &json!({"id": 1}), None)).await;

    let error = result.unwrap_err();
    assert!(matches!(error, BusError::PublishFailed { .. }));
    let message = error.to_string();
    assert!(message.contains("order.placed"), "{message}");
    assert!(message.contains("channel closed by broker"), "{message}");
    assert_eq!(bus.get_stats().queued_events_to_raise, 1);
}

#[tokio::test]
async fn test_publish_failure_does_not_stop_later_publishes() {
    let broker = MockBroker::new();
    let (bus, _recorder) = ready_bus(test_config(), &broker).await;

    broker.fail_publishes_with("flow control");
    assert!(within(bus.publish("a", &json!({}), None)).await.is_err());

    broker.clear_publish_failure();
    within(bus.publish("b", &json!({}), None)).await.unwrap();
    assert_eq!(broker.published_ids(), vec!["b"]);
}

#[tokio::test]
async fn test_events_raised_from_completion_callbacks_are_published() {
    let broker = MockBroker::new();
    let (bus, _recorder) = ready_bus(test_config(), &broker).await;
    let bus = Arc::new(bus);

    let chained = bus.clone();
    bus.raise_event("parent", &json!({}), move |result| {
        if result.is_ok() {
            chained.raise_event("child", &json!({}), |_| {});
        }
    });

    assert!(wait_until(|| broker.published().len() == 2).await);
    assert_eq!(broker.published_ids(), vec!["parent", "child"]);
}
