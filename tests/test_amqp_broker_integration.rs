//! Round trip against a real RabbitMQ
//!
//! Requires a broker on localhost:5672 with the default guest account:
//!
//! ```bash
//! docker run --rm -p 5672:5672 rabbitmq:3
//! cargo test --test test_amqp_broker_integration -- --ignored
//! ```

use busterbunny::testing::SignalRecorder;
use busterbunny::{BusConfig, EventBus, PublishOptions, QueueConfig, SignalKind};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
#[ignore = "requires RabbitMQ on localhost:5672"]
async fn test_publish_and_consume_through_rabbitmq() {
    let queue = format!("busterbunny.it.{}", std::process::id());

    // Publishing to the default exchange routes by queue name
    let mut config = BusConfig::new("localhost", "");
    config.queues.push(QueueConfig {
        name: queue.clone(),
    });

    let recorder = SignalRecorder::new();
    let bus = EventBus::builder(config)
        .on_any(recorder.listener())
        .build()
        .unwrap();
    assert!(
        recorder
            .wait_for(SignalKind::Ready, 1, Duration::from_secs(10))
            .await,
        "no broker reachable: {:?}",
        recorder.kinds()
    );

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    bus.subscribe(move |event, message| {
        sink.lock().unwrap().push((*event).clone());
        message.acknowledge().unwrap();
    })
    .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let options = PublishOptions {
        persistent: true,
        content_type: Some("application/json".to_string()),
        ..Default::default()
    };
    bus.publish(&queue, &json!({"hello": "rabbit"}), Some(options))
        .await
        .unwrap();

    assert!(
        recorder
            .wait_for(SignalKind::EventAcknowledged, 1, Duration::from_secs(10))
            .await
    );
    assert_eq!(*received.lock().unwrap(), vec![json!({"hello": "rabbit"})]);
    assert_eq!(bus.get_stats().messages_acknowledged, 1);

    bus.disconnect().await;
}
