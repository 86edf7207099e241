// tests/dedup_pipeline.rs

use serde_json::json;
use tokio::sync::mpsc;

use bitcoinde_feed::dispatch::Dispatcher;
use bitcoinde_feed::protocol::Delivery;
use bitcoinde_feed::sink::ChannelSink;

#[tokio::test]
async fn single_source_add_order_is_normalized_and_published() {
    let mut dispatcher = Dispatcher::new(60.0);
    let (tx, mut rx) = mpsc::channel(8);
    dispatcher.add_sink(Box::new(ChannelSink::new(tx)));

    let delivery = Delivery {
        event_name: "add_order".to_string(),
        args: json!({
            "id": "501",
            "price": "3.25",
            "is_shorting": "1",
            "is_shorting_allowed": "1",
            "payment_option": "2",
            "min_trust_level": "gold"
        }),
        receive_time: 500.0,
    };
    dispatcher.dispatch(delivery, 1).await;

    let event = rx.recv().await.expect("event published");
    assert_eq!(event.payload["price"], json!(325));
    assert_eq!(event.payload["short"], json!(3));
    assert_eq!(event.payload["min_trust_level"], json!(3));
}

#[tokio::test]
async fn two_mirrors_reporting_same_order_dedupe_to_one_publish() {
    let mut dispatcher = Dispatcher::new(60.0);
    let (tx, mut rx) = mpsc::channel(8);
    dispatcher.add_sink(Box::new(ChannelSink::new(tx)));

    let data = json!({"id": "77", "price": "1.00"});
    dispatcher
        .dispatch(Delivery { event_name: "add_order".to_string(), args: data.clone(), receive_time: 1000.0 }, 1)
        .await;
    dispatcher
        .dispatch(Delivery { event_name: "add_order".to_string(), args: data, receive_time: 1000.05 }, 2)
        .await;

    let published = rx.recv().await.expect("exactly one event published");
    assert_eq!(published.observations.len(), 2);

    // No second publish should follow.
    let second = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
    assert!(second.is_err(), "a duplicate sighting must not trigger a second publish");
}

#[tokio::test]
async fn po_fingerprint_matches_known_order_dependent_value() {
    let mut dispatcher = Dispatcher::new(60.0);
    let (tx, mut rx) = mpsc::channel(8);
    dispatcher.add_sink(Box::new(ChannelSink::new(tx)));

    let data = json!({
        "10": {"is_trade_by_fidor_reservation_allowed": "1"},
        "20": {"is_trade_by_fidor_reservation_allowed": "0"}
    });
    dispatcher
        .dispatch(Delivery { event_name: "refresh_express_option".to_string(), args: data, receive_time: 0.0 }, 1)
        .await;

    let event = rx.recv().await.expect("po event published");
    assert_eq!(event.event_id, bitcoinde_feed::event::EventId::Int(-30));
}

#[tokio::test]
async fn remove_order_evicts_after_retention_window() {
    let mut dispatcher = Dispatcher::new(60.0);
    let (tx, mut rx) = mpsc::channel(8);
    dispatcher.add_sink(Box::new(ChannelSink::new(tx)));

    dispatcher
        .dispatch(Delivery { event_name: "remove_order".to_string(), args: json!({"id": "9"}), receive_time: 1_000.0 }, 1)
        .await;
    rx.recv().await.expect("first sighting publishes");

    // A sweep still inside the retention window must not evict; a second
    // sighting of the same id right after it is still a dedup, not a
    // fresh publish.
    dispatcher.sweep_all(1_000.0 + 59.0);
    dispatcher
        .dispatch(Delivery { event_name: "remove_order".to_string(), args: json!({"id": "9"}), receive_time: 1_000.0 + 59.5 }, 2)
        .await;
    let still_deduped = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
    assert!(still_deduped.is_err(), "entry must survive a sweep inside the retention window");

    // Once the retention window has fully elapsed the entry is gone, so a
    // later sighting of the same id publishes again.
    dispatcher.sweep_all(1_000.0 + 61.0);
    dispatcher
        .dispatch(Delivery { event_name: "remove_order".to_string(), args: json!({"id": "9"}), receive_time: 1_000.0 + 62.0 }, 1)
        .await;
    rx.recv().await.expect("entry re-publishes once its fingerprint has been evicted");
}

#[tokio::test]
async fn unrecognized_event_name_does_not_reach_any_sink() {
    let mut dispatcher = Dispatcher::new(60.0);
    let (tx, mut rx) = mpsc::channel(8);
    dispatcher.add_sink(Box::new(ChannelSink::new(tx)));

    dispatcher
        .dispatch(Delivery { event_name: "unknown_stream".to_string(), args: json!({}), receive_time: 0.0 }, 1)
        .await;

    let result = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
    assert!(result.is_err());
}
