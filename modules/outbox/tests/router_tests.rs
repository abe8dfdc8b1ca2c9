use event_bus::{EventBus, InMemoryBus};
use outbox_relay::error::OutboxError;
use outbox_relay::router::Router;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Give the router a moment to establish its subscriptions before publishing.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_successful_handler_acks_no_redelivery() {
    let bus = Arc::new(InMemoryBus::new());
    let mut router = Router::new(bus.clone(), "router-test", Duration::from_millis(100));

    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_handler = seen.clone();
    router.register_handler("orders.events", move |payload| {
        let seen = seen_handler.clone();
        async move {
            seen.lock().unwrap().push(payload);
            Ok(())
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(router.run(shutdown_rx));
    settle().await;

    bus.publish("orders.events", None, b"one".to_vec())
        .await
        .unwrap();

    // Wait well past the ack deadline: an acked message must not come back.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);

    shutdown_tx.send(true).unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failing_handler_gets_redelivery() {
    let bus = Arc::new(InMemoryBus::new());
    let mut router = Router::new(bus.clone(), "router-test", Duration::from_secs(5));

    let invocations = Arc::new(AtomicUsize::new(0));
    let successes = Arc::new(AtomicUsize::new(0));
    let inv = invocations.clone();
    let succ = successes.clone();
    router.register_handler("orders.events", move |_payload| {
        let inv = inv.clone();
        let succ = succ.clone();
        async move {
            // Fail the first delivery, succeed afterwards.
            if inv.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("transient handler failure");
            }
            succ.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(router.run(shutdown_rx));
    settle().await;

    bus.publish("orders.events", None, b"retry".to_vec())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        invocations.load(Ordering::SeqCst) >= 2,
        "nacked message should have been redelivered"
    );
    assert_eq!(successes.load(Ordering::SeqCst), 1);

    shutdown_tx.send(true).unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_idempotent_handler_tolerates_duplicates() {
    let bus = Arc::new(InMemoryBus::new());
    let mut router = Router::new(bus.clone(), "router-test", Duration::from_secs(5));

    // Handler dedups on event_id, the way real consumers do against
    // processed_events; the side effect happens once even though the same
    // payload arrives twice.
    let invocations = Arc::new(AtomicUsize::new(0));
    let side_effects = Arc::new(AtomicUsize::new(0));
    let processed: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    let inv = invocations.clone();
    let effects = side_effects.clone();
    let dedup = processed.clone();
    router.register_handler("orders.events", move |payload| {
        let inv = inv.clone();
        let effects = effects.clone();
        let dedup = dedup.clone();
        async move {
            inv.fetch_add(1, Ordering::SeqCst);
            let envelope: serde_json::Value = serde_json::from_slice(&payload)?;
            let event_id = envelope
                .get("event_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("missing event_id"))?
                .to_string();
            if dedup.lock().unwrap().insert(event_id) {
                effects.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(router.run(shutdown_rx));
    settle().await;

    let payload =
        serde_json::to_vec(&serde_json::json!({"event_id": "dup-1", "n": 1})).unwrap();
    bus.publish("orders.events", None, payload.clone())
        .await
        .unwrap();
    bus.publish("orders.events", None, payload).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(
        side_effects.load(Ordering::SeqCst),
        1,
        "duplicate delivery must not repeat the side effect"
    );

    shutdown_tx.send(true).unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_malformed_message_acked_away_not_redelivered() {
    let bus = Arc::new(InMemoryBus::new());
    // Short ack deadline so an unacked message would come back quickly.
    let mut router = Router::new(bus.clone(), "router-test", Duration::from_millis(100));

    // The listener's policy for poison messages: a payload that fails
    // envelope validation is logged and acked away with Ok, because nacking
    // it would redeliver it forever.
    let invocations = Arc::new(AtomicUsize::new(0));
    let inv = invocations.clone();
    router.register_handler("orders.events", move |payload| {
        let inv = inv.clone();
        async move {
            inv.fetch_add(1, Ordering::SeqCst);
            if event_bus::parse_envelope(&payload).is_err() {
                return Ok(());
            }
            Ok(())
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(router.run(shutdown_rx));
    settle().await;

    bus.publish("orders.events", None, b"not an envelope".to_vec())
        .await
        .unwrap();

    // Several ack deadlines later the message must have been seen exactly
    // once: acked away, never looping.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    shutdown_tx.send(true).unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_router_without_handlers_is_config_error() {
    let bus = Arc::new(InMemoryBus::new());
    let router = Router::new(bus, "router-test", Duration::from_secs(5));

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = router.run(shutdown_rx).await;
    assert!(matches!(result, Err(OutboxError::Config(_))));
}
