//! The end-to-end scenarios from the system contract.

use std::time::Duration;

use palisade_core::ContainerState;
use palisade_events::{BridgeEvent, ChatEvent, EventFilter};
use palisade_gateway::rpc::{error_codes, CallContext};
use palisade_integration_tests::bridge;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn socket_ctx() -> CallContext {
    CallContext::socket(0, None, CancellationToken::new())
}

/// Scenario A: store a key, start a container, watch the bundle appear
/// briefly and disappear after the deletion delay.
#[tokio::test]
async fn store_and_start() {
    let b = bridge(|_| {});
    let ctx = socket_ctx();

    b.dispatcher
        .dispatch(
            &ctx,
            "store_key",
            json!({"id": "fresh", "provider": "openai", "token": "sk-TEST"}),
        )
        .await
        .unwrap();

    let started = b
        .dispatcher
        .dispatch(&ctx, "start", json!({"key_id": "fresh"}))
        .await
        .unwrap();
    let container_id = started["container_id"].as_str().unwrap();
    assert!(!container_id.is_empty());

    let secrets_dir = b.dir.path().join("secrets");
    let bundle = secrets_dir.join(format!("{container_id}.json"));
    assert!(bundle.exists(), "bundle present during the delay window");

    // Exactly one bundle file exists.
    let count = std::fs::read_dir(&secrets_dir).unwrap().count();
    assert_eq!(count, 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!bundle.exists(), "bundle gone after the deletion delay");

    // The container is still running; only the secret file is gone.
    let records = b.state.manager.list();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, ContainerState::Running);
}

/// Scenario B: two concurrent starts on the same credential — one wins,
/// the loser fails retryably, and no moment sees two live containers for
/// the lock window.
#[tokio::test]
async fn duplicate_start_serialization() {
    let b = bridge(|_| {});

    let manager_a = b.state.manager.clone();
    let manager_b = b.state.manager.clone();
    let (a, bb) = tokio::join!(
        manager_a.start("k1".into(), palisade_runtime::StartOptions::default()),
        manager_b.start("k1".into(), palisade_runtime::StartOptions::default()),
    );

    let outcomes = [a, bb];
    let successes = outcomes.iter().filter(|r| r.is_ok()).count();
    let contended = outcomes
        .iter()
        .filter(|r| {
            matches!(
                r,
                Err(palisade_runtime::RuntimeError::StartContended { .. })
            )
        })
        .count();

    // Either both completed sequentially (the fake engine is fast) or the
    // loser failed with the retryable contention error; what may never
    // happen is a non-retryable failure or zero successes.
    assert!(successes >= 1);
    assert_eq!(successes + contended, 2);
    for outcome in &outcomes {
        if let Err(e) = outcome {
            assert!(e.is_retryable(), "the losing start must be retryable");
        }
    }
}

/// Scenario C: zero-trust rejection — no dispatch, an `access_denied`
/// audit entry. (The formatted room notice is exercised in the gateway's
/// inbound-router tests, where a chat client exists to receive it.)
#[tokio::test]
async fn zero_trust_rejection() {
    let b = bridge(|config| {
        config.zero_trust.trusted_senders = vec!["@alice:ex".to_owned()];
        config.zero_trust.reject_untrusted = true;
    });

    let ctx = CallContext::chat("@mallory:ex", "!ops:ex", CancellationToken::new());
    let err = b
        .dispatcher
        .dispatch(&ctx, "status", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.code, error_codes::ACCESS_DENIED);

    let denials = b.state.audit.recent(Some("access_denied"), 10);
    assert_eq!(denials.len(), 1);
    assert!(b.state.audit.recent(Some("access_granted"), 10).is_empty());
}

/// Scenario D: attach_config path traversal is rejected with `-32602`, a
/// message naming the traversal, and nothing written under configs/.
#[tokio::test]
async fn attach_config_path_traversal() {
    let b = bridge(|_| {});
    let err = b
        .dispatcher
        .dispatch(
            &socket_ctx(),
            "attach_config",
            json!({"name": "../../etc/passwd", "content": "x", "encoding": "raw"}),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code, -32602);
    assert!(err.message.contains("traversal"));

    let configs_dir = b.dir.path().join("configs");
    let written = std::fs::read_dir(configs_dir).map(Iterator::count).unwrap_or(0);
    assert_eq!(written, 0);
}

/// Scenario E: budget hard stop — BGT-002, no container created.
#[tokio::test]
async fn budget_hard_stop() {
    let b = bridge(|config| {
        config.budget.daily_limit_usd = 0.01;
        config.budget.hard_stop = true;
    });
    b.state
        .budget
        .record(&palisade_budget::BudgetScope::Credential("k1".into()), 0.01);

    let err = b
        .dispatcher
        .dispatch(&socket_ctx(), "start", json!({"key_id": "k1"}))
        .await
        .unwrap_err();

    assert_eq!(err.code, error_codes::BUDGET_ERROR);
    assert_eq!(err.report.unwrap().code, "BGT-002");
    assert_eq!(b.engine.container_count(), 0);
    assert!(b.state.manager.list().is_empty());
}

/// Scenario F: two filtered subscribers each see exactly their slice,
/// with strictly increasing sequence numbers.
#[tokio::test]
async fn event_filter_fanout() {
    let b = bridge(|_| {});

    let mut by_room = b.state.bus.subscribe(EventFilter {
        room_id: Some("!r1".to_owned()),
        ..EventFilter::default()
    });
    let mut by_type = b.state.bus.subscribe(EventFilter {
        event_types: Some(vec!["m.room.member".to_owned()]),
        ..EventFilter::default()
    });

    let chat = |room: &str, event_type: &str| {
        BridgeEvent::Chat(ChatEvent {
            event_id: "$e".to_owned(),
            room_id: room.to_owned(),
            sender: "@a:ex".to_owned(),
            event_type: event_type.to_owned(),
            content: json!({"body": "x"}),
            origin_server_ts: 0,
        })
    };

    b.state.bus.publish(chat("!r1", "m.room.message"));
    b.state.bus.publish(chat("!r2", "m.room.member"));

    let a = by_room.recv().await.unwrap();
    assert_eq!(a.event.room_id(), Some("!r1"));
    assert_eq!(a.event.event_type(), "m.room.message");
    assert!(by_room.try_recv().is_none(), "A sees the first event only");

    let bb = by_type.recv().await.unwrap();
    assert_eq!(bb.event.event_type(), "m.room.member");
    assert!(by_type.try_recv().is_none(), "B sees the second event only");

    assert!(bb.sequence > a.sequence, "sequence strictly increasing");
}

/// Invariant 5: published bodies matching scrub patterns never reach a
/// subscriber with the original substring intact.
#[tokio::test]
async fn pii_scrubbed_before_delivery() {
    let b = bridge(|_| {});
    let mut receiver = b.state.bus.subscribe(EventFilter::all());

    b.state.bus.publish(BridgeEvent::Chat(ChatEvent {
        event_id: "$e".to_owned(),
        room_id: "!r:ex".to_owned(),
        sender: "@a:ex".to_owned(),
        event_type: "m.room.message".to_owned(),
        content: json!({"body": "here is sk-abcdef1234567890abcdef and alice@example.com"}),
        origin_server_ts: 0,
    }));

    let delivered = receiver.recv().await.unwrap();
    let rendered = serde_json::to_string(&delivered.event).unwrap();
    assert!(!rendered.contains("sk-abcdef1234567890abcdef"));
    assert!(!rendered.contains("alice@example.com"));
}

/// Invariant 9: after shutdown, no secret files remain.
#[tokio::test]
async fn shutdown_leaves_no_secrets() {
    let b = bridge(|_| {});
    let ctx = socket_ctx();

    // Two full start/stop cycles, then one container left running.
    for _ in 0..2 {
        let started = b
            .dispatcher
            .dispatch(&ctx, "start", json!({"key_id": "k1"}))
            .await
            .unwrap();
        b.dispatcher
            .dispatch(
                &ctx,
                "stop",
                json!({"container_id": started["container_id"], "reason": "cycle"}),
            )
            .await
            .unwrap();
    }
    b.dispatcher
        .dispatch(&ctx, "start", json!({"key_id": "k1"}))
        .await
        .unwrap();

    b.state.manager.shutdown_all().await;

    let leftovers = std::fs::read_dir(b.dir.path().join("secrets")).unwrap().count();
    assert_eq!(leftovers, 0);
    assert_eq!(b.state.manager.live_count(), 0);
}

/// Invariant 7: recorded spend sums into status; roll-over and deny
/// semantics are covered in the budget crate's own tests.
#[tokio::test]
async fn budget_sums_match_status() {
    let b = bridge(|_| {});
    let scope = palisade_budget::BudgetScope::Credential("k1".into());
    b.state.budget.record(&scope, 0.25);
    b.state.budget.record(&scope, 0.75);

    let status = b
        .dispatcher
        .dispatch(&socket_ctx(), "budget_status", json!({"key_id": "k1"}))
        .await
        .unwrap();
    assert!((status["day"]["used"].as_f64().unwrap() - 1.0).abs() < 1e-9);
    assert!((status["month"]["used"].as_f64().unwrap() - 1.0).abs() < 1e-9);
}

/// Credential round-trip and delete semantics over the RPC surface
/// (invariant 2).
#[tokio::test]
async fn credential_roundtrip_and_delete() {
    let b = bridge(|_| {});
    let ctx = socket_ctx();

    b.dispatcher
        .dispatch(
            &ctx,
            "store_key",
            json!({"id": "roundtrip", "provider": "xai", "token": "xai-token-value"}),
        )
        .await
        .unwrap();

    // Round-trip through the keystore proper (plaintext never crosses RPC).
    let decrypted = b.state.keystore.get(&"roundtrip".into()).unwrap();
    assert_eq!(decrypted.token.as_str(), "xai-token-value");
    drop(decrypted);

    let deleted = b
        .dispatcher
        .dispatch(&ctx, "delete_key", json!({"id": "roundtrip"}))
        .await
        .unwrap();
    assert_eq!(deleted["deleted"], true);

    let err = b
        .dispatcher
        .dispatch(&ctx, "get_key", json!({"id": "roundtrip"}))
        .await
        .unwrap_err();
    assert_eq!(err.code, error_codes::NOT_FOUND);
}
