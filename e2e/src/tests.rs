//! Scenario runs against the in-process mock, plus the live-service variants.

use crate::harness::{
    harness_options, init_tracing, load_env_file, recv_within, HarnessConfig, HarnessError,
    TestHarness, ENV_PROJECT_ANON_TOKEN, ENV_PROJECT_URL, TEST_USER_EMAIL, TEST_USER_PASSWORD,
};
use crate::scenarios;
use futures::StreamExt;
use realtime_kit_client::{
    create_client, BroadcastMessage, ChannelConfig, ChannelState, ConfigError, ConnectionState,
    DisconnectReason, PresenceEvent, SendStatus, SubscribeStatus,
};
use realtime_kit_mock::MockService;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

fn spawn_mock() -> MockService {
    init_tracing();
    MockService::builder()
        .user(TEST_USER_EMAIL, TEST_USER_PASSWORD)
        .spawn()
        .unwrap()
}

fn harness_for(service: &MockService) -> TestHarness {
    TestHarness::new(HarnessConfig::new(&service.url(), service.anon_key()).unwrap())
}

// ============================================================================
// The four scenarios against the mock
// ============================================================================

#[tokio::test]
async fn self_broadcast_is_received() {
    let service = spawn_mock();
    harness_for(&service)
        .run(scenarios::test_broadcast_able_to_self_broadcast)
        .await
        .unwrap();
    service.stop().await;
}

#[tokio::test]
async fn endpoint_broadcast_is_received() {
    let service = spawn_mock();
    harness_for(&service)
        .run(scenarios::test_broadcast_able_to_use_endpoint)
        .await
        .unwrap();
    service.stop().await;
}

#[tokio::test]
async fn private_channel_refuses_anon_key() {
    let service = spawn_mock();
    harness_for(&service)
        .run(scenarios::test_broadcast_not_able_to_connect_if_missing_permissions)
        .await
        .unwrap();
    service.stop().await;
}

#[tokio::test]
async fn private_channel_accepts_signed_in_user() {
    let service = spawn_mock();
    harness_for(&service)
        .run(scenarios::test_broadcast_able_to_connect_if_has_permissions)
        .await
        .unwrap();
    service.stop().await;
}

// ============================================================================
// Harness configuration
// ============================================================================

#[test]
fn missing_or_empty_env_is_rejected() {
    assert_eq!(
        HarnessConfig::from_lookup(|_| None),
        Err(ConfigError::MissingVar(ENV_PROJECT_URL.into()))
    );
    assert_eq!(
        HarnessConfig::from_lookup(|name| match name {
            ENV_PROJECT_URL => Some("https://abc.example.co".into()),
            _ => Some("   ".into()),
        }),
        Err(ConfigError::MissingVar(ENV_PROJECT_ANON_TOKEN.into()))
    );
    assert!(matches!(
        HarnessConfig::new("not a url", "anon"),
        Err(ConfigError::InvalidUrl { .. })
    ));
}

#[test]
fn harness_options_match_hosted_literals() {
    let options = harness_options();
    assert_eq!(
        serde_json::to_value(&options.realtime).unwrap(),
        json!({ "heartbeatIntervalMs": 1000, "timeout": 1000 })
    );
    let channel = serde_json::to_value(&options.channel).unwrap();
    assert_eq!(channel["broadcast"]["self"], json!(true));
    assert_eq!(channel["private"], json!(false));
}

#[tokio::test]
async fn release_clears_session_and_socket() {
    let service = spawn_mock();
    let harness = harness_for(&service);
    let client = harness.acquire().unwrap();

    client
        .auth()
        .sign_in_with_password(&realtime_kit_client::PasswordCredentials::new(
            TEST_USER_EMAIL,
            TEST_USER_PASSWORD,
        ))
        .await
        .unwrap();
    let channel = client.channel("release-check");
    assert_eq!(channel.subscribe().await.unwrap(), SubscribeStatus::Subscribed);

    harness.release(client.clone()).await.unwrap();
    assert!(client.auth().session().is_none());
    assert!(!client.realtime().is_connected());
    assert!(client.realtime().channels().is_empty());
    service.stop().await;
}

#[tokio::test]
async fn wrong_password_is_invalid_credentials() {
    let service = spawn_mock();
    let client = harness_for(&service).acquire().unwrap();
    let err = client
        .auth()
        .sign_in_with_password(&realtime_kit_client::PasswordCredentials::new(
            TEST_USER_EMAIL,
            "wrong",
        ))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        realtime_kit_client::ClientError::Auth(realtime_kit_client::AuthError::InvalidCredentials(_))
    ));
    service.stop().await;
}

// ============================================================================
// Client behavior against the mock
// ============================================================================

#[tokio::test]
async fn broadcast_without_self_is_not_echoed() {
    let service = spawn_mock();
    let harness = harness_for(&service);
    let sender = harness.acquire().unwrap();
    let receiver = harness.acquire().unwrap();

    let quiet = sender.realtime().channel("no-echo", ChannelConfig::default());
    let (echo_tx, mut echo_rx) = mpsc::unbounded_channel();
    quiet.on_broadcast("*", move |m| {
        let _ = echo_tx.send(m.payload.clone());
    });
    let listener = receiver.channel("no-echo");
    let (tx, mut rx) = mpsc::unbounded_channel();
    listener.on_broadcast("ping", move |m| {
        let _ = tx.send(m.payload.clone());
    });

    assert_eq!(quiet.subscribe().await.unwrap(), SubscribeStatus::Subscribed);
    assert_eq!(listener.subscribe().await.unwrap(), SubscribeStatus::Subscribed);

    let status = quiet
        .send(BroadcastMessage::new("ping", json!({ "n": 1 })))
        .await
        .unwrap();
    assert_eq!(status, SendStatus::Ok);

    let payload = recv_within(&mut rx, Duration::from_secs(5), "ping").await.unwrap();
    assert_eq!(payload, json!({ "n": 1 }));
    assert!(tokio::time::timeout(Duration::from_millis(300), echo_rx.recv())
        .await
        .is_err());

    harness.release(sender).await.unwrap();
    harness.release(receiver).await.unwrap();
    service.stop().await;
}

#[tokio::test]
async fn acked_broadcast_resolves_ok() {
    let service = spawn_mock();
    let harness = harness_for(&service);
    let client = harness.acquire().unwrap();

    let channel = client.realtime().channel(
        "acked",
        ChannelConfig::default().with_self_broadcast(true).with_ack(true),
    );
    assert_eq!(channel.subscribe().await.unwrap(), SubscribeStatus::Subscribed);
    let status = channel
        .send(BroadcastMessage::new("evt", json!({})))
        .await
        .unwrap();
    assert_eq!(status, SendStatus::Ok);

    harness.release(client).await.unwrap();
    service.stop().await;
}

#[tokio::test]
async fn unjoined_private_send_with_anon_key_is_refused() {
    let service = spawn_mock();
    let harness = harness_for(&service);
    let client = harness.acquire().unwrap();

    let channel = client
        .realtime()
        .channel("vault", ChannelConfig::default().private(true));
    let status = channel
        .send(BroadcastMessage::new("evt", json!({ "x": 1 })))
        .await
        .unwrap();
    assert!(matches!(status, SendStatus::Error(_)), "got {:?}", status);

    harness.release(client).await.unwrap();
    service.stop().await;
}

#[tokio::test]
async fn anon_token_refresh_closes_private_channel() {
    let service = spawn_mock();
    let harness = harness_for(&service);
    let client = harness.acquire().unwrap();

    let response = client
        .auth()
        .sign_in_with_password(&realtime_kit_client::PasswordCredentials::new(
            TEST_USER_EMAIL,
            TEST_USER_PASSWORD,
        ))
        .await
        .unwrap();
    client
        .realtime()
        .set_auth(Some(response.session.access_token.clone()));

    let channel = client
        .realtime()
        .channel("vault", ChannelConfig::default().private(true));
    let (tx, mut rx) = mpsc::unbounded_channel();
    channel.on_system(move |payload| {
        let _ = tx.send(payload.clone());
    });
    assert_eq!(channel.subscribe().await.unwrap(), SubscribeStatus::Subscribed);

    client.realtime().set_auth(Some(service.anon_key().to_string()));

    let notice = recv_within(&mut rx, Duration::from_secs(5), "system notice")
        .await
        .unwrap();
    assert_eq!(notice["status"], "error");
    assert_eq!(notice["channel"], "vault");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while channel.state() != ChannelState::Closed {
        assert!(tokio::time::Instant::now() < deadline, "channel stayed {:?}", channel.state());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    harness.release(client).await.unwrap();
    service.stop().await;
}

#[tokio::test]
async fn presence_tracks_both_clients() {
    let service = spawn_mock();
    let harness = harness_for(&service);
    let alice = harness.acquire().unwrap();
    let bob = harness.acquire().unwrap();

    let a = alice
        .realtime()
        .channel("lobby", ChannelConfig::default().with_presence_key("alice"));
    let b = bob
        .realtime()
        .channel("lobby", ChannelConfig::default().with_presence_key("bob"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    a.on_presence("join", move |event| {
        if let PresenceEvent::Join { key, .. } = event {
            let _ = tx.send(key.clone());
        }
    });

    assert_eq!(a.subscribe().await.unwrap(), SubscribeStatus::Subscribed);
    assert_eq!(b.subscribe().await.unwrap(), SubscribeStatus::Subscribed);
    assert_eq!(a.track(json!({ "online": true })).await.unwrap(), SendStatus::Ok);
    assert_eq!(b.track(json!({ "online": true })).await.unwrap(), SendStatus::Ok);

    let mut joined = vec![
        recv_within(&mut rx, Duration::from_secs(5), "first join").await.unwrap(),
        recv_within(&mut rx, Duration::from_secs(5), "second join").await.unwrap(),
    ];
    joined.sort();
    assert_eq!(joined, vec!["alice".to_string(), "bob".to_string()]);
    let state = a.presence_state();
    assert!(state.contains_key("alice") && state.contains_key("bob"));

    assert_eq!(b.untrack().await.unwrap(), SendStatus::Ok);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while a.presence_state().contains_key("bob") {
        assert!(tokio::time::Instant::now() < deadline, "bob never left");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    harness.release(alice).await.unwrap();
    harness.release(bob).await.unwrap();
    service.stop().await;
}

#[tokio::test]
async fn heartbeats_keep_the_socket_open() {
    let service = spawn_mock();
    let harness = harness_for(&service);
    let client = harness.acquire().unwrap();

    client.realtime().connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(client.realtime().connection_state(), ConnectionState::Connected);

    harness.release(client).await.unwrap();
    service.stop().await;
}

/// A WebSocket server that accepts and then never answers.
async fn silent_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                    while let Some(Ok(_)) = ws.next().await {}
                }
            });
        }
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn unanswered_join_times_out_and_heartbeat_drops_socket() {
    init_tracing();
    let url = silent_server().await;
    let client = create_client(&url, "anon", harness_options()).unwrap();

    let channel = client.channel("nobody-home");
    assert_eq!(channel.subscribe().await.unwrap(), SubscribeStatus::TimedOut);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if client.realtime().connection_state()
            == ConnectionState::Lost(DisconnectReason::HeartbeatTimeout)
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "heartbeat timeout not detected");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ============================================================================
// Live service (needs PROJECT_URL / PROJECT_ANON_TOKEN, e.g. from .env)
// ============================================================================

fn live_harness() -> Result<TestHarness, HarnessError> {
    init_tracing();
    load_env_file();
    Ok(TestHarness::new(HarnessConfig::from_env()?))
}

#[tokio::test]
#[ignore = "needs a live project"]
async fn live_self_broadcast() {
    live_harness()
        .unwrap()
        .run(scenarios::test_broadcast_able_to_self_broadcast)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "needs a live project"]
async fn live_endpoint_broadcast() {
    live_harness()
        .unwrap()
        .run(scenarios::test_broadcast_able_to_use_endpoint)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "needs a live project"]
async fn live_private_channel_without_permissions() {
    live_harness()
        .unwrap()
        .run(scenarios::test_broadcast_not_able_to_connect_if_missing_permissions)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "needs a live project"]
async fn live_private_channel_with_permissions() {
    live_harness()
        .unwrap()
        .run(scenarios::test_broadcast_able_to_connect_if_has_permissions)
        .await
        .unwrap();
}
