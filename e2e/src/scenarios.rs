//! The four broadcast smoke tests. Each takes an owned client from the
//! harness and fails with a [`HarnessError`].

use crate::harness::{
    ensure, random_event, random_topic, recv_within, HarnessError, RECEIVE_TIMEOUT,
    TEST_USER_EMAIL, TEST_USER_PASSWORD,
};
use realtime_kit_client::protocol::PERMISSION_DENIED_REASON;
use realtime_kit_client::{
    BroadcastMessage, Client, PasswordCredentials, RealtimeChannel, SendStatus, SubscribeStatus,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn expect_subscribed(topic: &str, status: SubscribeStatus) -> Result<(), HarnessError> {
    ensure(
        status == SubscribeStatus::Subscribed,
        format!("subscribe to {} ended in {:?}", topic, status),
    )
}

/// Forward every payload of `event` on `channel` into a receiver.
fn collect_payloads(channel: &RealtimeChannel, event: &str) -> mpsc::UnboundedReceiver<Value> {
    let (tx, rx) = mpsc::unbounded_channel();
    channel.on_broadcast(event, move |message| {
        let _ = tx.send(message.payload.clone());
    });
    rx
}

fn random_payload() -> Value {
    json!({ "message": uuid::Uuid::new_v4().to_string() })
}

/// A channel with `broadcast.self` receives its own broadcast.
pub async fn test_broadcast_able_to_self_broadcast(client: Client) -> Result<(), HarnessError> {
    tracing::info!("{:?}", client.realtime());

    let topic = random_topic();
    let event = random_event();
    let expected = random_payload();

    let channel = client.channel(&topic);
    let mut received = collect_payloads(&channel, &event);
    expect_subscribed(&topic, channel.subscribe().await?)?;

    let status = channel
        .send(BroadcastMessage::new(event.clone(), expected.clone()))
        .await?;
    ensure(status == SendStatus::Ok, format!("send returned {:?}", status))?;

    let payload = recv_within(&mut received, RECEIVE_TIMEOUT, "self broadcast").await?;
    ensure(
        payload == expected,
        format!("expected {}, received {}", expected, payload),
    )?;

    client.realtime().remove_channel(&channel).await?;
    Ok(())
}

/// A payload posted to the REST broadcast endpoint reaches a subscriber.
pub async fn test_broadcast_able_to_use_endpoint(client: Client) -> Result<(), HarnessError> {
    let topic = random_topic();
    let event = random_event();
    let expected = random_payload();

    let listener = client.channel(&topic);
    let mut received = collect_payloads(&listener, &event);
    expect_subscribed(&topic, listener.subscribe().await?)?;

    // Never subscribed, so `send` goes over HTTP.
    let sender = client.channel(&topic);
    let status = sender
        .send(BroadcastMessage::new(event.clone(), expected.clone()))
        .await?;
    ensure(status == SendStatus::Ok, format!("endpoint send returned {:?}", status))?;

    let payload = recv_within(&mut received, RECEIVE_TIMEOUT, "endpoint broadcast").await?;
    ensure(
        payload == expected,
        format!("expected {}, received {}", expected, payload),
    )?;

    client.realtime().remove_channel(&sender).await?;
    client.realtime().remove_channel(&listener).await?;
    Ok(())
}

/// The anon key alone cannot join a private channel.
pub async fn test_broadcast_not_able_to_connect_if_missing_permissions(
    client: Client,
) -> Result<(), HarnessError> {
    let topic = random_topic();
    let config = client.options().channel.clone().private(true);
    let channel = client.realtime().channel(&topic, config);

    let status = channel.subscribe().await?;
    ensure(
        status == SubscribeStatus::ChannelError(PERMISSION_DENIED_REASON.to_string()),
        format!("private subscribe with anon key ended in {:?}", status),
    )?;

    client.realtime().remove_channel(&channel).await?;
    Ok(())
}

/// A signed-in user can join a private channel.
pub async fn test_broadcast_able_to_connect_if_has_permissions(
    client: Client,
) -> Result<(), HarnessError> {
    let response = client
        .auth()
        .sign_in_with_password(&PasswordCredentials::new(TEST_USER_EMAIL, TEST_USER_PASSWORD))
        .await?;
    tracing::info!("{:?}", response);
    ensure(
        response.user.email.as_deref() == Some(TEST_USER_EMAIL),
        format!("signed in as {:?}", response.user.email),
    )?;

    client
        .realtime()
        .set_auth(Some(response.session.access_token.clone()));

    let topic = random_topic();
    let config = client.options().channel.clone().private(true);
    let channel = client.realtime().channel(&topic, config);
    expect_subscribed(&topic, channel.subscribe().await?)?;
    client.realtime().remove_channel(&channel).await?;

    client.auth().sign_out().await?;
    ensure(
        client.auth().session().is_none(),
        "session still present after sign-out",
    )?;
    Ok(())
}
