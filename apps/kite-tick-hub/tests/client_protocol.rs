//! Client Protocol Integration Tests
//!
//! Starts the real client server on an ephemeral port and talks to
//! `/ws/ticks` with a `tokio-tungstenite` client.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use kite_tick_hub::infrastructure::server::{AppState, router};
use kite_tick_hub::{
    AccessCredential, ClientSettings, FanoutBroadcaster, FeedConnector, FeedSettings,
    InstrumentDirectory, InstrumentToken, StaticCredentialProvider, Tick,
};

const NIFTY: InstrumentToken = InstrumentToken::new(256_265);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    hub: Arc<FanoutBroadcaster>,
    feed: Arc<FeedConnector>,
}

async fn start_server(client: ClientSettings) -> TestServer {
    let feed_settings = FeedSettings {
        // Nothing listens here; the feed just keeps retrying.
        url: "ws://127.0.0.1:9".to_string(),
        reconnect_delay_initial: Duration::from_secs(5),
        ..FeedSettings::default()
    };
    let (tick_tx, _tick_rx) = mpsc::channel(1);
    let feed = Arc::new(FeedConnector::new(
        feed_settings,
        Arc::new(StaticCredentialProvider::new(
            AccessCredential::new("key", "token").unwrap(),
        )),
        tick_tx,
        CancellationToken::new(),
    ));
    let hub = Arc::new(FanoutBroadcaster::new(
        feed.clone(),
        &client,
        InstrumentDirectory::from_pairs([(NIFTY, "NIFTY 50")]),
    ));

    let state = Arc::new(AppState::new(hub.clone(), feed.clone(), client));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    TestServer { addr, hub, feed }
}

async fn connect(server: &TestServer) -> Client {
    let url = format!("ws://{}/ws/ticks", server.addr);
    let (client, _response) = connect_async(url).await.expect("Failed to connect");
    client
}

async fn recv_json(client: &mut Client) -> Value {
    loop {
        let message = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn send_json(client: &mut Client, value: &Value) {
    client.send(Message::text(value.to_string())).await.unwrap();
}

async fn wait_until(check: impl Fn() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn subscribe_then_receive_ticks() {
    let server = start_server(ClientSettings::default()).await;
    let mut client = connect(&server).await;

    assert_eq!(recv_json(&mut client).await, json!({"type": "connected"}));

    send_json(&mut client, &json!({"action": "subscribe", "tokens": [256_265]})).await;
    assert_eq!(
        recv_json(&mut client).await,
        json!({"type": "subscribed", "tokens": [256_265]})
    );
    assert_eq!(server.feed.desired_tokens(), vec![NIFTY]);

    let mut tick = Tick::ltp(NIFTY, Decimal::new(1_950_025, 2));
    tick.volume = 10;
    server.hub.ingest(vec![tick]);

    let message = recv_json(&mut client).await;
    assert_eq!(message["type"], "ticks");
    let payload = &message["data"][0];
    assert_eq!(payload["instrument_token"], 256_265);
    assert_eq!(payload["symbol"], "NIFTY 50");
    assert_eq!(payload["last_price"], json!(19500.25));
    assert_eq!(payload["volume"], 10);
    assert!(payload["timestamp"].is_string());

    send_json(&mut client, &json!({"action": "unsubscribe", "tokens": [256_265]})).await;
    assert_eq!(
        recv_json(&mut client).await,
        json!({"type": "unsubscribed", "tokens": [256_265]})
    );
    assert!(server.feed.desired_tokens().is_empty());
}

#[tokio::test]
async fn invalid_commands_get_error_and_change_nothing() {
    let server = start_server(ClientSettings::default()).await;
    let mut client = connect(&server).await;
    recv_json(&mut client).await;

    send_json(&mut client, &json!({"action": "subscribe", "tokens": [256_265, -5]})).await;
    let reply = recv_json(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["message"].as_str().unwrap().contains("-5"));
    assert!(server.hub.required_tokens().is_empty());

    client.send(Message::text("not json")).await.unwrap();
    assert_eq!(recv_json(&mut client).await["type"], "error");

    send_json(&mut client, &json!({"action": "subscribe", "tokens": ["abc"]})).await;
    assert_eq!(recv_json(&mut client).await["type"], "error");

    // The session is still usable.
    send_json(&mut client, &json!({"action": "subscribe", "tokens": [256_265]})).await;
    assert_eq!(recv_json(&mut client).await["type"], "subscribed");
}

#[tokio::test]
async fn disconnect_releases_interest() {
    let server = start_server(ClientSettings::default()).await;
    let mut client = connect(&server).await;
    recv_json(&mut client).await;

    send_json(&mut client, &json!({"action": "subscribe", "tokens": [256_265]})).await;
    recv_json(&mut client).await;
    assert_eq!(server.hub.active_clients(), 1);

    client.close(None).await.unwrap();
    drop(client);

    wait_until(|| server.hub.active_clients() == 0).await;
    assert!(server.hub.required_tokens().is_empty());
    assert!(server.feed.desired_tokens().is_empty());
}

#[tokio::test]
async fn idle_client_is_pinged_then_dropped() {
    let server = start_server(ClientSettings {
        idle_timeout: Duration::from_millis(200),
        ..ClientSettings::default()
    })
    .await;
    let mut client = connect(&server).await;
    recv_json(&mut client).await;

    assert_eq!(recv_json(&mut client).await, json!({"type": "ping"}));

    let ended = timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "idle client was not disconnected");
    wait_until(|| server.hub.active_clients() == 0).await;
}

#[tokio::test]
async fn pong_keeps_client_alive() {
    let server = start_server(ClientSettings {
        idle_timeout: Duration::from_millis(200),
        ..ClientSettings::default()
    })
    .await;
    let mut client = connect(&server).await;
    recv_json(&mut client).await;

    for _ in 0..3 {
        assert_eq!(recv_json(&mut client).await, json!({"type": "ping"}));
        send_json(&mut client, &json!({"action": "pong"})).await;
    }
    assert_eq!(server.hub.active_clients(), 1);
}
