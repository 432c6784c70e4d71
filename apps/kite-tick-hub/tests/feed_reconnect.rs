//! Feed Connector Integration Tests
//!
//! Runs the connector against a local mock ticker built on
//! `tokio-tungstenite`, covering subscription replay after a reconnect,
//! live delta reconciliation, and terminal authentication failure.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{WebSocketStream, accept_async, accept_hdr_async};
use tokio_util::sync::CancellationToken;

use kite_tick_hub::{
    AccessCredential, ConnectionState, FeedConnector, FeedControl, FeedSettings, FeedStatus,
    InstrumentToken, StaticCredentialProvider, TickBatch,
};

const NIFTY: InstrumentToken = InstrumentToken::new(256_265);
const RELIANCE: InstrumentToken = InstrumentToken::new(738_561);
const INFY: InstrumentToken = InstrumentToken::new(408_065);

type Upstream = WebSocketStream<TcpStream>;

fn connector(url: String, max_auth_failures: u32) -> (Arc<FeedConnector>, mpsc::Receiver<TickBatch>) {
    let settings = FeedSettings {
        url,
        reconnect_delay_initial: Duration::from_millis(50),
        reconnect_delay_max: Duration::from_millis(200),
        max_auth_failures,
        ..FeedSettings::default()
    };
    let credential = AccessCredential::new("key1", "tok1").unwrap();
    let (tx, rx) = mpsc::channel(16);
    let feed = Arc::new(FeedConnector::new(
        settings,
        Arc::new(StaticCredentialProvider::new(credential)),
        tx,
        CancellationToken::new(),
    ));
    (feed, rx)
}

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> Upstream {
    let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("connector did not connect")
        .unwrap();
    accept_async(stream).await.unwrap()
}

/// Next JSON control message sent by the connector.
async fn next_request(upstream: &mut Upstream) -> Value {
    loop {
        let message = timeout(Duration::from_secs(5), upstream.next())
            .await
            .expect("no request from connector")
            .expect("connector closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

fn ltp_frame(token: InstrumentToken, paise: i32) -> Vec<u8> {
    let mut frame = BytesMut::new();
    frame.put_u16(1);
    frame.put_u16(8);
    frame.put_u32(token.get());
    frame.put_i32(paise);
    frame.to_vec()
}

async fn wait_for(feed: &FeedConnector, check: impl Fn(&FeedStatus) -> bool) -> FeedStatus {
    timeout(Duration::from_secs(5), async {
        loop {
            let status = feed.status();
            if check(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("status condition not reached")
}

#[tokio::test]
async fn handshake_targets_root_path() {
    let (listener, url) = listen().await;
    let (feed, _ticks) = connector(url, 3);
    feed.start();

    let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("connector did not connect")
        .unwrap();
    let mut lines = BufReader::new(stream).lines();
    let request_line = timeout(Duration::from_secs(5), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(request_line, "GET /?api_key=key1&access_token=tok1 HTTP/1.1");

    feed.shutdown().await;
}

#[tokio::test]
async fn reconnect_resubscribes_full_set() {
    let (listener, url) = listen().await;
    let (feed, mut ticks) = connector(url, 3);

    feed.subscribe(&[RELIANCE, NIFTY]);
    assert!(feed.start());

    let mut first = accept(&listener).await;
    assert_eq!(
        next_request(&mut first).await,
        json!({"a": "subscribe", "v": [256_265, 738_561]})
    );
    assert_eq!(
        next_request(&mut first).await,
        json!({"a": "mode", "v": ["full", [256_265, 738_561]]})
    );
    wait_for(&feed, FeedStatus::is_connected).await;

    first.send(Message::Binary(ltp_frame(NIFTY, 1_950_025).into())).await.unwrap();
    let batch = timeout(Duration::from_secs(5), ticks.recv()).await.unwrap().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].instrument_token, NIFTY);
    assert_eq!(batch[0].last_price.to_string(), "19500.25");

    // Drop the connection without a close handshake.
    drop(first);

    let mut second = accept(&listener).await;
    assert_eq!(
        next_request(&mut second).await,
        json!({"a": "subscribe", "v": [256_265, 738_561]})
    );
    assert_eq!(
        next_request(&mut second).await,
        json!({"a": "mode", "v": ["full", [256_265, 738_561]]})
    );

    let status = wait_for(&feed, FeedStatus::is_connected).await;
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(status.ticks_received, 1);
    assert!(status.last_connected_at.is_some());

    feed.shutdown().await;
    assert_eq!(feed.status().state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn live_changes_send_only_the_difference() {
    let (listener, url) = listen().await;
    let (feed, _ticks) = connector(url, 3);

    feed.subscribe(&[NIFTY]);
    feed.start();

    let mut upstream = accept(&listener).await;
    assert_eq!(
        next_request(&mut upstream).await,
        json!({"a": "subscribe", "v": [256_265]})
    );
    next_request(&mut upstream).await;

    feed.subscribe(&[NIFTY, INFY]);
    assert_eq!(
        next_request(&mut upstream).await,
        json!({"a": "subscribe", "v": [408_065]})
    );
    assert_eq!(
        next_request(&mut upstream).await,
        json!({"a": "mode", "v": ["full", [408_065]]})
    );

    feed.unsubscribe(&[NIFTY]);
    assert_eq!(
        next_request(&mut upstream).await,
        json!({"a": "unsubscribe", "v": [256_265]})
    );

    feed.shutdown().await;
}

#[tokio::test]
async fn ticker_error_message_is_recorded() {
    let (listener, url) = listen().await;
    let (feed, _ticks) = connector(url, 3);
    feed.start();

    let mut upstream = accept(&listener).await;
    wait_for(&feed, FeedStatus::is_connected).await;

    upstream
        .send(Message::text(r#"{"type":"error","data":"Invalid mode"}"#))
        .await
        .unwrap();

    let status = wait_for(&feed, |s| s.last_error.is_some()).await;
    assert_eq!(status.last_error.as_deref(), Some("Invalid mode"));
    assert!(status.is_connected());

    feed.shutdown().await;
}

#[tokio::test]
async fn repeated_rejection_is_terminal() {
    let (listener, url) = listen().await;
    let (feed, _ticks) = connector(url, 2);
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&attempts);
    let server = tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            let reject = |request: &Request, _response: Response| -> Result<Response, ErrorResponse> {
                assert!(request.uri().query().unwrap().contains("api_key=key1"));
                let mut error = ErrorResponse::new(Some("invalid token".to_string()));
                *error.status_mut() = StatusCode::FORBIDDEN;
                Err(error)
            };
            let _ = accept_hdr_async(stream, reject).await;
        }
    });

    feed.start();
    let status = wait_for(&feed, |s| s.unauthenticated).await;
    wait_for(&feed, |s| s.state == ConnectionState::Disconnected).await;

    assert!(status.last_error.unwrap().contains("403"));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(!feed.ensure_started());

    server.abort();
}
