//! Client WebSocket session.
//!
//! One task per client. It drains the client's outbound queue into the
//! socket, applies subscribe/unsubscribe commands, and pings the client
//! when it goes quiet.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};

use super::{AppState, ServerError};
use crate::domain::subscription::ClientId;
use crate::infrastructure::broadcast::{ClientSession, FanoutBroadcaster, HubError};
use crate::infrastructure::heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent};
use crate::infrastructure::protocol::{ClientCommand, ServerMessage};

type ClientWriter = SplitSink<WebSocket, Message>;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    ClientClosed,
    Shed,
    IdleTimeout,
    Unreachable,
}

pub(super) async fn run(socket: WebSocket, state: Arc<AppState>) {
    let ClientSession {
        id,
        mut outbound,
        closed,
    } = state.hub.on_client_connect();

    if state.feed.ensure_started() {
        tracing::info!(client_id = id, "Feed started for first client");
    }

    let (mut writer, mut reader) = socket.split();
    let send_timeout = state.client.send_timeout;
    let idle = state.client.idle_timeout;
    let heartbeat_config = HeartbeatConfig::new(idle, idle);
    let mut heartbeat = Heartbeat::new(heartbeat_config);
    let mut poll = tokio::time::interval(heartbeat_config.poll_period());
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            biased;

            () = closed.cancelled() => break Exit::Shed,

            frame = reader.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        heartbeat.record_activity();
                        if let Some(reply) = apply_command(&state.hub, id, text.as_str()) {
                            if send(&mut writer, &reply, send_timeout).await.is_err() {
                                break Exit::Unreachable;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        heartbeat.record_activity();
                        let reply = ServerMessage::error("binary frames are not supported");
                        if send(&mut writer, &reply, send_timeout).await.is_err() {
                            break Exit::Unreachable;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => heartbeat.record_activity(),
                    Some(Ok(Message::Close(_))) | None => break Exit::ClientClosed,
                    Some(Err(e)) => {
                        tracing::debug!(client_id = id, error = %e, "Client socket error");
                        break Exit::Unreachable;
                    }
                }
            }

            message = outbound.recv() => {
                let Some(message) = message else {
                    break Exit::Shed;
                };
                if let Err(e) = send(&mut writer, &message, send_timeout).await {
                    tracing::debug!(client_id = id, error = %e, "Client write failed");
                    break Exit::Unreachable;
                }
            }

            _ = poll.tick() => {
                match heartbeat.poll() {
                    Some(HeartbeatEvent::SendPing) => {
                        if send(&mut writer, &ServerMessage::Ping, send_timeout).await.is_err() {
                            break Exit::Unreachable;
                        }
                    }
                    Some(HeartbeatEvent::Timeout) => break Exit::IdleTimeout,
                    None => {}
                }
            }
        }
    };

    state.hub.on_client_disconnect(id);
    if exit != Exit::ClientClosed {
        let _ = writer.send(Message::Close(None)).await;
    }
    tracing::debug!(client_id = id, reason = ?exit, "Session ended");
}

/// Apply one client text frame. Returns a direct reply, if any.
///
/// Acknowledgements travel through the broadcaster's queue so they stay
/// ordered with snapshots; only rejections are answered here.
fn apply_command(hub: &FanoutBroadcaster, client: ClientId, text: &str) -> Option<ServerMessage> {
    let command = match ClientCommand::parse(text) {
        Ok(command) => command,
        Err(e) => {
            tracing::debug!(client_id = client, error = %e, "Malformed client command");
            return Some(ServerMessage::error(format!("malformed command: {e}")));
        }
    };

    let result = match command {
        ClientCommand::Subscribe { tokens } => hub.on_client_subscribe(client, &tokens),
        ClientCommand::Unsubscribe { tokens } => hub.on_client_unsubscribe(client, &tokens),
        ClientCommand::Ping | ClientCommand::Pong => return None,
    };

    match result {
        Ok(_) => None,
        Err(HubError::InvalidArgument(reason)) => Some(ServerMessage::error(reason)),
        // The session was shed; its `closed` token ends the loop.
        Err(HubError::ClientUnreachable(_)) => None,
    }
}

async fn send(
    writer: &mut ClientWriter,
    message: &ServerMessage,
    limit: Duration,
) -> Result<(), ServerError> {
    let json = message.to_json()?;
    tokio::time::timeout(limit, writer.send(Message::Text(json.into())))
        .await
        .map_err(|_| ServerError::SendTimeout(limit))??;
    Ok(())
}
