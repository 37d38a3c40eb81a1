use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{error, info, warn};

use murmur_types::api::Claims;
use murmur_types::events::{ClientCommand, ServerEvent};
use murmur_types::models::UserId;

use crate::presence::{ConnectionHandle, Outbound};
use crate::session::SessionGateway;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Time allowed between upgrade and the Identify frame.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a single WebSocket connection: Identify handshake, login, then the
/// send/receive loop until either side stops.
pub async fn handle_connection(socket: WebSocket, gateway: SessionGateway, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: Wait for Identify command with JWT
    let claims = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(claims) => claims,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };
    let user_id = claims.sub;

    // Subscribe before login so this client also sees its own presence and the
    // refreshed user list.
    let mut broadcast_rx = gateway.presence().subscribe();
    let (handle, mut user_rx) = ConnectionHandle::new();
    let conn_id = handle.conn_id();

    // Step 2: Register presence
    let user = match gateway.login(user_id, handle.clone()).await {
        Ok(user) => user,
        Err(e) => {
            warn!("Login of {} over gateway rejected: {}", user_id, e);
            let _ = send_event(&mut sender, &ServerEvent::error(e.to_string())).await;
            return;
        }
    };
    let username = user.username.clone();
    info!("{} ({}) connected to gateway", username, user_id);

    // Step 3: Send Ready event
    if send_event(&mut sender, &ServerEvent::Ready { user }).await.is_err() {
        disconnect(&gateway, user_id, conn_id).await;
        return;
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward broadcasts + targeted events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                result = user_rx.recv() => {
                    match result {
                        Some(Outbound::Event(event)) => {
                            if send_event(&mut sender, &event).await.is_err() {
                                break;
                            }
                        }
                        Some(Outbound::Close) => {
                            let _ = sender.send(Message::Close(None)).await;
                            break;
                        }
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let gateway_recv = gateway.clone();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        if handle_command(&gateway_recv, &handle, user_id, cmd).await.is_break() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        handle.push(ServerEvent::error(format!("Unrecognized command: {}", e)));
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    disconnect(&gateway, user_id, conn_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn disconnect(gateway: &SessionGateway, user_id: UserId, conn_id: uuid::Uuid) {
    if let Err(e) = gateway.logout(user_id, conn_id).await {
        error!("Failed to persist offline state for {}: {}", user_id, e);
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(event)?;
    sender.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<Claims> {
    let identify = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(ClientCommand::Identify { token }) =
                    serde_json::from_str::<ClientCommand>(&text)
                {
                    return verify_identify(&token, jwt_secret);
                }
            }
        }
        None
    };

    tokio::time::timeout(IDENTIFY_TIMEOUT, identify).await.ok().flatten()
}

/// Claims of a valid, unexpired token signed with `jwt_secret`.
fn verify_identify(token: &str, jwt_secret: &str) -> Option<Claims> {
    use jsonwebtoken::{DecodingKey, Validation, decode};

    match decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(token_data) => Some(token_data.claims),
        Err(e) => {
            warn!("Identify rejected: {}", e);
            None
        }
    }
}

/// Apply one client command. Rejections go back to this connection only as an
/// `Error` event. `Break` ends the connection.
async fn handle_command(
    gateway: &SessionGateway,
    handle: &ConnectionHandle,
    user_id: UserId,
    cmd: ClientCommand,
) -> ControlFlow<()> {
    let outcome = match cmd {
        ClientCommand::Identify { .. } => Ok(()), // Already handled

        ClientCommand::SendMessage { receiver_id, body } => gateway
            .send_message(user_id, receiver_id, &body)
            .await
            .map(|_| ()),

        ClientCommand::Typing { receiver_id } => {
            gateway.typing(user_id, receiver_id).await;
            Ok(())
        }

        ClientCommand::MarkRead { message_id } => {
            gateway.mark_read(user_id, message_id).await.map(|_| ())
        }

        ClientCommand::Logout => {
            if let Err(e) = gateway.logout(user_id, handle.conn_id()).await {
                error!("Failed to persist logout of {}: {}", user_id, e);
            }
            return ControlFlow::Break(());
        }
    };

    if let Err(e) = outcome {
        warn!("Command from {} rejected: {}", user_id, e);
        handle.push(ServerEvent::error(e.to_string()));
    }
    ControlFlow::Continue(())
}
