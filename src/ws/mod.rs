pub mod message;

use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::Instant,
};
use uuid::Uuid;

use crate::{
    channel::{ChannelConfig, ChannelError, ChannelEvent, ChannelLink, ChannelProvider, PresenceHub},
    server::AppState,
};
use message::{ClientFrame, ServerFrame};

/// Axum WebSocket handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let connection_id = Uuid::new_v4();
    tracing::info!(%connection_id, "New WebSocket connection attempt");
    ws.on_upgrade(move |socket| handle_socket(socket, state, connection_id))
}

/// One channel subscription held on behalf of a connected client.
///
/// Dropping it stops forwarding and drops the link, which leaves the channel
/// and removes the client's row.
struct RelaySubscription {
    link: Box<dyn ChannelLink>,
    forwarder: JoinHandle<()>,
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

fn queue_frame(out: &mpsc::UnboundedSender<Message>, frame: &ServerFrame) -> bool {
    match frame.to_json() {
        Ok(text) => out.send(Message::Text(text.into())).is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize server frame");
            true
        }
    }
}

fn spawn_forwarder(
    sub: u64,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    out: mpsc::UnboundedSender<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let frame = match event {
                ChannelEvent::Sync(state) => ServerFrame::PresenceState { sub, state },
                ChannelEvent::Broadcast { event, payload } => {
                    ServerFrame::Broadcast { sub, event, payload }
                }
            };
            if !queue_frame(&out, &frame) {
                break;
            }
        }
    })
}

fn handle_frame(
    hub: &Arc<PresenceHub>,
    connection_id: Uuid,
    frame: ClientFrame,
    subscriptions: &mut HashMap<u64, RelaySubscription>,
    out: &mpsc::UnboundedSender<Message>,
) -> Result<(), ChannelError> {
    let not_subscribed = |sub: u64| ChannelError::NotSubscribed(sub.to_string());

    match frame {
        ClientFrame::Subscribe {
            sub,
            channel,
            key,
            broadcast_self,
        } => {
            // Re-subscribing under the same id replaces the old subscription.
            subscriptions.remove(&sub);
            let subscription = hub.subscribe(&channel, ChannelConfig { key, broadcast_self })?;
            queue_frame(out, &ServerFrame::Subscribed { sub, channel: channel.clone() });
            let forwarder = spawn_forwarder(sub, subscription.events, out.clone());
            subscriptions.insert(
                sub,
                RelaySubscription {
                    link: subscription.link,
                    forwarder,
                },
            );
            tracing::debug!(%connection_id, %sub, %channel, "Client subscribed");
            Ok(())
        }
        ClientFrame::Track { sub, payload } => subscriptions
            .get(&sub)
            .ok_or_else(|| not_subscribed(sub))?
            .link
            .track(payload),
        ClientFrame::Untrack { sub } => subscriptions
            .get(&sub)
            .ok_or_else(|| not_subscribed(sub))?
            .link
            .untrack(),
        ClientFrame::Broadcast {
            sub,
            event,
            payload,
        } => subscriptions
            .get(&sub)
            .ok_or_else(|| not_subscribed(sub))?
            .link
            .send(&event, payload),
        ClientFrame::Unsubscribe { sub } => {
            let mut subscription = subscriptions.remove(&sub).ok_or_else(|| not_subscribed(sub))?;
            tracing::debug!(%connection_id, %sub, "Client unsubscribed");
            subscription.link.unsubscribe()
        }
    }
}

/// Handles the WebSocket communication for a single client
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, connection_id: Uuid) {
    tracing::info!(%connection_id, "WebSocket connection established");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    // Track last pong received time from *this* client
    let last_pong_received = Arc::new(Mutex::new(Instant::now()));

    // --- Task 1: Drain queued frames into the WebSocket ---
    let mut send_task: JoinHandle<()> = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(%connection_id, "WS Send: Failed to send message, client disconnected?");
                break;
            }
        }
        if let Err(e) = ws_sender.close().await {
            tracing::debug!(%connection_id, "Ignoring error closing WebSocket sender: {}", e);
        }
    });

    // --- Task 2: Receive frames from the WebSocket and apply them to the hub ---
    let hub = Arc::clone(&state.hub);
    let recv_out = out_tx.clone();
    let recv_last_pong = Arc::clone(&last_pong_received);
    let mut recv_task: JoinHandle<()> = tokio::spawn(async move {
        // Owned here so that every subscription is released when the task ends.
        let mut subscriptions: HashMap<u64, RelaySubscription> = HashMap::new();

        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match ClientFrame::try_from(text.as_str()) {
                    Ok(frame) => {
                        let sub = frame.sub();
                        if let Err(e) =
                            handle_frame(&hub, connection_id, frame, &mut subscriptions, &recv_out)
                        {
                            tracing::warn!(%connection_id, %sub, error = %e, "Failed to handle client frame");
                            queue_frame(
                                &recv_out,
                                &ServerFrame::Error {
                                    sub: Some(sub),
                                    message: e.to_string(),
                                },
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%connection_id, "Failed to parse client frame: {}. Raw: '{}'", e, text);
                        queue_frame(
                            &recv_out,
                            &ServerFrame::Error {
                                sub: None,
                                message: e.to_string(),
                            },
                        );
                    }
                },
                Ok(Message::Binary(bin)) => {
                    tracing::warn!(%connection_id, "Received unexpected binary message ({} bytes)", bin.len());
                }
                Ok(Message::Ping(_)) => {
                    tracing::trace!(%connection_id, "Received Ping from client");
                }
                Ok(Message::Pong(_)) => {
                    tracing::trace!(%connection_id, "Received Pong from client");
                    *recv_last_pong.lock().await = Instant::now();
                }
                Ok(Message::Close(close_frame)) => {
                    tracing::info!(%connection_id, "Received Close frame: {:?}", close_frame);
                    break;
                }
                Err(e) => {
                    tracing::warn!(%connection_id, "WebSocket receive error: {}", e);
                    break;
                }
            }
        }
        tracing::debug!(%connection_id, subscriptions = subscriptions.len(), "WebSocket receive task loop finished.");
    });

    // --- Task 3: Server-side Heartbeat (Send Pings, Check Pongs) ---
    let heartbeat_out = out_tx;
    let heartbeat_last_pong = Arc::clone(&last_pong_received);
    let interval_duration = state.config.heartbeat_interval;
    let timeout_duration = state.config.heartbeat_timeout;
    let mut heartbeat_task: JoinHandle<Result<(), &'static str>> = tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + interval_duration, interval_duration);
        loop {
            interval.tick().await;

            if heartbeat_last_pong.lock().await.elapsed() > timeout_duration {
                tracing::warn!(%connection_id, "Heartbeat timeout: Client Pong not received recently. Disconnecting.");
                return Err("Heartbeat Timeout");
            }

            tracing::trace!(%connection_id, "Sending Ping to client");
            if heartbeat_out.send(Message::Ping(Bytes::new())).is_err() {
                return Err("Failed to queue Ping");
            }
        }
    });

    // Wait for *any* task to finish, then abort the others.
    tokio::select! {
        res = &mut recv_task => {
            if let Err(e) = res {
                tracing::error!(%connection_id, "WebSocket receive task panicked: {}", e);
            }
            heartbeat_task.abort();
            send_task.abort();
        },
        res = &mut send_task => {
            if let Err(e) = res {
                tracing::error!(%connection_id, "WebSocket send task panicked: {}", e);
            }
            recv_task.abort();
            heartbeat_task.abort();
        },
        res = &mut heartbeat_task => {
            match res {
                Ok(Ok(())) => tracing::error!(%connection_id, "Heartbeat task completed unexpectedly"),
                Ok(Err(reason)) => tracing::info!(%connection_id, "Heartbeat task stopped: {}", reason),
                Err(e) => tracing::error!(%connection_id, "Heartbeat task panicked: {}", e),
            }
            recv_task.abort();
            send_task.abort();
        }
    }

    // Aborting the receive task drops its subscriptions, which removes this
    // client's rows from every channel it joined.
    tracing::info!(%connection_id, "Client disconnected and cleanup initiated.");
}

