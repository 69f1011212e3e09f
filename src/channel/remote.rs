use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde_json::Value;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{ChannelConfig, ChannelError, ChannelEvent, ChannelLink, ChannelProvider, Subscription};
use crate::ws::message::{ClientFrame, ServerFrame};

type Routes = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<ChannelEvent>>>>;
type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Channel provider backed by a presence relay over one WebSocket.
///
/// Every subscription is multiplexed on the same connection under its own
/// `sub` id. When the connection drops, every subscription's event queue is
/// closed. Dropping the provider flushes the frames already queued, then
/// closes the connection.
#[derive(Debug)]
pub struct RemoteProvider {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    routes: Routes,
    next_sub: AtomicU64,
    reader: JoinHandle<()>,
    // Dropped with the provider, which tells the writer to finish.
    _closing: oneshot::Sender<()>,
}

impl RemoteProvider {
    /// Connects to a relay, e.g. `ws://127.0.0.1:8080/ws`.
    pub async fn connect(url: &str) -> Result<Arc<Self>, ChannelError> {
        let url = Url::parse(url).map_err(|e| ChannelError::Connect(e.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ChannelError::Connect(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        info!(%url, "Connected to presence relay");

        let (mut write, mut read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));

        let (closing, mut closed) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => match frame {
                        Some(frame) => {
                            if !send_frame(&mut write, frame).await {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = &mut closed => {
                        while let Ok(frame) = outbound_rx.try_recv() {
                            if !send_frame(&mut write, frame).await {
                                break;
                            }
                        }
                        break;
                    }
                }
            }
            if let Err(e) = write.close().await {
                debug!(error = %e, "Ignoring error closing relay connection");
            }
            debug!("Relay writer finished");
        });

        let reader_routes = Arc::clone(&routes);
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerFrame::try_from(text.as_str()) {
                        Ok(frame) => route_frame(&reader_routes, frame),
                        Err(e) => warn!(error = %e, "Failed to parse relay frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        info!(?frame, "Relay closed the connection");
                        break;
                    }
                    // Pongs to relay pings are answered by the stream itself.
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Relay connection error");
                        break;
                    }
                }
            }
            // Closing every queue tells each subscriber the channel is gone.
            if let Ok(mut routes) = reader_routes.lock() {
                routes.clear();
            }
            debug!("Relay reader finished");
        });

        Ok(Arc::new(Self {
            outbound,
            routes,
            next_sub: AtomicU64::new(1),
            reader,
            _closing: closing,
        }))
    }

    /// Number of subscriptions currently routed on this connection.
    pub fn subscription_count(&self) -> usize {
        self.routes.lock().map(|routes| routes.len()).unwrap_or(0)
    }
}

async fn send_frame(write: &mut WsWriter, frame: ClientFrame) -> bool {
    let text = match frame.to_json() {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to serialize client frame");
            return true;
        }
    };
    match write.send(Message::text(text)).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Failed to send frame to relay");
            false
        }
    }
}

fn route_frame(routes: &Routes, frame: ServerFrame) {
    let (sub, event) = match frame {
        ServerFrame::PresenceState { sub, state } => (sub, ChannelEvent::Sync(state)),
        ServerFrame::Broadcast {
            sub,
            event,
            payload,
        } => (sub, ChannelEvent::Broadcast { event, payload }),
        ServerFrame::Subscribed { sub, channel } => {
            debug!(%sub, %channel, "Relay confirmed subscription");
            return;
        }
        ServerFrame::Error { sub, message } => {
            warn!(?sub, %message, "Relay rejected a frame");
            return;
        }
    };

    let Ok(routes) = routes.lock() else {
        return;
    };
    match routes.get(&sub) {
        Some(sender) => {
            let _ = sender.send(event);
        }
        None => trace!(%sub, "Dropping frame for unknown subscription"),
    }
}

impl Drop for RemoteProvider {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl ChannelProvider for RemoteProvider {
    fn subscribe(
        self: &Arc<Self>,
        channel: &str,
        config: ChannelConfig,
    ) -> Result<Subscription, ChannelError> {
        let sub = self.next_sub.fetch_add(1, Ordering::Relaxed);
        let (sender, events) = mpsc::unbounded_channel();
        self.routes.lock()?.insert(sub, sender);

        let frame = ClientFrame::Subscribe {
            sub,
            channel: channel.to_string(),
            key: config.key,
            broadcast_self: config.broadcast_self,
        };
        if self.outbound.send(frame).is_err() {
            self.routes.lock()?.remove(&sub);
            return Err(ChannelError::Connect(
                "relay connection is closed".to_string(),
            ));
        }

        debug!(%sub, %channel, "Subscribing through relay");
        Ok(Subscription {
            link: Box::new(RemoteLink {
                sub,
                channel: channel.to_string(),
                outbound: self.outbound.clone(),
                routes: Arc::clone(&self.routes),
                closed: false,
            }),
            events,
        })
    }
}

/// One subscription multiplexed on a [`RemoteProvider`] connection.
#[derive(Debug)]
pub struct RemoteLink {
    sub: u64,
    channel: String,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    routes: Routes,
    closed: bool,
}

impl RemoteLink {
    fn queue(&self, frame: ClientFrame) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed(self.channel.clone()));
        }
        self.outbound
            .send(frame)
            .map_err(|e| ChannelError::SendFail(e.to_string()))
    }
}

impl ChannelLink for RemoteLink {
    fn track(&self, payload: Value) -> Result<(), ChannelError> {
        self.queue(ClientFrame::Track {
            sub: self.sub,
            payload,
        })
    }

    fn untrack(&self) -> Result<(), ChannelError> {
        self.queue(ClientFrame::Untrack { sub: self.sub })
    }

    fn send(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        self.queue(ClientFrame::Broadcast {
            sub: self.sub,
            event: event.to_string(),
            payload,
        })
    }

    fn unsubscribe(&mut self) -> Result<(), ChannelError> {
        if self.closed {
            return Ok(());
        }
        self.routes.lock()?.remove(&self.sub);
        let result = self.queue(ClientFrame::Unsubscribe { sub: self.sub });
        self.closed = true;
        debug!(sub = %self.sub, channel = %self.channel, "Unsubscribed through relay");
        result
    }
}

impl Drop for RemoteLink {
    fn drop(&mut self) {
        let _ = self.unsubscribe();
    }
}
