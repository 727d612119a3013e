//! Per-Connection Handler
//!
//! One reader task and one writer task per client connection. The reader
//! owns the interest set and the category listeners; the writer drains
//! the bounded outbound buffer and drives the heartbeat. Teardown is
//! synchronous: listeners are detached before the socket close completes,
//! so no notification can be delivered past disconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_stream::StreamMap;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::ports::identity::Identity;
use crate::domain::interest::{ChannelCategory, InterestKey, InterestSet};
use crate::infrastructure::cache::Notification;
use crate::infrastructure::metrics;
use crate::infrastructure::ws::buffer::OutboundBuffer;
use crate::infrastructure::ws::protocol::{ClientRequest, RejectCode, ServerFrame};
use crate::infrastructure::ws::server::FanoutShared;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

// =============================================================================
// Heartbeat Liveness
// =============================================================================

/// Tracks unanswered server pings.
#[derive(Debug, Default)]
struct Liveness {
    outstanding_pings: AtomicU32,
}

impl Liveness {
    fn record_activity(&self) {
        self.outstanding_pings.store(0, Ordering::SeqCst);
    }

    fn mark_ping(&self) {
        self.outstanding_pings.fetch_add(1, Ordering::SeqCst);
    }

    fn outstanding(&self) -> u32 {
        self.outstanding_pings.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Connection Handler
// =============================================================================

/// State owned by one connection's reader task.
pub(crate) struct ConnectionHandler {
    id: Uuid,
    identity: Option<Identity>,
    shared: Arc<FanoutShared>,
    interest: InterestSet,
    streams: StreamMap<ChannelCategory, BroadcastStream<Notification>>,
    buffer: Arc<OutboundBuffer>,
}

impl ConnectionHandler {
    /// Serve one accepted, authenticated-or-anonymous connection until it
    /// closes or the server shuts down.
    pub(crate) async fn run(
        socket: WebSocketStream<TcpStream>,
        identity: Option<Identity>,
        shared: Arc<FanoutShared>,
        server_cancel: &CancellationToken,
    ) {
        let id = Uuid::new_v4();
        let (sink, stream) = socket.split();

        let buffer = Arc::new(OutboundBuffer::new(shared.settings.key_buffer_capacity));
        let liveness = Arc::new(Liveness::default());
        let conn_cancel = server_cancel.child_token();

        let writer = tokio::spawn(write_loop(
            sink,
            Arc::clone(&buffer),
            Arc::clone(&liveness),
            conn_cancel.clone(),
            shared.settings.heartbeat_interval,
            shared.settings.missed_pong_limit,
            id,
        ));

        tracing::info!(
            connection_id = %id,
            authenticated = identity.is_some(),
            "Client connected"
        );

        let mut handler = Self {
            id,
            identity,
            shared,
            interest: InterestSet::new(),
            streams: StreamMap::new(),
            buffer,
        };
        handler.read_loop(stream, &liveness, &conn_cancel).await;

        let subscriptions = handler.interest.len();
        // Detach listeners and destroy subscriptions before the close
        // completes; a notification arriving now reaches nobody.
        drop(handler);

        conn_cancel.cancel();
        let _ = writer.await;

        tracing::info!(connection_id = %id, subscriptions, "Client disconnected");
    }

    async fn read_loop(
        &mut self,
        mut stream: WsStream,
        liveness: &Liveness,
        conn_cancel: &CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = conn_cancel.cancelled() => break,
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            liveness.record_activity();
                            self.handle_text(text.as_str()).await;
                        }
                        Some(Ok(Message::Pong(_) | Message::Ping(_))) => {
                            liveness.record_activity();
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            tracing::debug!(connection_id = %self.id, error = %error, "Socket read error");
                            break;
                        }
                    }
                }
                Some((_category, result)) = self.streams.next(), if !self.streams.is_empty() => {
                    match result {
                        Ok(notification) => self.deliver(&notification),
                        Err(BroadcastStreamRecvError::Lagged(missed)) => {
                            // The category channel outpaced this connection;
                            // clients converge from the cache on the next update.
                            tracing::warn!(
                                connection_id = %self.id,
                                missed,
                                "Notification receiver lagged"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Queue a notification matching this connection's interest.
    fn deliver(&self, notification: &Notification) {
        if !self.interest.contains(&notification.key) {
            return;
        }

        match ServerFrame::update(notification).to_text() {
            Ok(text) => {
                let evicted = self.buffer.push(&notification.key.to_string(), text);
                metrics::record_frame_sent(notification.key.category());
                if evicted {
                    metrics::record_frames_dropped(1);
                }
            }
            Err(error) => {
                tracing::error!(connection_id = %self.id, error = %error, "Frame serialization failed");
            }
        }
    }

    async fn handle_text(&mut self, text: &str) {
        match ClientRequest::parse(text) {
            Ok(ClientRequest::Subscribe { key }) => self.handle_subscribe(&key).await,
            Ok(ClientRequest::Unsubscribe { key }) => self.handle_unsubscribe(&key),
            Err(error) => {
                tracing::debug!(connection_id = %self.id, error = %error, "Malformed client frame");
                self.reject(RejectCode::InvalidRequest, "malformed request", None);
            }
        }
    }

    async fn handle_subscribe(&mut self, wire_key: &str) {
        let key = match wire_key.parse::<InterestKey>() {
            Ok(key) => key,
            Err(error) => {
                self.reject(
                    RejectCode::UnknownKey,
                    error.to_string(),
                    Some(wire_key.to_string()),
                );
                return;
            }
        };

        if let Some(scope) = key.authorization_scope() {
            let Some(identity) = self.identity.clone() else {
                self.reject(
                    RejectCode::AuthRequired,
                    "authentication required for private keys",
                    Some(wire_key.to_string()),
                );
                return;
            };

            // The rejection scopes to this one request; the connection
            // stays open for everything else it is allowed to see.
            let resource_type = scope.resource_type;
            let resource_id = scope.resource_id.to_string();
            if !self.authorize(&identity, resource_type, &resource_id).await {
                self.reject(
                    RejectCode::Forbidden,
                    format!("not authorized to read {resource_type}:{resource_id}"),
                    Some(wire_key.to_string()),
                );
                return;
            }
        }

        if self.interest.insert(key.clone()) {
            let category = key.category();
            self.streams.insert(
                category,
                BroadcastStream::new(self.shared.hub.subscribe(category)),
            );
        }

        // Replay the latest cached value so the client starts from
        // current state instead of waiting for the next change.
        if let Some(cached) = self.shared.cache.read(&key) {
            let notification = Notification {
                key: key.clone(),
                payload: cached.payload,
                marker: cached.marker,
                produced_at: cached.produced_at,
            };
            self.deliver(&notification);
        }

        tracing::debug!(connection_id = %self.id, key = %key, "Subscribed");
    }

    fn handle_unsubscribe(&mut self, wire_key: &str) {
        // Unsubscribing an unknown or never-subscribed key is a no-op,
        // not an error.
        let Ok(key) = wire_key.parse::<InterestKey>() else {
            tracing::debug!(connection_id = %self.id, key = wire_key, "Unsubscribe for unparseable key ignored");
            return;
        };

        let outcome = self.interest.remove(&key);
        if outcome.category_now_empty {
            self.streams.remove(&key.category());
        }

        if outcome.removed {
            tracing::debug!(connection_id = %self.id, key = %key, "Unsubscribed");
        }
    }

    /// Run the authorization check with a timeout, denying on error or
    /// timeout. An unreachable authorization service fails closed.
    async fn authorize(&self, identity: &Identity, resource_type: &str, resource_id: &str) -> bool {
        let check = self
            .shared
            .access
            .check(identity, resource_type, resource_id, "read");

        match tokio::time::timeout(self.shared.check_timeout, check).await {
            Ok(Ok(granted)) => granted,
            Ok(Err(error)) => {
                tracing::warn!(
                    connection_id = %self.id,
                    error = %error,
                    "Authorization check failed, denying"
                );
                false
            }
            Err(_) => {
                tracing::warn!(
                    connection_id = %self.id,
                    "Authorization check timed out, denying"
                );
                false
            }
        }
    }

    fn reject(&self, code: RejectCode, message: impl Into<String>, key: Option<String>) {
        metrics::record_subscribe_rejected(code.as_str());
        match ServerFrame::error(code, message, key).to_text() {
            Ok(text) => self.buffer.push_control(text),
            Err(error) => {
                tracing::error!(connection_id = %self.id, error = %error, "Error frame serialization failed");
            }
        }
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

/// Drain the outbound buffer to the socket and drive the heartbeat.
async fn write_loop(
    mut sink: WsSink,
    buffer: Arc<OutboundBuffer>,
    liveness: Arc<Liveness>,
    cancel: CancellationToken,
    heartbeat_interval: std::time::Duration,
    missed_pong_limit: u32,
    connection_id: Uuid,
) {
    let mut ping_timer = tokio::time::interval(heartbeat_interval);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Consume the immediate first tick so the first ping waits a full
    // interval after the handshake.
    ping_timer.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            frame = buffer.next() => {
                if let Err(error) = sink.send(Message::Text(frame.text.into())).await {
                    tracing::debug!(connection_id = %connection_id, error = %error, "Socket write failed");
                    cancel.cancel();
                    break;
                }
            }
            _ = ping_timer.tick() => {
                if liveness.outstanding() >= missed_pong_limit {
                    tracing::warn!(
                        connection_id = %connection_id,
                        missed = liveness.outstanding(),
                        "Heartbeat timeout, closing connection"
                    );
                    cancel.cancel();
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }

                if sink.send(Message::Ping(vec![].into())).await.is_err() {
                    cancel.cancel();
                    break;
                }
                liveness.mark_ping();
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_resets_on_activity() {
        let liveness = Liveness::default();
        liveness.mark_ping();
        liveness.mark_ping();
        assert_eq!(liveness.outstanding(), 2);

        liveness.record_activity();
        assert_eq!(liveness.outstanding(), 0);
    }
}
