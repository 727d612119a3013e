//! WebSocket Fan-out Server
//!
//! Terminates many concurrent long-lived client connections. Each
//! connection presents a bearer token in the connection-establishment
//! query parameters; verification failure completes the handshake anyway
//! and degrades the connection to public-only data (market ticks and
//! order books, never portfolio-scoped keys).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;

use crate::application::ports::identity::{AccessPort, Identity, IdentityPort};
use crate::infrastructure::cache::{NotifyHub, StateCache};
use crate::infrastructure::config::{AuthSettings, FanoutSettings};
use crate::infrastructure::metrics;
use crate::infrastructure::ws::connection::ConnectionHandler;

// =============================================================================
// Shared State
// =============================================================================

/// Dependencies shared by every connection.
pub(crate) struct FanoutShared {
    pub(crate) cache: Arc<StateCache>,
    pub(crate) hub: Arc<NotifyHub>,
    pub(crate) access: Arc<dyn AccessPort>,
    pub(crate) settings: FanoutSettings,
    pub(crate) check_timeout: Duration,
}

// =============================================================================
// Errors
// =============================================================================

/// Fan-out server failure.
#[derive(Debug, thiserror::Error)]
pub enum FanoutServerError {
    /// Could not bind the listen port.
    #[error("failed to bind fan-out port {0}: {1}")]
    BindFailed(u16, String),
}

// =============================================================================
// Server
// =============================================================================

/// Accepts client connections and serves subscriptions until cancelled.
pub struct FanoutServer {
    port: u16,
    identity: Arc<dyn IdentityPort>,
    verify_timeout: Duration,
    shared: Arc<FanoutShared>,
    connections: AtomicI32,
    cancel: CancellationToken,
}

impl FanoutServer {
    /// Create a fan-out server.
    #[must_use]
    pub fn new(
        port: u16,
        cache: Arc<StateCache>,
        hub: Arc<NotifyHub>,
        identity: Arc<dyn IdentityPort>,
        access: Arc<dyn AccessPort>,
        settings: FanoutSettings,
        auth: &AuthSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            port,
            identity,
            verify_timeout: auth.verify_timeout,
            shared: Arc::new(FanoutShared {
                cache,
                hub,
                access,
                settings,
                check_timeout: auth.check_timeout,
            }),
            connections: AtomicI32::new(0),
            cancel,
        }
    }

    /// Number of currently connected clients.
    #[must_use]
    pub fn connection_count(&self) -> i32 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Bind the configured port and serve until cancelled.
    pub async fn run(self: Arc<Self>) -> Result<(), FanoutServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FanoutServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Fan-out server listening");
        self.serve_with_listener(listener).await;
        Ok(())
    }

    /// Serve connections from an already-bound listener until cancelled.
    pub async fn serve_with_listener(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            let active = self.connection_count();
                            if active >= self.shared.settings.max_connections as i32 {
                                tracing::warn!(peer = %peer, active, "Connection limit reached, refusing client");
                                drop(socket);
                                continue;
                            }

                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.handle_socket(socket, peer).await;
                            });
                        }
                        Err(error) => {
                            tracing::warn!(error = %error, "Accept failed");
                        }
                    }
                }
            }
        }

        tracing::info!("Fan-out server stopped");
    }

    async fn handle_socket(&self, socket: TcpStream, peer: SocketAddr) {
        // Capture the bearer token from the upgrade request's query
        // parameters while completing the handshake.
        let mut token: Option<String> = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            token = extract_token(request.uri().query());
            Ok(response)
        };

        let ws = match tokio_tungstenite::accept_hdr_async(socket, callback).await {
            Ok(ws) => ws,
            Err(error) => {
                tracing::debug!(peer = %peer, error = %error, "WebSocket handshake failed");
                return;
            }
        };

        // Verification happens after the handshake: a bad or missing
        // token never refuses the connection, it only withholds private
        // subscriptions until the client re-authenticates.
        let identity = match token {
            Some(token) => self.verify(&token).await,
            None => None,
        };

        let active = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_fanout_connections(f64::from(active));

        ConnectionHandler::run(ws, identity, Arc::clone(&self.shared), &self.cancel).await;

        let active = self.connections.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::set_fanout_connections(f64::from(active));
    }

    async fn verify(&self, token: &str) -> Option<Identity> {
        match tokio::time::timeout(self.verify_timeout, self.identity.verify(token)).await {
            Ok(Ok(identity)) => Some(identity),
            Ok(Err(error)) => {
                tracing::info!(error = %error, "Authentication failed, serving public data only");
                None
            }
            Err(_) => {
                tracing::warn!("Token verification timed out, serving public data only");
                None
            }
        }
    }
}

/// Extract the `token` query parameter from an upgrade request URI.
fn extract_token(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_token_from_query() {
        assert_eq!(
            extract_token(Some("token=abc123")),
            Some("abc123".to_string())
        );
        assert_eq!(
            extract_token(Some("foo=bar&token=abc123&baz=1")),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn missing_or_empty_token_is_none() {
        assert_eq!(extract_token(None), None);
        assert_eq!(extract_token(Some("")), None);
        assert_eq!(extract_token(Some("foo=bar")), None);
        assert_eq!(extract_token(Some("token=")), None);
    }
}
