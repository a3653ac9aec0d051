//! Peer Links
//!
//! Transport between the two devices. A link carries one request and returns
//! the peer's reply; it never touches ledger state itself.
//!
//! ```text
//!   Device ──send(Sync)──► PeerLink ──► SyncEndpoint (peer Device)
//!          ◄──SyncReply───          ◄──
//! ```
//!
//! Two implementations:
//! - [`LoopbackLink`]: in-process, with a reachability switch for tests
//!   and the demo binary
//! - [`WsPeerLink`] / [`serve_peer`]: one WebSocket round trip per sync

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::sync::protocol::PeerMessage;

// =============================================================================
// ERRORS
// =============================================================================

/// Sync transport errors. None of them change local state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// The peer could not be reached at all.
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Connection dropped or timed out mid-exchange.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Frame could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Envelope version not understood.
    #[error("Unsupported wire version {0}")]
    VersionMismatch(u16),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Codec(e.to_string())
    }
}

impl From<bincode::Error> for SyncError {
    fn from(e: bincode::Error) -> Self {
        SyncError::Codec(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

// =============================================================================
// TRAITS
// =============================================================================

/// Receiving side of a sync exchange.
#[async_trait]
pub trait SyncEndpoint: Send + Sync {
    /// Absorb a peer message and answer with the merged state.
    async fn handle_peer_message(&self, msg: PeerMessage) -> Result<PeerMessage, SyncError>;
}

/// Sending side of a sync exchange.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Deliver `msg` and wait for the reply.
    async fn send(&self, msg: PeerMessage) -> Result<PeerMessage, SyncError>;

    /// Best-effort reachability hint; `send` is the source of truth.
    fn is_reachable(&self) -> bool {
        true
    }
}

// =============================================================================
// LOOPBACK
// =============================================================================

/// In-process link to another device.
#[derive(Clone)]
pub struct LoopbackLink {
    peer: Arc<dyn SyncEndpoint>,
    reachable: Arc<AtomicBool>,
}

impl LoopbackLink {
    /// Link to `peer`, initially reachable.
    pub fn new(peer: Arc<dyn SyncEndpoint>) -> Self {
        Self {
            peer,
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the peer going out of range or coming back.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn send(&self, msg: PeerMessage) -> Result<PeerMessage, SyncError> {
        if !self.is_reachable() {
            return Err(SyncError::PeerUnreachable("loopback peer offline".to_string()));
        }
        self.peer.handle_peer_message(msg).await
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

// =============================================================================
// WEBSOCKET
// =============================================================================

/// Client side of the WebSocket transport.
#[derive(Debug, Clone)]
pub struct WsPeerLink {
    url: String,
    timeout: Duration,
    last_ok: Arc<AtomicBool>,
}

impl WsPeerLink {
    /// Link to a peer listening at `url` (`ws://host:port`).
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            last_ok: Arc::new(AtomicBool::new(true)),
        }
    }

    async fn round_trip(&self, msg: &PeerMessage) -> Result<PeerMessage, SyncError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SyncError::PeerUnreachable(format!("{}: {}", self.url, e)))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        ws_sender.send(Message::Text(msg.to_json()?)).await?;

        let reply = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Text(text))) => break PeerMessage::from_json(&text)?,
                Some(Ok(Message::Binary(data))) => break PeerMessage::from_bytes(&data)?,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(SyncError::Transport("peer closed before replying".to_string()));
                }
                Some(Err(e)) => return Err(e.into()),
                _ => {}
            }
        };

        let _ = ws_sender.send(Message::Close(None)).await;
        Ok(reply)
    }
}

#[async_trait]
impl PeerLink for WsPeerLink {
    async fn send(&self, msg: PeerMessage) -> Result<PeerMessage, SyncError> {
        let result = match tokio::time::timeout(self.timeout, self.round_trip(&msg)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Transport(format!(
                "no reply from {} within {:?}",
                self.url, self.timeout
            ))),
        };
        self.last_ok.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    fn is_reachable(&self) -> bool {
        self.last_ok.load(Ordering::SeqCst)
    }
}

/// Accept peer connections until `shutdown` fires.
///
/// Each connection may carry any number of request frames; every request is
/// answered in the encoding it arrived in.
pub async fn serve_peer(
    listener: TcpListener,
    endpoint: Arc<dyn SyncEndpoint>,
    mut shutdown: broadcast::Receiver<()>,
) {
    match listener.local_addr() {
        Ok(addr) => info!("Peer sync listening on {}", addr),
        Err(e) => warn!("Peer sync listening on unknown address: {}", e),
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!("Peer connection from {}", addr);
                        let endpoint = endpoint.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, endpoint).await;
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Peer sync listener shutting down");
                break;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, endpoint: Arc<dyn SyncEndpoint>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    while let Some(frame) = ws_receiver.next().await {
        let reply = match frame {
            Ok(Message::Text(text)) => match PeerMessage::from_json(&text) {
                Ok(msg) => endpoint
                    .handle_peer_message(msg)
                    .await
                    .and_then(|r| Ok(Message::Text(r.to_json()?))),
                Err(e) => Err(e.into()),
            },
            Ok(Message::Binary(data)) => match PeerMessage::from_bytes(&data) {
                Ok(msg) => endpoint
                    .handle_peer_message(msg)
                    .await
                    .and_then(|r| Ok(Message::Binary(r.to_bytes()?))),
                Err(e) => Err(e.into()),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Peer connection error: {}", e);
                break;
            }
        };

        match reply {
            Ok(frame) => {
                if ws_sender.send(frame).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                // No reply: the sender times out and retries on its next cycle.
                warn!("Dropping peer frame: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;
    use crate::sync::protocol::{DeviceRole, MessageKind, WIRE_VERSION};

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SyncEndpoint for Echo {
        async fn handle_peer_message(&self, mut msg: PeerMessage) -> Result<PeerMessage, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            msg.kind = MessageKind::SyncReply;
            msg.revision += 1;
            Ok(msg)
        }
    }

    fn message() -> PeerMessage {
        PeerMessage {
            version: WIRE_VERSION,
            kind: MessageKind::Sync,
            sender: Uuid::from_u128(5),
            role: DeviceRole::Companion,
            revision: 1,
            fields: BTreeMap::new(),
            deltas: Vec::new(),
            delta_acks: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_loopback_reachability() {
        let echo = Arc::new(Echo { calls: AtomicUsize::new(0) });
        let link = LoopbackLink::new(echo.clone());

        let reply = link.send(message()).await.unwrap();
        assert_eq!(reply.kind, MessageKind::SyncReply);
        assert_eq!(reply.revision, 2);

        link.set_reachable(false);
        assert!(!link.is_reachable());
        assert!(matches!(link.send(message()).await, Err(SyncError::PeerUnreachable(_))));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_websocket_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let echo: Arc<dyn SyncEndpoint> = Arc::new(Echo { calls: AtomicUsize::new(0) });
        let server = tokio::spawn(serve_peer(listener, echo, shutdown_rx));

        let link = WsPeerLink::new(format!("ws://{}", addr), Duration::from_secs(5));
        let reply = link.send(message()).await.unwrap();
        assert_eq!(reply.kind, MessageKind::SyncReply);
        assert!(link.is_reachable());

        let _ = shutdown_tx.send(());
        let _ = server.await;
    }

    #[tokio::test]
    async fn test_websocket_unreachable() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let link = WsPeerLink::new(format!("ws://{}", addr), Duration::from_secs(2));
        assert!(link.send(message()).await.is_err());
        assert!(!link.is_reachable());
    }
}
