//! Accepts/establishes connections, runs the handshake, and owns the set of
//! live peer sessions. Everything above the wire (what a message *means*)
//! lives in [`crate::controller`], [`crate::worker`], and
//! [`crate::dispatcher`].

mod connection;
mod dedup;
mod handshake;
mod rate_limit;
pub(crate) mod seal;

pub use connection::{ConnectionState, PeerConnection, Socket};
pub use dedup::DedupTable;
pub use rate_limit::TokenBucket;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{NodeError, NodeResult};
use crate::identity::NodeManager;
use crate::protocol::{self, ErrorCode, Message as OverlayMessage, MessageType, ProtocolError};
use crate::registry::{Peer, PeerRegistry};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub listen_addr: SocketAddr,
    pub ws_path: String,
    pub max_connections: usize,
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9091".parse().expect("valid default listen address"),
            ws_path: "/ws".to_string(),
            max_connections: 100,
            max_message_size: connection::MAX_MESSAGE_SIZE,
        }
    }
}

struct Session {
    conn: Arc<PeerConnection>,
    read_handle: JoinHandle<()>,
    keepalive_handle: JoinHandle<()>,
}

/// Delivered to the dispatcher for every successfully decrypted, non-dup
/// application message.
pub struct Inbound {
    pub peer_id: String,
    pub message: OverlayMessage,
}

pub struct Transport {
    manager: Arc<NodeManager>,
    registry: Arc<PeerRegistry>,
    config: TransportConfig,
    sessions: RwLock<HashMap<String, Session>>,
    live_count: AtomicUsize,
    dedup: Arc<DedupTable>,
    shutdown: CancellationToken,
    inbound_tx: mpsc::Sender<Inbound>,
}

impl Transport {
    pub fn new(
        manager: Arc<NodeManager>,
        registry: Arc<PeerRegistry>,
        config: TransportConfig,
    ) -> (Arc<Self>, mpsc::Receiver<Inbound>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let transport = Arc::new(Self {
            manager,
            registry,
            config,
            sessions: RwLock::new(HashMap::new()),
            live_count: AtomicUsize::new(0),
            dedup: Arc::new(DedupTable::new()),
            shutdown: CancellationToken::new(),
            inbound_tx,
        });
        transport.dedup.clone().spawn_sweeper();
        (transport, inbound_rx)
    }

    fn try_reserve_slot(&self) -> bool {
        loop {
            let current = self.live_count.load(Ordering::Acquire);
            if current >= self.config.max_connections {
                return false;
            }
            if self
                .live_count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release_slot(&self) {
        self.live_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Dial `peer` and complete the handshake as initiator. The responder's
    /// reported identity supersedes `peer.id` if different.
    pub async fn connect(self: &Arc<Self>, peer: &Peer) -> NodeResult<Arc<PeerConnection>> {
        if !self.try_reserve_slot() {
            return Err(NodeError::ResourceExhausted("max connections reached".into()));
        }

        let result = self.connect_inner(peer).await;
        if result.is_err() {
            self.release_slot();
        }
        result
    }

    async fn connect_inner(self: &Arc<Self>, peer: &Peer) -> NodeResult<Arc<PeerConnection>> {
        let scheme = if self.config.listen_addr.port() == 443 { "wss" } else { "ws" };
        let url = format!("{scheme}://{}{}", peer.address, self.config.ws_path);
        let ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig {
            max_message_size: Some(self.config.max_message_size),
            max_frame_size: Some(self.config.max_message_size),
            ..Default::default()
        };
        let (ws_stream, _) = tokio_tungstenite::connect_async_with_config(&url, Some(ws_config), false)
            .await
            .map_err(|e| NodeError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

        let conn = PeerConnection::new(
            self.manager.id().to_string(),
            peer.id.clone(),
            Socket::Client(ws_stream),
            ConnectionState::Handshaking,
        );

        let challenge = handshake::generate_challenge();
        let hs_payload = handshake::build_handshake(&self.manager, &challenge);
        let hs_msg = OverlayMessage::new(
            MessageType::Handshake,
            self.manager.id(),
            peer.id.clone(),
            serde_json::to_value(hs_payload).map_err(|e| NodeError::Corrupt(e.to_string()))?,
        );
        conn.send_plaintext(&hs_msg).await?;

        let ack_msg = tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.recv_plaintext(self.config.max_message_size))
            .await
            .map_err(|_| NodeError::Protocol(ProtocolError::timeout("handshake ack not received")))?
            .map_err(NodeError::Io)?
            .ok_or_else(|| NodeError::Protocol(ProtocolError::new(ErrorCode::InvalidMessage, "connection closed during handshake")))?;

        let ack: crate::protocol::HandshakeAckPayload = protocol::parse_payload(&ack_msg.payload)?;
        let shared_secret = handshake::verify_ack(&self.manager, &challenge, &ack)?;

        conn.install_shared_secret(shared_secret).await;
        conn.set_peer_id(ack.identity.id.clone()).await;
        self.registry.set_connected(&ack.identity.id, true).await;

        self.spawn_session(ack.identity.id.clone(), conn.clone()).await;
        Ok(conn)
    }

    /// Accept an inbound WebSocket after the origin check has already
    /// passed, and run the responder side of the handshake.
    pub async fn accept(self: Arc<Self>, ws: WebSocket, remote_addr: SocketAddr) {
        if !self.try_reserve_slot() {
            warn!("rejecting inbound connection from {remote_addr}: at capacity");
            return;
        }

        if let Err(e) = self.accept_inner(ws, remote_addr).await {
            warn!("handshake with {remote_addr} failed: {e}");
        }
        // accept_inner hands the slot off to spawn_session on success; on
        // failure it never reserved a live session, so release here covers
        // both early-return paths cheaply (spawn_session does not touch
        // live_count itself).
    }

    async fn accept_inner(self: &Arc<Self>, ws: WebSocket, remote_addr: SocketAddr) -> NodeResult<()> {
        let conn = PeerConnection::new(
            self.manager.id().to_string(),
            String::new(),
            Socket::Server(ws),
            ConnectionState::Handshaking,
        );

        let handshake_msg = tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.recv_plaintext(self.config.max_message_size))
            .await
            .map_err(|_| NodeError::Protocol(ProtocolError::timeout("handshake not received")))?
            .map_err(NodeError::Io)?
            .ok_or_else(|| NodeError::Protocol(ProtocolError::new(ErrorCode::InvalidMessage, "connection closed during handshake")))?;

        let request: crate::protocol::HandshakePayload = protocol::parse_payload(&handshake_msg.payload)?;

        if !protocol::is_supported_version(&request.version) {
            let reason = protocol::unsupported_version_reason(&request.version);
            self.send_rejection(&conn, &handshake_msg, &reason).await;
            self.release_slot();
            return Err(NodeError::Protocol(ProtocolError::new(ErrorCode::InvalidMessage, reason)));
        }

        let allowed = self
            .registry
            .is_peer_allowed(&request.identity.id, &request.identity.public_key)
            .await;
        if !allowed {
            self.send_rejection(&conn, &handshake_msg, "peer not allowed").await;
            self.release_slot();
            return Err(NodeError::Protocol(ProtocolError::unauthorized("peer not allowed")));
        }

        let (ack, shared_secret) = handshake::build_handshake_ack(&self.manager, &request)?;

        if self.registry.get(&request.identity.id).await.is_none() {
            let peer = Peer::new(
                request.identity.id.clone(),
                request.identity.name.clone(),
                request.identity.public_key.clone(),
                remote_addr.to_string(),
                request.identity.role,
            );
            // Auto-registration races with a concurrent AddPeer are
            // harmless: losing them just means we reuse the existing record.
            let _ = self.registry.add_peer(peer).await;
        }

        conn.set_peer_id(request.identity.id.clone()).await;
        conn.install_shared_secret(shared_secret).await;

        let ack_msg = handshake_msg.reply(
            MessageType::HandshakeAck,
            self.manager.id(),
            serde_json::to_value(&ack).map_err(|e| NodeError::Corrupt(e.to_string()))?,
        );
        conn.send_plaintext(&ack_msg).await?;

        self.registry.set_connected(&request.identity.id, true).await;
        self.spawn_session(request.identity.id, conn).await;
        Ok(())
    }

    async fn send_rejection(&self, conn: &Arc<PeerConnection>, handshake_msg: &OverlayMessage, reason: &str) {
        let ack = handshake::rejection_ack(&self.manager, reason);
        if let Ok(payload) = serde_json::to_value(&ack) {
            let reply = handshake_msg.reply(MessageType::HandshakeAck, self.manager.id(), payload);
            let _ = conn.send_plaintext(&reply).await;
        }
    }

    async fn spawn_session(self: &Arc<Self>, peer_id: String, conn: Arc<PeerConnection>) {
        let read_handle = tokio::spawn(conn.clone().run_read_loop(
            self.dedup.clone(),
            self.registry.clone(),
            self.forwarding_channel(peer_id.clone()),
        ));
        let keepalive_handle = tokio::spawn(conn.clone().run_keepalive(self.registry.clone()));

        let mut sessions = self.sessions.write().await;
        sessions.insert(
            peer_id,
            Session {
                conn,
                read_handle,
                keepalive_handle,
            },
        );
    }

    /// Bridges the connection's generic `Message` channel into this
    /// transport's `Inbound` channel, tagging each message with its peer.
    fn forwarding_channel(self: &Arc<Self>, peer_id: String) -> mpsc::Sender<OverlayMessage> {
        let (tx, mut rx) = mpsc::channel(256);
        let inbound_tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if inbound_tx.send(Inbound { peer_id: peer_id.clone(), message }).await.is_err() {
                    break;
                }
            }
        });
        tx
    }

    /// Deliver `msg` to all live connections except the one matching
    /// `msg.from` (echo suppression).
    pub async fn broadcast(&self, msg: &OverlayMessage) {
        let sessions = self.sessions.read().await;
        for (peer_id, session) in sessions.iter() {
            if peer_id == &msg.from {
                continue;
            }
            if let Err(e) = session.conn.send(msg).await {
                warn!("broadcast to {peer_id} failed: {e}");
            }
        }
    }

    pub async fn connection(&self, peer_id: &str) -> Option<Arc<PeerConnection>> {
        self.sessions.read().await.get(peer_id).map(|s| s.conn.clone())
    }

    pub async fn is_connected(&self, peer_id: &str) -> bool {
        self.sessions.read().await.contains_key(peer_id)
    }

    fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(&self.config.ws_path.clone(), get(ws_handler))
            .with_state(self)
    }

    pub async fn serve(self: Arc<Self>) -> NodeResult<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(addr = %self.config.listen_addr, path = %self.config.ws_path, "overlay transport listening");
        let router = self.clone().router().into_make_service_with_connect_info::<SocketAddr>();
        let shutdown = self.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }

    /// Cancel the listener, best-effort `disconnect` every live peer, then
    /// join every read/keepalive task.
    pub async fn stop(self: &Arc<Self>) {
        self.shutdown.cancel();

        let mut sessions = self.sessions.write().await;
        for (peer_id, session) in sessions.drain() {
            let disconnect = OverlayMessage::new(MessageType::Disconnect, self.manager.id(), peer_id, serde_json::json!({}));
            let _ = tokio::time::timeout(Duration::from_secs(2), session.conn.send(&disconnect)).await;
            session.conn.close(&self.registry).await;
            session.read_handle.abort();
            session.keepalive_handle.abort();
        }
    }

    /// Origin check for the WS upgrade: absent is fine (non-browser
    /// clients); present must name a loopback host.
    pub fn is_origin_allowed(origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(value) => value.contains("localhost") || value.contains("127.0.0.1") || value.contains("[::1]"),
        }
    }
}

async fn ws_handler(
    State(transport): State<Arc<Transport>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let origin = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok());
    if !Transport::is_origin_allowed(origin) {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    let max_message_size = transport.config.max_message_size;
    ws.max_message_size(max_message_size)
        .max_frame_size(max_message_size)
        .on_upgrade(move |socket| async move {
            transport.accept(socket, remote_addr).await;
        })
}
