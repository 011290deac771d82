//! A live session with one peer: the socket, the derived shared secret, and
//! the bookkeeping the read/write loops and keepalive timer share.
//!
//! The socket is split into independent reader/writer halves at
//! construction (mirroring `tokio::io::split` in the teacher's own
//! encrypted-stream layer) so the read loop's blocking wait on the next
//! frame never holds the same lock an outbound `send` needs. Only the
//! writer is guarded by a mutex; the reader is touched exclusively by
//! whichever task currently owns the read side (the handshake code, then
//! `run_read_loop`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message as AxumMessage, WebSocket};
use base64::Engine as _;
use chacha20poly1305::Key;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::protocol::{Message as OverlayMessage, PingPayload};
use crate::registry::PeerRegistry;

use super::dedup::DedupTable;
use super::rate_limit::TokenBucket;
use super::seal;

pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const PONG_TIMEOUT: Duration = Duration::from_secs(10);
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Dialing,
    Handshaking,
    Active,
    Closing,
    Closed,
}

/// The two concrete transports a connection can ride on: an accepted axum
/// upgrade, or a dialed tokio-tungstenite client stream. Split into a
/// [`SocketReader`]/[`SocketWriter`] pair as soon as a [`PeerConnection`]
/// takes ownership of one.
pub enum Socket {
    Server(WebSocket),
    Client(ClientStream),
}

enum SocketReader {
    Server(SplitStream<WebSocket>),
    Client(SplitStream<ClientStream>),
}

enum SocketWriter {
    Server(SplitSink<WebSocket, AxumMessage>),
    Client(SplitSink<ClientStream, TungsteniteMessage>),
}

enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Closed,
}

impl Socket {
    fn split(self) -> (SocketReader, SocketWriter) {
        match self {
            Socket::Server(ws) => {
                let (sink, stream) = ws.split();
                (SocketReader::Server(stream), SocketWriter::Server(sink))
            }
            Socket::Client(ws) => {
                let (sink, stream) = ws.split();
                (SocketReader::Client(stream), SocketWriter::Client(sink))
            }
        }
    }
}

impl SocketReader {
    async fn recv_frame(&mut self) -> Option<Frame> {
        match self {
            SocketReader::Server(stream) => match stream.next().await {
                Some(Ok(AxumMessage::Text(t))) => Some(Frame::Text(t)),
                Some(Ok(AxumMessage::Binary(b))) => Some(Frame::Binary(b)),
                Some(Ok(AxumMessage::Close(_))) | None => Some(Frame::Closed),
                Some(Ok(_)) => None, // ping/pong handled by axum internally
                Some(Err(e)) => {
                    warn!("websocket read error: {e}");
                    Some(Frame::Closed)
                }
            },
            SocketReader::Client(stream) => match stream.next().await {
                Some(Ok(TungsteniteMessage::Text(t))) => Some(Frame::Text(t)),
                Some(Ok(TungsteniteMessage::Binary(b))) => Some(Frame::Binary(b)),
                Some(Ok(TungsteniteMessage::Close(_))) | None => Some(Frame::Closed),
                Some(Ok(_)) => None,
                Some(Err(e)) => {
                    warn!("websocket read error: {e}");
                    Some(Frame::Closed)
                }
            },
        }
    }
}

impl SocketWriter {
    async fn send_text(&mut self, text: String) -> std::io::Result<()> {
        match self {
            SocketWriter::Server(sink) => sink.send(AxumMessage::Text(text)).await.map_err(to_io_err),
            SocketWriter::Client(sink) => sink.send(TungsteniteMessage::Text(text)).await.map_err(to_io_err),
        }
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> std::io::Result<()> {
        match self {
            SocketWriter::Server(sink) => sink.send(AxumMessage::Binary(data)).await.map_err(to_io_err),
            SocketWriter::Client(sink) => sink.send(TungsteniteMessage::Binary(data)).await.map_err(to_io_err),
        }
    }

    /// Sends the close frame; this also tears down the paired reader half,
    /// so the read loop observes `Frame::Closed` on its next poll.
    async fn close(&mut self) {
        let _ = match self {
            SocketWriter::Server(sink) => sink.send(AxumMessage::Close(Some(CloseFrame { code: 1000, reason: "".into() }))).await,
            SocketWriter::Client(sink) => sink.send(TungsteniteMessage::Close(None)).await,
        };
    }
}

fn to_io_err<E: std::fmt::Display>(e: E) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

/// A single peer session. Owns its own read buffer (implicit in the socket),
/// rate-limit bucket, and write mutex — nothing here is shared across
/// connections. The reader and writer halves are locked independently so a
/// stalled read never blocks an outbound write.
pub struct PeerConnection {
    /// This node's own id, stamped as `from` on anything originated here
    /// (keepalive pings included) rather than on the application layer.
    local_id: String,
    /// The peer id as currently known; may be replaced once during the
    /// handshake if the responder's reported identity differs from a
    /// pre-configured value.
    pub peer_id: RwLock<String>,
    reader: Mutex<SocketReader>,
    writer: Mutex<SocketWriter>,
    shared_secret: RwLock<Option<Key>>,
    state: RwLock<ConnectionState>,
    last_activity: RwLock<Instant>,
    rate_limiter: Mutex<TokenBucket>,
    closed: AtomicBool,
}

impl PeerConnection {
    pub fn new(local_id: String, peer_id: String, socket: Socket, state: ConnectionState) -> Arc<Self> {
        let (reader, writer) = socket.split();
        Arc::new(Self {
            local_id,
            peer_id: RwLock::new(peer_id),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            shared_secret: RwLock::new(None),
            state: RwLock::new(state),
            last_activity: RwLock::new(Instant::now()),
            rate_limiter: Mutex::new(TokenBucket::default_peer_limit()),
            closed: AtomicBool::new(false),
        })
    }

    pub async fn install_shared_secret(&self, secret: [u8; 32]) {
        *self.shared_secret.write().await = Some(seal::key_from_shared_secret(&secret));
        *self.state.write().await = ConnectionState::Active;
    }

    pub async fn set_peer_id(&self, id: String) {
        *self.peer_id.write().await = id;
    }

    /// Base64 of the installed shared secret, used as the bundle-sealing
    /// password during a live `deploy` (§4.6).
    pub async fn shared_secret_base64(&self) -> Option<String> {
        self.shared_secret
            .read()
            .await
            .map(|key| base64::engine::general_purpose::STANDARD.encode(key.as_slice()))
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    /// Send a plaintext JSON frame. Used only for the handshake pair.
    pub async fn send_plaintext(&self, msg: &OverlayMessage) -> std::io::Result<()> {
        let json = serde_json::to_string(msg).map_err(to_io_err)?;
        let mut writer = self.writer.lock().await;
        tokio::time::timeout(WRITE_DEADLINE, writer.send_text(json))
            .await
            .map_err(to_io_err)?
    }

    /// Read exactly one plaintext JSON frame, rejecting oversized frames
    /// before parsing. Used only for the handshake pair, before the read
    /// loop takes ownership of the reader half.
    pub async fn recv_plaintext(&self, max_size: usize) -> std::io::Result<Option<OverlayMessage>> {
        let frame = {
            let mut reader = self.reader.lock().await;
            reader.recv_frame().await
        };
        match frame {
            Some(Frame::Text(text)) => {
                if text.len() > max_size {
                    return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "handshake frame too large"));
                }
                let msg = OverlayMessage::deserialize(text.as_bytes()).map_err(to_io_err)?;
                Ok(Some(msg))
            }
            Some(Frame::Binary(_)) => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected plaintext handshake frame")),
            Some(Frame::Closed) | None => Ok(None),
        }
    }

    /// Seal and send an application message under the per-connection write
    /// mutex, so on-wire order matches call order. Never contends with the
    /// read loop, which holds only the reader lock.
    pub async fn send(&self, msg: &OverlayMessage) -> std::io::Result<()> {
        let key = self
            .shared_secret
            .read()
            .await
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "no shared secret installed"))?;
        let plaintext = serde_json::to_vec(msg).map_err(to_io_err)?;
        let sealed = seal::seal(&key, &plaintext);
        let mut writer = self.writer.lock().await;
        tokio::time::timeout(WRITE_DEADLINE, writer.send_binary(sealed))
            .await
            .map_err(to_io_err)?
    }

    /// Idempotent close: best-effort `disconnect` notice already sent by the
    /// caller if desired, then tear down the socket and mark closing.
    pub async fn close(self: &Arc<Self>, registry: &Arc<PeerRegistry>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.state.write().await = ConnectionState::Closing;
        self.writer.lock().await.close().await;
        *self.state.write().await = ConnectionState::Closed;
        let peer_id = self.peer_id.read().await.clone();
        registry.set_connected(&peer_id, false).await;
    }

    /// Read loop: enforce the read deadline, the rate limiter, decrypt,
    /// dedup, and forward to `inbound`. Runs until the socket closes or the
    /// read deadline is exceeded. Holds only the reader lock, so `send` and
    /// the keepalive ping are never blocked behind a stalled read.
    pub async fn run_read_loop(
        self: Arc<Self>,
        dedup: Arc<DedupTable>,
        registry: Arc<PeerRegistry>,
        inbound: mpsc::Sender<OverlayMessage>,
    ) {
        let read_deadline = PING_INTERVAL + PONG_TIMEOUT;
        loop {
            let frame = {
                let mut reader = self.reader.lock().await;
                tokio::time::timeout(read_deadline, reader.recv_frame()).await
            };

            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => continue, // control frame handled transparently
                Err(_) => {
                    debug!("connection read deadline exceeded, closing");
                    break;
                }
            };

            match frame {
                Frame::Closed => break,
                Frame::Text(_) => {
                    // Only the handshake pair is plaintext, and that's
                    // handled before this loop starts; stray text frames on
                    // an active connection are ignored.
                }
                Frame::Binary(sealed) => {
                    self.touch().await;

                    if !self.rate_limiter.lock().await.try_acquire() {
                        continue; // drop, connection stays up
                    }

                    let key = match *self.shared_secret.read().await {
                        Some(key) => key,
                        None => continue,
                    };
                    let Some(plaintext) = seal::open(&key, &sealed) else {
                        continue; // decrypt failure: drop, don't close
                    };
                    let Ok(msg) = OverlayMessage::deserialize(&plaintext) else {
                        continue;
                    };

                    if dedup.check_and_insert(msg.id).await {
                        continue;
                    }

                    if inbound.send(msg).await.is_err() {
                        break; // dispatcher gone, connection is doomed
                    }
                }
            }
        }

        self.close(&registry).await;
    }

    /// Keepalive timer: sends `ping` on the interval; removes the
    /// connection if nothing has been heard in `pingInterval + pongTimeout`.
    /// Only ever takes the writer lock, so it runs freely while the read
    /// loop is parked waiting on the next frame.
    pub async fn run_keepalive(self: Arc<Self>, registry: Arc<PeerRegistry>) {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        loop {
            interval.tick().await;
            if self.closed.load(Ordering::Acquire) {
                break;
            }

            let elapsed = self.last_activity.read().await.elapsed();
            if elapsed > PING_INTERVAL + PONG_TIMEOUT {
                debug!("keepalive timeout, dropping connection");
                self.close(&registry).await;
                break;
            }

            let peer_id = self.peer_id.read().await.clone();
            let payload = PingPayload { sent_at: now_millis() };
            let ping = OverlayMessage::new(
                crate::protocol::MessageType::Ping,
                self.local_id.clone(),
                peer_id,
                serde_json::to_value(payload).expect("PingPayload always serializes"),
            );
            if self.send(&ping).await.is_err() {
                break;
            }
        }
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_deadline_is_ping_interval_plus_pong_timeout() {
        assert_eq!(PING_INTERVAL + PONG_TIMEOUT, Duration::from_secs(40));
    }
}
