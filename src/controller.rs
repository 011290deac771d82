//! Controller: initiates requests against peers, correlates replies by
//! envelope id, and aggregates across the fleet. §4.5.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{oneshot, RwLock};
use uuid::Uuid;

use crate::error::{NodeError, NodeResult};
use crate::identity::NodeManager;
use crate::protocol::{
    self, DeployAckPayload, DeployPayload, GetLogsPayload, GetStatsPayload, LogsPayload, Message as OverlayMessage,
    MessageType, MinerAckPayload, PingPayload, PongPayload, ProtocolError, StartMinerPayload, StatsPayload,
    StopMinerPayload,
};
use crate::registry::PeerRegistry;
use crate::transport::Transport;

pub const PING_TIMEOUT: Duration = Duration::from_secs(5);
pub const GET_STATS_TIMEOUT: Duration = Duration::from_secs(10);
pub const GET_LOGS_TIMEOUT: Duration = Duration::from_secs(10);
pub const MINER_OP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEPLOY_TIMEOUT: Duration = Duration::from_secs(60);

/// Tracks in-flight requests this node has sent and is waiting on a reply
/// for, keyed by the request's envelope id.
pub struct Controller {
    manager: Arc<NodeManager>,
    registry: Arc<PeerRegistry>,
    transport: Arc<Transport>,
    pending: RwLock<HashMap<Uuid, oneshot::Sender<OverlayMessage>>>,
}

impl Controller {
    pub fn new(manager: Arc<NodeManager>, registry: Arc<PeerRegistry>, transport: Arc<Transport>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            registry,
            transport,
            pending: RwLock::new(HashMap::new()),
        })
    }

    /// Hand a reply message to its waiter, if one is still registered.
    /// Returns `false` if no pending entry matched (late reply, already
    /// timed out and cleaned up — dropped per §5).
    pub async fn deliver_reply(&self, msg: OverlayMessage) -> bool {
        let Some(reply_to) = msg.reply_to else { return false };
        let sender = self.pending.write().await.remove(&reply_to);
        match sender {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Resolve (dialing if necessary) the live connection for `peer_id`,
    /// per §4.5 step 1. Returns the connection's canonical peer id, which
    /// may differ from `peer_id` if the handshake substituted it.
    async fn resolve_connection(&self, peer_id: &str) -> NodeResult<Arc<crate::transport::PeerConnection>> {
        if let Some(conn) = self.transport.connection(peer_id).await {
            return Ok(conn);
        }
        let peer = self
            .registry
            .get(peer_id)
            .await
            .ok_or_else(|| NodeError::NotFound(format!("peer {peer_id}")))?;
        self.transport.connect(&peer).await
    }

    /// Send `payload` as `kind` to `to`, wait up to `timeout` for a reply,
    /// and report the outcome to the registry's score-feedback loop.
    async fn request_raw(&self, to: &str, kind: MessageType, payload: Value, timeout: Duration) -> NodeResult<OverlayMessage> {
        let conn = self.resolve_connection(to).await?;
        let canonical_to = conn.peer_id.read().await.clone();

        let msg = OverlayMessage::new(kind, self.manager.id(), canonical_to.clone(), payload);

        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(msg.id, tx);

        let send_result = conn.send(&msg).await;
        if let Err(e) = send_result {
            self.pending.write().await.remove(&msg.id);
            let _ = self.registry.record_failure(&canonical_to).await;
            return Err(NodeError::Io(e));
        }

        let outcome = tokio::time::timeout(timeout, rx).await;
        self.pending.write().await.remove(&msg.id);

        match outcome {
            Ok(Ok(reply)) => {
                if reply.kind == MessageType::Error {
                    let _ = self.registry.record_failure(&canonical_to).await;
                } else {
                    let _ = self.registry.record_success(&canonical_to).await;
                }
                Ok(reply)
            }
            Ok(Err(_)) => {
                // Sender dropped without a reply: the connection died mid-flight.
                let _ = self.registry.record_failure(&canonical_to).await;
                Err(NodeError::Protocol(ProtocolError::operation_failed(
                    "connection closed before a reply arrived",
                )))
            }
            Err(_) => {
                let _ = self.registry.record_timeout(&canonical_to).await;
                Err(NodeError::Protocol(ProtocolError::timeout(format!(
                    "no reply from {canonical_to} within {timeout:?}"
                ))))
            }
        }
    }

    async fn request<T: DeserializeOwned>(&self, to: &str, kind: MessageType, payload: Value, expected: MessageType, timeout: Duration) -> NodeResult<T> {
        let reply = self.request_raw(to, kind, payload, timeout).await?;
        protocol::validate_response(Some(&reply), expected).map_err(NodeError::Protocol)
    }

    /// Round-trip a `ping`; updates the peer's `pingMs` metric with the
    /// measured RTT.
    pub async fn ping_peer(&self, peer_id: &str) -> NodeResult<Duration> {
        let sent_at = now_millis();
        let started = Instant::now();
        let ping = serde_json::to_value(PingPayload { sent_at }).expect("PingPayload always serializes");
        let _pong: PongPayload = self
            .request(peer_id, MessageType::Ping, ping, MessageType::Pong, PING_TIMEOUT)
            .await?;
        let rtt = started.elapsed();
        let _ = self.registry.update_metrics(peer_id, rtt.as_secs_f64() * 1000.0, 0, 0.0).await;
        Ok(rtt)
    }

    pub async fn get_stats(&self, peer_id: &str) -> NodeResult<StatsPayload> {
        self.request(
            peer_id,
            MessageType::GetStats,
            serde_json::to_value(GetStatsPayload::default()).expect("GetStatsPayload always serializes"),
            MessageType::Stats,
            GET_STATS_TIMEOUT,
        )
        .await
    }

    /// Fan out `get_stats` in parallel across every connected peer. Skips
    /// peers whose request fails rather than failing the whole call.
    pub async fn get_all_stats(self: &Arc<Self>) -> Vec<(String, StatsPayload)> {
        let peers = self.registry.list().await;
        let live: Vec<String> = {
            let mut out = Vec::new();
            for peer in peers {
                if self.transport.is_connected(&peer.id).await {
                    out.push(peer.id);
                }
            }
            out
        };

        let handles: Vec<_> = live
            .into_iter()
            .map(|peer_id| {
                let this = self.clone();
                tokio::spawn(async move {
                    let stats = this.get_stats(&peer_id).await.ok();
                    stats.map(|s| (peer_id, s))
                })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            if let Ok(Some(pair)) = handle.await {
                results.push(pair);
            }
        }
        results
    }

    pub async fn get_total_hashrate(self: &Arc<Self>) -> f64 {
        self.get_all_stats()
            .await
            .iter()
            .flat_map(|(_, stats)| stats.miners.iter())
            .map(|m| m.hashrate)
            .sum()
    }

    pub async fn start_miner(&self, peer_id: &str, miner_type: &str, profile_id: Option<String>, config_override: Option<Value>) -> NodeResult<MinerAckPayload> {
        let payload = StartMinerPayload {
            miner_type: miner_type.to_string(),
            profile_id,
            config_override,
        };
        self.request(
            peer_id,
            MessageType::StartMiner,
            serde_json::to_value(payload).expect("StartMinerPayload always serializes"),
            MessageType::MinerAck,
            MINER_OP_TIMEOUT,
        )
        .await
    }

    pub async fn stop_miner(&self, peer_id: &str, miner_name: &str) -> NodeResult<MinerAckPayload> {
        let payload = StopMinerPayload { miner_name: miner_name.to_string() };
        self.request(
            peer_id,
            MessageType::StopMiner,
            serde_json::to_value(payload).expect("StopMinerPayload always serializes"),
            MessageType::MinerAck,
            MINER_OP_TIMEOUT,
        )
        .await
    }

    pub async fn get_logs(&self, peer_id: &str, miner_name: &str, lines: u32) -> NodeResult<LogsPayload> {
        let payload = GetLogsPayload { miner_name: miner_name.to_string(), lines };
        self.request(
            peer_id,
            MessageType::GetLogs,
            serde_json::to_value(payload).expect("GetLogsPayload always serializes"),
            MessageType::Logs,
            GET_LOGS_TIMEOUT,
        )
        .await
    }

    pub async fn deploy(&self, peer_id: &str, payload: DeployPayload) -> NodeResult<DeployAckPayload> {
        self.request(
            peer_id,
            MessageType::Deploy,
            serde_json::to_value(payload).expect("DeployPayload always serializes"),
            MessageType::DeployAck,
            DEPLOY_TIMEOUT,
        )
        .await
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
    fn timeouts_match_documented_defaults() {
        assert_eq!(PING_TIMEOUT, Duration::from_secs(5));
        assert_eq!(GET_STATS_TIMEOUT, Duration::from_secs(10));
        assert_eq!(GET_LOGS_TIMEOUT, Duration::from_secs(10));
        assert_eq!(MINER_OP_TIMEOUT, Duration::from_secs(30));
        assert_eq!(DEPLOY_TIMEOUT, Duration::from_secs(60));
    }
}
