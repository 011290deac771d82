//! Worker: handles inbound requests by invoking local capabilities and
//! replying. §4.6.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Instant;

use base64::Engine as _;
use serde_json::Value;
use tracing::warn;

use crate::bundles::{self, Bundle};
use crate::capabilities::{CapabilityError, MinerManager, ProfileManager};
use crate::identity::NodeManager;
use crate::protocol::{
    self, BundleType, DeployAckPayload, DeployPayload, ErrorCode, GetLogsPayload, LogsPayload, Message as OverlayMessage,
    MessageType, MinerAckPayload, PingPayload, PongPayload, ProtocolError, StartMinerPayload, StatsPayload,
    StopMinerPayload,
};
use crate::transport::PeerConnection;

/// Handles non-reply inbound messages. Holds weak references to the miner
/// and profile capabilities (§3 ownership) so a dual-role node's worker
/// never keeps those collaborators alive past their owner.
pub struct Worker {
    manager: Arc<NodeManager>,
    miner_manager: Weak<dyn MinerManager>,
    profile_manager: Weak<dyn ProfileManager>,
    install_dir: PathBuf,
    started_at: Instant,
}

impl Worker {
    pub fn new(
        manager: Arc<NodeManager>,
        miner_manager: &Arc<dyn MinerManager>,
        profile_manager: &Arc<dyn ProfileManager>,
        install_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            manager,
            miner_manager: Arc::downgrade(miner_manager),
            profile_manager: Arc::downgrade(profile_manager),
            install_dir: install_dir.into(),
            started_at: Instant::now(),
        }
    }

    fn miner_manager(&self) -> Result<Arc<dyn MinerManager>, CapabilityError> {
        self.miner_manager
            .upgrade()
            .ok_or_else(|| CapabilityError::OperationFailed("miner manager is no longer available".into()))
    }

    fn profile_manager(&self) -> Result<Arc<dyn ProfileManager>, CapabilityError> {
        self.profile_manager
            .upgrade()
            .ok_or_else(|| CapabilityError::OperationFailed("profile manager is no longer available".into()))
    }

    /// Dispatch a single inbound request and send the reply (or error)
    /// over `conn`. Unknown message types are ignored, per §4.6.
    pub async fn handle(&self, conn: &Arc<PeerConnection>, msg: &OverlayMessage) {
        let reply = match msg.kind {
            MessageType::Ping => Some(self.handle_ping(msg)),
            MessageType::GetStats => Some(self.handle_get_stats(msg).await),
            MessageType::StartMiner => Some(self.handle_start_miner(msg).await),
            MessageType::StopMiner => Some(self.handle_stop_miner(msg).await),
            MessageType::GetLogs => Some(self.handle_get_logs(msg).await),
            MessageType::Deploy => Some(self.handle_deploy(msg, conn).await),
            MessageType::Disconnect => None,
            _ => {
                warn!(kind = ?msg.kind, "worker ignoring message of unexpected type");
                None
            }
        };

        if let Some(reply) = reply {
            if let Err(e) = conn.send(&reply).await {
                warn!("failed to send reply to {}: {e}", msg.from);
            }
        }
    }

    fn handle_ping(&self, msg: &OverlayMessage) -> OverlayMessage {
        let ping: Result<PingPayload, ProtocolError> = protocol::parse_payload(&msg.payload);
        let sent_at = ping.map(|p| p.sent_at).unwrap_or(0);
        let pong = PongPayload { sent_at, received_at: now_millis() };
        msg.reply(MessageType::Pong, self.manager.id(), serde_json::to_value(pong).expect("PongPayload always serializes"))
    }

    async fn handle_get_stats(&self, msg: &OverlayMessage) -> OverlayMessage {
        match self.collect_stats().await {
            Ok(stats) => msg.reply(MessageType::Stats, self.manager.id(), serde_json::to_value(stats).expect("StatsPayload always serializes")),
            Err(e) => self.error_reply(msg, ErrorCode::OperationFailed, e.to_string()),
        }
    }

    async fn collect_stats(&self) -> Result<StatsPayload, CapabilityError> {
        let miners = self.miner_manager()?.list_miners().await?;
        let record = self.manager.record();
        Ok(StatsPayload {
            node_id: record.id.clone(),
            node_name: record.name.clone(),
            miners,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        })
    }

    async fn handle_start_miner(&self, msg: &OverlayMessage) -> OverlayMessage {
        let request: StartMinerPayload = match protocol::parse_payload(&msg.payload) {
            Ok(p) => p,
            Err(e) => return self.error_reply(msg, ErrorCode::InvalidMessage, e.to_string()),
        };

        if request.miner_type.trim().is_empty() {
            return self.error_reply(msg, ErrorCode::InvalidMessage, "minerType must not be empty");
        }

        match self.start_miner(request).await {
            Ok(miner_name) => self.ack(msg, MinerAckPayload { success: true, miner_name: Some(miner_name), error: None }),
            Err(e) => self.ack(msg, MinerAckPayload { success: false, miner_name: None, error: Some(e.to_string()) }),
        }
    }

    async fn start_miner(&self, request: StartMinerPayload) -> Result<String, CapabilityError> {
        let config = if let Some(inline) = request.config_override {
            inline
        } else if let Some(profile_id) = &request.profile_id {
            self.profile_manager()?.resolve_config(profile_id).await?
        } else {
            Value::Null
        };
        self.miner_manager()?.start_miner(&request.miner_type, config).await
    }

    async fn handle_stop_miner(&self, msg: &OverlayMessage) -> OverlayMessage {
        let request: StopMinerPayload = match protocol::parse_payload(&msg.payload) {
            Ok(p) => p,
            Err(e) => return self.error_reply(msg, ErrorCode::InvalidMessage, e.to_string()),
        };

        let result = async {
            self.miner_manager()?.stop_miner(&request.miner_name).await
        }
        .await;

        match result {
            Ok(()) => self.ack(msg, MinerAckPayload { success: true, miner_name: Some(request.miner_name), error: None }),
            Err(e) => self.ack(msg, MinerAckPayload { success: false, miner_name: Some(request.miner_name), error: Some(e.to_string()) }),
        }
    }

    fn ack(&self, msg: &OverlayMessage, payload: MinerAckPayload) -> OverlayMessage {
        msg.reply(MessageType::MinerAck, self.manager.id(), serde_json::to_value(payload).expect("MinerAckPayload always serializes"))
    }

    async fn handle_get_logs(&self, msg: &OverlayMessage) -> OverlayMessage {
        let request: GetLogsPayload = match protocol::parse_payload(&msg.payload) {
            Ok(p) => p,
            Err(e) => return self.error_reply(msg, ErrorCode::InvalidMessage, e.to_string()),
        };

        let clamped = request.clamped_lines();
        let result = async {
            self.miner_manager()?.console_history(&request.miner_name, clamped).await
        }
        .await;

        match result {
            Ok(lines) => {
                let has_more = lines.len() as u32 >= clamped;
                let payload = LogsPayload { miner_name: request.miner_name, lines, has_more };
                msg.reply(MessageType::Logs, self.manager.id(), serde_json::to_value(payload).expect("LogsPayload always serializes"))
            }
            Err(e) => self.error_reply(msg, ErrorCode::NotFound, e.to_string()),
        }
    }

    async fn handle_deploy(&self, msg: &OverlayMessage, conn: &Arc<PeerConnection>) -> OverlayMessage {
        let request: DeployPayload = match protocol::parse_payload(&msg.payload) {
            Ok(p) => p,
            Err(e) => return self.error_reply(msg, ErrorCode::InvalidMessage, e.to_string()),
        };

        match self.deploy(request.clone(), conn).await {
            Ok(()) => self.deploy_ack(msg, request.name, true, None),
            Err(e) => self.deploy_ack(msg, request.name, false, Some(e.to_string())),
        }
    }

    async fn deploy(&self, request: DeployPayload, conn: &Arc<PeerConnection>) -> Result<(), CapabilityError> {
        let password = conn
            .shared_secret_base64()
            .await
            .ok_or_else(|| CapabilityError::OperationFailed("no shared secret installed on this connection".into()))?;

        let data = base64::engine::general_purpose::STANDARD
            .decode(&request.data)
            .map_err(|e| CapabilityError::OperationFailed(format!("bad bundle data encoding: {e}")))?;
        let bundle = Bundle {
            bundle_type: request.bundle_type,
            name: request.name.clone(),
            data,
            checksum: request.checksum.clone(),
        };

        match bundle.bundle_type {
            BundleType::Profile => {
                let profile = bundles::extract_profile_bundle(&bundle, &password)
                    .map_err(|e| CapabilityError::OperationFailed(e.to_string()))?;
                self.profile_manager()?.save_profile(profile).await
            }
            BundleType::Miner | BundleType::Full => {
                let extraction = bundles::extract_miner_bundle(&bundle, &password, &self.install_dir)
                    .map_err(|e| CapabilityError::OperationFailed(e.to_string()))?;
                if let Some(profile) = extraction.embedded_profile {
                    // Best-effort: a failure to save the embedded profile
                    // doesn't fail the deploy itself.
                    if let Ok(profiles) = self.profile_manager() {
                        let _ = profiles.save_profile(profile).await;
                    }
                }
                Ok(())
            }
        }
    }

    fn deploy_ack(&self, msg: &OverlayMessage, name: String, success: bool, error: Option<String>) -> OverlayMessage {
        let payload = DeployAckPayload { success, name, error };
        msg.reply(MessageType::DeployAck, self.manager.id(), serde_json::to_value(payload).expect("DeployAckPayload always serializes"))
    }

    fn error_reply(&self, msg: &OverlayMessage, code: ErrorCode, message: impl Into<String>) -> OverlayMessage {
        let err = ProtocolError::new(code, message).into_payload();
        msg.reply(MessageType::Error, self.manager.id(), serde_json::to_value(err).expect("ErrorPayload always serializes"))
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
