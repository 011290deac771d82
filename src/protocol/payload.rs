//! Payload catalog: one shape per [`MessageType`](super::MessageType), fixed
//! and enumerated as required by §4.2.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Highest line count `GetLogsPayload::lines` is clamped to.
pub const MAX_LOG_LINES: u32 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePayload {
    pub identity: IdentityBlob,
    /// 16+ random bytes, base64-encoded.
    pub challenge: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAckPayload {
    pub identity: IdentityBlob,
    /// MAC(challenge) under the newly derived shared secret, base64.
    pub challenge_response: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Identity as carried inside a handshake message (not the on-disk record).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityBlob {
    pub id: String,
    pub name: String,
    pub public_key: String, // base64
    pub role: crate::identity::Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    pub sent_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    pub sent_at: u64,
    pub received_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMinerPayload {
    pub miner_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_override: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopMinerPayload {
    pub miner_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinerAckPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub miner_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetStatsPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinerStatsItem {
    pub name: String,
    pub hashrate: f64,
    pub shares: u64,
    pub rejected: u64,
    pub uptime: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsPayload {
    pub node_id: String,
    pub node_name: String,
    pub miners: Vec<MinerStatsItem>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLogsPayload {
    pub miner_name: String,
    pub lines: u32,
}

impl GetLogsPayload {
    /// Clamp into `(0, MAX_LOG_LINES]`, per §8 boundary behavior.
    pub fn clamped_lines(&self) -> u32 {
        if self.lines == 0 || self.lines > MAX_LOG_LINES {
            MAX_LOG_LINES
        } else {
            self.lines
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsPayload {
    pub miner_name: String,
    pub lines: Vec<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleType {
    Profile,
    Miner,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployPayload {
    pub bundle_type: BundleType,
    pub name: String,
    /// Sealed blob, base64.
    pub data: String,
    /// Hex SHA-256 of the raw (un-base64'd) sealed blob.
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployAckPayload {
    pub success: bool,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub use super::error::ErrorPayload;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_zero_and_overflow() {
        let p = GetLogsPayload {
            miner_name: "x".into(),
            lines: 0,
        };
        assert_eq!(p.clamped_lines(), MAX_LOG_LINES);

        let p = GetLogsPayload {
            miner_name: "x".into(),
            lines: 50_000,
        };
        assert_eq!(p.clamped_lines(), MAX_LOG_LINES);

        let p = GetLogsPayload {
            miner_name: "x".into(),
            lines: 42,
        };
        assert_eq!(p.clamped_lines(), 42);
    }
}
