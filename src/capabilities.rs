//! The external collaborators the worker drives: the miner process
//! supervisor and the profile store. Both are out of scope (§1) and
//! specified here only as the capability traits the worker consumes.
//!
//! Production wiring plugs in real implementations backed by the miner
//! supervisor and profile store processes; [`InMemoryMinerManager`] and
//! [`InMemoryProfileManager`] exist so the worker and its dispatch logic can
//! be exercised without those external processes.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::MinerStatsItem;

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("miner not found: {0}")]
    MinerNotFound(String),
    #[error("profile not found: {0}")]
    ProfileNotFound(String),
    #[error("{0}")]
    OperationFailed(String),
}

pub type CapabilityResult<T> = Result<T, CapabilityError>;

/// Everything the worker needs from the miner process supervisor.
#[async_trait]
pub trait MinerManager: Send + Sync {
    /// Enumerate currently known miners and their live stats.
    async fn list_miners(&self) -> CapabilityResult<Vec<MinerStatsItem>>;

    /// Start a miner of `miner_type` with the given config, returning the
    /// name assigned to the running instance.
    async fn start_miner(&self, miner_type: &str, config: Value) -> CapabilityResult<String>;

    async fn stop_miner(&self, miner_name: &str) -> CapabilityResult<()>;

    /// Most recent console history for `miner_name`, newest last, at most
    /// `lines` entries.
    async fn console_history(&self, miner_name: &str, lines: u32) -> CapabilityResult<Vec<String>>;
}

/// Everything the worker needs from the profile store.
#[async_trait]
pub trait ProfileManager: Send + Sync {
    /// Resolve a profile id into the JSON config a miner expects.
    async fn resolve_config(&self, profile_id: &str) -> CapabilityResult<Value>;

    /// Persist a profile deployed via a `profile` bundle. `profile` is
    /// already-parsed JSON; the store assigns or reuses an id as it sees fit.
    async fn save_profile(&self, profile: Value) -> CapabilityResult<()>;
}

/// Trivial in-memory [`MinerManager`] used by tests and as a harmless
/// default when no real supervisor is wired up.
#[derive(Default)]
pub struct InMemoryMinerManager {
    miners: tokio::sync::RwLock<std::collections::HashMap<String, MinerState>>,
}

struct MinerState {
    stats: MinerStatsItem,
    console: Vec<String>,
}

impl InMemoryMinerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a running miner directly, bypassing `start_miner` — used by
    /// tests that want to assert on `get_stats`/`get_logs` without also
    /// exercising the start path.
    pub async fn seed(&self, stats: MinerStatsItem, console: Vec<String>) {
        self.miners
            .write()
            .await
            .insert(stats.name.clone(), MinerState { stats, console });
    }
}

#[async_trait]
impl MinerManager for InMemoryMinerManager {
    async fn list_miners(&self) -> CapabilityResult<Vec<MinerStatsItem>> {
        Ok(self.miners.read().await.values().map(|m| m.stats.clone()).collect())
    }

    async fn start_miner(&self, miner_type: &str, _config: Value) -> CapabilityResult<String> {
        let mut miners = self.miners.write().await;
        let name = format!("{miner_type}-{}", miners.len());
        miners.insert(
            name.clone(),
            MinerState {
                stats: MinerStatsItem {
                    name: name.clone(),
                    hashrate: 0.0,
                    shares: 0,
                    rejected: 0,
                    uptime: 0,
                },
                console: Vec::new(),
            },
        );
        Ok(name)
    }

    async fn stop_miner(&self, miner_name: &str) -> CapabilityResult<()> {
        self.miners
            .write()
            .await
            .remove(miner_name)
            .map(|_| ())
            .ok_or_else(|| CapabilityError::MinerNotFound(miner_name.to_string()))
    }

    async fn console_history(&self, miner_name: &str, lines: u32) -> CapabilityResult<Vec<String>> {
        let miners = self.miners.read().await;
        let miner = miners
            .get(miner_name)
            .ok_or_else(|| CapabilityError::MinerNotFound(miner_name.to_string()))?;
        let take = lines as usize;
        let start = miner.console.len().saturating_sub(take);
        Ok(miner.console[start..].to_vec())
    }
}

/// Trivial in-memory [`ProfileManager`].
#[derive(Default)]
pub struct InMemoryProfileManager {
    profiles: tokio::sync::RwLock<std::collections::HashMap<String, Value>>,
}

impl InMemoryProfileManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileManager for InMemoryProfileManager {
    async fn resolve_config(&self, profile_id: &str) -> CapabilityResult<Value> {
        self.profiles
            .read()
            .await
            .get(profile_id)
            .cloned()
            .ok_or_else(|| CapabilityError::ProfileNotFound(profile_id.to_string()))
    }

    async fn save_profile(&self, profile: Value) -> CapabilityResult<()> {
        let id = profile
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.profiles.write().await.insert(id, profile);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_then_stop_miner() {
        let manager = InMemoryMinerManager::new();
        let name = manager.start_miner("xmrig", Value::Null).await.unwrap();
        assert_eq!(manager.list_miners().await.unwrap().len(), 1);
        manager.stop_miner(&name).await.unwrap();
        assert!(manager.list_miners().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn console_history_is_tail_clamped() {
        let manager = InMemoryMinerManager::new();
        let stats = MinerStatsItem { name: "xmrig-0".into(), hashrate: 1.0, shares: 0, rejected: 0, uptime: 0 };
        let console: Vec<String> = (0..10).map(|i| format!("line {i}")).collect();
        manager.seed(stats, console).await;

        let tail = manager.console_history("xmrig-0", 3).await.unwrap();
        assert_eq!(tail, vec!["line 7", "line 8", "line 9"]);
    }

    #[tokio::test]
    async fn resolve_missing_profile_errors() {
        let profiles = InMemoryProfileManager::new();
        let err = profiles.resolve_config("missing").await.unwrap_err();
        assert!(matches!(err, CapabilityError::ProfileNotFound(_)));
    }

    #[tokio::test]
    async fn save_then_resolve_round_trips() {
        let profiles = InMemoryProfileManager::new();
        let profile = serde_json::json!({"name": "p1", "minerType": "xmrig", "config": {"pool": "p.example:3333"}});
        profiles.save_profile(profile.clone()).await.unwrap();
        let resolved = profiles.resolve_config("p1").await.unwrap();
        assert_eq!(resolved, profile);
    }
}
