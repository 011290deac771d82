//! Persistent, thread-safe peer registry: the set of known peers, the
//! selection index over them, and the admission allowlist.

mod allowlist;
mod kdtree;
mod peer;

pub use allowlist::AuthMode;
pub use peer::{Peer, DEFAULT_SCORE};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{NodeError, NodeResult};
use crate::identity::validate_name;
use allowlist::Allowlist;
use kdtree::{KdTree, Point};

const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);

struct State {
    /// Insertion order is preserved; the KD-tree's indices refer into this.
    peers: Vec<Peer>,
    index_by_id: HashMap<String, usize>,
    tree: KdTree,
}

impl State {
    fn empty() -> Self {
        Self {
            peers: Vec::new(),
            index_by_id: HashMap::new(),
            tree: KdTree::empty(),
        }
    }

    fn rebuild_tree(&mut self) {
        let points: Vec<Point> = self
            .peers
            .iter()
            .map(|p| Point::from_metrics(p.ping_ms, p.hops, p.geo_km, p.score))
            .collect();
        self.tree = KdTree::build(&points);
    }
}

/// Owns the peer set, the selection index, and the allowlist. Cheap to
/// clone (it's an `Arc` internally via [`PeerRegistry::open`]); the
/// debounced-save timer holds its own clone.
pub struct PeerRegistry {
    state: RwLock<State>,
    allowlist: RwLock<Allowlist>,
    path: PathBuf,
    debounce: Duration,
    dirty: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl PeerRegistry {
    /// Load peers from `path` if it exists, otherwise start empty. Returns
    /// an `Arc` because the debounced flush timer needs to outlive any
    /// single call and hold a reference back to the registry.
    pub fn open(path: impl Into<PathBuf>) -> NodeResult<Arc<Self>> {
        Self::open_with_debounce(path, DEFAULT_DEBOUNCE)
    }

    pub fn open_with_debounce(path: impl Into<PathBuf>, debounce: Duration) -> NodeResult<Arc<Self>> {
        let path = path.into();
        let mut state = State::empty();

        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let peers: Vec<Peer> = serde_json::from_str(&raw)
                .map_err(|e| NodeError::Corrupt(format!("peer registry: {e}")))?;
            for peer in peers {
                let idx = state.peers.len();
                state.index_by_id.insert(peer.id.clone(), idx);
                state.peers.push(peer);
            }
            state.rebuild_tree();
        }

        Ok(Arc::new(Self {
            state: RwLock::new(state),
            allowlist: RwLock::new(Allowlist::new()),
            path,
            debounce,
            dirty: AtomicBool::new(false),
            timer: Mutex::new(None),
        }))
    }

    pub async fn add_peer(self: &Arc<Self>, mut peer: Peer) -> NodeResult<()> {
        if peer.id.is_empty() {
            return Err(NodeError::InvalidKey("peer id must not be empty".into()));
        }
        validate_name(&peer.name).map_err(|e| NodeError::InvalidName(e.to_string()))?;

        {
            let mut state = self.state.write().await;
            if state.index_by_id.contains_key(&peer.id) {
                return Err(NodeError::AlreadyExists(format!("peer {} already registered", peer.id)));
            }
            peer.clamp_score();
            let idx = state.peers.len();
            state.index_by_id.insert(peer.id.clone(), idx);
            state.peers.push(peer);
            state.rebuild_tree();
        }
        self.schedule_save();
        Ok(())
    }

    pub async fn update_peer(self: &Arc<Self>, id: &str, mutate: impl FnOnce(&mut Peer)) -> NodeResult<()> {
        {
            let mut state = self.state.write().await;
            let idx = *state
                .index_by_id
                .get(id)
                .ok_or_else(|| NodeError::NotFound(format!("peer {id}")))?;
            mutate(&mut state.peers[idx]);
            state.peers[idx].clamp_score();
            state.rebuild_tree();
        }
        self.schedule_save();
        Ok(())
    }

    pub async fn remove_peer(self: &Arc<Self>, id: &str) -> NodeResult<()> {
        {
            let mut state = self.state.write().await;
            let idx = state
                .index_by_id
                .remove(id)
                .ok_or_else(|| NodeError::NotFound(format!("peer {id}")))?;
            state.peers.remove(idx);
            // Every index after the removed one shifted down by one.
            for (_, v) in state.index_by_id.iter_mut() {
                if *v > idx {
                    *v -= 1;
                }
            }
            state.rebuild_tree();
        }
        self.schedule_save();
        Ok(())
    }

    pub async fn update_metrics(self: &Arc<Self>, id: &str, ping_ms: f64, hops: u32, geo_km: f64) -> NodeResult<()> {
        self.update_peer(id, |p| {
            p.ping_ms = ping_ms;
            p.hops = hops;
            p.geo_km = geo_km;
        })
        .await
    }

    pub async fn update_score(self: &Arc<Self>, id: &str, score: f64) -> NodeResult<()> {
        self.update_peer(id, |p| p.score = score).await
    }

    /// Idempotent: setting `connected` on an absent peer is a no-op, not an
    /// error (the peer may have just been removed by another task).
    pub async fn set_connected(self: &Arc<Self>, id: &str, connected: bool) {
        let mut state = self.state.write().await;
        if let Some(&idx) = state.index_by_id.get(id) {
            state.peers[idx].connected = connected;
            if connected {
                state.peers[idx].last_seen = Utc::now();
            }
        }
    }

    pub async fn record_success(self: &Arc<Self>, id: &str) -> NodeResult<()> {
        self.update_peer(id, |p| p.record_success()).await
    }

    pub async fn record_failure(self: &Arc<Self>, id: &str) -> NodeResult<()> {
        self.update_peer(id, |p| p.record_failure()).await
    }

    pub async fn record_timeout(self: &Arc<Self>, id: &str) -> NodeResult<()> {
        self.update_peer(id, |p| p.record_timeout()).await
    }

    pub async fn get(&self, id: &str) -> Option<Peer> {
        let state = self.state.read().await;
        state.index_by_id.get(id).map(|&idx| state.peers[idx].clone())
    }

    pub async fn list(&self) -> Vec<Peer> {
        self.state.read().await.peers.clone()
    }

    /// The peer closest to the ideal point `(0,0,0,0)` in the weighted
    /// metric space, or `None` if the registry is empty.
    pub async fn select_optimal_peer(&self) -> Option<Peer> {
        let state = self.state.read().await;
        let idx = state.tree.nearest(&Point([0.0; 4]))?;
        Some(state.peers[idx].clone())
    }

    pub async fn select_nearest_peers(&self, n: usize) -> Vec<Peer> {
        let state = self.state.read().await;
        state
            .tree
            .nearest_n(&Point([0.0; 4]), n)
            .into_iter()
            .map(|idx| state.peers[idx].clone())
            .collect()
    }

    pub async fn set_auth_mode(&self, mode: AuthMode) {
        self.allowlist.write().await.set_mode(mode);
    }

    pub async fn allow_public_key(&self, public_key: impl Into<String>) {
        self.allowlist.write().await.allow(public_key);
    }

    pub async fn revoke_public_key(&self, public_key: &str) -> bool {
        self.allowlist.write().await.revoke(public_key)
    }

    pub async fn is_peer_allowed(&self, id: &str, public_key: &str) -> bool {
        let known = {
            let state = self.state.read().await;
            state.index_by_id.contains_key(id)
        };
        self.allowlist.read().await.is_allowed(known, public_key)
    }

    fn schedule_save(self: &Arc<Self>) {
        self.dirty.store(true, Ordering::Release);
        let this = self.clone();
        tokio::spawn(async move {
            let mut guard = this.timer.lock().await;
            if guard.is_some() {
                return; // a flush is already scheduled
            }
            let inner = this.clone();
            *guard = Some(tokio::spawn(async move {
                tokio::time::sleep(inner.debounce).await;
                *inner.timer.lock().await = None;
                if inner.dirty.swap(false, Ordering::AcqRel) {
                    if let Err(e) = inner.flush().await {
                        warn!("failed to flush peer registry: {e}");
                    }
                }
            }));
        });
    }

    /// Cancel any pending timer and flush synchronously if dirty.
    pub async fn close(self: &Arc<Self>) {
        if let Some(handle) = self.timer.lock().await.take() {
            handle.abort();
        }
        if self.dirty.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.flush().await {
                warn!("failed to flush peer registry on close: {e}");
            }
        }
    }

    async fn flush(&self) -> NodeResult<()> {
        let peers = self.state.read().await.peers.clone();
        let json = serde_json::to_string_pretty(&peers)
            .map_err(|e| NodeError::Corrupt(e.to_string()))?;
        debug!(count = peers.len(), path = %self.path.display(), "flushing peer registry");
        atomic_write(&self.path, json.as_bytes())
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> NodeResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        set_dir_mode(parent, 0o755)?;
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, data)?;
    set_file_mode(&tmp_path, 0o644)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_dir_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;
    use tempfile::tempdir;

    fn peer(id: &str, score: f64) -> Peer {
        let mut p = Peer::new(id, format!("node-{id}"), "pubkey", "127.0.0.1:9091", Role::Worker);
        p.score = score;
        p
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let registry = PeerRegistry::open(dir.path().join("peers.json")).unwrap();
        registry.add_peer(peer("a", 50.0)).await.unwrap();
        let fetched = registry.get("a").await.unwrap();
        assert_eq!(fetched.id, "a");
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let dir = tempdir().unwrap();
        let registry = PeerRegistry::open(dir.path().join("peers.json")).unwrap();
        registry.add_peer(peer("a", 50.0)).await.unwrap();
        let err = registry.add_peer(peer("a", 50.0)).await.unwrap_err();
        assert!(matches!(err, NodeError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn score_feedback_is_clamped() {
        let dir = tempdir().unwrap();
        let registry = PeerRegistry::open(dir.path().join("peers.json")).unwrap();
        registry.add_peer(peer("a", 99.5)).await.unwrap();
        registry.record_success("a").await.unwrap();
        registry.record_success("a").await.unwrap();
        let p = registry.get("a").await.unwrap();
        assert_eq!(p.score, 100.0);

        for _ in 0..30 {
            registry.record_failure("a").await.unwrap();
        }
        let p = registry.get("a").await.unwrap();
        assert_eq!(p.score, 0.0);
    }

    #[tokio::test]
    async fn select_optimal_prefers_best_metrics() {
        let dir = tempdir().unwrap();
        let registry = PeerRegistry::open(dir.path().join("peers.json")).unwrap();
        registry.add_peer(peer("slow", 50.0)).await.unwrap();
        registry.update_metrics("slow", 300.0, 5, 4000.0).await.unwrap();
        registry.add_peer(peer("fast", 90.0)).await.unwrap();
        registry.update_metrics("fast", 5.0, 0, 10.0).await.unwrap();

        let best = registry.select_optimal_peer().await.unwrap();
        assert_eq!(best.id, "fast");
    }

    #[tokio::test]
    async fn remove_then_rebuild_keeps_indices_consistent() {
        let dir = tempdir().unwrap();
        let registry = PeerRegistry::open(dir.path().join("peers.json")).unwrap();
        registry.add_peer(peer("a", 50.0)).await.unwrap();
        registry.add_peer(peer("b", 50.0)).await.unwrap();
        registry.remove_peer("a").await.unwrap();
        assert!(registry.get("a").await.is_none());
        assert!(registry.get("b").await.is_some());
    }

    #[tokio::test]
    async fn close_flushes_dirty_state_to_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peers.json");
        let registry = PeerRegistry::open(&path).unwrap();
        registry.add_peer(peer("a", 50.0)).await.unwrap();
        registry.close().await;

        let reloaded = PeerRegistry::open(&path).unwrap();
        assert!(reloaded.get("a").await.is_some());
    }

    #[tokio::test]
    async fn allowlist_gates_unknown_peers() {
        let dir = tempdir().unwrap();
        let registry = PeerRegistry::open(dir.path().join("peers.json")).unwrap();
        registry.set_auth_mode(AuthMode::Allowlist).await;
        assert!(!registry.is_peer_allowed("unknown", "key").await);
        registry.allow_public_key("key").await;
        assert!(registry.is_peer_allowed("unknown", "key").await);
    }
}
