//! Transport-wide message-id dedup table: drops replayed or looped envelopes
//! without closing the connection they arrived on.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use uuid::Uuid;

const TTL: Duration = Duration::from_secs(5 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct DedupTable {
    seen: Mutex<HashMap<Uuid, Instant>>,
}

impl DedupTable {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `id` was already seen within the TTL (caller should
    /// drop the message); otherwise records it as seen and returns `false`.
    pub async fn check_and_insert(&self, id: Uuid) -> bool {
        let mut seen = self.seen.lock().await;
        let now = Instant::now();
        if let Some(&seen_at) = seen.get(&id) {
            if now.duration_since(seen_at) < TTL {
                return true;
            }
        }
        seen.insert(id, now);
        false
    }

    pub async fn sweep(&self) {
        let mut seen = self.seen.lock().await;
        let now = Instant::now();
        seen.retain(|_, &mut seen_at| now.duration_since(seen_at) < TTL);
    }

    /// Spawn the periodic sweeper. The returned handle is owned by the
    /// transport and aborted on shutdown.
    pub fn spawn_sweeper(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }
}

impl Default for DedupTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_sighting_passes_repeat_is_dropped() {
        let table = DedupTable::new();
        let id = Uuid::new_v4();
        assert!(!table.check_and_insert(id).await);
        assert!(table.check_and_insert(id).await);
    }

    #[tokio::test]
    async fn distinct_ids_are_independent() {
        let table = DedupTable::new();
        assert!(!table.check_and_insert(Uuid::new_v4()).await);
        assert!(!table.check_and_insert(Uuid::new_v4()).await);
    }
}
