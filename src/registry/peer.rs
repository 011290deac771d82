//! The persisted `Peer` record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::Role;

pub const DEFAULT_SCORE: f64 = 50.0;

/// A known remote node. `connected` is transient — never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub name: String,
    pub public_key: String, // base64
    pub address: String,    // host:port of the peer's overlay listener
    pub role: Role,
    pub added_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,

    #[serde(skip, default)]
    pub connected: bool,

    #[serde(default)]
    pub ping_ms: f64,
    #[serde(default)]
    pub hops: u32,
    #[serde(default)]
    pub geo_km: f64,
    #[serde(default = "default_score")]
    pub score: f64,
}

fn default_score() -> f64 {
    DEFAULT_SCORE
}

impl Peer {
    pub fn new(id: impl Into<String>, name: impl Into<String>, public_key: impl Into<String>, address: impl Into<String>, role: Role) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            public_key: public_key.into(),
            address: address.into(),
            role,
            added_at: now,
            last_seen: now,
            connected: false,
            ping_ms: 0.0,
            hops: 0,
            geo_km: 0.0,
            score: DEFAULT_SCORE,
        }
    }

    pub fn clamp_score(&mut self) {
        self.score = self.score.clamp(0.0, 100.0);
    }

    pub fn record_success(&mut self) {
        self.score += 1.0;
        self.clamp_score();
    }

    pub fn record_failure(&mut self) {
        self.score -= 5.0;
        self.clamp_score();
        self.last_seen = Utc::now();
    }

    pub fn record_timeout(&mut self) {
        self.score -= 3.0;
        self.clamp_score();
        self.last_seen = Utc::now();
    }
}
