use serde::{Deserialize, Serialize};

/// Owner-controlled activation state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Paused,
}

impl KeyStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::Active => Self::Paused,
            Self::Paused => Self::Active,
        }
    }
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored in redb as bincode-encoded bytes, keyed by `key_id`.
/// Timestamps are Unix microseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_id: String,
    pub owner_email: String,
    /// Hardware ID the key is bound to. `None` until the first successful validation.
    pub hwid: Option<String>,
    pub status: KeyStatus,
    pub created_at: i64,
    /// After this instant (inclusive) the key is rejected regardless of status.
    pub expires_at: Option<i64>,
    /// Days between creation and `expires_at`; 0 for perpetual keys.
    pub duration_days: u32,
}

impl KeyRecord {
    /// Returns true if the key has reached its expiry instant.
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }

    /// A key is live when it is active and not expired.
    pub fn is_live(&self, now: i64) -> bool {
        self.status == KeyStatus::Active && !self.is_expired(now)
    }
}
