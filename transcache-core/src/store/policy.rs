//! Expiration policies and the sidecar record that carries them.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// When a committed entry stops being worth keeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpirationPolicy {
    /// Expires once it has not been read for `window_secs`.
    Sliding { window_secs: u64 },
    /// Expires at a fixed instant regardless of use.
    Absolute { deadline: DateTime<Utc> },
}

impl ExpirationPolicy {
    pub fn sliding(window: Duration) -> Self {
        Self::Sliding {
            window_secs: window.as_secs(),
        }
    }

    /// Absolute policy expiring `lifetime` from now.
    pub fn absolute_after(lifetime: Duration) -> Self {
        let deadline = TimeDelta::from_std(lifetime)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self::Absolute { deadline }
    }

    pub fn is_sliding(&self) -> bool {
        matches!(self, Self::Sliding { .. })
    }
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self::sliding(Duration::from_secs(24 * 60 * 60))
    }
}

/// Persisted next to each committed blob. Its presence is what makes the
/// blob visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub policy: ExpirationPolicy,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

impl PolicyRecord {
    pub fn new(policy: ExpirationPolicy, now: DateTime<Utc>) -> Self {
        Self {
            policy,
            created_at: now,
            last_access: now,
        }
    }

    /// Records a read. Returns whether the record changed and needs saving.
    pub fn touch(&mut self, now: DateTime<Utc>) -> bool {
        if self.policy.is_sliding() && now > self.last_access {
            self.last_access = now;
            return true;
        }
        false
    }

    /// Evaluates the policy at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.policy {
            ExpirationPolicy::Sliding { window_secs } => {
                match now.signed_duration_since(self.last_access).to_std() {
                    Ok(idle) => idle > Duration::from_secs(window_secs),
                    // last_access is in the future (clock skew)
                    Err(_) => false,
                }
            }
            ExpirationPolicy::Absolute { deadline } => now > deadline,
        }
    }
}
