use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MB: f64 = 1024.0 * 1024.0;

/// Account owning aliases, recipients and custom domains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Always lower case
    pub username: String,
    pub default_recipient_id: Option<Uuid>,
    /// Bytes forwarded so far
    pub bandwidth: u64,
    /// Plan limit in bytes
    pub bandwidth_limit: u64,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn bandwidth_mb(&self) -> f64 {
        round_mb(self.bandwidth)
    }

    pub fn bandwidth_limit_mb(&self) -> f64 {
        round_mb(self.bandwidth_limit)
    }

    pub fn usage(&self) -> BandwidthUsage {
        BandwidthUsage {
            before: self.bandwidth,
            after: self.bandwidth,
            limit: self.bandwidth_limit,
        }
    }
}

/// Bytes as megabytes, rounded to two decimals
pub fn round_mb(bytes: u64) -> f64 {
    (bytes as f64 / MB * 100.0).round() / 100.0
}

/// Bandwidth counter around one atomic increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthUsage {
    pub before: u64,
    pub after: u64,
    pub limit: u64,
}

impl BandwidthUsage {
    pub fn ratio_before(&self) -> f64 {
        ratio(self.before, self.limit)
    }

    pub fn ratio_after(&self) -> f64 {
        ratio(self.after, self.limit)
    }
}

fn ratio(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    used as f64 / limit as f64
}

/// Counter sums across all of a user's aliases
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserTotals {
    pub emails_forwarded: i64,
    pub emails_blocked: i64,
    pub emails_replied: i64,
}
