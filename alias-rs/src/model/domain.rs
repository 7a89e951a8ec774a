use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A custom domain owned by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub id: Uuid,
    pub user_id: Uuid,
    pub domain: String,
    pub active: bool,
    pub verified_at: Option<DateTime<Utc>>,
}

impl Domain {
    /// Only verified, active domains take part in routing
    pub fn is_routable(&self) -> bool {
        self.active && self.verified_at.is_some()
    }
}
