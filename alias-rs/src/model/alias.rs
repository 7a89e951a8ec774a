use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A disposable forwarding address
///
/// Identity is `(user_id, local_part, domain)`; subaddress extensions never
/// take part in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alias {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Custom domain the alias lives under, if any
    pub domain_id: Option<Uuid>,
    pub local_part: String,
    pub domain: String,
    pub active: bool,
    pub emails_forwarded: i64,
    pub emails_blocked: i64,
    pub emails_replied: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Alias {
    /// Full address, e.g. `ebay@johndoe.anonaddy.me`
    pub fn email(&self) -> String {
        format!("{}@{}", self.local_part, self.domain)
    }
}

/// Fields needed to create an alias on first contact
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlias {
    pub user_id: Uuid,
    pub domain_id: Option<Uuid>,
    pub local_part: String,
    pub domain: String,
}

impl NewAlias {
    pub fn new(user_id: Uuid, local_part: &str, domain: &str, domain_id: Option<Uuid>) -> Self {
        Self {
            user_id,
            domain_id,
            local_part: local_part.to_lowercase(),
            domain: domain.to_lowercase(),
        }
    }
}

/// Alias counters mutated by the routing pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasCounter {
    Forwarded,
    Blocked,
    Replied,
}

impl AliasCounter {
    pub fn column(&self) -> &'static str {
        match self {
            AliasCounter::Forwarded => "emails_forwarded",
            AliasCounter::Blocked => "emails_blocked",
            AliasCounter::Replied => "emails_replied",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_alias_normalizes_case() {
        let user_id = Uuid::new_v4();
        let alias = NewAlias::new(user_id, "EBay", "JohnDoe.AnonAddy.me", None);
        assert_eq!(alias.local_part, "ebay");
        assert_eq!(alias.domain, "johndoe.anonaddy.me");
        assert_eq!(alias.user_id, user_id);
    }

    #[test]
    fn test_counter_columns() {
        assert_eq!(AliasCounter::Forwarded.column(), "emails_forwarded");
        assert_eq!(AliasCounter::Blocked.column(), "emails_blocked");
        assert_eq!(AliasCounter::Replied.column(), "emails_replied");
    }
}
