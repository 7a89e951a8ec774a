//! Alias lookup-or-create with per-user creation limits

use crate::config::LimitsConfig;
use crate::error::Result;
use crate::model::{NewAlias, User};
use crate::store::{AliasCreation, AliasStore, CreationLimit};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

impl From<&LimitsConfig> for CreationLimit {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            max_per_window: limits.new_aliases_per_window,
            window: Duration::seconds(limits.new_alias_window_secs),
        }
    }
}

pub struct AliasRegistry {
    store: Arc<dyn AliasStore>,
    limit: CreationLimit,
}

impl AliasRegistry {
    pub fn new(store: Arc<dyn AliasStore>, limit: CreationLimit) -> Self {
        Self { store, limit }
    }

    /// Resolve the alias for `local_part@domain` owned by `user`
    ///
    /// Existing aliases are returned as they are, active or not. The
    /// extension of the current delivery plays no part in the lookup.
    pub async fn resolve(
        &self,
        user: &User,
        local_part: &str,
        domain: &str,
        domain_id: Option<Uuid>,
    ) -> Result<AliasCreation> {
        let new_alias = NewAlias::new(user.id, local_part, domain, domain_id);

        if let Some(alias) = self
            .store
            .find_alias(user.id, &new_alias.local_part, &new_alias.domain)
            .await?
        {
            return Ok(AliasCreation::Existing(alias));
        }

        let creation = self
            .store
            .create_alias_if_absent(new_alias, self.limit, Utc::now())
            .await?;

        match &creation {
            AliasCreation::Created(alias) => {
                info!("Created alias {} for {}", alias.email(), user.username);
            }
            AliasCreation::RateLimited => {
                warn!(
                    "User {} hit the new alias limit ({} per {}s)",
                    user.username,
                    self.limit.max_per_window,
                    self.limit.window.num_seconds()
                );
            }
            AliasCreation::Existing(_) => {}
        }

        Ok(creation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Alias;
    use crate::store::MockAliasStore;
    use mockall::predicate::{always, eq};

    fn user() -> User {
        User {
            id: Uuid::from_u128(1),
            username: "johndoe".to_string(),
            default_recipient_id: None,
            bandwidth: 0,
            bandwidth_limit: 104_857_600,
            created_at: Utc::now(),
        }
    }

    fn alias(local_part: &str) -> Alias {
        Alias {
            id: Uuid::from_u128(2),
            user_id: Uuid::from_u128(1),
            domain_id: None,
            local_part: local_part.to_string(),
            domain: "johndoe.anonaddy.me".to_string(),
            active: true,
            emails_forwarded: 0,
            emails_blocked: 0,
            emails_replied: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_existing_alias_skips_creation() {
        let mut store = MockAliasStore::new();
        store
            .expect_find_alias()
            .with(eq(Uuid::from_u128(1)), eq("ebay"), eq("johndoe.anonaddy.me"))
            .times(1)
            .returning(|_, _, _| Ok(Some(alias("ebay"))));
        store.expect_create_alias_if_absent().never();

        let registry = AliasRegistry::new(Arc::new(store), CreationLimit::default());
        let creation = registry
            .resolve(&user(), "EBay", "johndoe.anonaddy.me", None)
            .await
            .unwrap();

        assert_eq!(creation, AliasCreation::Existing(alias("ebay")));
    }

    #[tokio::test]
    async fn test_missing_alias_is_created_with_configured_limit() {
        let limits = LimitsConfig {
            new_aliases_per_window: 3,
            ..LimitsConfig::default()
        };
        let expected_limit = CreationLimit::from(&limits);

        let mut store = MockAliasStore::new();
        store.expect_find_alias().returning(|_, _, _| Ok(None));
        store
            .expect_create_alias_if_absent()
            .with(
                eq(NewAlias::new(Uuid::from_u128(1), "ebay", "johndoe.anonaddy.me", None)),
                eq(expected_limit),
                always(),
            )
            .times(1)
            .returning(|_, _, _| Ok(AliasCreation::RateLimited));

        let registry = AliasRegistry::new(Arc::new(store), expected_limit);
        let creation = registry
            .resolve(&user(), "ebay", "johndoe.anonaddy.me", None)
            .await
            .unwrap();

        assert_eq!(creation, AliasCreation::RateLimited);
        assert_eq!(expected_limit.max_per_window, 3);
        assert_eq!(expected_limit.window, Duration::hours(1));
    }
}
