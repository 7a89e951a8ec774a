use crate::error::Result;
use crate::model::{Alias, Recipient, User};
use crate::store::AliasStore;
use std::sync::Arc;

/// Works out which verified mailboxes an alias forwards to
pub struct RecipientResolver {
    store: Arc<dyn AliasStore>,
}

impl RecipientResolver {
    pub fn new(store: Arc<dyn AliasStore>) -> Self {
        Self { store }
    }

    /// Verified part of the alias's override set, or the verified default
    /// recipient when no override exists. Empty means the mail is blocked.
    pub async fn destinations(&self, user: &User, alias: &Alias) -> Result<Vec<Recipient>> {
        let overrides = self.store.alias_recipients(alias.id).await?;
        if !overrides.is_empty() {
            return Ok(overrides.into_iter().filter(Recipient::is_verified).collect());
        }

        let Some(default_id) = user.default_recipient_id else {
            return Ok(Vec::new());
        };

        Ok(self
            .store
            .find_recipient(default_id)
            .await?
            .filter(Recipient::is_verified)
            .into_iter()
            .collect())
    }
}
