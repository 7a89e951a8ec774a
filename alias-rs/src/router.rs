//! Per envelope-recipient routing
//!
//! Every recipient of a message is routed on its own and always ends in a
//! [`RouteOutcome`]. Storage or queue failures for one recipient become
//! `Rejected(Internal)` so that siblings are still routed.

use crate::classify::{DomainClassifier, DomainKind};
use crate::config::Config;
use crate::error::Result;
use crate::mailer::{ForwardRequest, OutboundMailer};
use crate::message::{EnvelopeRecipient, InboundMessage};
use crate::model::{AliasCounter, User};
use crate::recipients::RecipientResolver;
use crate::registry::AliasRegistry;
use crate::store::{AliasCreation, AliasStore, CreationLimit};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockReason {
    Inactive,
    Unverified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    NoMatchingUser,
    RateLimited,
    UnauthorizedUnsubscribe,
    UnknownAlias,
    Internal,
}

/// Terminal state of one envelope recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum RouteOutcome {
    Forwarded { user_id: Uuid, alias_id: Uuid },
    Blocked { alias_id: Uuid, reason: BlockReason },
    Unsubscribed { alias_id: Uuid },
    Rejected { reason: RejectReason },
}

impl RouteOutcome {
    fn rejected(reason: RejectReason) -> Self {
        RouteOutcome::Rejected { reason }
    }

    /// Owner to charge bandwidth to, for forwarded outcomes only
    pub fn forwarded_user(&self) -> Option<Uuid> {
        match self {
            RouteOutcome::Forwarded { user_id, .. } => Some(*user_id),
            _ => None,
        }
    }
}

pub struct RouteExecutor {
    store: Arc<dyn AliasStore>,
    mailer: Arc<dyn OutboundMailer>,
    classifier: DomainClassifier,
    registry: AliasRegistry,
    resolver: RecipientResolver,
}

impl RouteExecutor {
    pub fn new(
        config: &Config,
        store: Arc<dyn AliasStore>,
        mailer: Arc<dyn OutboundMailer>,
    ) -> Self {
        Self {
            classifier: DomainClassifier::new(&config.service),
            registry: AliasRegistry::new(store.clone(), CreationLimit::from(&config.limits)),
            resolver: RecipientResolver::new(store.clone()),
            store,
            mailer,
        }
    }

    pub async fn route(
        &self,
        recipient: &EnvelopeRecipient,
        message: &InboundMessage,
    ) -> RouteOutcome {
        match self.try_route(recipient, message).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Failed to route message for {}: {}", recipient.address, e);
                RouteOutcome::rejected(RejectReason::Internal)
            }
        }
    }

    async fn try_route(
        &self,
        recipient: &EnvelopeRecipient,
        message: &InboundMessage,
    ) -> Result<RouteOutcome> {
        let kind = self
            .classifier
            .classify(self.store.as_ref(), &recipient.domain, &recipient.local_part)
            .await?;
        debug!("Classified {} as {:?}", recipient.address, kind);

        match kind {
            DomainKind::Unsubscribe { local_part } => {
                self.unsubscribe(&local_part, &message.sender).await
            }
            DomainKind::StandardUser { username, domain } => {
                match self.store.find_user_by_username(&username).await? {
                    Some(user) => {
                        self.deliver(&user, &recipient.local_part, &domain, None, message)
                            .await
                    }
                    None => {
                        warn!("No user {} for {}", username, recipient.address);
                        Ok(RouteOutcome::rejected(RejectReason::NoMatchingUser))
                    }
                }
            }
            DomainKind::CustomDomain(record) => {
                match self.store.find_user(record.user_id).await? {
                    Some(user) => {
                        self.deliver(
                            &user,
                            &recipient.local_part,
                            &record.domain,
                            Some(record.id),
                            message,
                        )
                        .await
                    }
                    None => {
                        warn!("Domain {} has no owner", record.domain);
                        Ok(RouteOutcome::rejected(RejectReason::NoMatchingUser))
                    }
                }
            }
            DomainKind::Unroutable => {
                warn!("No matching user for {}", recipient.address);
                Ok(RouteOutcome::rejected(RejectReason::NoMatchingUser))
            }
        }
    }

    /// Deactivate the alias named by `local_part` if `sender` is one of its
    /// owner's verified recipients
    async fn unsubscribe(&self, local_part: &str, sender: &str) -> Result<RouteOutcome> {
        let Ok(alias_id) = Uuid::parse_str(local_part) else {
            warn!("Unsubscribe for malformed alias id {}", local_part);
            return Ok(RouteOutcome::rejected(RejectReason::UnknownAlias));
        };

        let Some(alias) = self.store.find_alias_by_id(alias_id).await? else {
            warn!("Unsubscribe for unknown alias {}", alias_id);
            return Ok(RouteOutcome::rejected(RejectReason::UnknownAlias));
        };

        if self
            .store
            .find_verified_recipient_by_email(alias.user_id, sender)
            .await?
            .is_none()
        {
            warn!(
                "Rejected unsubscribe of {} from unauthorized sender {}",
                alias.email(),
                sender
            );
            return Ok(RouteOutcome::rejected(RejectReason::UnauthorizedUnsubscribe));
        }

        if self.store.deactivate_alias(alias.id).await? {
            info!("Alias {} deactivated by {}", alias.email(), sender);
        } else {
            debug!("Alias {} was already inactive", alias.email());
        }

        Ok(RouteOutcome::Unsubscribed { alias_id: alias.id })
    }

    async fn deliver(
        &self,
        user: &User,
        local_part: &str,
        domain: &str,
        domain_id: Option<Uuid>,
        message: &InboundMessage,
    ) -> Result<RouteOutcome> {
        let alias = match self.registry.resolve(user, local_part, domain, domain_id).await? {
            AliasCreation::Existing(alias) | AliasCreation::Created(alias) => alias,
            AliasCreation::RateLimited => {
                return Ok(RouteOutcome::rejected(RejectReason::RateLimited));
            }
        };

        if !alias.active {
            self.store
                .increment_counter(alias.id, AliasCounter::Blocked)
                .await?;
            warn!("Blocked message to inactive alias {}", alias.email());
            return Ok(RouteOutcome::Blocked {
                alias_id: alias.id,
                reason: BlockReason::Inactive,
            });
        }

        let destinations = self.resolver.destinations(user, &alias).await?;
        if destinations.is_empty() {
            self.store
                .increment_counter(alias.id, AliasCounter::Blocked)
                .await?;
            warn!(
                "Blocked message to {}: no verified recipient for {}",
                alias.email(),
                user.username
            );
            return Ok(RouteOutcome::Blocked {
                alias_id: alias.id,
                reason: BlockReason::Unverified,
            });
        }

        self.mailer
            .forward(ForwardRequest::for_alias(&alias, message, &destinations))
            .await?;
        self.store
            .increment_counter(alias.id, AliasCounter::Forwarded)
            .await?;

        info!(
            "Forwarded message from {} via {} to {} recipient(s)",
            message.sender,
            alias.email(),
            destinations.len()
        );

        Ok(RouteOutcome::Forwarded {
            user_id: user.id,
            alias_id: alias.id,
        })
    }
}
