//! Failed-delivery reporting
//!
//! The queue worker calls [`report_delivery_failure`] after every failed
//! attempt. Once a forward bounces, the alias owner is told which sender's
//! message could not be delivered.

use super::{JobKind, OutboundQueue, QueuedEmail, RetryDecision};
use crate::error::Result;
use crate::notify::{NotificationEvent, Notifier};
use crate::store::AliasStore;
use tracing::{info, warn};

pub async fn report_delivery_failure(
    queue: &OutboundQueue,
    store: &dyn AliasStore,
    notifier: &dyn Notifier,
    email: &QueuedEmail,
    error_msg: &str,
) -> Result<RetryDecision> {
    let decision = queue
        .mark_failed(&email.id, error_msg, email.retry_count)
        .await?;

    // Notifications themselves never trigger further notifications
    if decision != RetryDecision::Bounced || email.job.kind != JobKind::Forward {
        return Ok(decision);
    }

    let Some(alias_id) = email.job.alias_id else {
        return Ok(decision);
    };

    let Some(alias) = store.find_alias_by_id(alias_id).await? else {
        warn!("Bounced forward {} refers to missing alias {}", email.id, alias_id);
        return Ok(decision);
    };

    let Some(user) = store.find_user(alias.user_id).await? else {
        warn!("Bounced forward {} refers to missing user {}", email.id, alias.user_id);
        return Ok(decision);
    };

    notifier
        .notify(
            &user,
            NotificationEvent::FailedDelivery {
                alias_email: alias.email(),
                original_sender: email.job.original_sender.clone().unwrap_or_default(),
                original_subject: email.job.original_subject.clone(),
            },
        )
        .await?;

    info!(
        "Notified {} of failed delivery through {}",
        user.username,
        alias.email()
    );

    Ok(decision)
}
