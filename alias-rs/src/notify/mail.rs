//! Notifications delivered by mail through the outbound queue

use super::{NotificationEvent, Notifier};
use crate::error::{AliasError, Result};
use crate::mailer::{JobKind, OutboundJob, OutboundQueue};
use crate::model::User;
use crate::store::AliasStore;
use async_trait::async_trait;
use mail_builder::headers::text::Text;
use mail_builder::MessageBuilder;
use std::sync::Arc;
use tracing::{debug, warn};

/// Sends notifications to the user's default recipient
pub struct MailNotifier {
    store: Arc<dyn AliasStore>,
    queue: Arc<OutboundQueue>,
    from_address: String,
    feedback_tag: String,
}

impl MailNotifier {
    pub fn new(
        store: Arc<dyn AliasStore>,
        queue: Arc<OutboundQueue>,
        from_address: &str,
        feedback_tag: &str,
    ) -> Self {
        Self {
            store,
            queue,
            from_address: from_address.to_string(),
            feedback_tag: feedback_tag.to_string(),
        }
    }

    fn render(&self, user: &User, to: &str, event: &NotificationEvent) -> Result<Vec<u8>> {
        let subject = event.subject();
        let body = event.body(&user.username);
        let feedback_id = event.feedback_id(&self.feedback_tag);

        MessageBuilder::new()
            .from(self.from_address.as_str())
            .to(to)
            .subject(subject.as_str())
            .header("Feedback-ID", Text::new(feedback_id.as_str()))
            .text_body(body.as_str())
            .write_to_vec()
            .map_err(|e| AliasError::Build(e.to_string()))
    }
}

#[async_trait]
impl Notifier for MailNotifier {
    async fn notify(&self, user: &User, event: NotificationEvent) -> Result<()> {
        let recipient = match user.default_recipient_id {
            Some(id) => self.store.find_recipient(id).await?,
            None => None,
        };

        let Some(recipient) = recipient else {
            warn!(
                "User {} has no default recipient, dropping {} notification",
                user.username,
                event.code()
            );
            return Ok(());
        };

        let data = self.render(user, &recipient.email, &event)?;
        let (original_sender, original_subject) = match &event {
            NotificationEvent::FailedDelivery {
                original_sender,
                original_subject,
                ..
            } => (Some(original_sender.clone()), original_subject.clone()),
            NotificationEvent::NearBandwidthLimit { .. } => (None, None),
        };

        let id = self
            .queue
            .enqueue(&OutboundJob {
                kind: JobKind::Notification,
                user_id: user.id,
                alias_id: None,
                from_addr: self.from_address.clone(),
                recipients: vec![recipient.email.clone()],
                data,
                original_sender,
                original_subject,
            })
            .await?;

        debug!(
            "Queued {} notification for {} as {}",
            event.code(),
            user.username,
            id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{connect, SqliteStore};

    async fn setup() -> (Arc<SqliteStore>, Arc<OutboundQueue>) {
        let pool = connect("sqlite::memory:").await.unwrap();
        let store = SqliteStore::new(pool.clone());
        store.init_db().await.unwrap();
        let queue = OutboundQueue::new(pool, None);
        queue.init_db().await.unwrap();
        (Arc::new(store), Arc::new(queue))
    }

    #[tokio::test]
    async fn test_notification_queued_to_default_recipient() {
        let (store, queue) = setup().await;
        let mut user = store.insert_user("johndoe", 104_857_600).await.unwrap();
        let recipient = store
            .insert_recipient(user.id, "will@anonaddy.com", true)
            .await
            .unwrap();
        store.set_default_recipient(user.id, recipient.id).await.unwrap();
        user.default_recipient_id = Some(recipient.id);

        let notifier = MailNotifier::new(store.clone(), queue.clone(), "mailer@anonaddy.me", "anonaddy");
        notifier
            .notify(
                &user,
                NotificationEvent::NearBandwidthLimit {
                    bandwidth: 100_944_820,
                    limit: 104_857_600,
                },
            )
            .await
            .unwrap();

        let pending = queue.get_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job.kind, JobKind::Notification);
        assert_eq!(pending[0].job.recipients, vec!["will@anonaddy.com".to_string()]);

        let rendered = String::from_utf8_lossy(&pending[0].job.data);
        assert!(rendered.contains("Feedback-ID: NBL:anonaddy"));
    }

    #[tokio::test]
    async fn test_missing_default_recipient_is_skipped() {
        let (store, queue) = setup().await;
        let user = store.insert_user("johndoe", 104_857_600).await.unwrap();

        let notifier = MailNotifier::new(store.clone(), queue.clone(), "mailer@anonaddy.me", "anonaddy");
        notifier
            .notify(
                &user,
                NotificationEvent::NearBandwidthLimit {
                    bandwidth: 1,
                    limit: 2,
                },
            )
            .await
            .unwrap();

        assert!(queue.get_pending(10).await.unwrap().is_empty());
    }
}
