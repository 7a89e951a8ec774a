//! Receipt pipeline for one inbound delivery
//!
//! Parse once, route every envelope recipient independently, then charge
//! bandwidth. Only a parse failure (or an oversized message) fails the run.

use crate::bandwidth::{BandwidthAccountant, BandwidthCharge};
use crate::config::Config;
use crate::error::{AliasError, Result};
use crate::mailer::OutboundMailer;
use crate::message::{EnvelopeRecipient, InboundEnvelope, InboundMessage};
use crate::notify::Notifier;
use crate::router::{RouteExecutor, RouteOutcome};
use crate::store::AliasStore;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Routed recipient and how it ended
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipientReport {
    pub recipient: EnvelopeRecipient,
    pub outcome: RouteOutcome,
}

/// Everything that happened to one delivery
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReceiveReport {
    pub recipients: Vec<RecipientReport>,
    pub charges: Vec<BandwidthCharge>,
}

impl ReceiveReport {
    pub fn outcomes(&self) -> impl Iterator<Item = &RouteOutcome> {
        self.recipients.iter().map(|r| &r.outcome)
    }

    pub fn forwarded_count(&self) -> usize {
        self.outcomes()
            .filter(|o| matches!(o, RouteOutcome::Forwarded { .. }))
            .count()
    }
}

pub struct ReceivePipeline {
    router: RouteExecutor,
    accountant: BandwidthAccountant,
    max_message_size: u64,
}

impl ReceivePipeline {
    pub fn new(
        config: &Config,
        store: Arc<dyn AliasStore>,
        mailer: Arc<dyn OutboundMailer>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            router: RouteExecutor::new(config, store.clone(), mailer),
            accountant: BandwidthAccountant::new(store, notifier, &config.limits),
            max_message_size: config.limits.max_message_size,
        }
    }

    /// Route `raw` to every recipient in `envelope`
    ///
    /// `size` is the size declared by the MTA and is what gets charged.
    pub async fn receive(
        &self,
        envelope: &InboundEnvelope,
        raw: Bytes,
        sender: &str,
        size: u64,
    ) -> Result<ReceiveReport> {
        let raw_len = raw.len() as u64;
        if self.max_message_size > 0 && raw_len > self.max_message_size {
            return Err(AliasError::MessageTooLarge {
                size: raw_len,
                limit: self.max_message_size,
            });
        }

        let message = InboundMessage::parse(raw, sender, size)?;
        debug!(
            "Received message from {} ({} bytes, {} attachment(s)) for {} recipient(s)",
            message.sender,
            message.size,
            message.attachment_count,
            envelope.recipients.len()
        );

        let mut recipients = Vec::with_capacity(envelope.recipients.len());
        for recipient in &envelope.recipients {
            let outcome = self.router.route(recipient, &message).await;
            recipients.push(RecipientReport {
                recipient: recipient.clone(),
                outcome,
            });
        }

        let outcomes: Vec<RouteOutcome> = recipients.iter().map(|r| r.outcome).collect();
        let charges = self.accountant.charge(&outcomes, message.size).await;

        let report = ReceiveReport {
            recipients,
            charges,
        };
        info!(
            "Processed message from {}: {} of {} recipient(s) forwarded",
            message.sender,
            report.forwarded_count(),
            report.recipients.len()
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::MockOutboundMailer;
    use crate::notify::MockNotifier;
    use crate::store::MockAliasStore;

    fn pipeline(config: &Config) -> ReceivePipeline {
        ReceivePipeline::new(
            config,
            Arc::new(MockAliasStore::new()),
            Arc::new(MockOutboundMailer::new()),
            Arc::new(MockNotifier::new()),
        )
    }

    #[tokio::test]
    async fn test_malformed_message_fails_whole_delivery() {
        let envelope = InboundEnvelope {
            recipients: vec![EnvelopeRecipient::new(
                "ebay@johndoe.anonaddy.me",
                "ebay",
                "",
                "johndoe.anonaddy.me",
            )],
        };

        let result = pipeline(&Config::default())
            .receive(&envelope, Bytes::from_static(b"  \r\n"), "will@anonaddy.com", 4)
            .await;
        assert!(matches!(result, Err(AliasError::Parse(_))));
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let mut config = Config::default();
        config.limits.max_message_size = 8;

        let result = pipeline(&config)
            .receive(
                &InboundEnvelope::default(),
                Bytes::from_static(b"Subject: too long\r\n\r\nbody"),
                "will@anonaddy.com",
                26,
            )
            .await;
        assert!(matches!(
            result,
            Err(AliasError::MessageTooLarge { limit: 8, .. })
        ));
    }

    #[tokio::test]
    async fn test_no_recipients_is_empty_report() {
        let report = pipeline(&Config::default())
            .receive(
                &InboundEnvelope::default(),
                Bytes::from_static(b"Subject: hi\r\n\r\nbody"),
                "will@anonaddy.com",
                20,
            )
            .await
            .unwrap();
        assert_eq!(report, ReceiveReport::default());
    }
}
