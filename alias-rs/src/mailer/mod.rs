//! Outbound side of forwarding
//!
//! - [`builder`]: renders the forwarded MIME message
//! - [`queue`]: SQLite outbound queue with retry/backoff bookkeeping
//! - [`cipher`]: optional at-rest sealing of queued payloads
//! - [`feedback`]: failed-delivery reporting for the queue worker

pub mod builder;
pub mod cipher;
pub mod feedback;
pub mod queue;

pub use builder::ForwardMessageBuilder;
pub use cipher::PayloadCipher;
pub use feedback::report_delivery_failure;
pub use queue::{JobKind, OutboundJob, OutboundQueue, QueueStatus, QueuedEmail, RetryDecision};

use crate::error::Result;
use crate::message::InboundMessage;
use crate::model::{Alias, Recipient};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// One forward of the original message to an alias's destinations
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardRequest {
    pub alias_id: Uuid,
    pub user_id: Uuid,
    pub from_name: String,
    /// The alias address
    pub from_address: String,
    pub reply_to: String,
    pub destinations: Vec<String>,
    pub original: Bytes,
    pub original_sender: String,
    pub original_subject: Option<String>,
}

impl ForwardRequest {
    /// Address `message` from `alias` to every destination at once
    ///
    /// Replies go to `<local>+<sender with @ as =>@<alias domain>` so the
    /// reply path can recover the original sender.
    pub fn for_alias(alias: &Alias, message: &InboundMessage, destinations: &[Recipient]) -> Self {
        let alias_email = alias.email();
        let reply_to = format!(
            "{}+{}@{}",
            alias.local_part,
            message.sender.replacen('@', "=", 1),
            alias.domain
        );

        Self {
            alias_id: alias.id,
            user_id: alias.user_id,
            from_name: format!("{} via {}", message.display_sender(), alias_email),
            from_address: alias_email,
            reply_to,
            destinations: destinations.iter().map(|r| r.email.clone()).collect(),
            original: message.raw.clone(),
            original_sender: message.sender.clone(),
            original_subject: message.subject.clone(),
        }
    }
}

/// Port for handing forwarded mail to the outbound transport
///
/// Implementations must not wait for SMTP completion.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutboundMailer: Send + Sync {
    async fn forward(&self, request: ForwardRequest) -> Result<()>;
}

/// [`OutboundMailer`] that renders the message and puts it on the queue
pub struct QueuedMailer {
    builder: ForwardMessageBuilder,
    queue: Arc<OutboundQueue>,
}

impl QueuedMailer {
    pub fn new(builder: ForwardMessageBuilder, queue: Arc<OutboundQueue>) -> Self {
        Self { builder, queue }
    }
}

#[async_trait]
impl OutboundMailer for QueuedMailer {
    async fn forward(&self, request: ForwardRequest) -> Result<()> {
        let data = self.builder.build(&request)?;

        let job = OutboundJob {
            kind: JobKind::Forward,
            user_id: request.user_id,
            alias_id: Some(request.alias_id),
            from_addr: request.from_address,
            recipients: request.destinations,
            data,
            original_sender: Some(request.original_sender),
            original_subject: request.original_subject,
        };

        let id = self.queue.enqueue(&job).await?;
        debug!("Forward for alias {} queued as {}", request.alias_id, id);
        Ok(())
    }
}
