//! Notification port
//!
//! Account notifications are typed events handed to a [`Notifier`]. Delivery
//! is queued and at-least-once; the pipeline never waits on it.

pub mod mail;

pub use mail::MailNotifier;

use crate::error::Result;
use crate::model::{round_mb, User};
use async_trait::async_trait;

/// Event delivered to an account owner
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    /// Usage moved above the warning ratio of the plan limit
    NearBandwidthLimit { bandwidth: u64, limit: u64 },
    /// A forwarded message was bounced by the destination
    FailedDelivery {
        alias_email: String,
        original_sender: String,
        original_subject: Option<String>,
    },
}

impl NotificationEvent {
    /// Short code used in `Feedback-ID`
    pub fn code(&self) -> &'static str {
        match self {
            NotificationEvent::NearBandwidthLimit { .. } => "NBL",
            NotificationEvent::FailedDelivery { .. } => "FDN",
        }
    }

    pub fn feedback_id(&self, tag: &str) -> String {
        format!("{}:{}", self.code(), tag)
    }

    pub fn subject(&self) -> String {
        match self {
            NotificationEvent::NearBandwidthLimit { .. } => {
                "You're close to your bandwidth limit".to_string()
            }
            NotificationEvent::FailedDelivery { alias_email, .. } => {
                format!("New failed delivery on {}", alias_email)
            }
        }
    }

    pub fn body(&self, username: &str) -> String {
        match self {
            NotificationEvent::NearBandwidthLimit { bandwidth, limit } => format!(
                "Hi {},\n\n\
                 Your aliases have forwarded {:.2}MB of your {:.2}MB \
                 bandwidth limit.\n",
                username,
                round_mb(*bandwidth),
                round_mb(*limit)
            ),
            NotificationEvent::FailedDelivery {
                alias_email,
                original_sender,
                original_subject,
            } => format!(
                "Hi {},\n\n\
                 A message sent to your alias {} could not be delivered to your \
                 recipient.\n\n\
                 Sender: {}\n\
                 Subject: {}\n",
                username,
                alias_email,
                original_sender,
                original_subject.as_deref().unwrap_or("(no subject)")
            ),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user: &User, event: NotificationEvent) -> Result<()>;
}
