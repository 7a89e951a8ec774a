//! alias-rs: email alias receipt routing and accounting
//!
//! Takes one inbound message as handed over by the MTA, routes it to each
//! envelope recipient's alias and meters the owner's bandwidth.
//!
//! # Routing
//!
//! - `<alias-id>@unsubscribe.<base>`: deactivates the alias when sent by one
//!   of its owner's verified recipients
//! - `<anything>@<username>.<base>` and bare `<base>` (admin): standard aliases,
//!   created on first contact subject to a per-user hourly limit
//! - `<anything>@<custom domain>`: aliases under a verified custom domain
//!
//! Forwards are queued, never sent inline. Each user with at least one
//! forwarded recipient is charged the message size once, and warned when
//! usage passes the near-limit ratio.
//!
//! # Example
//!
//! ```no_run
//! use alias_rs::mailer::{ForwardMessageBuilder, OutboundQueue, QueuedMailer};
//! use alias_rs::message::InboundEnvelope;
//! use alias_rs::notify::MailNotifier;
//! use alias_rs::pipeline::ReceivePipeline;
//! use alias_rs::store::{connect, SqliteStore};
//! use alias_rs::Config;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let pool = connect(&config.storage.database_url).await?;
//!
//!     let store = Arc::new(SqliteStore::new(pool.clone()));
//!     store.init_db().await?;
//!     let queue = Arc::new(OutboundQueue::new(pool, None));
//!     queue.init_db().await?;
//!
//!     let mailer = Arc::new(QueuedMailer::new(
//!         ForwardMessageBuilder::new("anonaddy", "unsubscribe.anonaddy.me"),
//!         queue.clone(),
//!     ));
//!     let notifier = Arc::new(MailNotifier::new(
//!         store.clone(),
//!         queue,
//!         &config.service.from_address,
//!         &config.service.feedback_tag,
//!     ));
//!     let pipeline = ReceivePipeline::new(&config, store, mailer, notifier);
//!
//!     let envelope = InboundEnvelope::from_parallel(
//!         &["ebay@johndoe.anonaddy.me".to_string()],
//!         &["ebay".to_string()],
//!         &[],
//!         &["johndoe.anonaddy.me".to_string()],
//!     )?;
//!     let raw = std::fs::read("message.eml")?;
//!     pipeline
//!         .receive(&envelope, raw.into(), "will@anonaddy.com", 1000)
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`pipeline`]: one delivery end to end
//! - [`router`]: per-recipient routing state machine
//! - [`classify`], [`registry`], [`recipients`]: routing building blocks
//! - [`bandwidth`]: usage metering and near-limit notices
//! - [`mailer`]: forward rendering and the outbound queue
//! - [`notify`]: account notifications
//! - [`store`]: persistence port and SQLite adapter

pub mod bandwidth;
pub mod classify;
pub mod config;
pub mod error;
pub mod logging;
pub mod mailer;
pub mod message;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod recipients;
pub mod registry;
pub mod router;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use error::{AliasError, Result};
