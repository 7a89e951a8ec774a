//! alias-rs command line
//!
//! # Usage
//!
//! ```bash
//! # Route a message handed over by the MTA (file or stdin)
//! alias-rs receive-email message.eml --sender will@anonaddy.com \
//!     --recipient ebay@johndoe.anonaddy.me --local-part ebay \
//!     --extension "" --domain johndoe.anonaddy.me --size 1000
//!
//! # Show bandwidth and counters for a user
//! alias-rs usage johndoe
//! ```

use alias_rs::mailer::{ForwardMessageBuilder, OutboundQueue, PayloadCipher, QueuedMailer};
use alias_rs::message::InboundEnvelope;
use alias_rs::notify::MailNotifier;
use alias_rs::pipeline::ReceivePipeline;
use alias_rs::store::{connect, AliasStore, SqliteStore};
use alias_rs::{logging, Config};
use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "alias-rs")]
#[command(about = "Route inbound mail to email aliases", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Route one inbound message to its envelope recipients
    ReceiveEmail {
        /// Raw message file, `-` or omitted for stdin
        file: Option<PathBuf>,
        /// Envelope sender
        #[arg(long)]
        sender: String,
        #[arg(long = "recipient", required = true)]
        recipients: Vec<String>,
        #[arg(long = "local-part", alias = "local_part", required = true)]
        local_parts: Vec<String>,
        #[arg(long = "extension", allow_hyphen_values = true)]
        extensions: Vec<String>,
        #[arg(long = "domain", required = true)]
        domains: Vec<String>,
        /// Message size in bytes as reported by the MTA
        #[arg(long)]
        size: Option<u64>,
    },
    /// Show bandwidth usage and alias counters for a user
    Usage {
        username: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    logging::init(&config.logging);

    let pool = connect(&config.storage.database_url)
        .await
        .with_context(|| format!("failed to open {}", config.storage.database_url))?;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    store.init_db().await?;

    match cli.command {
        Commands::ReceiveEmail {
            file,
            sender,
            recipients,
            local_parts,
            extensions,
            domains,
            size,
        } => {
            let envelope =
                InboundEnvelope::from_parallel(&recipients, &local_parts, &extensions, &domains)?;
            let raw = read_message(file).await?;
            let size = size.unwrap_or(raw.len() as u64);

            let cipher = config
                .queue
                .encryption_key
                .as_deref()
                .map(PayloadCipher::from_base64)
                .transpose()?;
            let queue = Arc::new(
                OutboundQueue::new(pool, cipher)
                    .with_retry_policy(config.queue.max_retries, config.queue.retry_base_delay_secs),
            );
            queue.init_db().await?;

            let unsubscribe_domain = format!(
                "{}.{}",
                config.service.unsubscribe_label,
                config.service.canonical_domain()
            );
            let mailer = Arc::new(QueuedMailer::new(
                ForwardMessageBuilder::new(&config.service.feedback_tag, &unsubscribe_domain),
                queue.clone(),
            ));
            let notifier = Arc::new(MailNotifier::new(
                store.clone(),
                queue,
                &config.service.from_address,
                &config.service.feedback_tag,
            ));

            let pipeline = ReceivePipeline::new(&config, store, mailer, notifier);
            let report = pipeline.receive(&envelope, raw, &sender, size).await?;

            for charge in &report.charges {
                debug!(
                    "User {} now at {} of {} bytes",
                    charge.user_id, charge.after, charge.limit
                );
            }
            info!(
                "{} of {} recipient(s) forwarded",
                report.forwarded_count(),
                report.recipients.len()
            );
        }
        Commands::Usage { username } => {
            let Some(user) = store.find_user_by_username(&username).await? else {
                bail!("user {} does not exist", username);
            };
            let totals = store.user_totals(user.id).await?;

            println!("User:        {}", user.username);
            println!(
                "Bandwidth:   {:.2}MB / {:.2}MB",
                user.bandwidth_mb(),
                user.bandwidth_limit_mb()
            );
            println!("Forwarded:   {}", totals.emails_forwarded);
            println!("Blocked:     {}", totals.emails_blocked);
            println!("Replied:     {}", totals.emails_replied);
        }
    }

    Ok(())
}

async fn read_message(file: Option<PathBuf>) -> anyhow::Result<Bytes> {
    let raw = match file {
        Some(path) if path.as_os_str() != "-" => tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?,
        _ => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("failed to read message from stdin")?;
            buf
        }
    };

    Ok(Bytes::from(raw))
}
