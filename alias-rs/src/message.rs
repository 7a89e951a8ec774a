//! Inbound message and envelope
//!
//! The raw message is parsed once up front so a malformed message fails the
//! whole delivery before any recipient is routed.

use crate::error::{AliasError, Result};
use bytes::Bytes;
use mail_parser::MessageParser;
use serde::{Deserialize, Serialize};

/// One address the accepting MTA delivered the message to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeRecipient {
    pub address: String,
    pub local_part: String,
    /// Subaddress after the `+`, empty when absent
    pub extension: String,
    pub domain: String,
}

impl EnvelopeRecipient {
    pub fn new(address: &str, local_part: &str, extension: &str, domain: &str) -> Self {
        Self {
            address: address.to_string(),
            local_part: local_part.to_string(),
            extension: extension.to_string(),
            domain: domain.to_string(),
        }
    }

    /// Split a plain `local+extension@domain` address
    pub fn from_address(address: &str) -> Result<Self> {
        let (local, domain) = address
            .rsplit_once('@')
            .filter(|(local, domain)| !local.is_empty() && !domain.is_empty())
            .ok_or_else(|| AliasError::InvalidEnvelope(format!("not an address: {}", address)))?;

        let (local_part, extension) = local.split_once('+').unwrap_or((local, ""));
        Ok(Self::new(address, local_part, extension, domain))
    }
}

/// All envelope recipients of one delivery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundEnvelope {
    pub recipients: Vec<EnvelopeRecipient>,
}

impl InboundEnvelope {
    /// Zip the parallel per-recipient arrays handed over by the MTA
    pub fn from_parallel(
        addresses: &[String],
        local_parts: &[String],
        extensions: &[String],
        domains: &[String],
    ) -> Result<Self> {
        let count = addresses.len();
        if local_parts.len() != count || domains.len() != count {
            return Err(AliasError::InvalidEnvelope(format!(
                "{} recipients but {} local parts and {} domains",
                count,
                local_parts.len(),
                domains.len()
            )));
        }

        // Extensions may be omitted entirely
        if !extensions.is_empty() && extensions.len() != count {
            return Err(AliasError::InvalidEnvelope(format!(
                "{} recipients but {} extensions",
                count,
                extensions.len()
            )));
        }

        let recipients = (0..count)
            .map(|i| {
                EnvelopeRecipient::new(
                    &addresses[i],
                    &local_parts[i],
                    extensions.get(i).map(String::as_str).unwrap_or(""),
                    &domains[i],
                )
            })
            .collect();

        Ok(Self { recipients })
    }
}

/// A parsed inbound message plus its envelope sender and declared size
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub raw: Bytes,
    /// Envelope sender (MAIL FROM)
    pub sender: String,
    /// Size reported by the MTA, charged against bandwidth
    pub size: u64,
    pub subject: Option<String>,
    pub from_name: Option<String>,
    pub from_address: Option<String>,
    pub message_id: Option<String>,
    pub attachment_count: usize,
}

impl InboundMessage {
    pub fn parse(raw: Bytes, sender: &str, size: u64) -> Result<Self> {
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(AliasError::Parse("message is empty".to_string()));
        }

        // Scoped so the parsed view's borrow of `raw` ends before `raw` moves
        let (subject, from_name, from_address, message_id, attachment_count) = {
            let message = MessageParser::default()
                .parse(&raw[..])
                .ok_or_else(|| AliasError::Parse("message could not be parsed".to_string()))?;

            if message.headers().is_empty() {
                return Err(AliasError::Parse("message has no headers".to_string()));
            }

            let from = message.from().and_then(|from| from.first());
            (
                message.subject().map(str::to_string),
                from.and_then(|addr| addr.name()).map(str::to_string),
                from.and_then(|addr| addr.address()).map(str::to_string),
                message.message_id().map(str::to_string),
                message.attachment_count(),
            )
        };

        Ok(Self {
            sender: sender.to_string(),
            size,
            subject,
            from_name,
            from_address,
            message_id,
            attachment_count,
            raw,
        })
    }

    /// Name shown in the `From` of forwarded mail
    pub fn display_sender(&self) -> &str {
        self.from_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.sender)
    }
}
