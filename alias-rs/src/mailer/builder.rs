//! Rendering of forwarded messages
//!
//! The original message is re-parsed here so bodies and attachments can be
//! carried over verbatim into a fresh envelope addressed from the alias.

use super::ForwardRequest;
use crate::error::{AliasError, Result};
use mail_builder::headers::address::Address;
use mail_builder::headers::text::Text;
use mail_builder::headers::url::URL;
use mail_builder::MessageBuilder;
use mail_parser::{MessageParser, MimeHeaders};

/// Owned copy of one attachment of the original message
struct AttachmentCopy {
    content_type: String,
    filename: String,
    contents: Vec<u8>,
}

/// Builds forwarded messages for one service installation
#[derive(Debug, Clone)]
pub struct ForwardMessageBuilder {
    feedback_tag: String,
    unsubscribe_domain: String,
}

impl ForwardMessageBuilder {
    /// `unsubscribe_domain` is the full `unsubscribe.<base>` domain
    pub fn new(feedback_tag: &str, unsubscribe_domain: &str) -> Self {
        Self {
            feedback_tag: feedback_tag.to_string(),
            unsubscribe_domain: unsubscribe_domain.to_string(),
        }
    }

    /// `Feedback-ID` value identifying the alias to mailbox providers
    pub fn feedback_id(&self, request: &ForwardRequest) -> String {
        format!("F:{}:{}", request.alias_id, self.feedback_tag)
    }

    pub fn unsubscribe_url(&self, request: &ForwardRequest) -> String {
        format!("mailto:{}@{}", request.alias_id, self.unsubscribe_domain)
    }

    pub fn build(&self, request: &ForwardRequest) -> Result<Vec<u8>> {
        let original = MessageParser::default()
            .parse(&request.original[..])
            .ok_or_else(|| AliasError::Build("original message could not be parsed".to_string()))?;

        let text_body = original.body_text(0).map(|body| body.into_owned());
        // mail-parser synthesizes HTML from plain text; only carry a real HTML part
        let html_body = original
            .html_part(0)
            .filter(|part| {
                part.content_type()
                    .map_or(false, |ct| ct.subtype().map_or(false, |s| s.eq_ignore_ascii_case("html")))
            })
            .and_then(|_| original.body_html(0))
            .map(|body| body.into_owned());
        let attachments: Vec<AttachmentCopy> = original
            .attachments()
            .enumerate()
            .map(|(i, part)| AttachmentCopy {
                content_type: part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                filename: part
                    .attachment_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("attachment-{}", i + 1)),
                contents: part.contents().to_vec(),
            })
            .collect();

        let feedback_id = self.feedback_id(request);
        let unsubscribe_url = self.unsubscribe_url(request);
        let subject = request.original_subject.clone().unwrap_or_default();

        let destinations: Vec<Address> = request
            .destinations
            .iter()
            .map(|email| Address::new_address(None::<&str>, email.as_str()))
            .collect();

        let mut builder = MessageBuilder::new()
            .from((request.from_name.as_str(), request.from_address.as_str()))
            .to(Address::new_list(destinations))
            .reply_to(request.reply_to.as_str())
            .subject(subject.as_str())
            .header("Feedback-ID", Text::new(feedback_id.as_str()))
            .header("List-Unsubscribe", URL::new(unsubscribe_url.as_str()));

        if let Some(text) = &text_body {
            builder = builder.text_body(text.as_str());
        }
        if let Some(html) = &html_body {
            builder = builder.html_body(html.as_str());
        }
        if text_body.is_none() && html_body.is_none() {
            builder = builder.text_body("");
        }

        for attachment in &attachments {
            builder = builder.attachment(
                attachment.content_type.as_str(),
                attachment.filename.as_str(),
                attachment.contents.as_slice(),
            );
        }

        builder
            .write_to_vec()
            .map_err(|e| AliasError::Build(e.to_string()))
    }
}
