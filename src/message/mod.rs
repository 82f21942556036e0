//! Message composition and one-call sending.
//!
//! The `compose*` functions build a [`ComposedMessage`] without touching the
//! network and leave its sent date unset. The `send*` functions compose,
//! stamp the sent date and deliver through the given context.

use chrono::{DateTime, Utc};
use mime::Mime;

use crate::address::{AddressInput, AddressRecord};
use crate::context::{ConnectionContext, SendReport};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::mime::MimeEncoder;
use crate::session::Envelope;

/// Header fields supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeaders {
    subject: Option<String>,
    from: AddressInput,
    to: AddressInput,
    cc: AddressInput,
    bcc: AddressInput,
    reply_to: AddressInput,
    strict: bool,
}

impl Default for MessageHeaders {
    fn default() -> Self {
        Self {
            subject: None,
            from: AddressInput::Empty,
            to: AddressInput::Empty,
            cc: AddressInput::Empty,
            bcc: AddressInput::Empty,
            reply_to: AddressInput::Empty,
            strict: true,
        }
    }
}

impl MessageHeaders {
    /// Creates empty headers with strict address parsing.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn from(mut self, from: impl Into<AddressInput>) -> Self {
        self.from = from.into();
        self
    }

    pub fn to(mut self, to: impl Into<AddressInput>) -> Self {
        self.to = to.into();
        self
    }

    pub fn cc(mut self, cc: impl Into<AddressInput>) -> Self {
        self.cc = cc.into();
        self
    }

    /// Sets blind recipients. They receive the message but never appear in
    /// its headers.
    pub fn bcc(mut self, bcc: impl Into<AddressInput>) -> Self {
        self.bcc = bcc.into();
        self
    }

    pub fn reply_to(mut self, reply_to: impl Into<AddressInput>) -> Self {
        self.reply_to = reply_to.into();
        self
    }

    /// Sets whether raw address strings are validated.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// One part of the given content type.
    Single { content_type: Mime, content: String },
    /// Plaintext and HTML renderings of the same content.
    Alternative { plaintext: String, html: String },
}

/// One renderable body part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyPart<'a> {
    pub content_type: Mime,
    pub content: &'a str,
}

impl Body {
    /// Plaintext body.
    pub fn plaintext(content: impl Into<String>) -> Self {
        Body::Single {
            content_type: mime::TEXT_PLAIN_UTF_8,
            content: content.into(),
        }
    }

    /// HTML body.
    pub fn html(content: impl Into<String>) -> Self {
        Body::Single {
            content_type: mime::TEXT_HTML_UTF_8,
            content: content.into(),
        }
    }

    /// HTML body with a plaintext alternative.
    pub fn alternative(html: impl Into<String>, plaintext: impl Into<String>) -> Self {
        Body::Alternative {
            plaintext: plaintext.into(),
            html: html.into(),
        }
    }

    /// Returns the parts in display preference order, most preferred last.
    pub fn parts(&self) -> Vec<BodyPart<'_>> {
        match self {
            Body::Single {
                content_type,
                content,
            } => vec![BodyPart {
                content_type: content_type.clone(),
                content,
            }],
            Body::Alternative { plaintext, html } => vec![
                BodyPart {
                    content_type: mime::TEXT_PLAIN_UTF_8,
                    content: plaintext,
                },
                BodyPart {
                    content_type: mime::TEXT_HTML_UTF_8,
                    content: html,
                },
            ],
        }
    }
}

/// A fully composed message, ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMessage {
    subject: Option<String>,
    from: Vec<AddressRecord>,
    to: Vec<AddressRecord>,
    cc: Vec<AddressRecord>,
    bcc: Vec<AddressRecord>,
    reply_to: Vec<AddressRecord>,
    body: Body,
    message_id: String,
    sent_date: Option<DateTime<Utc>>,
}

impl ComposedMessage {
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn from(&self) -> &[AddressRecord] {
        &self.from
    }

    pub fn to(&self) -> &[AddressRecord] {
        &self.to
    }

    pub fn cc(&self) -> &[AddressRecord] {
        &self.cc
    }

    pub fn bcc(&self) -> &[AddressRecord] {
        &self.bcc
    }

    pub fn reply_to(&self) -> &[AddressRecord] {
        &self.reply_to
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Returns the Message-ID without angle brackets.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn sent_date(&self) -> Option<&DateTime<Utc>> {
        self.sent_date.as_ref()
    }

    pub fn set_sent_date(&mut self, date: DateTime<Utc>) {
        self.sent_date = Some(date);
    }

    /// Sets the sent date to now unless one is already set.
    pub fn stamp_sent_date(&mut self) {
        if self.sent_date.is_none() {
            self.sent_date = Some(Utc::now());
        }
    }

    /// Returns every envelope recipient: To, Cc, then Bcc.
    pub fn recipients(&self) -> Vec<&AddressRecord> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .collect()
    }

    /// Builds the SMTP envelope.
    pub fn envelope(&self) -> SmtpResult<Envelope> {
        let from = self.from.first().cloned().ok_or_else(|| {
            SmtpError::message_error(SmtpErrorKind::InvalidFromAddress, "Message has no From address")
        })?;

        let recipients: Vec<AddressRecord> = self.recipients().into_iter().cloned().collect();
        if recipients.is_empty() {
            return Err(SmtpError::message_error(
                SmtpErrorKind::InvalidRecipientAddress,
                "Message has no recipients",
            ));
        }

        Ok(Envelope { from, recipients })
    }

    /// Renders the message in RFC 5322 format.
    pub fn to_bytes(&self) -> SmtpResult<Vec<u8>> {
        MimeEncoder::new().encode(self)
    }
}

/// Composes a message with a body of the given content type.
pub fn compose(
    ctx: &ConnectionContext,
    content_type: Mime,
    content: impl Into<String>,
    headers: MessageHeaders,
) -> SmtpResult<ComposedMessage> {
    if content_type.type_() == mime::MULTIPART {
        return Err(SmtpError::message_error(
            SmtpErrorKind::InvalidHeader,
            format!(
                "Content type {} needs parts; use compose_html_plaintext_alternative",
                content_type
            ),
        ));
    }
    build(
        ctx,
        Body::Single {
            content_type,
            content: content.into(),
        },
        headers,
    )
}

/// Composes a plaintext message.
pub fn compose_plaintext(
    ctx: &ConnectionContext,
    plaintext: impl Into<String>,
    headers: MessageHeaders,
) -> SmtpResult<ComposedMessage> {
    build(ctx, Body::plaintext(plaintext), headers)
}

/// Composes an HTML message without a plaintext rendering.
pub fn compose_html_only(
    ctx: &ConnectionContext,
    html: impl Into<String>,
    headers: MessageHeaders,
) -> SmtpResult<ComposedMessage> {
    build(ctx, Body::html(html), headers)
}

/// Composes a `multipart/alternative` message.
pub fn compose_html_plaintext_alternative(
    ctx: &ConnectionContext,
    html: impl Into<String>,
    plaintext: impl Into<String>,
    headers: MessageHeaders,
) -> SmtpResult<ComposedMessage> {
    build(ctx, Body::alternative(html, plaintext), headers)
}

fn build(
    ctx: &ConnectionContext,
    body: Body,
    headers: MessageHeaders,
) -> SmtpResult<ComposedMessage> {
    let strict = headers.strict;
    Ok(ComposedMessage {
        subject: headers.subject,
        from: headers.from.into_records(strict)?,
        to: headers.to.into_records(strict)?,
        cc: headers.cc.into_records(strict)?,
        bcc: headers.bcc.into_records(strict)?,
        reply_to: headers.reply_to.into_records(strict)?,
        body,
        message_id: MimeEncoder::generate_message_id(ctx.host()),
        sent_date: None,
    })
}

/// Stamps the sent date if unset and delivers the message.
pub async fn send_message(
    ctx: &ConnectionContext,
    mut message: ComposedMessage,
) -> SmtpResult<SendReport> {
    message.stamp_sent_date();
    ctx.send(&message).await
}

/// Composes and sends a message with a body of the given content type.
pub async fn send(
    ctx: &ConnectionContext,
    content_type: Mime,
    content: impl Into<String>,
    headers: MessageHeaders,
) -> SmtpResult<SendReport> {
    send_message(ctx, compose(ctx, content_type, content, headers)?).await
}

/// Composes and sends a plaintext message.
pub async fn send_plaintext(
    ctx: &ConnectionContext,
    plaintext: impl Into<String>,
    headers: MessageHeaders,
) -> SmtpResult<SendReport> {
    send_message(ctx, compose_plaintext(ctx, plaintext, headers)?).await
}

/// Composes and sends an HTML-only message.
pub async fn send_html_only(
    ctx: &ConnectionContext,
    html: impl Into<String>,
    headers: MessageHeaders,
) -> SmtpResult<SendReport> {
    send_message(ctx, compose_html_only(ctx, html, headers)?).await
}

/// Composes and sends an HTML message with a plaintext alternative.
pub async fn send_html_plaintext_alternative(
    ctx: &ConnectionContext,
    html: impl Into<String>,
    plaintext: impl Into<String>,
    headers: MessageHeaders,
) -> SmtpResult<SendReport> {
    send_message(
        ctx,
        compose_html_plaintext_alternative(ctx, html, plaintext, headers)?,
    )
    .await
}
