//! MIME encoding for composed messages.
//!
//! Provides RFC 5322 message formatting with:
//! - Header encoding (RFC 2047)
//! - Quoted-printable and Base64 content encoding
//! - `multipart/alternative` bodies

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::address::AddressRecord;
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::message::{BodyPart, ComposedMessage};

/// Transfer encoding types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferEncoding {
    /// Quoted-printable encoding.
    #[default]
    QuotedPrintable,
    /// Base64 encoding.
    Base64,
}

impl TransferEncoding {
    /// Picks the encoding for a content type.
    pub fn for_content_type(content_type: &mime::Mime) -> Self {
        if content_type.type_() == mime::TEXT {
            TransferEncoding::QuotedPrintable
        } else {
            TransferEncoding::Base64
        }
    }

    /// Returns the header value.
    pub fn header_value(&self) -> &'static str {
        match self {
            TransferEncoding::QuotedPrintable => "quoted-printable",
            TransferEncoding::Base64 => "base64",
        }
    }
}

/// Encodes a header word using RFC 2047 `B` encoding.
///
/// ASCII text is returned unchanged.
pub fn encode_word(value: &str, charset: &str) -> String {
    if value.is_ascii() {
        return value.to_string();
    }
    format!("=?{}?B?{}?=", charset, BASE64.encode(value.as_bytes()))
}

/// MIME encoder for composed messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct MimeEncoder;

impl MimeEncoder {
    /// Creates a new encoder.
    pub fn new() -> Self {
        Self
    }

    /// Encodes a message to RFC 5322 format.
    ///
    /// `Date` is written only when the message has a sent date. Bcc
    /// recipients never appear in the headers.
    pub fn encode(&self, message: &ComposedMessage) -> SmtpResult<Vec<u8>> {
        let mut output = Vec::new();

        if let Some(date) = message.sent_date() {
            self.write_header(&mut output, "Date", &Self::format_date(date))?;
        }

        if !message.from().is_empty() {
            self.write_header(&mut output, "From", &Self::address_list(message.from()))?;
        }
        if !message.to().is_empty() {
            self.write_header(&mut output, "To", &Self::address_list(message.to()))?;
        }
        if !message.cc().is_empty() {
            self.write_header(&mut output, "Cc", &Self::address_list(message.cc()))?;
        }
        if !message.reply_to().is_empty() {
            self.write_header(&mut output, "Reply-To", &Self::address_list(message.reply_to()))?;
        }

        if let Some(subject) = message.subject() {
            self.write_header(&mut output, "Subject", &encode_word(subject, "UTF-8"))?;
        }
        self.write_header(&mut output, "Message-ID", &format!("<{}>", message.message_id()))?;
        self.write_header(&mut output, "MIME-Version", "1.0")?;

        let parts = message.body().parts();
        if parts.len() == 1 {
            self.write_part(&mut output, &parts[0])?;
        } else {
            let boundary = Self::generate_boundary();
            self.write_header(
                &mut output,
                "Content-Type",
                &format!("multipart/alternative; boundary=\"{}\"", boundary),
            )?;
            output.extend_from_slice(b"\r\n");

            // Least preferred first, most preferred last.
            for part in &parts {
                output.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
                self.write_part(&mut output, part)?;
                output.extend_from_slice(b"\r\n");
            }
            output.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
        }

        Ok(output)
    }

    fn address_list(addresses: &[AddressRecord]) -> String {
        addresses
            .iter()
            .map(AddressRecord::to_header)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Writes one body part's headers and content.
    fn write_part(&self, output: &mut Vec<u8>, part: &BodyPart<'_>) -> SmtpResult<()> {
        let content_type = Self::with_charset(&part.content_type);
        let encoding = TransferEncoding::for_content_type(&part.content_type);

        self.write_header(output, "Content-Type", &content_type)?;
        self.write_header(output, "Content-Transfer-Encoding", encoding.header_value())?;
        output.extend_from_slice(b"\r\n");

        match encoding {
            TransferEncoding::QuotedPrintable => {
                let normalized = normalize_line_endings(part.content);
                output.extend_from_slice(&quoted_printable::encode(normalized.as_bytes()));
            }
            TransferEncoding::Base64 => {
                let encoded = BASE64.encode(part.content.as_bytes());
                for chunk in encoded.as_bytes().chunks(76) {
                    output.extend_from_slice(chunk);
                    output.extend_from_slice(b"\r\n");
                }
            }
        }
        Ok(())
    }

    /// Adds `charset=utf-8` to text types that lack a charset.
    fn with_charset(content_type: &mime::Mime) -> String {
        if content_type.type_() == mime::TEXT && content_type.get_param(mime::CHARSET).is_none() {
            format!("{}; charset=utf-8", content_type)
        } else {
            content_type.to_string()
        }
    }

    /// Writes a header line.
    fn write_header(&self, output: &mut Vec<u8>, name: &str, value: &str) -> SmtpResult<()> {
        if name.is_empty() || name.chars().any(|c| c.is_control() || c == ':' || c == ' ') {
            return Err(SmtpError::message_error(
                SmtpErrorKind::InvalidHeader,
                format!("Invalid header name: {}", name),
            ));
        }
        if value.contains(['\r', '\n']) {
            return Err(SmtpError::message_error(
                SmtpErrorKind::InvalidHeader,
                format!("Header {} contains a line break", name),
            ));
        }

        let header = format!("{}: {}", name, value);
        output.extend_from_slice(Self::fold_header(&header).as_bytes());
        output.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// Folds a header line at 78 characters.
    fn fold_header(header: &str) -> String {
        if header.len() <= 78 {
            return header.to_string();
        }

        let mut result = String::new();
        let mut current_line = String::new();

        for word in header.split(' ') {
            if current_line.is_empty() {
                current_line = word.to_string();
            } else if current_line.len() + 1 + word.len() <= 76 {
                current_line.push(' ');
                current_line.push_str(word);
            } else {
                result.push_str(&current_line);
                result.push_str("\r\n ");
                current_line = word.to_string();
            }
        }

        result.push_str(&current_line);
        result
    }

    /// Generates a unique message ID for `domain`.
    pub fn generate_message_id(domain: &str) -> String {
        format!("{}.{}@{}", Uuid::new_v4(), Utc::now().timestamp(), domain)
    }

    /// Generates a unique boundary.
    fn generate_boundary() -> String {
        format!("----=_Part_{}", Uuid::new_v4().simple())
    }

    /// Formats the date for the Date header.
    fn format_date(date: &DateTime<Utc>) -> String {
        date.format("%a, %d %b %Y %H:%M:%S %z").to_string()
    }

    /// Prepares the DATA content with dot-stuffing.
    pub fn prepare_data_content(encoded_email: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(encoded_email.len() + 100);
        let mut at_line_start = true;

        for &byte in encoded_email {
            if at_line_start && byte == b'.' {
                output.push(b'.');
            }

            output.push(byte);
            at_line_start = byte == b'\n';
        }

        if !output.ends_with(b"\r\n") {
            if output.ends_with(b"\n") {
                output.pop();
            }
            output.extend_from_slice(b"\r\n");
        }

        // End with <CRLF>.<CRLF>
        output.extend_from_slice(b".\r\n");

        output
    }
}

/// Converts bare `\n` line endings to `\r\n`.
fn normalize_line_endings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut previous = '\0';
    for c in text.chars() {
        if c == '\n' && previous != '\r' {
            out.push('\r');
        }
        out.push(c);
        previous = c;
    }
    out
}
