//! SMTP protocol implementation.
//!
//! RFC 5321 commands and replies, plus the EHLO capability list.

use std::collections::HashSet;
use std::fmt;

use crate::auth::AuthMethod;
use crate::errors::{EnhancedStatusCode, SmtpError, SmtpErrorKind, SmtpResult};

/// SMTP commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Authentication mechanism.
        mechanism: AuthMethod,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// MAIL FROM command.
    MailFrom {
        /// Sender address.
        address: String,
        /// SIZE parameter (optional).
        size: Option<usize>,
        /// 8BITMIME parameter.
        body_8bit: bool,
    },
    /// RCPT TO command.
    RcptTo {
        /// Recipient address.
        address: String,
    },
    /// DATA command.
    Data,
    /// Reset transaction.
    Rset,
    /// No operation.
    Noop,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command as a single line, refusing line breaks and
    /// other control characters that would start a second command.
    pub fn to_checked_line(&self) -> SmtpResult<String> {
        let line = self.to_smtp_string();
        if !line.chars().any(char::is_control) {
            return Ok(line);
        }
        let kind = match self {
            SmtpCommand::MailFrom { .. } => SmtpErrorKind::InvalidFromAddress,
            SmtpCommand::RcptTo { .. } => SmtpErrorKind::InvalidRecipientAddress,
            _ => SmtpErrorKind::ConfigurationInvalid,
        };
        Err(SmtpError::new(
            kind,
            format!("Refusing to send {:?}: contains control characters", self.to_log_string()),
        ))
    }

    /// Formats the command for sending.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response,
            } => match initial_response {
                Some(response) => format!("AUTH {} {}", mechanism, response),
                None => format!("AUTH {}", mechanism),
            },
            SmtpCommand::MailFrom {
                address,
                size,
                body_8bit,
            } => {
                let mut cmd = format!("MAIL FROM:{}", address);
                if let Some(s) = size {
                    cmd.push_str(&format!(" SIZE={}", s));
                }
                if *body_8bit {
                    cmd.push_str(" BODY=8BITMIME");
                }
                cmd
            }
            SmtpCommand::RcptTo { address } => format!("RCPT TO:{}", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Rset => "RSET".to_string(),
            SmtpCommand::Noop => "NOOP".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }

    /// Formats the command for protocol logs, hiding AUTH payloads.
    pub fn to_log_string(&self) -> String {
        match self {
            SmtpCommand::Auth {
                mechanism,
                initial_response: Some(_),
            } => format!("AUTH {} [REDACTED]", mechanism),
            other => other.to_smtp_string(),
        }
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_log_string())
    }
}

/// SMTP reply from server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    /// Status code (e.g., 250, 354, 550).
    pub code: u16,
    /// Enhanced status code (optional).
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Reply text lines.
    pub message: Vec<String>,
    /// Whether this is a multiline reply.
    pub is_multiline: bool,
}

impl SmtpResponse {
    /// Creates a single-line reply.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced_code: None,
            message: vec![message.into()],
            is_multiline: false,
        }
    }

    /// Creates a multiline reply.
    pub fn multiline(code: u16, lines: &[&str]) -> Self {
        Self {
            code,
            enhanced_code: None,
            message: lines.iter().map(|l| l.to_string()).collect(),
            is_multiline: lines.len() > 1,
        }
    }

    /// Parses a reply from raw lines.
    pub fn parse(lines: &[String]) -> SmtpResult<Self> {
        if lines.is_empty() {
            return Err(SmtpError::protocol("Empty response"));
        }

        let mut messages = Vec::with_capacity(lines.len());
        let mut code = 0u16;
        let mut enhanced_code = None;

        for (i, line) in lines.iter().enumerate() {
            let parsed_code: u16 = line
                .get(..3)
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| SmtpError::protocol(format!("Invalid status code: {}", line)))?;

            if i == 0 {
                code = parsed_code;
            } else if parsed_code != code {
                return Err(SmtpError::protocol(
                    "Inconsistent status codes in multiline response",
                ));
            }

            let text = line.get(4..).unwrap_or("");
            let text = if i == 0 {
                match Self::parse_enhanced_code(text) {
                    Some((esc, rest)) => {
                        enhanced_code = Some(esc);
                        rest.trim().to_string()
                    }
                    None => text.to_string(),
                }
            } else {
                text.to_string()
            };

            messages.push(text);
        }

        Ok(Self {
            code,
            enhanced_code,
            message: messages,
            is_multiline: lines.len() > 1,
        })
    }

    /// Parses enhanced status code from message start.
    fn parse_enhanced_code(msg: &str) -> Option<(EnhancedStatusCode, &str)> {
        let (first, rest) = msg.split_once(' ').unwrap_or((msg, ""));
        let code = EnhancedStatusCode::parse(first)?;
        Some((code, rest))
    }

    /// Returns true if this is a success reply (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns true if this is a positive intermediate reply (3xx).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Returns the first message line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(|s| s.as_str()).unwrap_or("")
    }

    /// Returns all message lines joined.
    pub fn full_message(&self) -> String {
        self.message.join("\n")
    }

    /// Converts to an error.
    pub fn to_error(&self) -> SmtpError {
        let mut err = SmtpError::from_smtp_response(self.code, self.full_message());
        if let Some(enhanced) = &self.enhanced_code {
            err = err.with_enhanced_code(enhanced.clone());
        }
        err
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

/// ESMTP server capabilities.
#[derive(Debug, Clone, Default)]
pub struct EsmtpCapabilities {
    /// Maximum message size.
    pub size: Option<usize>,
    /// Supported authentication mechanisms.
    pub auth_mechanisms: HashSet<AuthMethod>,
    /// STARTTLS supported.
    pub starttls: bool,
    /// 8BITMIME supported.
    pub eight_bit_mime: bool,
    /// Enhanced status codes supported.
    pub enhanced_status_codes: bool,
    /// Raw capability strings.
    pub raw: Vec<String>,
}

impl EsmtpCapabilities {
    /// Parses capabilities from an EHLO reply.
    ///
    /// The first line is the server greeting and carries no capability.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_uppercase();
            let (capability, params) = line.split_once(' ').unwrap_or((line.as_str(), ""));

            match capability {
                "SIZE" => caps.size = params.parse().ok(),
                "AUTH" => {
                    for mech in params.split_whitespace() {
                        if let Some(method) = AuthMethod::from_capability(mech) {
                            caps.auth_mechanisms.insert(method);
                        }
                    }
                }
                "STARTTLS" => caps.starttls = true,
                "8BITMIME" => caps.eight_bit_mime = true,
                "ENHANCEDSTATUSCODES" => caps.enhanced_status_codes = true,
                _ => {
                    // Pre-standard AUTH=<mechs> form
                    if let Some(mechs) = capability.strip_prefix("AUTH=") {
                        let all = std::iter::once(mechs).chain(params.split_whitespace());
                        for mech in all {
                            if let Some(method) = AuthMethod::from_capability(mech) {
                                caps.auth_mechanisms.insert(method);
                            }
                        }
                    }
                }
            }

            caps.raw.push(line);
        }

        caps
    }

    /// Returns true if authentication is available.
    pub fn has_auth(&self) -> bool {
        !self.auth_mechanisms.is_empty()
    }

    /// Returns the advertised mechanisms.
    pub fn auth_methods(&self) -> Vec<AuthMethod> {
        self.auth_mechanisms.iter().copied().collect()
    }

    /// Checks if a specific capability is supported.
    pub fn has_capability(&self, name: &str) -> bool {
        let upper = name.to_uppercase();
        self.raw.iter().any(|c| c.starts_with(&upper))
    }
}

/// Reply codes for common SMTP operations.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Service closing.
    pub const SERVICE_CLOSING: u16 = 221;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// OK.
    pub const OK: u16 = 250;
    /// Continue (AUTH).
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
    /// Service unavailable.
    pub const SERVICE_UNAVAILABLE: u16 = 421;
    /// Command not implemented.
    pub const NOT_IMPLEMENTED: u16 = 502;
    /// Authentication required.
    pub const AUTH_REQUIRED: u16 = 530;
    /// Authentication failed.
    pub const AUTH_FAILED: u16 = 535;
    /// Mailbox unavailable (permanent).
    pub const MAILBOX_UNAVAILABLE: u16 = 550;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_line_refuses_line_breaks() {
        let rcpt = SmtpCommand::RcptTo {
            address: "<x@example.com>\r\nRCPT TO:<other@example.net>".to_string(),
        };
        assert_eq!(
            rcpt.to_checked_line().unwrap_err().kind(),
            SmtpErrorKind::InvalidRecipientAddress
        );

        let mail = SmtpCommand::MailFrom {
            address: "<a@example.com>\n".to_string(),
            size: None,
            body_8bit: false,
        };
        assert_eq!(
            mail.to_checked_line().unwrap_err().kind(),
            SmtpErrorKind::InvalidFromAddress
        );

        let ehlo = SmtpCommand::Ehlo("client\r\nQUIT".to_string());
        assert!(ehlo.to_checked_line().is_err());

        assert_eq!(SmtpCommand::Noop.to_checked_line().unwrap(), "NOOP");
    }

    #[test]
    fn test_command_formatting() {
        assert_eq!(
            SmtpCommand::Ehlo("localhost".to_string()).to_smtp_string(),
            "EHLO localhost"
        );
        assert_eq!(SmtpCommand::StartTls.to_smtp_string(), "STARTTLS");
        assert_eq!(
            SmtpCommand::MailFrom {
                address: "<test@example.com>".to_string(),
                size: Some(1024),
                body_8bit: true,
            }
            .to_smtp_string(),
            "MAIL FROM:<test@example.com> SIZE=1024 BODY=8BITMIME"
        );
        assert_eq!(
            SmtpCommand::RcptTo { address: "<a@x.com>".to_string() }.to_smtp_string(),
            "RCPT TO:<a@x.com>"
        );
    }

    #[test]
    fn test_auth_command_redacted_in_logs() {
        let cmd = SmtpCommand::Auth {
            mechanism: AuthMethod::Plain,
            initial_response: Some("AHVzZXIAcGFzcw==".to_string()),
        };
        assert_eq!(cmd.to_smtp_string(), "AUTH PLAIN AHVzZXIAcGFzcw==");
        assert_eq!(cmd.to_log_string(), "AUTH PLAIN [REDACTED]");
        assert!(!cmd.to_string().contains("AHVzZXIAcGFzcw=="));

        let cmd = SmtpCommand::Auth {
            mechanism: AuthMethod::Login,
            initial_response: None,
        };
        assert_eq!(cmd.to_log_string(), "AUTH LOGIN");
    }

    #[test]
    fn test_response_parse() {
        let lines = vec!["250 OK".to_string()];
        let response = SmtpResponse::parse(&lines).unwrap();
        assert_eq!(response.code, 250);
        assert!(response.is_success());
        assert_eq!(response.first_message(), "OK");

        let lines = vec![
            "250-smtp.example.com Hello".to_string(),
            "250-SIZE 10485760".to_string(),
            "250 STARTTLS".to_string(),
        ];
        let response = SmtpResponse::parse(&lines).unwrap();
        assert_eq!(response.code, 250);
        assert!(response.is_multiline);
        assert_eq!(response.message.len(), 3);

        let response = SmtpResponse::parse(&["354".to_string()]).unwrap();
        assert!(response.is_intermediate());
        assert_eq!(response.first_message(), "");
    }

    #[test]
    fn test_response_parse_errors() {
        assert!(SmtpResponse::parse(&[]).is_err());
        assert!(SmtpResponse::parse(&["OK".to_string()]).is_err());
        assert!(SmtpResponse::parse(&["250-a".to_string(), "251 b".to_string()]).is_err());
    }

    #[test]
    fn test_response_with_enhanced_code() {
        let lines = vec!["550 5.1.1 User unknown".to_string()];
        let response = SmtpResponse::parse(&lines).unwrap();
        assert_eq!(response.code, 550);
        assert_eq!(response.first_message(), "User unknown");
        let esc = response.enhanced_code.clone().unwrap();
        assert_eq!(esc.to_string(), "5.1.1");
        assert_eq!(response.to_error().enhanced_code(), Some(&esc));
    }

    #[test]
    fn test_capabilities_parse() {
        let response = SmtpResponse::multiline(
            250,
            &[
                "smtp.example.com",
                "SIZE 10485760",
                "AUTH PLAIN LOGIN CRAM-MD5",
                "STARTTLS",
                "8BITMIME",
                "PIPELINING",
            ],
        );

        let caps = EsmtpCapabilities::from_ehlo_response(&response);
        assert_eq!(caps.size, Some(10485760));
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Plain));
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Login));
        assert!(caps.auth_mechanisms.contains(&AuthMethod::CramMd5));
        assert!(caps.starttls);
        assert!(caps.eight_bit_mime);
        assert!(caps.has_capability("pipelining"));
        assert!(!caps.has_capability("smtp.example.com"));
    }

    #[test]
    fn test_capabilities_legacy_auth_form() {
        let response = SmtpResponse::multiline(250, &["mx.example.com", "AUTH=LOGIN PLAIN"]);
        let caps = EsmtpCapabilities::from_ehlo_response(&response);
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Login));
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Plain));
    }
}
