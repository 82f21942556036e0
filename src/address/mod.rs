//! Email addresses and address-list parsing.
//!
//! Comma-separated lists and single addresses share one grammar:
//! [`AddressParser::parse_one`] is [`AddressParser::parse_list`] plus a
//! count check.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{SmtpError, SmtpResult};

/// Default text encoding for display names.
pub const DEFAULT_CHARSET: &str = "UTF-8";

/// Maximum length of an address (RFC 5321 path limit minus brackets).
const MAX_ADDRESS_LEN: usize = 254;

/// Maximum length of the local part.
const MAX_LOCAL_LEN: usize = 64;

/// Maximum length of a single domain label.
const MAX_LABEL_LEN: usize = 63;

/// Parsed email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "AddressFields")]
pub struct AddressRecord {
    email: String,
    display_name: Option<String>,
    charset: String,
}

/// Deserialized form, checked through [`AddressRecord::with_name`].
#[derive(Deserialize)]
struct AddressFields {
    email: String,
    display_name: Option<String>,
    charset: Option<String>,
}

impl TryFrom<AddressFields> for AddressRecord {
    type Error = SmtpError;

    fn try_from(fields: AddressFields) -> SmtpResult<Self> {
        let record = AddressRecord::with_name(fields.display_name.unwrap_or_default(), fields.email)?;
        Ok(match fields.charset {
            Some(charset) => record.charset(charset),
            None => record,
        })
    }
}

impl AddressRecord {
    /// Creates an address without syntax validation.
    ///
    /// Fails when `email` is empty or holds control characters, so no
    /// record can carry a line break into an SMTP command.
    pub fn new(email: impl Into<String>) -> SmtpResult<Self> {
        let email = email.into();
        if email.trim().is_empty() {
            return Err(SmtpError::address("Email address cannot be empty"));
        }
        if email.chars().any(char::is_control) {
            return Err(SmtpError::address(format!(
                "Email address {:?} contains control characters",
                email
            )));
        }
        Ok(Self {
            email,
            display_name: None,
            charset: DEFAULT_CHARSET.to_string(),
        })
    }

    /// Creates an address with a display name.
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> SmtpResult<Self> {
        let name = name.into();
        if name.chars().any(char::is_control) {
            return Err(SmtpError::address(format!(
                "Display name {:?} contains control characters",
                name
            )));
        }
        Ok(Self::new(email)?.display_name(name))
    }

    /// Returns true if the address is safe to place in an SMTP command.
    pub fn is_command_safe(&self) -> bool {
        !self.email.trim().is_empty() && !self.email.chars().any(char::is_control)
    }

    /// Creates an address and validates its syntax.
    pub fn strict(email: impl Into<String>) -> SmtpResult<Self> {
        let record = Self::new(email)?;
        AddressParser::validate(&record.email)?;
        Ok(record)
    }

    /// Sets the display name.
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.display_name = if name.is_empty() { None } else { Some(name) };
        self
    }

    /// Sets the text encoding label used for the display name.
    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    /// Returns the address part.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Returns the display name if present.
    pub fn name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Returns the display-name text encoding.
    pub fn text_encoding(&self) -> &str {
        &self.charset
    }

    /// Formats the address for SMTP MAIL FROM/RCPT TO commands.
    pub fn to_smtp(&self) -> String {
        format!("<{}>", self.email)
    }

    /// Formats the address for message headers.
    ///
    /// Non-ASCII display names become RFC 2047 encoded words.
    pub fn to_header(&self) -> String {
        match &self.display_name {
            Some(name) if !name.is_ascii() => {
                format!(
                    "{} <{}>",
                    crate::mime::encode_word(name, &self.charset),
                    self.email
                )
            }
            Some(name) => {
                if name.contains(|c: char| !c.is_alphanumeric() && c != ' ') {
                    let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
                    format!("\"{}\" <{}>", escaped, self.email)
                } else {
                    format!("{} <{}>", name, self.email)
                }
            }
            None => self.email.clone(),
        }
    }
}

impl fmt::Display for AddressRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_header())
    }
}

/// Parser for single addresses and comma-separated address lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressParser;

impl AddressParser {
    /// Parses a comma-separated address list.
    ///
    /// Commas inside quoted display names, angle brackets and comments do
    /// not split. Empty input yields an empty list. With `strict`, every
    /// address is validated.
    pub fn parse_list(raw: &str, strict: bool) -> SmtpResult<Vec<AddressRecord>> {
        let mut records = Vec::new();
        for token in Self::split(raw)? {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let record = Self::parse_token(token)?;
            if strict {
                Self::validate(record.email()).map_err(|e| {
                    SmtpError::address(format!("Invalid address \"{}\": {}", token, e.message()))
                })?;
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Parses exactly one address.
    pub fn parse_one(raw: &str, strict: bool) -> SmtpResult<AddressRecord> {
        let mut records = Self::parse_list(raw, strict)?;
        if records.len() != 1 {
            return Err(SmtpError::address(format!(
                "Expected exactly one address in \"{}\", found {}",
                raw,
                records.len()
            )));
        }
        Ok(records.remove(0))
    }

    /// Splits on top-level commas.
    fn split(raw: &str) -> SmtpResult<Vec<&str>> {
        let mut tokens = Vec::new();
        let mut start = 0;
        let mut in_quotes = false;
        let mut escaped = false;
        let mut angle = false;
        let mut comment_depth = 0usize;

        for (i, c) in raw.char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' if in_quotes || comment_depth > 0 => escaped = true,
                '"' if comment_depth == 0 => in_quotes = !in_quotes,
                '(' if !in_quotes => comment_depth += 1,
                ')' if !in_quotes && comment_depth > 0 => comment_depth -= 1,
                '<' if !in_quotes && comment_depth == 0 => angle = true,
                '>' if !in_quotes && comment_depth == 0 => angle = false,
                ',' if !in_quotes && !angle && comment_depth == 0 => {
                    tokens.push(&raw[start..i]);
                    start = i + 1;
                }
                _ => {}
            }
        }

        if in_quotes {
            return Err(SmtpError::address(format!("Unterminated quoted string in \"{}\"", raw)));
        }
        if angle {
            return Err(SmtpError::address(format!("Missing '>' in \"{}\"", raw)));
        }
        if comment_depth > 0 {
            return Err(SmtpError::address(format!("Unterminated comment in \"{}\"", raw)));
        }

        tokens.push(&raw[start..]);
        Ok(tokens)
    }

    /// Parses one `addr-spec` or `display-name <addr-spec>` token.
    fn parse_token(token: &str) -> SmtpResult<AddressRecord> {
        let token = strip_comments(token);
        let token = token.trim();

        let open = find_unquoted(token, '<');
        match open {
            Some(open) => {
                let close = token[open..]
                    .find('>')
                    .map(|i| open + i)
                    .ok_or_else(|| SmtpError::address(format!("Missing '>' in \"{}\"", token)))?;
                if !token[close + 1..].trim().is_empty() {
                    return Err(SmtpError::address(format!(
                        "Unexpected text after '>' in \"{}\"",
                        token
                    )));
                }
                let email = token[open + 1..close].trim();
                let name = unquote(token[..open].trim());
                AddressRecord::with_name(name, email)
            }
            None => AddressRecord::new(token),
        }
    }

    /// Validates address syntax.
    pub fn validate(email: &str) -> SmtpResult<()> {
        if email.is_empty() {
            return Err(SmtpError::address("Email address cannot be empty"));
        }

        if email.len() > MAX_ADDRESS_LEN {
            return Err(SmtpError::address("Email address too long (max 254 characters)"));
        }

        if email.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(SmtpError::address(
                "Email address cannot contain whitespace or control characters",
            ));
        }

        let (local, domain) = match email.rsplit_once('@') {
            Some(parts) => parts,
            None => return Err(SmtpError::address("Email address must contain an @")),
        };

        if local.contains('@') && !(local.starts_with('"') && local.ends_with('"')) {
            return Err(SmtpError::address("Email address must contain exactly one @"));
        }

        if local.is_empty() || local.len() > MAX_LOCAL_LEN {
            return Err(SmtpError::address("Local part must be 1-64 characters"));
        }

        if !local.starts_with('"')
            && (local.starts_with('.') || local.ends_with('.') || local.contains(".."))
        {
            return Err(SmtpError::address("Local part has misplaced dots"));
        }

        if !local.starts_with('"') && local.contains(|c: char| "()<>,;:\\[]\"".contains(c)) {
            return Err(SmtpError::address("Local part contains special characters"));
        }

        if domain.is_empty() {
            return Err(SmtpError::address("Domain cannot be empty"));
        }

        // Address literal, e.g. user@[192.0.2.1]
        if domain.starts_with('[') && domain.ends_with(']') {
            return Ok(());
        }

        for label in domain.split('.') {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(SmtpError::address(format!("Invalid domain \"{}\"", domain)));
            }
            if label.starts_with('-') || label.ends_with('-') {
                return Err(SmtpError::address(format!("Invalid domain \"{}\"", domain)));
            }
            if !label.chars().all(|c| c.is_alphanumeric() || c == '-') {
                return Err(SmtpError::address(format!("Invalid domain \"{}\"", domain)));
            }
        }

        Ok(())
    }
}

/// Removes parenthesised comments outside quoted strings.
fn strip_comments(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;

    for c in token.chars() {
        if escaped {
            escaped = false;
            if depth == 0 {
                out.push(c);
            }
            continue;
        }
        match c {
            '\\' if in_quotes || depth > 0 => {
                escaped = true;
                if depth == 0 {
                    out.push(c);
                }
            }
            '"' if depth == 0 => {
                in_quotes = !in_quotes;
                out.push(c);
            }
            '(' if !in_quotes => depth += 1,
            ')' if !in_quotes && depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// Finds a character outside double quotes.
fn find_unquoted(s: &str, target: char) -> Option<usize> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            c if c == target && !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

/// Strips surrounding quotes and resolves backslash escapes.
fn unquote(name: &str) -> String {
    let inner = name
        .strip_prefix('"')
        .and_then(|n| n.strip_suffix('"'))
        .unwrap_or(name);

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Flexible address input for message headers.
///
/// Each variant converts to a list of records through
/// [`AddressInput::into_records`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AddressInput {
    /// No addresses.
    #[default]
    Empty,
    /// A raw, possibly comma-separated, address string.
    Raw(String),
    /// A single parsed record.
    Record(AddressRecord),
    /// Several parsed records.
    Records(Vec<AddressRecord>),
    /// Several raw strings, each possibly comma-separated.
    RawList(Vec<String>),
}

impl AddressInput {
    /// Converts the input into address records.
    ///
    /// Raw strings are parsed with the given strictness; records are
    /// passed through unchanged.
    pub fn into_records(self, strict: bool) -> SmtpResult<Vec<AddressRecord>> {
        match self {
            AddressInput::Empty => Ok(Vec::new()),
            AddressInput::Raw(raw) => AddressParser::parse_list(&raw, strict),
            AddressInput::Record(record) => Ok(vec![record]),
            AddressInput::Records(records) => Ok(records),
            AddressInput::RawList(raws) => {
                let mut records = Vec::new();
                for raw in raws {
                    records.extend(AddressParser::parse_list(&raw, strict)?);
                }
                Ok(records)
            }
        }
    }

    /// Returns true if the input holds no addresses.
    pub fn is_empty(&self) -> bool {
        match self {
            AddressInput::Empty => true,
            AddressInput::Raw(raw) => raw.trim().is_empty(),
            AddressInput::Record(_) => false,
            AddressInput::Records(records) => records.is_empty(),
            AddressInput::RawList(raws) => raws.iter().all(|r| r.trim().is_empty()),
        }
    }
}

impl From<&str> for AddressInput {
    fn from(raw: &str) -> Self {
        AddressInput::Raw(raw.to_string())
    }
}

impl From<String> for AddressInput {
    fn from(raw: String) -> Self {
        AddressInput::Raw(raw)
    }
}

impl From<AddressRecord> for AddressInput {
    fn from(record: AddressRecord) -> Self {
        AddressInput::Record(record)
    }
}

impl From<Vec<AddressRecord>> for AddressInput {
    fn from(records: Vec<AddressRecord>) -> Self {
        AddressInput::Records(records)
    }
}

impl From<Vec<String>> for AddressInput {
    fn from(raws: Vec<String>) -> Self {
        AddressInput::RawList(raws)
    }
}

impl From<Vec<&str>> for AddressInput {
    fn from(raws: Vec<&str>) -> Self {
        AddressInput::RawList(raws.into_iter().map(String::from).collect())
    }
}

impl<T: Into<AddressInput>> From<Option<T>> for AddressInput {
    fn from(input: Option<T>) -> Self {
        input.map(Into::into).unwrap_or_default()
    }
}
