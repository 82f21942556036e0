//! Authentication mechanisms for SMTP.
//!
//! Supports:
//! - PLAIN (RFC 4616)
//! - LOGIN (obsolete but widely used)
//! - CRAM-MD5 (RFC 2195)

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::Md5;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};

/// Authentication methods supported by the mailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// PLAIN authentication (RFC 4616).
    Plain,
    /// LOGIN authentication (obsolete).
    Login,
    /// CRAM-MD5 challenge-response.
    CramMd5,
}

impl AuthMethod {
    /// Returns the SMTP AUTH mechanism name.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
            AuthMethod::CramMd5 => "CRAM-MD5",
        }
    }

    /// Returns the priority for auto-selection (higher is better).
    pub fn priority(&self) -> u8 {
        match self {
            AuthMethod::CramMd5 => 3,
            AuthMethod::Plain => 2,
            AuthMethod::Login => 1,
        }
    }

    /// Parses from SMTP capability string.
    pub fn from_capability(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(AuthMethod::Plain),
            "LOGIN" => Some(AuthMethod::Login),
            "CRAM-MD5" => Some(AuthMethod::CramMd5),
            _ => None,
        }
    }

    /// Returns true if this method sends the password in the clear.
    pub fn requires_tls(&self) -> bool {
        matches!(self, AuthMethod::Plain | AuthMethod::Login)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mechanism_name())
    }
}

/// Login user and password.
#[derive(Clone)]
pub struct Credentials {
    user: String,
    password: SecretString,
}

impl Credentials {
    /// Creates credentials. Both parts must be non-empty.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> SmtpResult<Self> {
        let user = user.into();
        let password = password.into();
        if user.is_empty() {
            return Err(SmtpError::configuration("Credentials require a non-empty user"));
        }
        if password.is_empty() {
            return Err(SmtpError::configuration("Credentials require a non-empty password"));
        }
        Ok(Self {
            user,
            password: SecretString::new(password),
        })
    }

    /// Returns the login user.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Returns the protected password.
    pub fn password(&self) -> &SecretString {
        &self.password
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.user == other.user
            && self.password.expose_secret() == other.password.expose_secret()
    }
}

impl Eq for Credentials {}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Authentication payload generation and mechanism selection.
pub struct Authenticator;

impl Authenticator {
    /// Generates the initial response for PLAIN authentication.
    pub fn plain_initial_response(credentials: &Credentials) -> String {
        // Format: \0user\0password
        let response = format!(
            "\0{}\0{}",
            credentials.user,
            credentials.password.expose_secret()
        );
        BASE64.encode(response)
    }

    /// Generates LOGIN user response.
    pub fn login_username(credentials: &Credentials) -> String {
        BASE64.encode(&credentials.user)
    }

    /// Generates LOGIN password response.
    pub fn login_password(credentials: &Credentials) -> String {
        BASE64.encode(credentials.password.expose_secret())
    }

    /// Generates CRAM-MD5 response to a base64 challenge.
    pub fn cram_md5_response(challenge: &str, credentials: &Credentials) -> SmtpResult<String> {
        let challenge_bytes = BASE64
            .decode(challenge.trim())
            .map_err(|e| SmtpError::authentication(format!("Invalid CRAM-MD5 challenge: {}", e)))?;

        type HmacMd5 = Hmac<Md5>;
        let mut mac = HmacMd5::new_from_slice(credentials.password.expose_secret().as_bytes())
            .map_err(|e| SmtpError::authentication(format!("HMAC error: {}", e)))?;
        mac.update(&challenge_bytes);
        let digest = mac.finalize().into_bytes();

        // Format: user space hex-digest
        let hex_digest: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Ok(BASE64.encode(format!("{} {}", credentials.user, hex_digest)))
    }

    /// Selects the best mechanism offered by the server.
    ///
    /// PLAIN and LOGIN are never chosen over a link without TLS.
    pub fn select_best_method(available: &[AuthMethod], tls_enabled: bool) -> SmtpResult<AuthMethod> {
        available
            .iter()
            .filter(|m| !m.requires_tls() || tls_enabled)
            .max_by_key(|m| m.priority())
            .copied()
            .ok_or_else(|| {
                let offered: Vec<_> = available.iter().map(|m| m.mechanism_name()).collect();
                SmtpError::new(
                    SmtpErrorKind::AuthMethodNotSupported,
                    format!(
                        "No usable authentication method (server offers [{}], TLS {})",
                        offered.join(", "),
                        if tls_enabled { "active" } else { "inactive" }
                    ),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::new("user", "password").unwrap()
    }

    #[test]
    fn test_auth_method_from_capability() {
        assert_eq!(AuthMethod::from_capability("PLAIN"), Some(AuthMethod::Plain));
        assert_eq!(AuthMethod::from_capability("login"), Some(AuthMethod::Login));
        assert_eq!(AuthMethod::from_capability("CRAM-MD5"), Some(AuthMethod::CramMd5));
        assert_eq!(AuthMethod::from_capability("XOAUTH2"), None);
    }

    #[test]
    fn test_credentials_require_both_parts() {
        assert!(Credentials::new("", "pw").is_err());
        assert!(Credentials::new("user", "").is_err());
        assert!(Credentials::new("user", "pw").is_ok());
    }

    #[test]
    fn test_plain_initial_response() {
        let response = Authenticator::plain_initial_response(&creds());
        let decoded = BASE64.decode(&response).unwrap();
        assert_eq!(decoded, b"\0user\0password");
    }

    #[test]
    fn test_login_responses() {
        assert_eq!(Authenticator::login_username(&creds()), BASE64.encode("user"));
        assert_eq!(Authenticator::login_password(&creds()), BASE64.encode("password"));
    }

    #[test]
    fn test_cram_md5_response() {
        // RFC 2195 example
        let credentials = Credentials::new("tim", "tanstaaftanstaaf").unwrap();
        let challenge = BASE64.encode("<1896.697170952@postoffice.reston.mci.net>");
        let response = Authenticator::cram_md5_response(&challenge, &credentials).unwrap();
        let decoded = String::from_utf8(BASE64.decode(response).unwrap()).unwrap();
        assert_eq!(decoded, "tim b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn test_select_best_method() {
        let available = vec![AuthMethod::Plain, AuthMethod::Login, AuthMethod::CramMd5];

        let method = Authenticator::select_best_method(&available, true).unwrap();
        assert_eq!(method, AuthMethod::CramMd5);

        let method = Authenticator::select_best_method(&available, false).unwrap();
        assert_eq!(method, AuthMethod::CramMd5);

        let method =
            Authenticator::select_best_method(&[AuthMethod::Login, AuthMethod::Plain], true)
                .unwrap();
        assert_eq!(method, AuthMethod::Plain);
    }

    #[test]
    fn test_select_refuses_cleartext_without_tls() {
        let err = Authenticator::select_best_method(&[AuthMethod::Plain, AuthMethod::Login], false)
            .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::AuthMethodNotSupported);

        assert!(Authenticator::select_best_method(&[], true).is_err());
    }

    #[test]
    fn test_credentials_debug() {
        let creds = Credentials::new("user", "secret_password").unwrap();
        let debug_str = format!("{:?}", creds);
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("secret_password"));
    }

    #[test]
    fn test_credentials_equality() {
        assert_eq!(creds(), creds());
        assert_ne!(creds(), Credentials::new("user", "other").unwrap());
    }
}
