//! # SMTP Mailer
//!
//! Layered SMTP configuration resolution and one-call mail sending:
//! - Configuration from code, a properties file, system properties and
//!   environment variables, with precedence and default inference
//! - Warnings for contradictory authentication settings
//! - Authenticated sending over STARTTLS or implicit TLS (PLAIN, LOGIN,
//!   CRAM-MD5), or unauthenticated sending with opportunistic STARTTLS
//! - Address list parsing with strict or lenient validation
//! - Plaintext, HTML and HTML-with-plaintext-alternative messages
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_smtp_mailer::{message, ConnectionContext, MessageHeaders};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Resolved from SMTP_HOST, SMTP_USER, SMTP_PASSWORD, ...
//!     let ctx = ConnectionContext::from_env()?;
//!
//!     let headers = MessageHeaders::new()
//!         .from("Sender <sender@example.com>")
//!         .to("a@example.com, B <b@example.com>")
//!         .subject("Hello from Rust!");
//!
//!     let report = message::send_plaintext(&ctx, "This is a test email.", headers).await?;
//!     println!("Message sent with ID: {}", report.message_id);
//!
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod context;
pub mod errors;

// Addresses and messages
pub mod address;
pub mod message;
pub mod mime;

// Protocol layer
pub mod protocol;

// Transport layer
pub mod session;
pub mod transport;

// Authentication
pub mod auth;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use address::{AddressInput, AddressParser, AddressRecord};
pub use auth::{AuthMethod, Credentials};
pub use config::{ConfigKey, ConfigSource, Environment, MapEnvironment, ProcessEnvironment, Properties};
pub use context::{
    default_context, ConfigWarning, ConnectionContext, ConnectionContextBuilder, ContextResolver,
    DefaultContext, ExportCredentials, RejectedRecipient, Resolution, SendReport,
};
pub use errors::{SmtpError, SmtpErrorKind, SmtpResult};
pub use message::{Body, ComposedMessage, MessageHeaders};
pub use protocol::{EsmtpCapabilities, SmtpCommand, SmtpResponse};
pub use session::{Session, TlsMode};
pub use transport::{Connector, SmtpTransport, TcpConnector};
