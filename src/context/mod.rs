//! Resolved connection contexts.
//!
//! A [`ConnectionContext`] is the immutable result of configuration
//! resolution: where to connect, how to secure the link and whether to
//! authenticate. It owns one lazily created [`Session`] shared by every
//! send made through it.

mod resolver;

pub use resolver::{ConfigWarning, ContextResolver, Resolution};

use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::address::AddressRecord;
use crate::auth::Credentials;
use crate::config::{
    ConfigKey, ConfigSource, Environment, ProcessEnvironment, Properties, DEFAULT_CLIENT_ID,
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_CONNECT_TIMEOUT,
};
use crate::errors::{SmtpError, SmtpResult};
use crate::message::ComposedMessage;
use crate::session::{Session, SessionParams};
use crate::transport::{Connector, TcpConnector};

/// Plain SMTP port.
pub const PLAIN_PORT: u16 = 25;

/// SMTP over implicit TLS.
pub const IMPLICIT_TLS_PORT: u16 = 465;

/// Submission port, upgraded with STARTTLS.
pub const STARTTLS_PORT: u16 = 587;

/// Whether [`ConnectionContext::export_properties`] writes the password.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportCredentials {
    /// Leave the password out.
    #[default]
    Omit,
    /// Write the password in clear text.
    Include,
}

/// Outcome of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Message-ID of the sent message.
    pub message_id: String,
    /// Recipients the server accepted.
    pub accepted: Vec<AddressRecord>,
    /// Recipients the server refused.
    pub rejected: Vec<RejectedRecipient>,
    /// Final server reply to the message data.
    pub response: String,
}

/// A recipient refused at RCPT TO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecipient {
    pub address: AddressRecord,
    pub code: u16,
    pub message: String,
}

/// Immutable SMTP connection settings plus the ability to send.
#[derive(Clone)]
pub struct ConnectionContext {
    host: String,
    port: u16,
    credentials: Option<Credentials>,
    use_starttls: bool,
    debug: bool,
    client_id: String,
    connect_timeout: Duration,
    command_timeout: Duration,
    #[cfg(feature = "rustls-tls")]
    tls_config: Option<Arc<rustls::ClientConfig>>,
    connector: Arc<dyn Connector>,
    session: OnceLock<Session>,
}

impl ConnectionContext {
    /// Creates a new context builder.
    pub fn builder() -> ConnectionContextBuilder {
        ConnectionContextBuilder::default()
    }

    /// Resolves a context from the process environment.
    pub fn from_env() -> SmtpResult<Self> {
        ContextResolver::resolve(&ConfigSource::from_process())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the credentials, if the context authenticates.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn use_starttls(&self) -> bool {
        self.use_starttls
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Returns this context with a different connector.
    ///
    /// The settings are kept; the session is created afresh on next use.
    pub fn with_connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self.session = OnceLock::new();
        self
    }

    /// Returns the session, creating it on first use.
    pub fn session(&self) -> &Session {
        self.session.get_or_init(|| {
            Session::new(SessionParams {
                host: self.host.clone(),
                port: self.port,
                credentials: self.credentials.clone(),
                use_starttls: self.use_starttls,
                client_id: self.client_id.clone(),
                connect_timeout: self.connect_timeout,
                command_timeout: self.command_timeout,
                debug: self.debug,
                #[cfg(feature = "rustls-tls")]
                tls_config: self.tls_config.clone(),
            })
        })
    }

    /// Sends a composed message as-is.
    ///
    /// The message is delivered to all To, Cc and Bcc recipients over a
    /// fresh connection that is closed before this returns. No `Date`
    /// header is added; see [`crate::message::send_message`].
    pub async fn send(&self, message: &ComposedMessage) -> SmtpResult<SendReport> {
        let envelope = message.envelope()?;
        let bytes = message.to_bytes()?;

        let report = self
            .session()
            .deliver(self.connector.as_ref(), &envelope, message.message_id(), &bytes)
            .await?;

        tracing::info!(
            host = %self.host,
            message_id = %report.message_id,
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            "Message sent"
        );
        Ok(report)
    }

    /// Returns the property view of this context, without the password.
    ///
    /// The result does not round-trip authentication: resolving it yields
    /// an unauthenticated context and a missing-password warning. Use
    /// [`export_properties`](Self::export_properties) with
    /// [`ExportCredentials::Include`] for an equal context.
    pub fn to_properties(&self) -> Properties {
        self.export_properties(ExportCredentials::Omit)
    }

    /// Returns the property view of this context.
    ///
    /// With [`ExportCredentials::Include`] the result resolves back to an
    /// equal context.
    pub fn export_properties(&self, credentials: ExportCredentials) -> Properties {
        let mut props = Properties::new();
        let mut put = |key: ConfigKey, value: String| {
            if let Some(name) = key.property_name() {
                props.set(name, value);
            }
        };

        put(ConfigKey::Host, self.host.clone());
        put(ConfigKey::Port, self.port.to_string());
        put(ConfigKey::AuthFlag, self.credentials.is_some().to_string());
        if let Some(creds) = &self.credentials {
            put(ConfigKey::User, creds.user().to_string());
            if credentials == ExportCredentials::Include {
                put(ConfigKey::Password, creds.password().expose_secret().clone());
            }
        }
        put(ConfigKey::StartTlsFlag, self.use_starttls.to_string());
        put(ConfigKey::DebugFlag, self.debug.to_string());
        props
    }
}

impl PartialEq for ConnectionContext {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.credentials == other.credentials
            && self.use_starttls == other.use_starttls
            && self.debug == other.debug
            && self.client_id == other.client_id
            && self.connect_timeout == other.connect_timeout
            && self.command_timeout == other.command_timeout
    }
}

impl Eq for ConnectionContext {}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("credentials", &self.credentials)
            .field("use_starttls", &self.use_starttls)
            .field("debug", &self.debug)
            .field("client_id", &self.client_id)
            .field("connector", &self.connector)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ConnectionContext`].
#[derive(Debug, Default)]
pub struct ConnectionContextBuilder {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<SecretString>,
    starttls: bool,
    debug: bool,
    client_id: Option<String>,
    connect_timeout: Option<Duration>,
    command_timeout: Option<Duration>,
    connector: Option<Arc<dyn Connector>>,
    #[cfg(feature = "rustls-tls")]
    tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl ConnectionContextBuilder {
    /// Sets the server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the server port. Without one the port follows the
    /// authentication and STARTTLS settings.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets credentials; the context then authenticates over TLS.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Enables STARTTLS.
    pub fn starttls(mut self, enabled: bool) -> Self {
        self.starttls = enabled;
        self
    }

    /// Enables protocol logging.
    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Replaces the connector used to open transports.
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Sets the TLS client configuration. Defaults to the webpki roots.
    #[cfg(feature = "rustls-tls")]
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Builds the context.
    pub fn build(self) -> SmtpResult<ConnectionContext> {
        let host = self
            .host
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| SmtpError::configuration("Host is required"))?;

        let credentials = match (self.username, self.password) {
            (Some(user), Some(password)) => {
                Some(Credentials::new(user, password.expose_secret().clone())?)
            }
            _ => None,
        };

        let port = match self.port {
            Some(0) => return Err(SmtpError::configuration("Port must be non-zero")),
            Some(port) => port,
            None => default_port(credentials.is_some(), self.starttls),
        };

        let client_id = self
            .client_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());

        let connect_timeout = self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let command_timeout = self.command_timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        if connect_timeout.is_zero() || command_timeout.is_zero() {
            return Err(SmtpError::configuration("Timeouts must be non-zero"));
        }

        Ok(ConnectionContext {
            host,
            port,
            credentials,
            use_starttls: self.starttls,
            debug: self.debug,
            client_id,
            connect_timeout,
            command_timeout,
            #[cfg(feature = "rustls-tls")]
            tls_config: self.tls_config,
            connector: self.connector.unwrap_or_else(|| Arc::new(TcpConnector)),
            session: OnceLock::new(),
        })
    }
}

/// Port used when none is configured.
fn default_port(authenticated: bool, starttls: bool) -> u16 {
    match (authenticated, starttls) {
        (false, _) => PLAIN_PORT,
        (true, true) => STARTTLS_PORT,
        (true, false) => IMPLICIT_TLS_PORT,
    }
}

/// Lazily resolved, process-wide context.
///
/// The first successful [`get`](Self::get) resolves the context from the
/// environment and later calls return the same instance. Concurrent first
/// calls run a single resolution. Failures are not cached.
pub struct DefaultContext<E> {
    environment: E,
    cell: OnceCell<ConnectionContext>,
}

impl<E: Environment + Clone + 'static> DefaultContext<E> {
    /// Creates an unresolved default context reading `environment`.
    pub const fn new(environment: E) -> Self {
        Self {
            environment,
            cell: OnceCell::const_new(),
        }
    }

    /// Returns the context, resolving it on first use.
    pub async fn get(&self) -> SmtpResult<&ConnectionContext> {
        self.cell
            .get_or_try_init(|| async {
                let source = ConfigSource::builder()
                    .environment(self.environment.clone())
                    .build();
                ContextResolver::resolve(&source)
            })
            .await
    }

    /// Returns true once the context has been resolved.
    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }
}

impl<E: fmt::Debug> fmt::Debug for DefaultContext<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultContext")
            .field("environment", &self.environment)
            .field("context", &self.cell.get())
            .finish()
    }
}

static DEFAULT_CONTEXT: DefaultContext<ProcessEnvironment> =
    DefaultContext::new(ProcessEnvironment);

/// Returns the process-wide context resolved from the environment.
pub async fn default_context() -> SmtpResult<&'static ConnectionContext> {
    DEFAULT_CONTEXT.get().await
}
