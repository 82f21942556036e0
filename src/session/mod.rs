//! Per-context session handle and the SMTP exchange.
//!
//! A [`Session`] carries everything needed to reach the server: address,
//! transport security, credentials and timeouts. It is created once per
//! [`ConnectionContext`](crate::context::ConnectionContext) and every send
//! opens a fresh transport from it.

use serde::{Deserialize, Serialize};
use std::fmt;
#[cfg(feature = "rustls-tls")]
use std::sync::Arc;
use std::time::Duration;

use crate::address::AddressRecord;
use crate::auth::{AuthMethod, Authenticator, Credentials};
use crate::context::{RejectedRecipient, SendReport};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::mime::MimeEncoder;
use crate::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse};
use crate::transport::{Connector, SmtpTransport};

/// Transport security for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// No TLS.
    None,
    /// Opportunistic STARTTLS: upgrade when the server offers it.
    StartTls,
    /// Required STARTTLS (fail if not supported).
    StartTlsRequired,
    /// Implicit TLS from the first byte.
    Implicit,
}

impl TlsMode {
    /// Chooses the mode for a context.
    ///
    /// Unauthenticated contexts treat STARTTLS as opportunistic.
    /// Authenticated contexts always encrypt: STARTTLS when requested,
    /// implicit TLS otherwise.
    pub fn select(authenticated: bool, use_starttls: bool) -> Self {
        match (authenticated, use_starttls) {
            (false, false) => TlsMode::None,
            (false, true) => TlsMode::StartTls,
            (true, true) => TlsMode::StartTlsRequired,
            (true, false) => TlsMode::Implicit,
        }
    }
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TlsMode::None => "none",
            TlsMode::StartTls => "starttls",
            TlsMode::StartTlsRequired => "starttls-required",
            TlsMode::Implicit => "implicit",
        };
        write!(f, "{}", name)
    }
}

/// Envelope of a single delivery.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Reverse path.
    pub from: AddressRecord,
    /// Forward paths (To, Cc and Bcc).
    pub recipients: Vec<AddressRecord>,
}

impl Envelope {
    /// Rejects paths that cannot be written on a single command line.
    pub fn check(&self) -> SmtpResult<()> {
        if !self.from.is_command_safe() {
            return Err(SmtpError::new(
                SmtpErrorKind::InvalidFromAddress,
                format!("Sender {:?} cannot be used as a reverse path", self.from.email()),
            ));
        }
        if self.recipients.is_empty() {
            return Err(SmtpError::new(
                SmtpErrorKind::InvalidRecipientAddress,
                "Envelope has no recipients",
            ));
        }
        if let Some(bad) = self.recipients.iter().find(|r| !r.is_command_safe()) {
            return Err(SmtpError::new(
                SmtpErrorKind::InvalidRecipientAddress,
                format!("Recipient {:?} cannot be used as a forward path", bad.email()),
            ));
        }
        Ok(())
    }
}

/// Connection handle shared by all sends from one context.
#[derive(Clone)]
pub struct Session {
    host: String,
    port: u16,
    tls_mode: TlsMode,
    credentials: Option<Credentials>,
    client_id: String,
    connect_timeout: Duration,
    command_timeout: Duration,
    debug: bool,
    #[cfg(feature = "rustls-tls")]
    tls_config: Arc<rustls::ClientConfig>,
}

/// Inputs for [`Session::new`].
#[derive(Debug, Clone)]
pub(crate) struct SessionParams {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub use_starttls: bool,
    pub client_id: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub debug: bool,
    #[cfg(feature = "rustls-tls")]
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl Session {
    pub(crate) fn new(params: SessionParams) -> Self {
        let tls_mode = TlsMode::select(params.credentials.is_some(), params.use_starttls);

        tracing::debug!(
            host = %params.host,
            port = params.port,
            tls_mode = %tls_mode,
            authenticated = params.credentials.is_some(),
            "Created SMTP session"
        );

        Self {
            #[cfg(feature = "rustls-tls")]
            tls_config: params.tls_config.unwrap_or_else(default_tls_config),
            host: params.host,
            port: params.port,
            tls_mode,
            credentials: params.credentials,
            client_id: params.client_id,
            connect_timeout: params.connect_timeout,
            command_timeout: params.command_timeout,
            debug: params.debug,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tls_mode(&self) -> TlsMode {
        self.tls_mode
    }

    /// Returns true if the session authenticates.
    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_some()
    }

    /// Returns the EHLO client identifier.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Returns true if protocol traffic is logged.
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Returns the TLS client configuration.
    #[cfg(feature = "rustls-tls")]
    pub fn tls_config(&self) -> Arc<rustls::ClientConfig> {
        Arc::clone(&self.tls_config)
    }

    /// Delivers one message over a fresh transport.
    ///
    /// The transport is closed whether or not delivery succeeds.
    pub async fn deliver(
        &self,
        connector: &dyn Connector,
        envelope: &Envelope,
        message_id: &str,
        message: &[u8],
    ) -> SmtpResult<SendReport> {
        envelope.check()?;
        let mut transport = connector.connect(self).await?;
        let result = self
            .transact(transport.as_mut(), envelope, message_id, message)
            .await;

        if let Err(e) = transport.close().await {
            tracing::debug!(error = %e, "Error closing SMTP transport");
        }
        result
    }

    async fn transact(
        &self,
        transport: &mut dyn SmtpTransport,
        envelope: &Envelope,
        message_id: &str,
        message: &[u8],
    ) -> SmtpResult<SendReport> {
        let greeting = transport.read_response().await?;
        self.log_reply(&greeting);
        if greeting.code != codes::SERVICE_READY {
            return Err(greeting.to_error());
        }

        let mut capabilities = self.hello(transport).await?;
        capabilities = self.secure(transport, capabilities).await?;

        if let Some(credentials) = &self.credentials {
            self.authenticate(transport, &capabilities, credentials).await?;
        }

        let data = MimeEncoder::prepare_data_content(message);
        if let Some(limit) = capabilities.size {
            if limit > 0 && data.len() > limit {
                return Err(SmtpError::message_error(
                    SmtpErrorKind::MessageTooLarge,
                    format!("Message is {} bytes, server limit is {}", data.len(), limit),
                ));
            }
        }

        let mail_from = SmtpCommand::MailFrom {
            address: envelope.from.to_smtp(),
            size: capabilities
                .has_capability("SIZE")
                .then_some(data.len()),
            body_8bit: capabilities.eight_bit_mime && !message.is_ascii(),
        };
        let reply = self.command(transport, &mail_from).await?;
        if !reply.is_success() {
            return Err(reply.to_error());
        }

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for recipient in &envelope.recipients {
            let rcpt_to = SmtpCommand::RcptTo {
                address: recipient.to_smtp(),
            };
            let reply = self.command(transport, &rcpt_to).await?;
            if reply.is_success() {
                accepted.push(recipient.clone());
            } else {
                tracing::warn!(
                    recipient = %recipient.email(),
                    code = reply.code,
                    "Recipient rejected"
                );
                rejected.push(RejectedRecipient {
                    address: recipient.clone(),
                    code: reply.code,
                    message: reply.full_message(),
                });
            }
        }

        if accepted.is_empty() {
            if let Err(e) = self.command(transport, &SmtpCommand::Rset).await {
                tracing::debug!(error = %e, "RSET after rejected recipients failed");
            }
            return Err(SmtpError::message_error(
                SmtpErrorKind::InvalidRecipientAddress,
                "All recipients were rejected",
            ));
        }

        let reply = self.command(transport, &SmtpCommand::Data).await?;
        if reply.code != codes::START_MAIL_INPUT {
            return Err(reply.to_error());
        }

        if self.debug {
            tracing::debug!(bytes = data.len(), "SMTP >> [message content]");
        }
        transport.send_data(&data).await?;

        let reply = transport.read_response().await?;
        self.log_reply(&reply);
        if !reply.is_success() {
            return Err(reply.to_error());
        }

        Ok(SendReport {
            message_id: message_id.to_string(),
            accepted,
            rejected,
            response: reply.full_message(),
        })
    }

    /// EHLO with HELO fallback.
    async fn hello(&self, transport: &mut dyn SmtpTransport) -> SmtpResult<EsmtpCapabilities> {
        let reply = self
            .command(transport, &SmtpCommand::Ehlo(self.client_id.clone()))
            .await?;
        if reply.is_success() {
            return Ok(EsmtpCapabilities::from_ehlo_response(&reply));
        }

        let reply = self
            .command(transport, &SmtpCommand::Helo(self.client_id.clone()))
            .await?;
        if !reply.is_success() {
            return Err(reply.to_error());
        }
        Ok(EsmtpCapabilities::default())
    }

    /// Performs STARTTLS when the mode calls for it.
    async fn secure(
        &self,
        transport: &mut dyn SmtpTransport,
        capabilities: EsmtpCapabilities,
    ) -> SmtpResult<EsmtpCapabilities> {
        let required = match self.tls_mode {
            TlsMode::StartTls => false,
            TlsMode::StartTlsRequired => true,
            TlsMode::None | TlsMode::Implicit => return Ok(capabilities),
        };

        if transport.is_tls() {
            return Ok(capabilities);
        }

        if !capabilities.starttls {
            if required {
                return Err(SmtpError::new(
                    SmtpErrorKind::StarttlsNotSupported,
                    format!("{} does not advertise STARTTLS", self.host),
                ));
            }
            if self.debug {
                tracing::debug!(host = %self.host, "STARTTLS not offered, continuing without TLS");
            }
            return Ok(capabilities);
        }

        let reply = self.command(transport, &SmtpCommand::StartTls).await?;
        if !reply.is_success() {
            if required {
                return Err(SmtpError::new(
                    SmtpErrorKind::StarttlsNotSupported,
                    format!("STARTTLS refused: {}", reply),
                )
                .with_smtp_code(reply.code));
            }
            return Ok(capabilities);
        }

        transport.upgrade_tls(self).await?;

        // Capabilities must be re-read over the encrypted channel.
        let reply = self
            .command(transport, &SmtpCommand::Ehlo(self.client_id.clone()))
            .await?;
        if !reply.is_success() {
            return Err(reply.to_error());
        }
        Ok(EsmtpCapabilities::from_ehlo_response(&reply))
    }

    async fn authenticate(
        &self,
        transport: &mut dyn SmtpTransport,
        capabilities: &EsmtpCapabilities,
        credentials: &Credentials,
    ) -> SmtpResult<()> {
        if !capabilities.has_auth() {
            return Err(SmtpError::new(
                SmtpErrorKind::AuthMethodNotSupported,
                format!("{} does not advertise AUTH", self.host),
            ));
        }

        let method =
            Authenticator::select_best_method(&capabilities.auth_methods(), transport.is_tls())?;

        if self.debug {
            tracing::debug!(method = %method, user = %credentials.user(), "Authenticating");
        }

        match method {
            AuthMethod::Plain => {
                let command = SmtpCommand::Auth {
                    mechanism: AuthMethod::Plain,
                    initial_response: Some(Authenticator::plain_initial_response(credentials)),
                };
                let reply = self.command(transport, &command).await?;
                Self::expect(reply, codes::AUTH_SUCCESS)
            }
            AuthMethod::Login => {
                let command = SmtpCommand::Auth {
                    mechanism: AuthMethod::Login,
                    initial_response: None,
                };
                let reply = self.command(transport, &command).await?;
                Self::expect(reply, codes::AUTH_CONTINUE)?;

                let reply = self
                    .secret_line(transport, &Authenticator::login_username(credentials))
                    .await?;
                Self::expect(reply, codes::AUTH_CONTINUE)?;

                let reply = self
                    .secret_line(transport, &Authenticator::login_password(credentials))
                    .await?;
                Self::expect(reply, codes::AUTH_SUCCESS)
            }
            AuthMethod::CramMd5 => {
                let command = SmtpCommand::Auth {
                    mechanism: AuthMethod::CramMd5,
                    initial_response: None,
                };
                let reply = self.command(transport, &command).await?;
                if reply.code != codes::AUTH_CONTINUE {
                    return Err(reply.to_error());
                }

                let answer = Authenticator::cram_md5_response(reply.first_message(), credentials)?;
                let reply = self.secret_line(transport, &answer).await?;
                Self::expect(reply, codes::AUTH_SUCCESS)
            }
        }
    }

    fn expect(reply: SmtpResponse, code: u16) -> SmtpResult<()> {
        if reply.code == code {
            Ok(())
        } else {
            Err(reply.to_error())
        }
    }

    /// Sends a command, logging both directions when debug is on.
    async fn command(
        &self,
        transport: &mut dyn SmtpTransport,
        command: &SmtpCommand,
    ) -> SmtpResult<SmtpResponse> {
        command.to_checked_line()?;
        if self.debug {
            tracing::debug!(host = %self.host, "SMTP >> {}", command.to_log_string());
        }
        let reply = transport.send_command(command).await?;
        self.log_reply(&reply);
        Ok(reply)
    }

    /// Sends an AUTH continuation line; never logged in clear.
    async fn secret_line(
        &self,
        transport: &mut dyn SmtpTransport,
        line: &str,
    ) -> SmtpResult<SmtpResponse> {
        if self.debug {
            tracing::debug!(host = %self.host, "SMTP >> [REDACTED]");
        }
        transport.send_data(format!("{}\r\n", line).as_bytes()).await?;
        let reply = transport.read_response().await?;
        self.log_reply(&reply);
        Ok(reply)
    }

    fn log_reply(&self, reply: &SmtpResponse) {
        if !self.debug {
            return;
        }
        if reply.code == codes::AUTH_CONTINUE {
            tracing::debug!(host = %self.host, code = reply.code, "SMTP << [challenge]");
        } else {
            tracing::debug!(host = %self.host, code = reply.code, "SMTP << {}", reply.full_message());
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls_mode", &self.tls_mode)
            .field("credentials", &self.credentials)
            .field("client_id", &self.client_id)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "rustls-tls")]
fn default_tls_config() -> Arc<rustls::ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConnectionContext;
    use crate::mocks::{self, MockConnector, MockTransport};
    use rstest::rstest;

    #[rstest]
    #[case(false, false, TlsMode::None)]
    #[case(false, true, TlsMode::StartTls)]
    #[case(true, true, TlsMode::StartTlsRequired)]
    #[case(true, false, TlsMode::Implicit)]
    fn test_tls_mode_selection(
        #[case] authenticated: bool,
        #[case] starttls: bool,
        #[case] expected: TlsMode,
    ) {
        assert_eq!(TlsMode::select(authenticated, starttls), expected);
    }

    fn envelope() -> Envelope {
        Envelope {
            from: AddressRecord::new("sender@example.com").unwrap(),
            recipients: vec![
                AddressRecord::new("a@example.com").unwrap(),
                AddressRecord::new("b@example.com").unwrap(),
            ],
        }
    }

    fn context(credentials: bool, starttls: bool) -> ConnectionContext {
        let mut builder = ConnectionContext::builder()
            .host("smtp.example.com")
            .starttls(starttls)
            .debug(true);
        if credentials {
            builder = builder.credentials("user", "secret");
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_plain_delivery_sequence() {
        let transport = MockTransport::new();
        transport
            .queue_response(mocks::greeting_response())
            .queue_response(mocks::ehlo_response())
            .queue_ok() // MAIL FROM
            .queue_ok() // RCPT a
            .queue_ok() // RCPT b
            .queue_response(mocks::data_ready_response())
            .queue_response(SmtpResponse::new(250, "2.0.0 Queued as ABC"));
        let connector = MockConnector::new(transport.clone());

        let ctx = context(false, false);
        let report = ctx
            .session()
            .deliver(&connector, &envelope(), "id@example.com", b"Subject: hi\r\n\r\nbody\r\n")
            .await
            .unwrap();

        assert_eq!(report.accepted.len(), 2);
        assert!(report.rejected.is_empty());
        assert_eq!(report.response, "2.0.0 Queued as ABC");

        let commands = transport.recorded_commands();
        assert_eq!(commands[0], SmtpCommand::Ehlo("localhost".to_string()));
        assert!(matches!(commands[1], SmtpCommand::MailFrom { .. }));
        assert_eq!(commands.last(), Some(&SmtpCommand::Quit));
        assert!(!commands.contains(&SmtpCommand::StartTls));
        assert!(transport.is_closed());

        let data = transport.received_data();
        assert!(data[0].ends_with(b"\r\n.\r\n"));
    }

    #[tokio::test]
    async fn test_opportunistic_starttls_skipped_when_not_offered() {
        let transport = MockTransport::new();
        transport
            .queue_response(mocks::greeting_response())
            .queue_response(SmtpResponse::multiline(250, &["mx.example.com", "8BITMIME"]))
            .queue_ok()
            .queue_ok()
            .queue_ok()
            .queue_response(mocks::data_ready_response())
            .queue_ok();
        let connector = MockConnector::new(transport.clone());

        let ctx = context(false, true);
        assert_eq!(ctx.session().tls_mode(), TlsMode::StartTls);
        ctx.session()
            .deliver(&connector, &envelope(), "id", b"x\r\n")
            .await
            .unwrap();

        assert!(!transport.recorded_commands().contains(&SmtpCommand::StartTls));
        assert!(!transport.tls_enabled());
    }

    #[tokio::test]
    async fn test_required_starttls_fails_when_not_offered() {
        let transport = MockTransport::new();
        transport
            .queue_response(mocks::greeting_response())
            .queue_response(SmtpResponse::multiline(250, &["mx.example.com", "AUTH PLAIN"]));
        let connector = MockConnector::new(transport.clone());

        let ctx = context(true, true);
        let err = ctx
            .session()
            .deliver(&connector, &envelope(), "id", b"x\r\n")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::StarttlsNotSupported);
        assert!(transport.is_closed());
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    async fn deliver_without_starttls_offer(debug: bool) -> String {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(logs.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let transport = MockTransport::new();
        transport
            .queue_response(mocks::greeting_response())
            .queue_response(SmtpResponse::multiline(250, &["mx.example.com"]))
            .queue_ok()
            .queue_ok()
            .queue_ok()
            .queue_response(mocks::data_ready_response())
            .queue_ok();
        let connector = MockConnector::new(transport.clone());
        let ctx = ConnectionContext::builder()
            .host("smtp.example.com")
            .starttls(true)
            .debug(debug)
            .build()
            .unwrap();

        ctx.session()
            .deliver(&connector, &envelope(), "id", b"x\r\n")
            .await
            .unwrap();
        logs.contents()
    }

    #[tokio::test]
    async fn test_protocol_logging_follows_debug_flag() {
        let quiet = deliver_without_starttls_offer(false).await;
        assert!(!quiet.contains("STARTTLS not offered"));
        assert!(!quiet.contains("SMTP >>"));

        let verbose = deliver_without_starttls_offer(true).await;
        assert!(verbose.contains("STARTTLS not offered"));
        assert!(verbose.contains("SMTP >> EHLO localhost"));
    }

    #[tokio::test]
    async fn test_starttls_then_plain_auth() {
        let transport = MockTransport::new();
        transport
            .queue_response(mocks::greeting_response())
            .queue_response(SmtpResponse::multiline(250, &["mx.example.com", "STARTTLS"]))
            .queue_response(SmtpResponse::new(220, "Ready to start TLS"))
            .queue_response(SmtpResponse::multiline(250, &["mx.example.com", "AUTH PLAIN LOGIN"]))
            .queue_response(mocks::auth_success_response())
            .queue_ok()
            .queue_ok()
            .queue_ok()
            .queue_response(mocks::data_ready_response())
            .queue_ok();
        let connector = MockConnector::new(transport.clone());

        let ctx = context(true, true);
        ctx.session()
            .deliver(&connector, &envelope(), "id", b"x\r\n")
            .await
            .unwrap();

        let commands = transport.recorded_commands();
        assert_eq!(commands[1], SmtpCommand::StartTls);
        assert_eq!(commands[2], SmtpCommand::Ehlo("localhost".to_string()));
        assert_eq!(
            commands[3],
            SmtpCommand::Auth {
                mechanism: AuthMethod::Plain,
                initial_response: Some(Authenticator::plain_initial_response(
                    &Credentials::new("user", "secret").unwrap()
                )),
            }
        );
        assert!(transport.tls_enabled());
    }

    #[tokio::test]
    async fn test_login_auth_exchange() {
        let transport = MockTransport::new();
        transport
            .queue_response(mocks::greeting_response())
            .queue_response(SmtpResponse::multiline(250, &["mx.example.com", "AUTH LOGIN"]))
            .queue_response(mocks::auth_continue_response("VXNlcm5hbWU6"))
            .queue_response(mocks::auth_continue_response("UGFzc3dvcmQ6"))
            .queue_response(mocks::auth_success_response())
            .queue_ok()
            .queue_ok()
            .queue_ok()
            .queue_response(mocks::data_ready_response())
            .queue_ok();
        let connector = MockConnector::new(transport.clone());

        let ctx = context(true, false);
        assert_eq!(ctx.session().tls_mode(), TlsMode::Implicit);
        ctx.session()
            .deliver(&connector, &envelope(), "id", b"x\r\n")
            .await
            .unwrap();

        assert!(transport.tls_enabled());
        let data = transport.received_data();
        assert_eq!(data[0], b"dXNlcg==\r\n".to_vec());
        assert_eq!(data[1], b"c2VjcmV0\r\n".to_vec());
    }

    #[tokio::test]
    async fn test_required_starttls_refused_by_server() {
        let transport = MockTransport::new();
        transport
            .queue_response(mocks::greeting_response())
            .queue_response(SmtpResponse::multiline(
                250,
                &["mx.example.com", "STARTTLS", "AUTH PLAIN"],
            ))
            .queue_response(SmtpResponse::new(454, "TLS not available"));
        let connector = MockConnector::new(transport.clone());

        let ctx = context(true, true);
        let err = ctx
            .session()
            .deliver(&connector, &envelope(), "id", b"x\r\n")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::StarttlsNotSupported);
        assert_eq!(err.smtp_code(), Some(454));
    }

    #[tokio::test]
    async fn test_partial_recipient_rejection() {
        let transport = MockTransport::new();
        transport
            .queue_response(mocks::greeting_response())
            .queue_response(mocks::ehlo_response())
            .queue_ok()
            .queue_error(550, "5.1.1 No such user")
            .queue_ok()
            .queue_response(mocks::data_ready_response())
            .queue_ok();
        let connector = MockConnector::new(transport.clone());

        let report = context(false, false)
            .session()
            .deliver(&connector, &envelope(), "id", b"x\r\n")
            .await
            .unwrap();

        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].address.email(), "a@example.com");
        assert_eq!(report.rejected[0].code, 550);
    }

    #[tokio::test]
    async fn test_all_recipients_rejected() {
        let transport = MockTransport::new();
        transport
            .queue_response(mocks::greeting_response())
            .queue_response(mocks::ehlo_response())
            .queue_ok()
            .queue_error(550, "No such user")
            .queue_error(550, "No such user");
        let connector = MockConnector::new(transport.clone());

        let err = context(false, false)
            .session()
            .deliver(&connector, &envelope(), "id", b"x\r\n")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::InvalidRecipientAddress);
        let commands = transport.recorded_commands();
        assert!(commands.contains(&SmtpCommand::Rset));
        assert_eq!(commands.last(), Some(&SmtpCommand::Quit));
    }

    #[tokio::test]
    async fn test_size_limit_counts_transmitted_bytes() {
        let message = b"Subject: dots\r\n\r\n.first\r\n.second\r\n";
        let size_line = format!("SIZE {}", message.len());
        let transport = MockTransport::new();
        transport
            .queue_response(mocks::greeting_response())
            .queue_response(SmtpResponse::multiline(
                250,
                &["mx.example.com", size_line.as_str()],
            ));
        let connector = MockConnector::new(transport.clone());

        let err = context(false, false)
            .session()
            .deliver(&connector, &envelope(), "id", message)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::MessageTooLarge);
        let commands = transport.recorded_commands();
        assert!(!commands.iter().any(|c| matches!(c, SmtpCommand::MailFrom { .. })));
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_line_break_in_command_is_never_written() {
        let transport = MockTransport::new();
        transport.queue_response(mocks::greeting_response());
        let connector = MockConnector::new(transport.clone());
        let ctx = ConnectionContext::builder()
            .host("smtp.example.com")
            .client_id("client.example.com\r\nRCPT TO:<other@example.net>")
            .build()
            .unwrap();

        let err = ctx
            .session()
            .deliver(&connector, &envelope(), "id", b"x\r\n")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::ConfigurationInvalid);
        assert_eq!(transport.recorded_commands(), vec![SmtpCommand::Quit]);
    }

    #[tokio::test]
    async fn test_empty_envelope_fails_before_connecting() {
        let transport = MockTransport::new();
        let connector = MockConnector::new(transport.clone());
        let empty = Envelope {
            from: AddressRecord::new("sender@example.com").unwrap(),
            recipients: Vec::new(),
        };

        let err = context(false, false)
            .session()
            .deliver(&connector, &empty, "id", b"x\r\n")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::InvalidRecipientAddress);
        assert_eq!(connector.connections(), 0);
    }

    #[tokio::test]
    async fn test_helo_fallback() {
        let transport = MockTransport::new();
        transport
            .queue_response(mocks::greeting_response())
            .queue_error(502, "Command not implemented")
            .queue_ok() // HELO
            .queue_ok()
            .queue_ok()
            .queue_ok()
            .queue_response(mocks::data_ready_response())
            .queue_ok();
        let connector = MockConnector::new(transport.clone());

        context(false, false)
            .session()
            .deliver(&connector, &envelope(), "id", b"x\r\n")
            .await
            .unwrap();

        let commands = transport.recorded_commands();
        assert_eq!(commands[1], SmtpCommand::Helo("localhost".to_string()));
    }

    #[tokio::test]
    async fn test_bad_greeting_closes_transport() {
        let transport = MockTransport::new();
        transport.queue_error(421, "Too busy");
        let connector = MockConnector::new(transport.clone());

        let err = context(false, false)
            .session()
            .deliver(&connector, &envelope(), "id", b"x\r\n")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::ServerShutdown);
        assert!(err.is_transient());
        assert!(transport.is_closed());
    }

    #[test]
    fn test_session_debug_redacts_password() {
        let ctx = context(true, true);
        let rendered = format!("{:?}", ctx.session());
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("secret"));
    }
}
