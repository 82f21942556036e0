//! Mock implementations for testing.
//!
//! [`MockTransport`] replays scripted server replies and records what the
//! client sent. Clones share state, so a test can keep one handle while
//! [`MockConnector`] hands another to the code under test.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::{SmtpError, SmtpResult};
use crate::protocol::{codes, SmtpCommand, SmtpResponse};
use crate::session::{Session, TlsMode};
use crate::transport::{Connector, SmtpTransport};

#[derive(Debug, Default)]
struct MockState {
    commands: Vec<SmtpCommand>,
    responses: VecDeque<SmtpResponse>,
    data_received: Vec<Vec<u8>>,
    fail_next: Option<SmtpError>,
}

/// Mock SMTP transport for testing.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    default_response: SmtpResponse,
    tls_enabled: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MockTransport {
    /// Creates a new mock transport. Unscripted replies are `250 OK`.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            default_response: SmtpResponse::new(codes::OK, "OK"),
            tls_enabled: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the recorded exchange.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues a reply.
    pub fn queue_response(&self, response: SmtpResponse) -> &Self {
        self.state().responses.push_back(response);
        self
    }

    /// Queues an OK reply.
    pub fn queue_ok(&self) -> &Self {
        self.queue_response(SmtpResponse::new(codes::OK, "OK"))
    }

    /// Queues an error reply.
    pub fn queue_error(&self, code: u16, message: &str) -> &Self {
        self.queue_response(SmtpResponse::new(code, message))
    }

    /// Queues the replies of a complete unauthenticated delivery to
    /// `recipients` accepted recipients.
    pub fn script_delivery(&self, recipients: usize) -> &Self {
        self.queue_response(greeting_response())
            .queue_response(ehlo_response())
            .queue_ok();
        for _ in 0..recipients {
            self.queue_ok();
        }
        self.queue_response(data_ready_response())
            .queue_response(SmtpResponse::new(codes::OK, "Message accepted"))
    }

    /// Sets the next call to fail.
    pub fn fail_next_with(&self, error: SmtpError) -> &Self {
        self.state().fail_next = Some(error);
        self
    }

    /// Returns recorded commands.
    pub fn recorded_commands(&self) -> Vec<SmtpCommand> {
        self.state().commands.clone()
    }

    /// Returns received data.
    pub fn received_data(&self) -> Vec<Vec<u8>> {
        self.state().data_received.clone()
    }

    /// Returns the DATA payload, if one was sent.
    pub fn message_content(&self) -> Option<String> {
        self.state()
            .data_received
            .iter()
            .rev()
            .find(|d| d.ends_with(b"\r\n.\r\n"))
            .map(|d| String::from_utf8_lossy(d).into_owned())
    }

    /// Returns true once TLS has been negotiated.
    pub fn tls_enabled(&self) -> bool {
        self.tls_enabled.load(Ordering::SeqCst)
    }

    /// Returns true once the transport has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Clears recorded data.
    pub fn clear(&self) {
        let mut state = self.state();
        state.commands.clear();
        state.responses.clear();
        state.data_received.clear();
        state.fail_next = None;
        self.tls_enabled.store(false, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
    }

    fn take_failure(&self) -> SmtpResult<()> {
        match self.state().fail_next.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn next_response(&self) -> SmtpResponse {
        self.state()
            .responses
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SmtpTransport for MockTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        self.take_failure()?;
        self.state().commands.push(command.clone());
        Ok(self.next_response())
    }

    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()> {
        self.take_failure()?;
        self.state().data_received.push(data.to_vec());
        Ok(())
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        self.take_failure()?;
        Ok(self.next_response())
    }

    async fn upgrade_tls(&mut self, _session: &Session) -> SmtpResult<()> {
        self.take_failure()?;
        self.tls_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls_enabled()
    }

    async fn close(&mut self) -> SmtpResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state().commands.push(SmtpCommand::Quit);
        }
        Ok(())
    }
}

/// Connector handing out clones of one [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockConnector {
    transport: MockTransport,
    connections: Arc<AtomicUsize>,
    fail_connect: Arc<Mutex<Option<SmtpError>>>,
    last_session: Arc<Mutex<Option<Session>>>,
}

impl MockConnector {
    /// Creates a connector for the given transport.
    pub fn new(transport: MockTransport) -> Self {
        Self {
            transport,
            connections: Arc::new(AtomicUsize::new(0)),
            fail_connect: Arc::new(Mutex::new(None)),
            last_session: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns the shared transport.
    pub fn transport(&self) -> &MockTransport {
        &self.transport
    }

    /// Makes the next connect attempt fail.
    pub fn fail_next_connect(&self, error: SmtpError) {
        *self
            .fail_connect
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(error);
    }

    /// Returns the number of connections opened.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Returns the session of the most recent connect.
    pub fn last_session(&self) -> Option<Session> {
        self.last_session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, session: &Session) -> SmtpResult<Box<dyn SmtpTransport>> {
        let failure = self
            .fail_connect
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(error) = failure {
            return Err(error);
        }

        self.connections.fetch_add(1, Ordering::SeqCst);
        *self
            .last_session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session.clone());

        let mut transport = self.transport.clone();
        if session.tls_mode() == TlsMode::Implicit {
            transport.upgrade_tls(session).await?;
        }
        Ok(Box::new(transport))
    }
}

/// Creates an EHLO reply with standard capabilities.
pub fn ehlo_response() -> SmtpResponse {
    SmtpResponse::multiline(
        codes::OK,
        &[
            "smtp.example.com Hello",
            "SIZE 10485760",
            "AUTH PLAIN LOGIN CRAM-MD5",
            "STARTTLS",
            "8BITMIME",
            "PIPELINING",
            "ENHANCEDSTATUSCODES",
        ],
    )
}

/// Creates a greeting reply.
pub fn greeting_response() -> SmtpResponse {
    SmtpResponse::new(codes::SERVICE_READY, "smtp.example.com ESMTP ready")
}

/// Creates an authentication success reply.
pub fn auth_success_response() -> SmtpResponse {
    SmtpResponse::new(codes::AUTH_SUCCESS, "Authentication successful")
}

/// Creates a DATA ready reply.
pub fn data_ready_response() -> SmtpResponse {
    SmtpResponse::new(codes::START_MAIL_INPUT, "Start mail input")
}

/// Creates an AUTH continue reply.
pub fn auth_continue_response(challenge: &str) -> SmtpResponse {
    SmtpResponse::new(codes::AUTH_CONTINUE, challenge)
}
