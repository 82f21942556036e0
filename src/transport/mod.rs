//! Transport layer for SMTP connections.
//!
//! [`Connector`] opens one [`SmtpTransport`] per send; [`TcpConnector`]
//! does so over TCP with optional TLS.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::protocol::{SmtpCommand, SmtpResponse};
use crate::session::{Session, TlsMode};

/// One open connection to an SMTP server.
#[async_trait]
pub trait SmtpTransport: Send + Sync + fmt::Debug {
    /// Sends a command and receives the reply.
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse>;

    /// Sends raw data (DATA body, AUTH continuation lines).
    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()>;

    /// Reads a reply from the server.
    async fn read_response(&mut self) -> SmtpResult<SmtpResponse>;

    /// Upgrades the connection to TLS.
    async fn upgrade_tls(&mut self, session: &Session) -> SmtpResult<()>;

    /// Returns true if TLS is enabled.
    fn is_tls(&self) -> bool;

    /// Sends QUIT and closes the connection.
    async fn close(&mut self) -> SmtpResult<()>;
}

/// Opens transports for a session.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Connects to the session's server.
    ///
    /// For implicit TLS the handshake completes before this returns; the
    /// server greeting has not been read yet.
    async fn connect(&self, session: &Session) -> SmtpResult<Box<dyn SmtpTransport>>;
}

/// Default connector using [`TcpTransport`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, session: &Session) -> SmtpResult<Box<dyn SmtpTransport>> {
        let transport = TcpTransport::connect(session).await?;
        Ok(Box::new(transport))
    }
}

/// TCP connection with optional TLS.
pub struct TcpTransport {
    /// Read/write stream.
    stream: TransportStream,
    /// Command timeout.
    command_timeout: Duration,
    /// Handshake timeout.
    connect_timeout: Duration,
    /// Server address.
    address: String,
}

/// Stream type that can be plain TCP or TLS.
enum TransportStream {
    Plain(BufReader<TcpStream>),
    #[cfg(feature = "rustls-tls")]
    Tls(Box<BufReader<tokio_rustls::client::TlsStream<TcpStream>>>),
    /// Taken during a TLS upgrade, or shut down.
    Closed,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("address", &self.address)
            .field("tls_enabled", &self.is_tls())
            .field("closed", &matches!(self.stream, TransportStream::Closed))
            .finish()
    }
}

impl TcpTransport {
    /// Connects to the session's server.
    pub async fn connect(session: &Session) -> SmtpResult<Self> {
        let address = session.address();

        let stream = timeout(
            session.connect_timeout(),
            TcpStream::connect((session.host(), session.port())),
        )
        .await
        .map_err(|_| {
            SmtpError::timeout(
                SmtpErrorKind::ConnectTimeout,
                format!("Connect to {} timed out", address),
            )
        })?
        .map_err(|e| Self::map_io_error(e, &address))?;

        stream.set_nodelay(true).ok();

        let mut transport = Self {
            stream: TransportStream::Plain(BufReader::new(stream)),
            command_timeout: session.command_timeout(),
            connect_timeout: session.connect_timeout(),
            address,
        };

        // Implicit TLS is encrypted from the first byte, greeting included.
        if session.tls_mode() == TlsMode::Implicit {
            transport.upgrade_tls(session).await?;
        }

        Ok(transport)
    }

    /// Maps IO errors to SMTP errors.
    fn map_io_error(error: io::Error, address: &str) -> SmtpError {
        match error.kind() {
            io::ErrorKind::ConnectionRefused => SmtpError::new(
                SmtpErrorKind::ConnectionRefused,
                format!("Connection refused to {}", address),
            )
            .with_cause(error),
            io::ErrorKind::TimedOut => SmtpError::timeout(
                SmtpErrorKind::ConnectTimeout,
                format!("Connect to {} timed out", address),
            ),
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                SmtpError::new(SmtpErrorKind::ConnectionReset, "Connection reset by server")
                    .with_cause(error)
            }
            _ => SmtpError::connection(format!("Connection error to {}: {}", address, error))
                .with_cause(error),
        }
    }

    fn closed_error() -> SmtpError {
        SmtpError::new(SmtpErrorKind::ConnectionReset, "Connection is closed")
    }

    /// Reads lines until a complete reply has arrived.
    async fn read_response_inner<R: AsyncBufReadExt + Unpin>(
        reader: &mut R,
        timeout_duration: Duration,
    ) -> SmtpResult<SmtpResponse> {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();

            let read = timeout(timeout_duration, reader.read_line(&mut line))
                .await
                .map_err(|_| SmtpError::timeout(SmtpErrorKind::ReadTimeout, "Read timed out"))?
                .map_err(|e| SmtpError::protocol(format!("Read error: {}", e)).with_cause(e))?;

            if read == 0 {
                return Err(SmtpError::new(
                    SmtpErrorKind::ConnectionReset,
                    "Server closed connection",
                ));
            }

            let line = line.trim_end().to_string();

            // "250-" continues, "250 " ends
            let is_continuation = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line);

            if !is_continuation {
                break;
            }
        }

        SmtpResponse::parse(&lines)
    }

    /// Writes data to the stream.
    async fn write_all<W: AsyncWrite + Unpin>(
        writer: &mut W,
        data: &[u8],
        timeout_duration: Duration,
    ) -> SmtpResult<()> {
        timeout(timeout_duration, writer.write_all(data))
            .await
            .map_err(|_| SmtpError::timeout(SmtpErrorKind::WriteTimeout, "Write timed out"))?
            .map_err(|e| SmtpError::protocol(format!("Write error: {}", e)).with_cause(e))?;

        timeout(timeout_duration, writer.flush())
            .await
            .map_err(|_| SmtpError::timeout(SmtpErrorKind::WriteTimeout, "Flush timed out"))?
            .map_err(|e| SmtpError::protocol(format!("Flush error: {}", e)).with_cause(e))?;

        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> SmtpResult<()> {
        match &mut self.stream {
            TransportStream::Plain(stream) => {
                Self::write_all(stream.get_mut(), data, self.command_timeout).await
            }
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(stream) => {
                Self::write_all(stream.get_mut(), data, self.command_timeout).await
            }
            TransportStream::Closed => Err(Self::closed_error()),
        }
    }
}

#[async_trait]
impl SmtpTransport for TcpTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        let line = format!("{}\r\n", command.to_checked_line()?);
        self.write(line.as_bytes()).await?;
        self.read_response().await
    }

    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()> {
        self.write(data).await
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        match &mut self.stream {
            TransportStream::Plain(stream) => {
                Self::read_response_inner(stream, self.command_timeout).await
            }
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(stream) => {
                Self::read_response_inner(stream.as_mut(), self.command_timeout).await
            }
            TransportStream::Closed => Err(Self::closed_error()),
        }
    }

    async fn upgrade_tls(&mut self, session: &Session) -> SmtpResult<()> {
        if self.is_tls() {
            return Ok(());
        }

        #[cfg(feature = "rustls-tls")]
        {
            use rustls::pki_types::ServerName;

            let connector = tokio_rustls::TlsConnector::from(session.tls_config());
            let server_name = ServerName::try_from(session.host().to_string())
                .map_err(|_| SmtpError::tls(format!("Invalid server name: {}", session.host())))?;

            let tcp_stream = match std::mem::replace(&mut self.stream, TransportStream::Closed) {
                TransportStream::Plain(reader) => {
                    // Anything buffered now was sent before the handshake.
                    if !reader.buffer().is_empty() {
                        return Err(SmtpError::tls("Unexpected data received before TLS handshake"));
                    }
                    reader.into_inner()
                }
                other => {
                    self.stream = other;
                    return Err(Self::closed_error());
                }
            };

            let tls_stream = timeout(self.connect_timeout, connector.connect(server_name, tcp_stream))
                .await
                .map_err(|_| {
                    SmtpError::timeout(SmtpErrorKind::ConnectTimeout, "TLS handshake timed out")
                })?
                .map_err(|e| SmtpError::tls(format!("TLS handshake failed: {}", e)).with_cause(e))?;

            self.stream = TransportStream::Tls(Box::new(BufReader::new(tls_stream)));
            Ok(())
        }

        #[cfg(not(feature = "rustls-tls"))]
        {
            let _ = session;
            Err(SmtpError::configuration("No TLS implementation available"))
        }
    }

    fn is_tls(&self) -> bool {
        #[cfg(feature = "rustls-tls")]
        {
            matches!(self.stream, TransportStream::Tls(_))
        }
        #[cfg(not(feature = "rustls-tls"))]
        {
            false
        }
    }

    async fn close(&mut self) -> SmtpResult<()> {
        if matches!(self.stream, TransportStream::Closed) {
            return Ok(());
        }
        let _ = self.send_command(&SmtpCommand::Quit).await;
        match std::mem::replace(&mut self.stream, TransportStream::Closed) {
            TransportStream::Plain(mut stream) => {
                let _ = stream.get_mut().shutdown().await;
            }
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(mut stream) => {
                let _ = stream.get_mut().shutdown().await;
            }
            TransportStream::Closed => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConnectionContext;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_read_multiline_response() {
        let data = b"250-mx.example.com greets you\r\n250-SIZE 1000\r\n250 8BITMIME\r\n";
        let mut reader = BufReader::new(&data[..]);
        let response = TcpTransport::read_response_inner(&mut reader, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.message.len(), 3);
        assert_eq!(response.message[2], "8BITMIME");
    }

    #[tokio::test]
    async fn test_read_response_eof() {
        let data = b"250-partial\r\n";
        let mut reader = BufReader::new(&data[..]);
        let err = TcpTransport::read_response_inner(&mut reader, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_plain_exchange_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"220 test ESMTP\r\n").await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"NOOP\r\n");
            socket.write_all(b"250 2.0.0 OK\r\n").await.unwrap();
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"QUIT\r\n");
            socket.write_all(b"221 bye\r\n").await.unwrap();
        });

        let context = ConnectionContext::builder()
            .host("127.0.0.1")
            .port(port)
            .build()
            .unwrap();
        let mut transport = TcpTransport::connect(context.session()).await.unwrap();
        assert!(!transport.is_tls());

        let greeting = transport.read_response().await.unwrap();
        assert_eq!(greeting.code, 220);

        let reply = transport.send_command(&SmtpCommand::Noop).await.unwrap();
        assert!(reply.is_success());

        let injected = SmtpCommand::RcptTo {
            address: "<a@example.com>\r\nRCPT TO:<b@example.net>".to_string(),
        };
        let err = transport.send_command(&injected).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::InvalidRecipientAddress);

        transport.close().await.unwrap();
        assert!(transport.send_command(&SmtpCommand::Noop).await.is_err());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let context = ConnectionContext::builder()
            .host("127.0.0.1")
            .port(port)
            .build()
            .unwrap();
        let err = TcpTransport::connect(context.session()).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::ConnectionRefused);
    }
}
