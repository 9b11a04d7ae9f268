use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use native_tls::{HandshakeError, TlsConnector, TlsStream};

use crate::cancel::{CancelToken, Registration};

use super::error::SessionError;
use super::types::{SessionState, SmtpReply};

/// Byte channel the session driver talks through. The upgrade capability is the
/// only thing that differs between transports, so the state machine never
/// branches on implicit TLS versus `STARTTLS` beyond choosing when to call it.
pub trait SmtpChannel {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Applies to both reads and writes until changed.
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;
    fn upgrade_tls(&mut self, domain: &str) -> Result<(), SessionError>;
    fn is_tls(&self) -> bool;
    /// What the TLS layer exposes about the negotiated session, if anything.
    fn tls_details(&self) -> Option<String> {
        None
    }
    fn shutdown(&mut self);
}

/// Opens channels. Split out so tests can script the server side.
pub trait Connect {
    type Channel: SmtpChannel;

    fn connect(
        &self,
        addr: &SocketAddr,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> io::Result<Self::Channel>;
}

#[derive(Debug)]
enum StreamState {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Invalid,
}

/// TCP channel with an optional in-place TLS upgrade.
#[derive(Debug)]
pub struct TcpChannel {
    state: StreamState,
    connector: TlsConnector,
    _registration: Registration,
}

impl TcpChannel {
    fn tcp(&self) -> Option<&TcpStream> {
        match &self.state {
            StreamState::Plain(stream) => Some(stream),
            StreamState::Tls(stream) => Some(stream.get_ref()),
            StreamState::Invalid => None,
        }
    }
}

impl SmtpChannel for TcpChannel {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.state {
            StreamState::Plain(stream) => {
                stream.write_all(data)?;
                stream.flush()
            }
            StreamState::Tls(stream) => {
                stream.write_all(data)?;
                stream.flush()
            }
            StreamState::Invalid => Err(invalid_state()),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.state {
            StreamState::Plain(stream) => stream.read(buf),
            StreamState::Tls(stream) => stream.read(buf),
            StreamState::Invalid => Err(invalid_state()),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        let stream = self.tcp().ok_or_else(invalid_state)?;
        let timeout = Some(timeout).filter(|t| !t.is_zero());
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)
    }

    fn upgrade_tls(&mut self, domain: &str) -> Result<(), SessionError> {
        let plain = match std::mem::replace(&mut self.state, StreamState::Invalid) {
            StreamState::Plain(stream) => stream,
            StreamState::Tls(stream) => {
                self.state = StreamState::Tls(stream);
                return Ok(());
            }
            StreamState::Invalid => {
                return Err(SessionError::Protocol("invalid stream state".into()));
            }
        };
        let tls = complete_handshake(&self.connector, domain, plain)?;
        self.state = StreamState::Tls(Box::new(tls));
        Ok(())
    }

    fn is_tls(&self) -> bool {
        matches!(self.state, StreamState::Tls(_))
    }

    // native-tls hides the protocol version and cipher suite; the end-point
    // hash still tells one server certificate from another.
    fn tls_details(&self) -> Option<String> {
        let StreamState::Tls(stream) = &self.state else {
            return None;
        };
        let hash = stream.tls_server_end_point().ok().flatten()?;
        let hex: String = hash.iter().map(|byte| format!("{byte:02x}")).collect();
        Some(format!("server certificate hash {hex}"))
    }

    fn shutdown(&mut self) {
        if let Some(stream) = self.tcp() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.state = StreamState::Invalid;
    }
}

fn invalid_state() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "invalid stream state")
}

fn complete_handshake(
    connector: &TlsConnector,
    domain: &str,
    stream: TcpStream,
) -> Result<TlsStream<TcpStream>, SessionError> {
    match connector.connect(domain, stream) {
        Ok(tls) => Ok(tls),
        Err(HandshakeError::Failure(err)) => Err(SessionError::Tls { source: err }),
        Err(HandshakeError::WouldBlock(mut mid)) => loop {
            match mid.handshake() {
                Ok(tls) => break Ok(tls),
                Err(HandshakeError::Failure(err)) => {
                    break Err(SessionError::Tls { source: err });
                }
                Err(HandshakeError::WouldBlock(next)) => mid = next,
            }
        },
    }
}

/// Real network connector backed by `std::net` and `native-tls`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connector: TlsConnector,
}

impl TcpConnector {
    pub fn new(accept_invalid_certs: bool) -> Result<Self, native_tls::Error> {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;
        Ok(Self { connector })
    }
}

impl Connect for TcpConnector {
    type Channel = TcpChannel;

    fn connect(
        &self,
        addr: &SocketAddr,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> io::Result<TcpChannel> {
        let stream = if timeout.is_zero() {
            TcpStream::connect(addr)?
        } else {
            TcpStream::connect_timeout(addr, timeout)?
        };
        stream.set_nodelay(true)?;
        let registration = cancel.register(&stream);
        Ok(TcpChannel {
            state: StreamState::Plain(stream),
            connector: self.connector.clone(),
            _registration: registration,
        })
    }
}

/// RFC 5321 §4.5.3.1.5: a reply line is at most 512 octets including CRLF.
const MAX_REPLY_LINE: usize = 512;

/// Reply parser on top of a channel.
#[derive(Debug)]
pub(crate) struct Connection<C> {
    pub(crate) channel: C,
    buffer: Vec<u8>,
}

impl<C: SmtpChannel> Connection<C> {
    pub(crate) fn new(channel: C) -> Self {
        Self {
            channel,
            buffer: Vec::new(),
        }
    }

    /// Drops anything buffered before a TLS upgrade so plaintext injected ahead of
    /// the handshake is never read as a TLS-protected reply.
    pub(crate) fn discard_buffer(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }

    pub(crate) fn read_reply(&mut self, state: SessionState) -> Result<SmtpReply, SessionError> {
        let mut lines = Vec::new();
        let mut code: Option<u16> = None;
        loop {
            let line = self.read_line(state)?;
            let parsed_code = line
                .as_bytes()
                .get(..3)
                .and_then(|digits| std::str::from_utf8(digits).ok())
                .and_then(|digits| digits.parse::<u16>().ok())
                .ok_or_else(|| SessionError::Protocol(format!("invalid reply: {line}")))?;
            if let Some(existing) = code {
                if existing != parsed_code {
                    return Err(SessionError::Protocol(format!(
                        "inconsistent reply codes: {existing} vs {parsed_code}"
                    )));
                }
            } else {
                code = Some(parsed_code);
            }
            let is_last = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line);
            if is_last {
                break;
            }
        }
        Ok(SmtpReply {
            code: code.unwrap_or(0),
            lines,
        })
    }

    fn read_line(&mut self, state: SessionState) -> Result<String, SessionError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
                let mut line = self.buffer.drain(..=pos).collect::<Vec<_>>();
                if line.ends_with(b"\r\n") {
                    line.truncate(line.len() - 2);
                } else {
                    line.truncate(line.len() - 1);
                }
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }

            if self.buffer.len() > MAX_REPLY_LINE {
                return Err(SessionError::Protocol(format!(
                    "reply line exceeds {MAX_REPLY_LINE} bytes"
                )));
            }

            let mut buf = [0u8; 512];
            let read = self
                .channel
                .read(&mut buf)
                .map_err(|err| SessionError::from_io(state, err))?;
            if read == 0 {
                return Err(SessionError::from_io(
                    state,
                    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"),
                ));
            }
            self.buffer.extend_from_slice(&buf[..read]);
        }
    }
}
