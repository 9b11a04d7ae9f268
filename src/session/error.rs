use std::fmt;
use std::io;

use thiserror::Error;

#[cfg(feature = "with-serde")]
use serde::{Deserialize, Serialize};

use super::types::SessionState;

/// Failure that terminates a session (state machine → `Aborted`).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("no socket address to connect to for {host}")]
    NoAddress { host: String },
    #[error("I/O error during {state}: {source}")]
    Io {
        state: SessionState,
        #[source]
        source: io::Error,
    },
    #[error("connection reset during {state}: {source}")]
    Reset {
        state: SessionState,
        #[source]
        source: io::Error,
    },
    #[error("timed out waiting during {state}")]
    Timeout { state: SessionState },
    #[error("TLS handshake failed: {source}")]
    Tls {
        #[source]
        source: native_tls::Error,
    },
    #[error("STARTTLS required but not available: {reason}")]
    TlsUnavailable { reason: String },
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("server rejected {command} with {code}")]
    Rejected { command: String, code: u16 },
    #[error("server deferred {command} with {code}")]
    Deferred { command: String, code: u16 },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("session cancelled by operator")]
    Cancelled,
}

impl SessionError {
    /// Maps a socket error to the variant that carries its diagnostic meaning.
    pub(crate) fn from_io(state: SessionState, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout { state },
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Self::Reset { state, source },
            _ => Self::Io { state, source },
        }
    }

    pub fn category(&self) -> AbortCategory {
        match self {
            Self::Connect { source, .. } => match source.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => AbortCategory::Timeout,
                _ => AbortCategory::ConnectFailed,
            },
            Self::NoAddress { .. } => AbortCategory::ConnectFailed,
            Self::Io { .. } => AbortCategory::Transport,
            Self::Reset { .. } => AbortCategory::ConnectionReset,
            Self::Timeout { .. } => AbortCategory::Timeout,
            Self::Tls { .. } => AbortCategory::TlsFailed,
            Self::TlsUnavailable { .. } => AbortCategory::TlsUnavailable,
            Self::AuthRejected(_) => AbortCategory::AuthRejected,
            Self::Rejected { .. } => AbortCategory::Rejected,
            Self::Deferred { .. } => AbortCategory::Deferred,
            Self::Protocol(_) => AbortCategory::Protocol,
            Self::Cancelled => AbortCategory::Cancelled,
        }
    }
}

/// Why a session ended in `Aborted`.
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "with-serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortCategory {
    ConnectFailed,
    Transport,
    Timeout,
    ConnectionReset,
    TlsFailed,
    TlsUnavailable,
    AuthRejected,
    Rejected,
    Deferred,
    Protocol,
    Cancelled,
}

impl AbortCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectFailed => "connect_failed",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::ConnectionReset => "connection_reset",
            Self::TlsFailed => "tls_failed",
            Self::TlsUnavailable => "tls_unavailable",
            Self::AuthRejected => "auth_rejected",
            Self::Rejected => "rejected",
            Self::Deferred => "deferred",
            Self::Protocol => "protocol",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ConnectFailed
            | Self::Transport
            | Self::ConnectionReset
            | Self::TlsFailed
            | Self::Cancelled => ErrorClass::TransportError,
            Self::Timeout => ErrorClass::TimeoutError,
            Self::TlsUnavailable
            | Self::AuthRejected
            | Self::Rejected
            | Self::Deferred
            | Self::Protocol => ErrorClass::ProtocolError,
        }
    }

    /// Failures caused by the path to the server rather than by its policy.
    pub fn is_network_level(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed
                | Self::Transport
                | Self::Timeout
                | Self::ConnectionReset
                | Self::TlsFailed
        )
    }
}

impl fmt::Display for AbortCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy surfaced to the operator.
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    TransportError,
    ProtocolError,
    TimeoutError,
    ProbeIncomplete,
    ClassificationIndeterminate,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransportError => "TransportError",
            Self::ProtocolError => "ProtocolError",
            Self::TimeoutError => "TimeoutError",
            Self::ProbeIncomplete => "ProbeIncomplete",
            Self::ClassificationIndeterminate => "ClassificationIndeterminate",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plain-language hint shown next to the last server response of an aborted
/// session.
pub fn hint_for(category: AbortCategory, state: SessionState) -> &'static str {
    use AbortCategory as C;
    use SessionState as S;
    match (category, state) {
        (C::Timeout, S::Connecting) => {
            "port likely blocked upstream; try another submission port (587 or 465)"
        }
        (C::Timeout, S::DataTransfer) => {
            "transfer stalled mid-message; possible throttling or traffic inspection"
        }
        (C::Timeout, _) => "server stopped answering; check for a filtering middlebox",
        (C::ConnectFailed, _) => {
            "connection refused or unreachable; nothing listening or the port is actively blocked"
        }
        (C::ConnectionReset, S::DataTransfer) => {
            "connection reset mid-transfer; an intermediary may be cutting large messages"
        }
        (C::ConnectionReset, _) => "connection reset by the server or an intermediary",
        (C::Transport, _) => "network error while talking to the server",
        (C::TlsFailed, _) => "TLS negotiation failed; an intermediary may be intercepting TLS",
        (C::TlsUnavailable, _) => {
            "STARTTLS not offered; an intermediary may be stripping it from the EHLO reply"
        }
        (C::AuthRejected, _) => "server rejected the credentials; check username or app password",
        (C::Rejected, _) => "server refused the command; see the response text above",
        (C::Deferred, _) => "server asked to retry later; temporary policy or rate limit",
        (C::Protocol, _) => "unexpected reply from the server",
        (C::Cancelled, _) => "aborted by operator",
    }
}
