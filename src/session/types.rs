use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};

#[cfg(feature = "with-serde")]
use serde::{Deserialize, Serialize};

use crate::transport::TransportMode;

use super::error::{AbortCategory, ErrorClass};

/// States of the SMTP session state machine.
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Connecting,
    Greeted,
    TlsNegotiating,
    Authenticating,
    MailFrom,
    RcptTo,
    DataTransfer,
    Quitting,
    Closed,
    Aborted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::Greeted => "Greeted",
            Self::TlsNegotiating => "TLSNegotiating",
            Self::Authenticating => "Authenticating",
            Self::MailFrom => "MailFrom",
            Self::RcptTo => "RcptTo",
            Self::DataTransfer => "DataTransfer",
            Self::Quitting => "Quitting",
            Self::Closed => "Closed",
            Self::Aborted => "Aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "with-serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Sent,
    Received,
    /// Milestones observed by the driver itself: TLS progress, timeouts, policy.
    Local,
}

impl Direction {
    pub fn marker(&self) -> &'static str {
        match self {
            Self::Sent => "C:",
            Self::Received => "S:",
            Self::Local => "*:",
        }
    }
}

/// Progress recorded at each chunk boundary of a chunked `DATA` transfer.
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub index: usize,
    pub total: usize,
    pub bytes: usize,
    pub cumulative_bytes: u64,
    /// Time since the first payload byte was handed to the socket.
    pub elapsed: Duration,
}

/// One entry of a session transcript.
///
/// `timestamp` is a monotonic offset from the session start. The first event of
/// each connection attempt measures `latency_since_prior` from the start of that
/// attempt, later events from the previous event. `raw_text` is redacted before
/// the event is recorded.
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub timestamp: Duration,
    pub direction: Direction,
    pub raw_text: String,
    pub latency_since_prior: Duration,
    pub state: SessionState,
    pub attempt: usize,
    /// Bytes written on the session so far, this event included.
    pub bytes_sent: u64,
    pub chunk: Option<ChunkProgress>,
}

#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "with-serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptOutcome {
    Connected,
    Refused,
    Reset,
    Timeout,
    Failed,
}

impl AttemptOutcome {
    pub(crate) fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => Self::Refused,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => Self::Reset,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Self::Timeout,
            _ => Self::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Refused => "refused",
            Self::Reset => "reset",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
        }
    }
}

/// One TCP (and for implicit TLS, TLS) establishment.
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAttempt {
    pub host: String,
    pub address: Option<SocketAddr>,
    pub port: u16,
    pub transport_mode: TransportMode,
    pub outcome: AttemptOutcome,
    /// Offset from the session start.
    pub started: Duration,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Details of an `Aborted` session, shown to the operator.
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAbort {
    /// State the machine was in when the failure happened.
    pub state: SessionState,
    pub category: AbortCategory,
    pub class: ErrorClass,
    pub message: String,
    /// Last server reply, verbatim after redaction.
    pub last_response: Option<String>,
    pub hint: String,
}

#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "with-serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPlan {
    /// Full submission: auth, envelope, `DATA`.
    Deliver,
    /// Stop after greeting, `EHLO` and TLS negotiation. Used to cover extra
    /// ports without sending the message again.
    Handshake,
}

/// Prefix of the local events recording a transport security downgrade.
pub const POLICY_NOTE: &str = "policy:";

/// Full record of one driven session.
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub host: String,
    pub port: u16,
    pub transport: TransportMode,
    pub plan: SessionPlan,
    pub started_at: DateTime<Utc>,
    pub events: Vec<SessionEvent>,
    pub attempts: Vec<ConnectionAttempt>,
    pub final_state: SessionState,
    pub abort: Option<SessionAbort>,
    pub bytes_sent: u64,
}

impl SessionReport {
    pub fn is_closed(&self) -> bool {
        self.final_state == SessionState::Closed
    }

    pub fn abort_category(&self) -> Option<AbortCategory> {
        self.abort.as_ref().map(|abort| abort.category)
    }

    /// True once a 220 greeting was read.
    pub fn greeted(&self) -> bool {
        self.events.iter().any(|event| {
            event.direction == Direction::Received
                && event.state == SessionState::Connecting
                && event.raw_text.starts_with("220")
        })
    }

    /// True when the session went through at least one establishment attempt,
    /// was not cut short by the operator and exercised the transport it set out
    /// to use.
    pub fn concluded(&self) -> bool {
        !self.attempts.is_empty()
            && self.abort_category() != Some(AbortCategory::Cancelled)
            && !self.tls_withheld()
    }

    /// Index of the event showing that `STARTTLS` was expected but never
    /// protected the session: a required upgrade that was unavailable, or an
    /// optional one that fell back to plaintext.
    pub fn tls_withheld_at(&self) -> Option<usize> {
        if self.abort_category() == Some(AbortCategory::TlsUnavailable) {
            return Some(self.events.len().saturating_sub(1));
        }
        self.events.iter().position(|event| {
            event.direction == Direction::Local && event.raw_text.starts_with(POLICY_NOTE)
        })
    }

    pub fn tls_withheld(&self) -> bool {
        self.tls_withheld_at().is_some()
    }

    pub fn reached(&self, state: SessionState) -> bool {
        self.events.iter().any(|event| event.state == state)
    }

    /// Chunk-boundary events of the `DATA` transfer with their index in
    /// [`events`](Self::events).
    pub fn chunk_events(&self) -> impl Iterator<Item = (usize, &SessionEvent)> {
        self.events
            .iter()
            .enumerate()
            .filter(|(_, event)| event.chunk.is_some())
    }

    pub fn last_response(&self) -> Option<&str> {
        self.events
            .iter()
            .rev()
            .find(|event| event.direction == Direction::Received)
            .map(|event| event.raw_text.as_str())
    }
}

/// A parsed SMTP reply. `lines` keeps every raw line (code and separator
/// included) so the text can be shown verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl SmtpReply {
    pub fn is_positive_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_positive_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    pub fn is_transient_failure(&self) -> bool {
        (400..500).contains(&self.code)
    }

    pub fn is_permanent_failure(&self) -> bool {
        (500..600).contains(&self.code)
    }

    pub fn raw(&self) -> String {
        self.lines.join("\n")
    }

    /// Text of each line without the status code and separator.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .map(|line| line.get(4..).unwrap_or_default())
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.texts().any(|text| {
            text.split_whitespace()
                .next()
                .is_some_and(|token| token.eq_ignore_ascii_case(cap))
        })
    }

    /// Mechanisms listed by an `AUTH` (or legacy `AUTH=`) capability line.
    pub fn auth_mechanisms(&self) -> Vec<String> {
        let mut mechanisms = Vec::new();
        for text in self.texts() {
            let mut tokens = text.split(|c: char| c.is_whitespace() || c == '=');
            let Some(keyword) = tokens.next() else {
                continue;
            };
            if !keyword.eq_ignore_ascii_case("AUTH") {
                continue;
            }
            for token in tokens.filter(|token| !token.is_empty()) {
                let upper = token.to_ascii_uppercase();
                if !mechanisms.contains(&upper) {
                    mechanisms.push(upper);
                }
            }
        }
        mechanisms
    }
}
