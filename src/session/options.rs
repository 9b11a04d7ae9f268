use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

#[cfg(feature = "with-serde")]
use serde::{Deserialize, Serialize};

use crate::transport::TransportSelection;

/// Timeouts and transfer knobs for the session driver.
///
/// Each wait has its own deadline: a hang at the greeting and a hang after the
/// end-of-data sentinel mean different things.
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub helo_domain: String,
    pub connect_timeout: Duration,
    pub greeting_timeout: Duration,
    pub command_timeout: Duration,
    /// Wait for the final reply after the end-of-data sentinel.
    pub data_timeout: Duration,
    pub chunk_size: usize,
    /// Payloads larger than this are sent in `chunk_size` pieces.
    pub chunk_threshold: usize,
    pub accept_invalid_certs: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            helo_domain: String::new(),
            connect_timeout: Duration::from_secs(10),
            greeting_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
            data_timeout: Duration::from_secs(120),
            chunk_size: 8 * 1024,
            chunk_threshold: 1024 * 1024,
            accept_invalid_certs: false,
        }
    }
}

impl SessionOptions {
    pub fn helo_name<'a>(&'a self, fallback: &'a str) -> Cow<'a, str> {
        if self.helo_domain.trim().is_empty() {
            Cow::Borrowed(fallback)
        } else {
            Cow::Borrowed(self.helo_domain.as_str())
        }
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }
}

/// SMTP AUTH credentials. `Debug` never prints the password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &super::redact::REDACTION_MARKER)
            .finish()
    }
}

#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
}

impl Envelope {
    pub fn new(mail_from: impl Into<String>, rcpt_to: Vec<String>) -> Self {
        Self {
            mail_from: mail_from.into(),
            rcpt_to,
        }
    }
}

/// Where and how one session connects.
#[derive(Debug, Clone)]
pub struct SessionTarget {
    pub host: String,
    pub selection: TransportSelection,
    pub credentials: Option<Credentials>,
    pub envelope: Envelope,
}

impl SessionTarget {
    pub fn new(host: impl Into<String>, selection: TransportSelection) -> Self {
        Self {
            host: host.into(),
            selection,
            credentials: None,
            envelope: Envelope::default(),
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_envelope(mut self, envelope: Envelope) -> Self {
        self.envelope = envelope;
        self
    }

    pub fn port(&self) -> u16 {
        self.selection.port
    }
}
