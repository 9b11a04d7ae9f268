use std::fmt;

#[cfg(feature = "with-serde")]
use serde::{Deserialize, Serialize};

/// How the session driver secures the connection.
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportMode {
    /// TLS handshake before any SMTP byte (SMTPS, port 465).
    ImplicitTls,
    /// Plaintext greeting, then `STARTTLS` and an in-place upgrade.
    OpportunisticTls,
    Plaintext,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImplicitTls => "implicit-tls",
            Self::OpportunisticTls => "starttls",
            Self::Plaintext => "plaintext",
        }
    }

    pub fn uses_tls(&self) -> bool {
        !matches!(self, Self::Plaintext)
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`select_transport`](crate::transport::select_transport).
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSelection {
    pub port: u16,
    pub mode: TransportMode,
    /// When true a failed upgrade aborts the session instead of degrading to
    /// plaintext.
    pub tls_required: bool,
    pub warning: Option<String>,
}

impl TransportSelection {
    pub fn new(port: u16, mode: TransportMode, tls_required: bool) -> Self {
        Self {
            port,
            mode,
            tls_required,
            warning: None,
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }
}
