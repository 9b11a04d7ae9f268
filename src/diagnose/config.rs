use std::net::IpAddr;
use std::time::Duration;

use crate::classify::ClassifierOptions;
use crate::probe::ProbeOptions;
use crate::session::{Credentials, Envelope, SessionOptions};
use crate::transport::{TransportSelection, select_transport};

use super::error::DiagError;

/// SMTP server under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpTarget {
    pub host: String,
    pub port: u16,
    /// `None` lets the port decide; see [`select_transport`].
    pub use_tls: Option<bool>,
    pub credentials: Option<Credentials>,
}

impl SmtpTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls: None,
            credentials: None,
        }
    }

    pub fn selection(&self) -> TransportSelection {
        select_transport(self.port, self.use_tls)
    }
}

/// IMAP server the operator also talks to during the run. Only used to build
/// the audit allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapTarget {
    pub host: String,
    pub port: u16,
}

/// Everything one diagnostic run needs.
#[derive(Debug, Clone)]
pub struct DiagnosticConfig {
    pub smtp: SmtpTarget,
    pub imap: Option<ImapTarget>,
    pub envelope: Envelope,
    pub session: SessionOptions,
    pub probe: ProbeOptions,
    pub classifier: ClassifierOptions,
    /// Run the traffic auditor alongside the diagnosis.
    pub audit: bool,
    pub audit_interval: Duration,
    /// Open a handshake-only session on every probed port besides the main
    /// one, so the verdict can cover them.
    pub handshake_ports: bool,
}

impl Default for DiagnosticConfig {
    fn default() -> Self {
        Self {
            smtp: SmtpTarget::new("", 587),
            imap: None,
            envelope: Envelope::default(),
            session: SessionOptions::default(),
            probe: ProbeOptions::default(),
            classifier: ClassifierOptions::default(),
            audit: true,
            audit_interval: Duration::from_millis(500),
            handshake_ports: true,
        }
    }
}

impl DiagnosticConfig {
    pub fn new(smtp: SmtpTarget, envelope: Envelope) -> Self {
        Self {
            smtp,
            envelope,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), DiagError> {
        if self.smtp.host.trim().is_empty() {
            return Err(DiagError::invalid("SMTP host is empty"));
        }
        if self.smtp.port == 0 {
            return Err(DiagError::invalid("SMTP port must be non-zero"));
        }
        if self.envelope.mail_from.trim().is_empty() {
            return Err(DiagError::invalid("sender address is empty"));
        }
        if self.envelope.rcpt_to.iter().all(|rcpt| rcpt.trim().is_empty()) {
            return Err(DiagError::invalid("at least one recipient is required"));
        }
        if self.probe.ports.contains(&0) {
            return Err(DiagError::invalid("probe ports must be non-zero"));
        }
        if let Some(imap) = &self.imap {
            if imap.host.trim().is_empty() || imap.port == 0 {
                return Err(DiagError::invalid("IMAP target needs a host and a port"));
            }
        }
        Ok(())
    }

    /// Main SMTP port plus every probed port, sorted and deduplicated.
    pub fn configured_ports(&self) -> Vec<u16> {
        let mut ports = self.probe.ports();
        ports.push(self.smtp.port);
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    /// Ports that get a handshake-only session.
    pub fn handshake_ports(&self) -> Vec<u16> {
        if !self.handshake_ports {
            return Vec::new();
        }
        self.configured_ports()
            .into_iter()
            .filter(|port| *port != self.smtp.port)
            .collect()
    }
}

/// ASCII form of `host`. IP literals (bracketed or not) pass through.
pub fn normalize_host(host: &str) -> Result<String, DiagError> {
    let trimmed = host.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(DiagError::invalid("host is empty"));
    }
    let bare = trimmed.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(ip.to_string());
    }
    idna::domain_to_ascii(trimmed).map_err(|err| DiagError::idna(trimmed, err))
}
