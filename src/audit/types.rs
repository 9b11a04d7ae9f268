use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use thiserror::Error;

#[cfg(feature = "with-serde")]
use serde::{Deserialize, Serialize};

#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "with-serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SocketProtocol {
    Tcp,
    Udp,
}

impl SocketProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for SocketProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One connected socket owned by the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketPair {
    pub protocol: SocketProtocol,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("connection table unavailable on this platform: {0}")]
    Unsupported(String),
    #[error("cannot read {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl AuditError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Endpoints the run is expected to talk to, each with a label naming why.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    endpoints: BTreeMap<(IpAddr, u16), String>,
    any_host: BTreeMap<u16, String>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&mut self, ip: IpAddr, port: u16, label: impl Into<String>) -> &mut Self {
        self.endpoints.entry((ip, port)).or_insert_with(|| label.into());
        self
    }

    pub fn allow_addrs(
        &mut self,
        addrs: impl IntoIterator<Item = IpAddr>,
        ports: &[u16],
        label: &str,
    ) -> &mut Self {
        for ip in addrs {
            for port in ports {
                self.allow(ip, *port, label);
            }
        }
        self
    }

    /// Any remote host on `port`; used for DNS, whose servers come from the
    /// system configuration.
    pub fn allow_port(&mut self, port: u16, label: impl Into<String>) -> &mut Self {
        self.any_host.entry(port).or_insert_with(|| label.into());
        self
    }

    /// Label of the entry covering `remote`, if any.
    pub fn check(&self, remote: &SocketAddr) -> Option<&str> {
        let ip = canonical(remote.ip());
        self.endpoints
            .get(&(ip, remote.port()))
            .or_else(|| self.any_host.get(&remote.port()))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty() && self.any_host.is_empty()
    }
}

/// IPv4-mapped IPv6 addresses (dual-stack sockets) compare as IPv4.
pub(crate) fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

/// First sighting of a remote endpoint.
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub protocol: SocketProtocol,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub expected: bool,
    /// Allow-list label that matched.
    pub service: Option<String>,
}

impl fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let remote = SocketAddr::new(self.remote_addr, self.remote_port);
        write!(
            f,
            "{} {} :{} -> {} [{}]",
            self.timestamp.format("%H:%M:%S"),
            self.protocol,
            self.local_port,
            remote,
            self.service.as_deref().unwrap_or("UNEXPECTED")
        )
    }
}

#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuditSummary {
    pub total: usize,
    pub expected: usize,
    pub unexpected: usize,
    pub records: Vec<AuditRecord>,
    /// Why the audit is empty or partial.
    pub note: Option<String>,
}

impl AuditSummary {
    pub fn from_records(records: Vec<AuditRecord>, note: Option<String>) -> Self {
        let expected = records.iter().filter(|record| record.expected).count();
        Self {
            total: records.len(),
            expected,
            unexpected: records.len() - expected,
            records,
            note,
        }
    }

    pub fn unexpected_records(&self) -> impl Iterator<Item = &AuditRecord> {
        self.records.iter().filter(|record| !record.expected)
    }

    /// True when nothing unexpected was seen and the audit actually ran.
    pub fn is_clean(&self) -> bool {
        self.unexpected == 0 && self.note.is_none()
    }
}
