use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[cfg(feature = "with-serde")]
use serde::{Deserialize, Serialize};

use crate::transport::DEFAULT_SUBMISSION_PORTS;

#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "with-serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceStrategy {
    /// System `traceroute`/`tracert`, falling back to TTL-limited connects.
    #[default]
    Auto,
    External,
    Socket,
    Disabled,
}

impl TraceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::External => "external",
            Self::Socket => "socket",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for TraceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "external" | "traceroute" => Ok(Self::External),
            "socket" => Ok(Self::Socket),
            "disabled" | "off" | "none" => Ok(Self::Disabled),
            other => Err(format!("unknown trace strategy '{other}'")),
        }
    }
}

/// Knobs for the [`Prober`](super::Prober). Every step has its own timeout and
/// `deadline` bounds the whole probe.
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOptions {
    pub ports: Vec<u16>,
    pub max_hops: u8,
    pub dns_samples: usize,
    pub hop_timeout: Duration,
    pub connect_timeout: Duration,
    /// Upper bound for an external traceroute run.
    pub trace_timeout: Duration,
    pub deadline: Duration,
    /// TCP port used by the socket tracer.
    pub trace_port: u16,
    pub trace_strategy: TraceStrategy,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            ports: DEFAULT_SUBMISSION_PORTS.to_vec(),
            max_hops: 15,
            dns_samples: 2,
            hop_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(3),
            trace_timeout: Duration::from_secs(30),
            deadline: Duration::from_secs(45),
            trace_port: 80,
            trace_strategy: TraceStrategy::Auto,
        }
    }
}

impl ProbeOptions {
    /// Requested ports, sorted and deduplicated.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports = self.ports.clone();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    pub(crate) fn max_hops(&self) -> u8 {
        self.max_hops.max(1)
    }

    pub(crate) fn dns_samples(&self) -> usize {
        self.dns_samples.max(1)
    }
}
