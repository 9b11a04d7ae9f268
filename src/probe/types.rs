use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[cfg(feature = "with-serde")]
use serde::{Deserialize, Serialize};

use crate::session::ErrorClass;

use super::isp::detect_isp;

/// Why a probe step could not finish. Never fatal: the step is reported as
/// [`StepStatus::Incomplete`] and the rest of the probe goes on.
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "with-serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeIncomplete {
    #[error("insufficient privilege: {0}")]
    Privilege(String),
    #[error("unsupported on this platform: {0}")]
    Unsupported(String),
    #[error("`{0}` is not installed")]
    ToolMissing(String),
    #[error("disabled by configuration")]
    Disabled,
    #[error("probe deadline elapsed")]
    Deadline,
    #[error("cancelled by operator")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

impl ProbeIncomplete {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::ProbeIncomplete
    }
}

#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "with-serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Complete,
    Incomplete(ProbeIncomplete),
}

impl StepStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }

    pub fn reason(&self) -> Option<&ProbeIncomplete> {
        match self {
            Self::Complete => None,
            Self::Incomplete(reason) => Some(reason),
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => f.write_str("complete"),
            Self::Incomplete(reason) => write!(f, "incomplete ({reason})"),
        }
    }
}

/// One resolution of the target host.
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsSample {
    pub latency: Duration,
    pub addresses: Vec<IpAddr>,
    pub error: Option<String>,
}

/// One line of a path trace. `reached` is false for a hop that never
/// answered; the trace keeps going past it.
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub ttl: u8,
    pub ip: Option<IpAddr>,
    /// Reverse-DNS name reported by the trace tool.
    pub hostname: Option<String>,
    pub rtt: Option<Duration>,
    pub reached: bool,
}

impl Hop {
    pub fn answered(ttl: u8, ip: Option<IpAddr>, rtt: Option<Duration>) -> Self {
        Self {
            ttl,
            ip,
            hostname: None,
            rtt,
            reached: true,
        }
    }

    pub fn silent(ttl: u8) -> Self {
        Self {
            ttl,
            ip: None,
            hostname: None,
            rtt: None,
            reached: false,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }
}

/// Packet loss above this share of hops is flagged.
pub const HIGH_LOSS_PERCENT: f64 = 5.0;
/// Average hop round-trip time above this is flagged.
pub const HIGH_LATENCY: Duration = Duration::from_millis(200);

/// Path health warning derived from a finished trace.
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "with-serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PathFlag {
    HighLoss { percent: f64 },
    HighLatency { average: Duration },
}

impl fmt::Display for PathFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HighLoss { percent } => write!(f, "high packet loss: {percent:.1}% of hops silent"),
            Self::HighLatency { average } => {
                write!(f, "high latency: {:.1} ms average hop round trip", average.as_secs_f64() * 1000.0)
            }
        }
    }
}

#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathTrace {
    pub destination: Option<IpAddr>,
    /// `traceroute`, `tracert` or `socket`.
    pub method: String,
    pub hops: Vec<Hop>,
    /// Access provider recognised from hop hostnames.
    pub isp: Option<String>,
}

impl PathTrace {
    pub fn new(destination: IpAddr, method: impl Into<String>, hops: Vec<Hop>) -> Self {
        Self {
            destination: Some(destination),
            method: method.into(),
            isp: detect_isp(&hops),
            hops,
        }
    }

    /// The socket tracer cannot hear intermediate routers, so its silent hops
    /// say nothing about loss.
    pub fn sees_intermediate_hops(&self) -> bool {
        !self.method.is_empty() && self.method != "socket"
    }

    pub fn reached_destination(&self) -> bool {
        let Some(destination) = self.destination else {
            return false;
        };
        self.hops
            .iter()
            .any(|hop| hop.reached && hop.ip == Some(destination))
    }

    /// Share of hops that never answered, in percent.
    pub fn loss_percent(&self) -> f64 {
        if self.hops.is_empty() {
            return 0.0;
        }
        let silent = self.hops.iter().filter(|hop| !hop.reached).count();
        silent as f64 * 100.0 / self.hops.len() as f64
    }

    pub fn average_rtt(&self) -> Option<Duration> {
        let rtts: Vec<Duration> = self.hops.iter().filter_map(|hop| hop.rtt).collect();
        if rtts.is_empty() {
            return None;
        }
        Some(rtts.iter().sum::<Duration>() / rtts.len() as u32)
    }
}

#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "with-serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortState {
    Open,
    /// Actively refused (RST).
    Closed,
    /// No answer within the connect timeout, or an unreachable error.
    Filtered,
    Error,
}

impl PortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Filtered => "filtered",
            Self::Error => "error",
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Closed | Self::Filtered)
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortProbe {
    pub port: u16,
    pub state: PortState,
    pub rtt: Option<Duration>,
    pub attempts: u8,
    pub detail: Option<String>,
}

/// Immutable outcome of one [`Prober::run`](super::Prober::run).
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub target_host: String,
    pub requested_ports: Vec<u16>,
    /// Union of every address seen across the DNS samples.
    pub resolved_ips: BTreeSet<IpAddr>,
    pub dns_latency: Option<Duration>,
    pub dns_samples: Vec<DnsSample>,
    /// Address sets from earlier resolutions of the same host in this process.
    pub prior_resolutions: Vec<BTreeSet<IpAddr>>,
    pub trace: PathTrace,
    pub port_scan: BTreeMap<u16, PortProbe>,
    pub dns_status: StepStatus,
    pub trace_status: StepStatus,
    pub scan_status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl ProbeResult {
    pub fn dns_resolved(&self) -> bool {
        !self.resolved_ips.is_empty()
    }

    pub fn path_reaches_target(&self) -> bool {
        self.trace_status.is_complete() && self.trace.reached_destination()
    }

    pub fn port_state(&self, port: u16) -> Option<PortState> {
        self.port_scan.get(&port).map(|probe| probe.state)
    }

    pub fn open_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.port_scan
            .values()
            .filter(|probe| probe.state == PortState::Open)
            .map(|probe| probe.port)
    }

    pub fn is_complete(&self) -> bool {
        self.dns_status.is_complete()
            && self.trace_status.is_complete()
            && self.scan_status.is_complete()
    }

    pub fn hops(&self) -> &[Hop] {
        &self.trace.hops
    }

    /// Loss and latency warnings for a trace that finished.
    pub fn path_flags(&self) -> Vec<PathFlag> {
        if !self.trace_status.is_complete() {
            return Vec::new();
        }
        let mut flags = Vec::new();
        let loss = self.trace.loss_percent();
        if self.trace.sees_intermediate_hops() && loss > HIGH_LOSS_PERCENT {
            flags.push(PathFlag::HighLoss { percent: loss });
        }
        if let Some(average) = self.trace.average_rtt().filter(|rtt| *rtt > HIGH_LATENCY) {
            flags.push(PathFlag::HighLatency { average });
        }
        flags
    }
}
