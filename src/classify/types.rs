use std::fmt;

#[cfg(feature = "with-serde")]
use serde::{Deserialize, Serialize};

#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "with-serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InterferenceCategory {
    None,
    PortBlocked,
    ConnectionReset,
    Throttled,
    DpiSuspected,
    DnsManipulated,
    Indeterminate,
}

impl InterferenceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::PortBlocked => "port_blocked",
            Self::ConnectionReset => "connection_reset",
            Self::Throttled => "throttled",
            Self::DpiSuspected => "dpi_suspected",
            Self::DnsManipulated => "dns_manipulated",
            Self::Indeterminate => "indeterminate",
        }
    }

    /// True for every label that points at an intermediary.
    pub fn is_interference(&self) -> bool {
        !matches!(self, Self::None | Self::Indeterminate)
    }
}

impl fmt::Display for InterferenceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pointer into the inputs a verdict was derived from. Session and event
/// indexes refer to the slice passed to [`classify`](super::classify).
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "with-serde", serde(tag = "kind", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Evidence {
    SessionEvent { session: usize, event: usize },
    ConnectionAttempt { session: usize, attempt: usize },
    PortScan { port: u16 },
    DnsResolution,
    DnsSample { sample: usize },
    PathTrace,
    /// A requested port without a concluded session.
    Coverage { port: u16 },
}

impl fmt::Display for Evidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionEvent { session, event } => write!(f, "session #{session} event #{event}"),
            Self::ConnectionAttempt { session, attempt } => {
                write!(f, "session #{session} attempt #{attempt}")
            }
            Self::PortScan { port } => write!(f, "port scan {port}"),
            Self::DnsResolution => f.write_str("dns resolution"),
            Self::DnsSample { sample } => write!(f, "dns sample #{sample}"),
            Self::PathTrace => f.write_str("path trace"),
            Self::Coverage { port } => write!(f, "no concluded session on port {port}"),
        }
    }
}

/// The classifier's conclusion. Recomputed from its inputs, never patched.
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct InterferenceVerdict {
    pub category: InterferenceCategory,
    /// In `0.0..=1.0`.
    pub confidence: f32,
    pub evidence: Vec<Evidence>,
    pub summary: String,
}

impl InterferenceVerdict {
    pub(crate) fn new(
        category: InterferenceCategory,
        confidence: f32,
        evidence: Vec<Evidence>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            category,
            confidence: confidence.clamp(0.0, 1.0),
            evidence,
            summary: summary.into(),
        }
    }

    pub fn confidence_percent(&self) -> u8 {
        (self.confidence * 100.0).round() as u8
    }
}

impl fmt::Display for InterferenceVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}% confidence): {}",
            self.category,
            self.confidence_percent(),
            self.summary
        )
    }
}
