use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Instant;

use trust_dns_resolver::Resolver;
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};

use crate::cancel::CancelToken;

use super::types::{DnsSample, ProbeIncomplete, StepStatus};

/// Host to address lookup. Split out so tests can stub DNS answers.
pub trait ResolveHost: Send + Sync {
    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// `trust-dns` resolver built from the system configuration.
pub struct SystemResolver {
    resolver: Resolver,
}

impl SystemResolver {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            resolver: Resolver::from_system_conf()?,
        })
    }
}

impl std::fmt::Debug for SystemResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemResolver").finish_non_exhaustive()
    }
}

impl ResolveHost for SystemResolver {
    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        match self.resolver.lookup_ip(host) {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(err) if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DnsOutcome {
    pub(crate) samples: Vec<DnsSample>,
    pub(crate) resolved: BTreeSet<IpAddr>,
    pub(crate) status: StepStatus,
}

/// Resolves `host` `samples` times. A failed lookup is a sample with no
/// addresses, not a step failure.
pub(crate) fn sample_dns(
    resolver: &dyn ResolveHost,
    host: &str,
    samples: usize,
    cancel: &CancelToken,
) -> DnsOutcome {
    let mut outcome = DnsOutcome {
        samples: Vec::with_capacity(samples),
        resolved: BTreeSet::new(),
        status: StepStatus::Complete,
    };
    for round in 0..samples {
        if cancel.is_cancelled() {
            outcome.status = StepStatus::Incomplete(ProbeIncomplete::Cancelled);
            break;
        }
        let start = Instant::now();
        let result = resolver.resolve(host);
        let latency = start.elapsed();
        let sample = match result {
            Ok(addresses) => {
                tracing::debug!(host, round, count = addresses.len(), ?latency, "dns sample");
                outcome.resolved.extend(addresses.iter().copied());
                DnsSample {
                    latency,
                    addresses,
                    error: None,
                }
            }
            Err(err) => {
                tracing::info!(host, round, error = %err, "dns lookup failed");
                DnsSample {
                    latency,
                    addresses: Vec::new(),
                    error: Some(err.to_string()),
                }
            }
        };
        outcome.samples.push(sample);
    }
    outcome
}

/// First address the scan and trace steps aim at. IPv4 is preferred since
/// most access networks still route it best.
pub(crate) fn target_address(
    resolver: &dyn ResolveHost,
    host: &str,
) -> Result<IpAddr, ProbeIncomplete> {
    let addresses = resolver
        .resolve(host)
        .map_err(|err| ProbeIncomplete::Failed(format!("cannot resolve {host}: {err}")))?;
    addresses
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addresses.first())
        .copied()
        .ok_or_else(|| ProbeIncomplete::Failed(format!("{host} has no address")))
}
