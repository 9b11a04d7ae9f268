//! Network path prober.
//!
//! [`Prober::run`] looks at the target host independently of any SMTP session:
//! DNS samples, a hop-by-hop path trace and a TCP scan of the candidate
//! submission ports. Each step runs on its own thread with its own timeouts; the
//! result is finalized when all of them report or the probe deadline elapses,
//! whichever comes first. A step that could not finish is marked
//! [`StepStatus::Incomplete`] instead of failing the probe.

mod dns;
mod isp;
mod options;
mod scan;
mod trace;
mod types;

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
pub use dns::{ResolveHost, SystemResolver};
pub use isp::detect_isp;
pub use options::{ProbeOptions, TraceStrategy};
pub use scan::{PortDialer, TcpDialer, classify_connect_error};
pub use trace::{AutoTracer, ExternalTraceroute, PathTracer, SocketTracer, parse_traceroute, tracer_for};
pub use types::{
    DnsSample, HIGH_LATENCY, HIGH_LOSS_PERCENT, Hop, PathFlag, PathTrace, PortProbe, PortState,
    ProbeIncomplete, ProbeResult, StepStatus,
};

use crate::cancel::CancelToken;

use dns::DnsOutcome;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

enum StepReport {
    Dns(DnsOutcome),
    Trace(Result<PathTrace, ProbeIncomplete>),
    /// One scanned port; the scan step sends these before its final status.
    Port(PortProbe),
    Scan(StepStatus),
}

/// Runs probes and remembers what each host resolved to earlier in the
/// process.
pub struct Prober {
    options: ProbeOptions,
    resolver: Arc<dyn ResolveHost>,
    tracer: Option<Arc<dyn PathTracer>>,
    dialer: Arc<dyn PortDialer>,
    history: Mutex<BTreeMap<String, Vec<BTreeSet<IpAddr>>>>,
}

impl std::fmt::Debug for Prober {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober")
            .field("options", &self.options)
            .field("tracing", &self.tracer.is_some())
            .finish_non_exhaustive()
    }
}

impl Prober {
    /// Prober backed by the system resolver, real sockets and the tracer chosen
    /// by `options.trace_strategy`.
    pub fn new(options: ProbeOptions) -> std::io::Result<Self> {
        let resolver = Arc::new(SystemResolver::new()?);
        let tracer = tracer_for(options.trace_strategy).map(Arc::from);
        Ok(Self::with_parts(options, resolver, tracer, Arc::new(TcpDialer)))
    }

    pub fn with_parts(
        options: ProbeOptions,
        resolver: Arc<dyn ResolveHost>,
        tracer: Option<Arc<dyn PathTracer>>,
        dialer: Arc<dyn PortDialer>,
    ) -> Self {
        Self {
            options,
            resolver,
            tracer,
            dialer,
            history: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn options(&self) -> &ProbeOptions {
        &self.options
    }

    /// Records a resolution of `host` made elsewhere (e.g. by the session
    /// driver) so later probes can compare against it.
    pub fn remember(&self, host: &str, addresses: impl IntoIterator<Item = IpAddr>) {
        let set: BTreeSet<IpAddr> = addresses.into_iter().collect();
        if set.is_empty() {
            return;
        }
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(history_key(host))
            .or_default()
            .push(set);
    }

    fn prior_resolutions(&self, host: &str) -> Vec<BTreeSet<IpAddr>> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&history_key(host))
            .cloned()
            .unwrap_or_default()
    }

    pub fn run(&self, host: &str, cancel: &CancelToken) -> ProbeResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let ports = self.options.ports();
        let prior_resolutions = self.prior_resolutions(host);
        tracing::info!(host, ?ports, "probe starting");

        let (tx, rx) = mpsc::channel();
        let mut dns: Option<DnsOutcome> = None;
        let mut trace: Option<Result<PathTrace, ProbeIncomplete>> = None;
        let mut scan: Option<StepStatus> = None;
        let mut port_scan: BTreeMap<u16, PortProbe> = BTreeMap::new();
        let mut pending = 0usize;

        {
            let tx = tx.clone();
            let resolver = Arc::clone(&self.resolver);
            let host = host.to_string();
            let samples = self.options.dns_samples();
            let cancel = cancel.clone();
            let spawned = thread::Builder::new().name("probe-dns".into()).spawn(move || {
                let outcome = dns::sample_dns(resolver.as_ref(), &host, samples, &cancel);
                let _ = tx.send(StepReport::Dns(outcome));
            });
            match spawned {
                Ok(_) => pending += 1,
                Err(err) => {
                    dns = Some(DnsOutcome {
                        samples: Vec::new(),
                        resolved: BTreeSet::new(),
                        status: StepStatus::Incomplete(ProbeIncomplete::Failed(format!(
                            "cannot start dns step: {err}"
                        ))),
                    });
                }
            }
        }

        match &self.tracer {
            None => trace = Some(Err(ProbeIncomplete::Disabled)),
            Some(tracer) => {
                let tx = tx.clone();
                let resolver = Arc::clone(&self.resolver);
                let tracer = Arc::clone(tracer);
                let host = host.to_string();
                let options = self.options.clone();
                let cancel = cancel.clone();
                let spawned = thread::Builder::new().name("probe-trace".into()).spawn(move || {
                    let result = dns::target_address(resolver.as_ref(), &host)
                        .and_then(|ip| tracer.trace(ip, &options, &cancel));
                    let _ = tx.send(StepReport::Trace(result));
                });
                match spawned {
                    Ok(_) => pending += 1,
                    Err(err) => {
                        trace = Some(Err(ProbeIncomplete::Failed(format!(
                            "cannot start trace step: {err}"
                        ))));
                    }
                }
            }
        }

        {
            let tx = tx.clone();
            let resolver = Arc::clone(&self.resolver);
            let dialer = Arc::clone(&self.dialer);
            let host = host.to_string();
            let ports = ports.clone();
            let timeout = self.options.connect_timeout;
            let cancel = cancel.clone();
            let spawned = thread::Builder::new().name("probe-scan".into()).spawn(move || {
                let status = match dns::target_address(resolver.as_ref(), &host) {
                    Ok(ip) => {
                        let port_tx = tx.clone();
                        let finished = move |probe: PortProbe| {
                            let _ = port_tx.send(StepReport::Port(probe));
                        };
                        scan::scan_ports(dialer.as_ref(), ip, &ports, timeout, &cancel, &finished)
                    }
                    Err(reason) => StepStatus::Incomplete(reason),
                };
                let _ = tx.send(StepReport::Scan(status));
            });
            match spawned {
                Ok(_) => pending += 1,
                Err(err) => {
                    scan = Some(StepStatus::Incomplete(ProbeIncomplete::Failed(format!(
                        "cannot start scan step: {err}"
                    ))));
                }
            }
        }
        drop(tx);

        let deadline = clock + self.options.deadline;
        while pending > 0 && !cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(host, pending, "probe deadline elapsed");
                break;
            }
            let report = match rx.recv_timeout((deadline - now).min(POLL_INTERVAL)) {
                Ok(report) => report,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            match report {
                StepReport::Port(probe) => {
                    port_scan.insert(probe.port, probe);
                }
                StepReport::Dns(outcome) => {
                    pending -= 1;
                    dns = Some(outcome);
                }
                StepReport::Trace(result) => {
                    pending -= 1;
                    trace = Some(result);
                }
                StepReport::Scan(status) => {
                    pending -= 1;
                    scan = Some(status);
                }
            }
        }
        // ports measured before the probe stopped waiting stay in the result
        while let Ok(report) = rx.try_recv() {
            if let StepReport::Port(probe) = report {
                port_scan.insert(probe.port, probe);
            }
        }

        let unfinished = || {
            if cancel.is_cancelled() {
                ProbeIncomplete::Cancelled
            } else if Instant::now() >= deadline {
                ProbeIncomplete::Deadline
            } else {
                ProbeIncomplete::Failed("step exited without a result".into())
            }
        };

        let dns = dns.unwrap_or_else(|| DnsOutcome {
            samples: Vec::new(),
            resolved: BTreeSet::new(),
            status: StepStatus::Incomplete(unfinished()),
        });
        if !dns.resolved.is_empty() {
            self.remember(host, dns.resolved.iter().copied());
        }
        let (trace, trace_status) = match trace.unwrap_or_else(|| Err(unfinished())) {
            Ok(trace) => (trace, StepStatus::Complete),
            Err(reason) => {
                tracing::info!(host, %reason, "path trace incomplete");
                (PathTrace::default(), StepStatus::Incomplete(reason))
            }
        };
        let scan_status = scan.unwrap_or_else(|| StepStatus::Incomplete(unfinished()));
        if let StepStatus::Incomplete(reason) = &scan_status {
            tracing::info!(host, %reason, scanned = port_scan.len(), "port scan incomplete");
        }

        let result = ProbeResult {
            target_host: host.to_string(),
            requested_ports: ports,
            resolved_ips: dns.resolved,
            dns_latency: dns
                .samples
                .iter()
                .find(|sample| sample.error.is_none())
                .map(|sample| sample.latency),
            dns_samples: dns.samples,
            prior_resolutions,
            trace,
            port_scan,
            dns_status: dns.status,
            trace_status,
            scan_status,
            started_at,
            elapsed: clock.elapsed(),
        };
        tracing::info!(
            host,
            resolved = result.resolved_ips.len(),
            hops = result.trace.hops.len(),
            complete = result.is_complete(),
            "probe finished"
        );
        result
    }
}

fn history_key(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests;
