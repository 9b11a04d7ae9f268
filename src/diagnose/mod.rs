//! One diagnostic run: auditor, prober and session driver wired together.
//!
//! The prober runs on its own thread while the caller's thread drives the main
//! delivery session and then a handshake-only session on every other probed
//! port. Once both sides are done the auditor is stopped, the classifier runs
//! and everything is folded into a [`DiagnosticReport`].

mod config;
mod error;

use std::collections::BTreeSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::thread;

use chrono::Utc;

pub use config::{DiagnosticConfig, ImapTarget, SmtpTarget, normalize_host};
pub use error::DiagError;

use crate::audit::{AllowList, ConnectionTable, ProcNetTable, TrafficAuditor};
use crate::cancel::CancelToken;
use crate::classify::{classify, recommendations};
use crate::probe::{ProbeOptions, ProbeResult, Prober};
use crate::report::DiagnosticReport;
use crate::session::{
    Connect, SessionDriver, SessionPlan, SessionTarget, TcpConnector, resolve_addrs,
};
use crate::transport::select_transport;

const DNS_PORT: u16 = 53;

type ResolveFn<'a> = &'a (dyn Fn(&str, u16) -> io::Result<Vec<SocketAddr>> + Sync);

/// Collaborators of a run. Real sockets in [`run_diagnostics`], stubs in tests.
pub(crate) struct Toolkit<'a, C> {
    pub(crate) connector: &'a C,
    pub(crate) prober: &'a Prober,
    pub(crate) resolve: ResolveFn<'a>,
    pub(crate) table: Option<Box<dyn ConnectionTable>>,
}

/// Runs a full diagnosis against the configured server.
///
/// Only configuration and setup problems are errors. Session failures, probe
/// steps that could not finish and interference all end up in the report.
pub fn run_diagnostics(
    config: &DiagnosticConfig,
    message: &[u8],
    cancel: &CancelToken,
) -> Result<DiagnosticReport, DiagError> {
    let connector =
        TcpConnector::new(config.session.accept_invalid_certs).map_err(DiagError::tls)?;
    let prober = Prober::new(probe_options(config)).map_err(DiagError::resolver_init)?;
    let table: Option<Box<dyn ConnectionTable>> = if config.audit {
        Some(Box::new(ProcNetTable))
    } else {
        None
    };
    run_with(
        config,
        message,
        cancel,
        Toolkit {
            connector: &connector,
            prober: &prober,
            resolve: &resolve_addrs,
            table,
        },
    )
}

/// Probe only: no SMTP session, no classification.
pub fn run_probe(config: &DiagnosticConfig, cancel: &CancelToken) -> Result<ProbeResult, DiagError> {
    let host = normalize_host(&config.smtp.host)?;
    let prober = Prober::new(probe_options(config)).map_err(DiagError::resolver_init)?;
    Ok(prober.run(&host, cancel))
}

/// The probe always scans the main SMTP port too.
fn probe_options(config: &DiagnosticConfig) -> ProbeOptions {
    ProbeOptions {
        ports: config.configured_ports(),
        ..config.probe.clone()
    }
}

pub(crate) fn run_with<C>(
    config: &DiagnosticConfig,
    message: &[u8],
    cancel: &CancelToken,
    toolkit: Toolkit<'_, C>,
) -> Result<DiagnosticReport, DiagError>
where
    C: Connect,
{
    config.validate()?;
    let started_at = Utc::now();
    let host = normalize_host(&config.smtp.host)?;
    let selection = config.smtp.selection();
    if let Some(warning) = &selection.warning {
        tracing::warn!(port = selection.port, %warning, "transport selection");
    }

    let addrs = match (toolkit.resolve)(&host, config.smtp.port) {
        Ok(addrs) => addrs,
        Err(err) => {
            tracing::warn!(%host, error = %err, "address resolution failed");
            Vec::new()
        }
    };
    let ips: BTreeSet<IpAddr> = addrs.iter().map(SocketAddr::ip).collect();
    toolkit.prober.remember(&host, ips.iter().copied());
    tracing::info!(%host, port = config.smtp.port, mode = %selection.mode, addresses = ips.len(), "diagnosis starting");

    let auditor = match toolkit.table {
        Some(table) => {
            let allow = allow_list(config, &ips, toolkit.resolve);
            let auditor = TrafficAuditor::start(table, allow, config.audit_interval)
                .map_err(|err| DiagError::spawn("traffic-audit", err))?;
            Some(auditor)
        }
        None => None,
    };

    let driver = SessionDriver::new(toolkit.connector, &config.session, cancel);
    let prober = toolkit.prober;
    let (sessions, probe) = thread::scope(|scope| {
        let probe_handle = thread::Builder::new()
            .name("probe".into())
            .spawn_scoped(scope, || prober.run(&host, cancel))
            .map_err(|err| DiagError::spawn("probe", err))?;

        let mut sessions = Vec::new();
        let target = SessionTarget::new(host.clone(), selection.clone())
            .with_credentials(config.smtp.credentials.clone())
            .with_envelope(config.envelope.clone());
        sessions.push(driver.run(&target, &addrs, SessionPlan::Deliver, message));

        for port in config.handshake_ports() {
            if cancel.is_cancelled() {
                break;
            }
            let target = SessionTarget::new(host.clone(), select_transport(port, None));
            let port_addrs: Vec<SocketAddr> = ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect();
            sessions.push(driver.run(&target, &port_addrs, SessionPlan::Handshake, &[]));
        }

        let probe = probe_handle
            .join()
            .map_err(|_| DiagError::WorkerPanicked { name: "probe" })?;
        Ok::<_, DiagError>((sessions, probe))
    })?;

    let audit = auditor.map(TrafficAuditor::finish);
    let verdict = classify(&sessions, &probe, &config.classifier);
    let recommendations = recommendations(&verdict, &probe);
    let path_flags = probe.path_flags();
    tracing::info!(category = %verdict.category, confidence = verdict.confidence, "diagnosis finished");

    Ok(DiagnosticReport {
        target: host,
        port: config.smtp.port,
        selection,
        started_at,
        finished_at: Utc::now(),
        sessions,
        probe,
        verdict,
        path_flags,
        recommendations,
        audit,
    })
}

/// SMTP addresses on every probed port, the trace port, DNS to any server and
/// the IMAP server when one is configured.
fn allow_list(config: &DiagnosticConfig, smtp_ips: &BTreeSet<IpAddr>, resolve: ResolveFn<'_>) -> AllowList {
    let mut allow = AllowList::new();
    let mut ports = config.configured_ports();
    ports.push(config.probe.trace_port);
    allow
        .allow_addrs(smtp_ips.iter().copied(), &ports, "smtp")
        .allow_port(DNS_PORT, "dns");
    if let Some(imap) = &config.imap {
        match normalize_host(&imap.host).map(|host| resolve(&host, imap.port)) {
            Ok(Ok(addrs)) => {
                allow.allow_addrs(addrs.iter().map(SocketAddr::ip), &[imap.port], "imap");
            }
            Ok(Err(err)) => tracing::warn!(host = %imap.host, error = %err, "IMAP host not resolved"),
            Err(err) => tracing::warn!(host = %imap.host, error = %err, "IMAP host rejected"),
        }
    }
    allow
}
