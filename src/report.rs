//! End-of-run report and its renderings.
//!
//! Components keep their own append-only logs during the run; they only meet
//! here. Human text is always available, JSON and NDJSON need `with-serde`,
//! the audit CSV needs `with-csv`.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};

#[cfg(feature = "with-serde")]
use serde::{Deserialize, Serialize};

use crate::audit::AuditSummary;
use crate::classify::{InterferenceCategory, InterferenceVerdict};
use crate::diagnose::DiagError;
use crate::probe::{PathFlag, ProbeResult};
use crate::session::{SessionPlan, SessionReport};
use crate::transport::{TransportSelection, service_name};

/// Process exit code for a clean run.
pub const EXIT_CLEAN: i32 = 0;
/// Process exit code when interference was detected or could not be ruled out.
pub const EXIT_INTERFERENCE: i32 = 2;

#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticReport {
    /// ASCII host name the run connected to.
    pub target: String,
    pub port: u16,
    pub selection: TransportSelection,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Main delivery session first, then handshake sessions by port.
    pub sessions: Vec<SessionReport>,
    pub probe: ProbeResult,
    pub verdict: InterferenceVerdict,
    /// Loss and latency warnings from the path trace.
    pub path_flags: Vec<PathFlag>,
    pub recommendations: Vec<String>,
    pub audit: Option<AuditSummary>,
}

impl DiagnosticReport {
    pub fn exit_code(&self) -> i32 {
        match self.verdict.category {
            InterferenceCategory::None => EXIT_CLEAN,
            _ => EXIT_INTERFERENCE,
        }
    }

    /// Plain-text rendering. With `transcripts` every session event is listed,
    /// otherwise only the outcome of each session.
    pub fn render_human(&self, transcripts: bool) -> String {
        let mut out = String::new();
        let selection = &self.selection;
        let _ = writeln!(
            out,
            "SMTP diagnosis for {}:{} [{}{}]",
            self.target,
            self.port,
            selection.mode,
            if selection.tls_required { ", TLS required" } else { "" }
        );
        if let Some(warning) = &selection.warning {
            let _ = writeln!(out, "warning: {warning}");
        }
        let _ = writeln!(
            out,
            "run: {} -> {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S%.3f UTC"),
            self.finished_at.format("%H:%M:%S%.3f")
        );

        for (index, session) in self.sessions.iter().enumerate() {
            out.push('\n');
            render_session(&mut out, index, session, transcripts);
        }

        out.push('\n');
        render_probe(&mut out, &self.probe);

        if let Some(audit) = &self.audit {
            out.push('\n');
            render_audit(&mut out, audit);
        }

        out.push('\n');
        let _ = writeln!(out, "verdict: {}", self.verdict);
        if !self.verdict.evidence.is_empty() {
            let evidence: Vec<String> = self.verdict.evidence.iter().map(ToString::to_string).collect();
            let _ = writeln!(out, "  evidence: {}", evidence.join("; "));
        }
        if !self.recommendations.is_empty() {
            let _ = writeln!(out, "recommendations:");
            for line in &self.recommendations {
                let _ = writeln!(out, "  - {line}");
            }
        }
        out
    }

    #[cfg(feature = "with-serde")]
    pub fn to_json_pretty(&self) -> Result<String, DiagError> {
        serde_json::to_string_pretty(self).map_err(|source| DiagError::Serialize { source })
    }

    /// One JSON object per line: a `run` header, each session, the probe, the
    /// audit when present, the path flags with the recommendations, and the
    /// verdict last.
    #[cfg(feature = "with-serde")]
    pub fn to_ndjson(&self) -> Result<String, DiagError> {
        let mut records = vec![NdjsonRecord::Run {
            target: &self.target,
            port: self.port,
            selection: &self.selection,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }];
        records.extend(self.sessions.iter().map(NdjsonRecord::Session));
        records.push(NdjsonRecord::Probe(&self.probe));
        if let Some(audit) = &self.audit {
            records.push(NdjsonRecord::Audit(audit));
        }
        records.push(NdjsonRecord::Advice {
            path_flags: &self.path_flags,
            recommendations: &self.recommendations,
        });
        records.push(NdjsonRecord::Verdict(&self.verdict));

        let mut out = String::new();
        for record in &records {
            let line = serde_json::to_string(record).map_err(|source| DiagError::Serialize { source })?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }

    /// Audit records as CSV, header included. Empty body when the audit did
    /// not run.
    #[cfg(feature = "with-csv")]
    pub fn audit_csv(&self) -> Result<Vec<u8>, DiagError> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        let csv_err = |source| DiagError::Csv { source };
        wtr.write_record([
            "timestamp",
            "protocol",
            "local_port",
            "remote_addr",
            "remote_port",
            "expected",
            "service",
        ])
        .map_err(csv_err)?;
        for record in self.audit.iter().flat_map(|audit| &audit.records) {
            wtr.write_record([
                record.timestamp.to_rfc3339(),
                record.protocol.to_string(),
                record.local_port.to_string(),
                record.remote_addr.to_string(),
                record.remote_port.to_string(),
                record.expected.to_string(),
                record.service.clone().unwrap_or_default(),
            ])
            .map_err(csv_err)?;
        }
        wtr.into_inner()
            .map_err(|err| DiagError::io("CSV buffer", err.into_error()))
    }
}

#[cfg(feature = "with-serde")]
#[derive(Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum NdjsonRecord<'a> {
    Run {
        target: &'a str,
        port: u16,
        selection: &'a TransportSelection,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    Session(&'a SessionReport),
    Probe(&'a ProbeResult),
    Audit(&'a AuditSummary),
    Advice {
        path_flags: &'a [PathFlag],
        recommendations: &'a [String],
    },
    Verdict(&'a InterferenceVerdict),
}

fn render_session(out: &mut String, index: usize, session: &SessionReport, transcripts: bool) {
    let service = service_name(session.port).unwrap_or("unknown service");
    let plan = match session.plan {
        SessionPlan::Deliver => "delivery",
        SessionPlan::Handshake => "handshake",
    };
    let _ = writeln!(
        out,
        "session #{index}: {plan} on port {} ({service}, {}) -> {} after {} bytes",
        session.port, session.transport, session.final_state, session.bytes_sent
    );
    for attempt in &session.attempts {
        let address = attempt
            .address
            .map_or_else(|| attempt.host.clone(), |addr| addr.to_string());
        let _ = writeln!(
            out,
            "  connect {address}: {} in {}",
            attempt.outcome.as_str(),
            millis(attempt.duration)
        );
    }
    if transcripts {
        for event in &session.events {
            let _ = writeln!(
                out,
                "  [{:>9}] {} {} (+{})",
                seconds(event.timestamp),
                event.direction.marker(),
                event.raw_text.replace('\n', "\n              "),
                millis(event.latency_since_prior)
            );
        }
    }
    if let Some(abort) = &session.abort {
        let _ = writeln!(
            out,
            "  aborted in {}: {} ({}) {}",
            abort.state, abort.category, abort.class, abort.message
        );
        if let Some(last) = &abort.last_response {
            let _ = writeln!(out, "  last response: {}", last.replace('\n', " | "));
        }
        let _ = writeln!(out, "  hint: {}", abort.hint);
    }
}

/// Plain-text rendering of a probe run on its own.
pub fn render_probe_human(probe: &ProbeResult) -> String {
    let mut out = String::new();
    render_probe(&mut out, probe);
    out
}

fn render_probe(out: &mut String, probe: &ProbeResult) {
    let resolved: Vec<String> = probe.resolved_ips.iter().map(ToString::to_string).collect();
    let _ = writeln!(
        out,
        "probe {} ({}):",
        probe.target_host,
        millis(probe.elapsed)
    );
    let _ = writeln!(
        out,
        "  dns [{}]: {}{}",
        probe.dns_status,
        if resolved.is_empty() { "no address".to_string() } else { resolved.join(", ") },
        probe
            .dns_latency
            .map(|latency| format!(" in {}", millis(latency)))
            .unwrap_or_default()
    );
    for prior in &probe.prior_resolutions {
        let prior: Vec<String> = prior.iter().map(ToString::to_string).collect();
        let _ = writeln!(out, "    earlier: {}", prior.join(", "));
    }

    let _ = writeln!(
        out,
        "  trace [{}]: {} hops via {}, {:.0}% silent{}{}",
        probe.trace_status,
        probe.trace.hops.len(),
        if probe.trace.method.is_empty() { "-" } else { probe.trace.method.as_str() },
        probe.trace.loss_percent(),
        if probe.path_reaches_target() { ", destination reached" } else { "" },
        probe
            .trace
            .isp
            .as_ref()
            .map(|isp| format!(", provider {isp}"))
            .unwrap_or_default()
    );
    for hop in &probe.trace.hops {
        let Some(ip) = hop.ip else {
            let _ = writeln!(out, "    {:>2}  *", hop.ttl);
            continue;
        };
        let name = match &hop.hostname {
            Some(hostname) => format!("{hostname} ({ip})"),
            None => ip.to_string(),
        };
        match hop.rtt {
            Some(rtt) => {
                let _ = writeln!(out, "    {:>2}  {name}  {}", hop.ttl, millis(rtt));
            }
            None => {
                let _ = writeln!(out, "    {:>2}  {name}", hop.ttl);
            }
        }
    }
    for flag in probe.path_flags() {
        let _ = writeln!(out, "  warning: {flag}");
    }

    let _ = writeln!(out, "  scan [{}]:", probe.scan_status);
    for scan in probe.port_scan.values() {
        let _ = writeln!(
            out,
            "    {:>5}  {:<8} {}{}",
            scan.port,
            scan.state.as_str(),
            scan.rtt.map(millis).unwrap_or_else(|| "-".to_string()),
            if scan.attempts > 1 { format!(" ({} attempts)", scan.attempts) } else { String::new() }
        );
    }
}

fn render_audit(out: &mut String, audit: &AuditSummary) {
    let _ = writeln!(
        out,
        "audit: {} connections, {} expected, {} unexpected",
        audit.total, audit.expected, audit.unexpected
    );
    if let Some(note) = &audit.note {
        let _ = writeln!(out, "  note: {note}");
    }
    for record in audit.unexpected_records() {
        let _ = writeln!(out, "  {record}");
    }
}

fn millis(duration: Duration) -> String {
    if duration >= Duration::from_secs(10) {
        format!("{:.1} s", duration.as_secs_f64())
    } else {
        format!("{} ms", duration.as_millis())
    }
}

fn seconds(duration: Duration) -> String {
    format!("{:.3}s", duration.as_secs_f64())
}

/// Writes `bytes` to a sibling temporary file, syncs it and renames it over
/// `path`, so readers never see a half-written report.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DiagError> {
    use std::io::Write;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);
    let display = path.display().to_string();
    {
        let mut file = std::fs::File::create(tmp).map_err(|err| DiagError::io(&display, err))?;
        file.write_all(bytes).map_err(|err| DiagError::io(&display, err))?;
        file.sync_all().map_err(|err| DiagError::io(&display, err))?;
    }
    std::fs::rename(tmp, path).map_err(|err| DiagError::io(display, err))
}
