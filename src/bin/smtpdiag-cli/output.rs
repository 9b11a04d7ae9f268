use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, bail};
use smtpdiag_lib::{DiagnosticReport, ProbeResult, render_probe_human, write_atomic};

use crate::args::Cli;

pub fn write_report(report: &DiagnosticReport, cli: &Cli, transcript: bool) -> Result<()> {
    let bytes = match cli.format.as_str() {
        "human" => report.render_human(transcript).into_bytes(),
        "json" => report_json(report)?,
        "ndjson" => report_ndjson(report)?,
        "csv" => audit_csv(report)?,
        other => bail!("unknown --format '{other}', use: human|json|ndjson|csv"),
    };
    emit(&bytes, cli.out.as_deref())
}

pub fn write_probe(probe: &ProbeResult, cli: &Cli) -> Result<()> {
    let bytes = match cli.format.as_str() {
        "human" => render_probe_human(probe).into_bytes(),
        "json" => probe_json(probe, true)?,
        "ndjson" => probe_json(probe, false)?,
        "csv" => bail!("format=csv ne concerne que l'audit de 'diagnose'"),
        other => bail!("unknown --format '{other}', use: human|json|ndjson|csv"),
    };
    emit(&bytes, cli.out.as_deref())
}

fn emit(bytes: &[u8], out: Option<&Path>) -> Result<()> {
    match out {
        Some(path) => {
            write_atomic(path, bytes).with_context(|| format!("write {}", path.display()))
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(bytes).context("write stdout")?;
            stdout.flush().context("flush stdout")
        }
    }
}

#[cfg(feature = "with-serde")]
fn report_json(report: &DiagnosticReport) -> Result<Vec<u8>> {
    let mut s = report.to_json_pretty()?;
    s.push('\n');
    Ok(s.into_bytes())
}

#[cfg(not(feature = "with-serde"))]
fn report_json(_: &DiagnosticReport) -> Result<Vec<u8>> {
    bail!("format=json nécessite la feature 'with-serde'")
}

#[cfg(feature = "with-serde")]
fn report_ndjson(report: &DiagnosticReport) -> Result<Vec<u8>> {
    Ok(report.to_ndjson()?.into_bytes())
}

#[cfg(not(feature = "with-serde"))]
fn report_ndjson(_: &DiagnosticReport) -> Result<Vec<u8>> {
    bail!("format=ndjson nécessite la feature 'with-serde'")
}

#[cfg(feature = "with-csv")]
fn audit_csv(report: &DiagnosticReport) -> Result<Vec<u8>> {
    if report.audit.is_none() {
        tracing::warn!("audit disabled, CSV export is empty");
    }
    Ok(report.audit_csv()?)
}

#[cfg(not(feature = "with-csv"))]
fn audit_csv(_: &DiagnosticReport) -> Result<Vec<u8>> {
    bail!("format=csv nécessite la feature 'with-csv'")
}

#[cfg(feature = "with-serde")]
fn probe_json(probe: &ProbeResult, pretty: bool) -> Result<Vec<u8>> {
    let mut s = if pretty {
        serde_json::to_string_pretty(probe)?
    } else {
        serde_json::to_string(probe)?
    };
    s.push('\n');
    Ok(s.into_bytes())
}

#[cfg(not(feature = "with-serde"))]
fn probe_json(_: &ProbeResult, _: bool) -> Result<Vec<u8>> {
    bail!("format=json/ndjson nécessite la feature 'with-serde'")
}
