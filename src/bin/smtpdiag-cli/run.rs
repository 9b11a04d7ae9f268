use anyhow::{Context, Result};
use smtpdiag_lib::{CancelToken, EXIT_CLEAN, EXIT_INTERFERENCE, run_diagnostics, run_probe};
use tracing_subscriber::EnvFilter;

use crate::args::{Cli, DiagnoseArgs, ProbeArgs};
use crate::{message, output};

/// Logs go to stderr so stdout stays parseable. `-v` wins over `RUST_LOG`.
pub fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    /// First Ctrl-C: the run stops and its partial report is still written.
    Cancelled,
    /// Second Ctrl-C while the run is winding down.
    Forced,
}

fn on_interrupt(cancel: &CancelToken) -> Interrupt {
    if cancel.is_cancelled() {
        Interrupt::Forced
    } else {
        cancel.cancel();
        Interrupt::Cancelled
    }
}

/// Jeton annulé par Ctrl-C (ou SIGTERM); un second Ctrl-C quitte sur-le-champ.
fn interruptible() -> CancelToken {
    let cancel = CancelToken::new();
    let handle = cancel.clone();
    let installed = ctrlc::set_handler(move || match on_interrupt(&handle) {
        Interrupt::Cancelled => {
            eprintln!("interruption: arrêt en cours, le rapport partiel sera écrit (Ctrl-C à nouveau pour quitter)");
        }
        Interrupt::Forced => std::process::exit(130),
    });
    if let Err(err) = installed {
        tracing::warn!(error = %err, "Ctrl-C handler not installed");
    }
    cancel
}

pub fn diagnose(args: &DiagnoseArgs, cli: &Cli) -> Result<i32> {
    let config = args.config()?;
    let message = message::load(
        args.message.as_deref(),
        &config.envelope.mail_from,
        &config.envelope.rcpt_to,
        args.size,
    )?;
    let cancel = interruptible();
    let report = run_diagnostics(&config, &message, &cancel)
        .with_context(|| format!("diagnose {}:{}", config.smtp.host, config.smtp.port))?;
    output::write_report(&report, cli, args.transcript)?;
    if cancel.is_cancelled() {
        tracing::warn!("run interrupted, report is partial");
    }
    Ok(report.exit_code())
}

/// Exits 2 when a probe step could not finish.
pub fn probe(args: &ProbeArgs, cli: &Cli) -> Result<i32> {
    let config = args.target.probe_config();
    let cancel = interruptible();
    let probe = run_probe(&config, &cancel).with_context(|| format!("probe {}", config.smtp.host))?;
    output::write_probe(&probe, cli)?;
    Ok(if probe.is_complete() {
        EXIT_CLEAN
    } else {
        EXIT_INTERFERENCE
    })
}
