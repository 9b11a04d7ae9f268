//! Interference classifier.
//!
//! [`classify`] turns session transcripts and a probe result into one
//! [`InterferenceVerdict`]. It reads no clock and iterates only ordered
//! collections, so the same inputs always give the same verdict.

mod advice;
mod options;
mod rules;
mod types;

pub use advice::recommendations;
pub use options::ClassifierOptions;
pub use rules::is_non_routable;
pub use types::{Evidence, InterferenceCategory, InterferenceVerdict};

use crate::probe::ProbeResult;
use crate::session::SessionReport;

/// Rules are tried in priority order and the first match wins:
///
/// 1. blocked port (connect timeout or refusal confirmed by the scan),
/// 2. reset during `DataTransfer` (`dpi_suspected` when it repeats at one offset),
/// 3. throttled transfer,
/// 4. manipulated DNS,
/// 5. stalls repeating at one offset,
/// 6. `STARTTLS` expected but never negotiated,
///
/// then `indeterminate` for unexplained network aborts or partial coverage, and
/// `none` otherwise.
pub fn classify(
    sessions: &[SessionReport],
    probe: &ProbeResult,
    options: &ClassifierOptions,
) -> InterferenceVerdict {
    let verdict = rules::port_blocked(sessions, probe)
        .or_else(|| rules::transfer_resets(sessions, options))
        .or_else(|| rules::throttling(sessions, options))
        .or_else(|| rules::dns_manipulation(probe, options))
        .or_else(|| rules::repeated_stalls(sessions, options))
        .or_else(|| rules::withheld_tls(sessions, probe))
        .or_else(|| rules::unexplained_aborts(sessions))
        .or_else(|| rules::coverage_gaps(sessions, probe))
        .unwrap_or_else(|| clean_verdict(sessions, probe));
    tracing::debug!(
        category = %verdict.category,
        confidence = verdict.confidence,
        evidence = verdict.evidence.len(),
        "classified"
    );
    verdict
}

fn clean_verdict(sessions: &[SessionReport], probe: &ProbeResult) -> InterferenceVerdict {
    let confidence = if probe.is_complete() { 0.9 } else { 0.8 };
    let ports = sessions
        .iter()
        .map(|session| session.port)
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .map(|port| port.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    InterferenceVerdict::new(
        InterferenceCategory::None,
        confidence,
        Vec::new(),
        format!("no interference observed on port {ports}"),
    )
}

#[cfg(test)]
mod tests;
