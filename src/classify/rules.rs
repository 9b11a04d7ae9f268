use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::time::Duration;

use crate::probe::{PortState, ProbeResult};
use crate::session::{
    AbortCategory, AttemptOutcome, ChunkProgress, SessionReport, SessionState,
};

use super::options::ClassifierOptions;
use super::types::{Evidence, InterferenceCategory, InterferenceVerdict};

/// Sessions on `port` that never saw a greeting because every connect timed
/// out or was refused, while the scan agrees the port is unreachable.
pub(crate) fn port_blocked(sessions: &[SessionReport], probe: &ProbeResult) -> Option<InterferenceVerdict> {
    if !probe.dns_resolved() {
        return None;
    }
    let mut blocked: BTreeMap<u16, (PortState, Vec<Evidence>)> = BTreeMap::new();
    for (index, session) in sessions.iter().enumerate() {
        if session.greeted() {
            continue;
        }
        let ended_connecting = session
            .abort
            .as_ref()
            .is_some_and(|abort| abort.state == SessionState::Connecting);
        if !ended_connecting {
            continue;
        }
        let failed: Vec<Evidence> = session
            .attempts
            .iter()
            .enumerate()
            .filter(|(_, attempt)| {
                matches!(attempt.outcome, AttemptOutcome::Timeout | AttemptOutcome::Refused)
            })
            .map(|(attempt, _)| Evidence::ConnectionAttempt {
                session: index,
                attempt,
            })
            .collect();
        if failed.is_empty() {
            continue;
        }
        let Some(state) = probe
            .port_state(session.port)
            .filter(|state| state.is_unreachable())
        else {
            continue;
        };
        blocked
            .entry(session.port)
            .or_insert_with(|| (state, Vec::new()))
            .1
            .extend(failed);
    }
    if blocked.is_empty() {
        return None;
    }

    let open: Vec<u16> = probe
        .open_ports()
        .filter(|port| !blocked.contains_key(port))
        .collect();
    let reached = probe.path_reaches_target();
    let confidence = match (reached, open.is_empty()) {
        (true, true) => 0.9,
        (true, false) => 0.95,
        (false, false) => 0.6,
        (false, true) => return None,
    };

    let mut evidence = Vec::new();
    for (port, (_, attempts)) in &blocked {
        evidence.extend(attempts.iter().copied());
        evidence.push(Evidence::PortScan { port: *port });
    }
    evidence.push(Evidence::DnsResolution);
    if reached {
        evidence.push(Evidence::PathTrace);
    }
    evidence.extend(open.iter().map(|port| Evidence::PortScan { port: *port }));

    let ports = blocked
        .iter()
        .map(|(port, (state, _))| format!("{port} ({state})"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut summary = format!("connections to port {ports} fail while DNS resolves");
    if reached {
        summary.push_str(" and the path reaches the host");
    } else {
        summary.push_str("; the path trace could not confirm the host");
    }
    if !open.is_empty() {
        let list = open.iter().map(u16::to_string).collect::<Vec<_>>().join(", ");
        summary.push_str(&format!("; port {list} open on the same host"));
    }
    Some(InterferenceVerdict::new(
        InterferenceCategory::PortBlocked,
        confidence,
        evidence,
        summary,
    ))
}

struct OffsetMark {
    session: usize,
    event: usize,
    offset: u64,
}

/// Payload offset of the last chunk boundary and the event to cite for it.
fn last_transfer_mark(index: usize, session: &SessionReport) -> OffsetMark {
    if let Some((event, progress)) = session
        .chunk_events()
        .filter_map(|(event, e)| e.chunk.map(|chunk| (event, chunk)))
        .last()
    {
        return OffsetMark {
            session: index,
            event,
            offset: progress.cumulative_bytes,
        };
    }
    let event = session
        .events
        .iter()
        .rposition(|event| event.state == SessionState::DataTransfer)
        .unwrap_or(session.events.len().saturating_sub(1));
    OffsetMark {
        session: index,
        event,
        offset: 0,
    }
}

/// Largest group of marks from distinct sessions lying within `tolerance` of
/// one anchor. Ties go to the earliest anchor.
fn densest_cluster(marks: &[OffsetMark], tolerance: u64) -> Vec<&OffsetMark> {
    let mut best: Vec<&OffsetMark> = Vec::new();
    for anchor in marks {
        let mut seen = BTreeSet::new();
        let members: Vec<&OffsetMark> = marks
            .iter()
            .filter(|mark| mark.offset.abs_diff(anchor.offset) <= tolerance)
            .filter(|mark| seen.insert(mark.session))
            .collect();
        if members.len() > best.len() {
            best = members;
        }
    }
    best
}

/// Resets after the greeting during `DataTransfer`. A reset repeating at the
/// same offset across sessions is demoted to `dpi_suspected`.
pub(crate) fn transfer_resets(
    sessions: &[SessionReport],
    options: &ClassifierOptions,
) -> Option<InterferenceVerdict> {
    let resets: Vec<OffsetMark> = sessions
        .iter()
        .enumerate()
        .filter(|(_, session)| {
            session.greeted()
                && session.abort.as_ref().is_some_and(|abort| {
                    abort.category == AbortCategory::ConnectionReset
                        && abort.state == SessionState::DataTransfer
                })
        })
        .map(|(index, session)| last_transfer_mark(index, session))
        .collect();
    let first = resets.first()?;

    let cluster = densest_cluster(&resets, options.dpi_offset_tolerance);
    if cluster.len() >= options.dpi_min_repeats() {
        let extra = (cluster.len() - options.dpi_min_repeats()) as f32;
        let confidence = (0.7 + 0.1 * extra).min(0.9);
        let evidence = cluster
            .iter()
            .map(|mark| Evidence::SessionEvent {
                session: mark.session,
                event: mark.event,
            })
            .collect();
        let summary = format!(
            "connection reset near byte {} of the message in {} independent sessions",
            cluster[0].offset,
            cluster.len()
        );
        return Some(InterferenceVerdict::new(
            InterferenceCategory::DpiSuspected,
            confidence,
            evidence,
            summary,
        ));
    }

    let summary = format!(
        "connection reset during DataTransfer after {} bytes of the message",
        first.offset
    );
    Some(InterferenceVerdict::new(
        InterferenceCategory::ConnectionReset,
        0.8,
        vec![Evidence::SessionEvent {
            session: first.session,
            event: first.event,
        }],
        summary,
    ))
}

struct Window {
    first_event: usize,
    last_event: usize,
    bytes: u64,
    time: Duration,
    offset: u64,
}

impl Window {
    fn rate(&self) -> f64 {
        self.bytes as f64 / self.time.as_secs_f64().max(1e-9)
    }
}

fn windows(chunks: &[(usize, ChunkProgress, Duration)], size: usize) -> Vec<Window> {
    chunks
        .chunks_exact(size)
        .map(|group| Window {
            first_event: group[0].0,
            last_event: group[group.len() - 1].0,
            bytes: group.iter().map(|(_, chunk, _)| chunk.bytes as u64).sum(),
            time: group.iter().map(|(_, _, latency)| *latency).sum(),
            offset: group[0].1.cumulative_bytes - group[0].1.bytes as u64,
        })
        .collect()
}

/// Otherwise-successful transfers whose rate falls below `throttle_factor` of
/// the initial window.
pub(crate) fn throttling(
    sessions: &[SessionReport],
    options: &ClassifierOptions,
) -> Option<InterferenceVerdict> {
    struct Candidate {
        session: usize,
        initial: Window,
        slowest: Window,
        ratio: f64,
    }

    let mut worst: Option<Candidate> = None;
    for (index, session) in sessions.iter().enumerate() {
        if !session.is_closed() {
            continue;
        }
        let chunks: Vec<(usize, ChunkProgress, Duration)> = session
            .chunk_events()
            .filter_map(|(event, e)| e.chunk.map(|chunk| (event, chunk, e.latency_since_prior)))
            .collect();
        if chunks.len() < options.min_throttle_chunks() {
            continue;
        }
        let size = (chunks.len() / 4).max(1);
        let mut measured = windows(&chunks, size).into_iter();
        let Some(initial) = measured.next() else {
            continue;
        };
        if initial.time < options.min_window_time {
            continue;
        }
        let initial_rate = initial.rate();
        let Some(slowest) = measured.min_by(|a, b| a.rate().total_cmp(&b.rate())) else {
            continue;
        };
        let ratio = slowest.rate() / initial_rate;
        if ratio >= options.throttle_factor {
            continue;
        }
        if worst.as_ref().is_none_or(|current| ratio < current.ratio) {
            worst = Some(Candidate {
                session: index,
                initial,
                slowest,
                ratio,
            });
        }
    }

    let candidate = worst?;
    let factor = options.throttle_factor.max(f64::EPSILON);
    let confidence = (0.6 + 0.3 * (1.0 - candidate.ratio / factor)).min(0.9) as f32;
    let summary = format!(
        "transfer rate fell to {:.0}% of the initial {:.1} KiB/s after {} bytes",
        candidate.ratio * 100.0,
        candidate.initial.rate() / 1024.0,
        candidate.slowest.offset
    );
    let session = candidate.session;
    Some(InterferenceVerdict::new(
        InterferenceCategory::Throttled,
        confidence,
        vec![
            Evidence::SessionEvent {
                session,
                event: candidate.initial.first_event,
            },
            Evidence::SessionEvent {
                session,
                event: candidate.slowest.first_event,
            },
            Evidence::SessionEvent {
                session,
                event: candidate.slowest.last_event,
            },
        ],
        summary,
    ))
}

/// Loopback, private, link-local, CGNAT and unspecified addresses. A public
/// mail host never legitimately resolves to one of them.
pub fn is_non_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [first, second, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || first == 0
                || (first == 100 && (64..=127).contains(&second))
        }
        IpAddr::V6(v6) => {
            let head = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || head & 0xfe00 == 0xfc00
                || head & 0xffc0 == 0xfe80
        }
    }
}

fn is_local_name(host: &str) -> bool {
    let host = host.trim().trim_end_matches('.');
    let lower = host.to_ascii_lowercase();
    host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>().is_ok()
        || lower == "localhost"
        || lower.ends_with(".localhost")
}

fn join_ips<'a>(ips: impl IntoIterator<Item = &'a IpAddr>) -> String {
    ips.into_iter().map(IpAddr::to_string).collect::<Vec<_>>().join(", ")
}

pub(crate) fn dns_manipulation(
    probe: &ProbeResult,
    options: &ClassifierOptions,
) -> Option<InterferenceVerdict> {
    if is_local_name(&probe.target_host) {
        return None;
    }

    if !options.allow_private_resolution {
        let bogus: Vec<&IpAddr> = probe.resolved_ips.iter().filter(|ip| is_non_routable(ip)).collect();
        if !bogus.is_empty() {
            return Some(InterferenceVerdict::new(
                InterferenceCategory::DnsManipulated,
                0.85,
                vec![Evidence::DnsResolution],
                format!(
                    "{} resolves to non-routable {}",
                    probe.target_host,
                    join_ips(bogus)
                ),
            ));
        }
    }

    let prior = probe
        .prior_resolutions
        .iter()
        .rev()
        .find(|set| !set.is_empty())
        .filter(|_| !probe.dns_samples.is_empty());
    if let Some(prior) = prior {
        if probe.resolved_ips.is_empty() {
            return Some(InterferenceVerdict::new(
                InterferenceCategory::DnsManipulated,
                0.8,
                vec![Evidence::DnsResolution],
                format!(
                    "{} resolved to {} earlier in the run, now resolves to nothing",
                    probe.target_host,
                    join_ips(prior)
                ),
            ));
        }
        if prior.is_disjoint(&probe.resolved_ips) {
            return Some(InterferenceVerdict::new(
                InterferenceCategory::DnsManipulated,
                0.6,
                vec![Evidence::DnsResolution],
                format!(
                    "{} moved from {} to {} within the run",
                    probe.target_host,
                    join_ips(prior),
                    join_ips(&probe.resolved_ips)
                ),
            ));
        }
    }

    let answered = probe
        .dns_samples
        .iter()
        .position(|sample| !sample.addresses.is_empty())?;
    let vanished = probe
        .dns_samples
        .iter()
        .enumerate()
        .skip(answered + 1)
        .find(|(_, sample)| sample.addresses.is_empty() && sample.error.is_none())
        .map(|(index, _)| index)?;
    Some(InterferenceVerdict::new(
        InterferenceCategory::DnsManipulated,
        0.75,
        vec![
            Evidence::DnsSample { sample: answered },
            Evidence::DnsSample { sample: vanished },
        ],
        format!(
            "{} answered in sample {} but returned no address in sample {}",
            probe.target_host, answered, vanished
        ),
    ))
}

/// Stalls (or a transfer timeout) at the same payload offset in several
/// sessions.
pub(crate) fn repeated_stalls(
    sessions: &[SessionReport],
    options: &ClassifierOptions,
) -> Option<InterferenceVerdict> {
    let mut marks = Vec::new();
    for (index, session) in sessions.iter().enumerate() {
        let chunks: Vec<(usize, u64, Duration)> = session
            .chunk_events()
            .filter_map(|(event, e)| {
                e.chunk
                    .map(|chunk| (event, chunk.cumulative_bytes, e.latency_since_prior))
            })
            .collect();
        if chunks.len() >= 3 {
            let mut latencies: Vec<Duration> = chunks.iter().map(|(_, _, latency)| *latency).collect();
            latencies.sort_unstable();
            let median = latencies[latencies.len() / 2];
            let threshold = median.mul_f64(options.stall_factor).max(options.min_window_time);
            marks.extend(
                chunks
                    .iter()
                    .filter(|(_, _, latency)| *latency > threshold)
                    .map(|(event, offset, _)| OffsetMark {
                        session: index,
                        event: *event,
                        offset: *offset,
                    }),
            );
        }
        let timed_out = session.abort.as_ref().is_some_and(|abort| {
            abort.category == AbortCategory::Timeout && abort.state == SessionState::DataTransfer
        });
        if timed_out {
            marks.push(last_transfer_mark(index, session));
        }
    }

    let cluster = densest_cluster(&marks, options.dpi_offset_tolerance);
    if cluster.len() < options.dpi_min_repeats() {
        return None;
    }
    let evidence = cluster
        .iter()
        .map(|mark| Evidence::SessionEvent {
            session: mark.session,
            event: mark.event,
        })
        .collect();
    Some(InterferenceVerdict::new(
        InterferenceCategory::DpiSuspected,
        0.5,
        evidence,
        format!(
            "transfer stalls near byte {} of the message in {} independent sessions",
            cluster[0].offset,
            cluster.len()
        ),
    ))
}

/// Sessions that set out to use `STARTTLS` and ended without it. When the scan
/// shows every such port answering, the capability went missing on the way.
pub(crate) fn withheld_tls(sessions: &[SessionReport], probe: &ProbeResult) -> Option<InterferenceVerdict> {
    let mut evidence = Vec::new();
    let mut ports = BTreeSet::new();
    for (index, session) in sessions.iter().enumerate() {
        if let Some(event) = session.tls_withheld_at() {
            evidence.push(Evidence::SessionEvent { session: index, event });
            ports.insert(session.port);
        }
    }
    if ports.is_empty() {
        return None;
    }

    let list = ports.iter().map(u16::to_string).collect::<Vec<_>>().join(", ");
    let answering = probe.dns_resolved()
        && ports
            .iter()
            .all(|port| probe.port_state(*port) == Some(PortState::Open));
    if answering {
        evidence.extend(ports.iter().map(|port| Evidence::PortScan { port: *port }));
        return Some(InterferenceVerdict::new(
            InterferenceCategory::DpiSuspected,
            0.45,
            evidence,
            format!(
                "STARTTLS missing or failing on port {list} while the port answers; an intermediary may be stripping it"
            ),
        ));
    }
    Some(InterferenceVerdict::new(
        InterferenceCategory::Indeterminate,
        0.4,
        evidence,
        format!("transport security on port {list} was expected but never negotiated"),
    ))
}

/// Network-level aborts no earlier rule accounted for.
pub(crate) fn unexplained_aborts(sessions: &[SessionReport]) -> Option<InterferenceVerdict> {
    let mut evidence = Vec::new();
    let mut notes = Vec::new();
    for (index, session) in sessions.iter().enumerate() {
        let Some(abort) = &session.abort else {
            continue;
        };
        if !abort.category.is_network_level() {
            continue;
        }
        evidence.push(Evidence::SessionEvent {
            session: index,
            event: session.events.len().saturating_sub(1),
        });
        notes.push(format!(
            "{} during {} on port {}",
            abort.category, abort.state, session.port
        ));
    }
    if evidence.is_empty() {
        return None;
    }
    Some(InterferenceVerdict::new(
        InterferenceCategory::Indeterminate,
        0.4,
        evidence,
        format!(
            "{} without a matching network signal",
            notes.join("; ")
        ),
    ))
}

/// Requested ports without a concluded session, plus whether the scan itself
/// finished.
pub(crate) fn coverage_gaps(sessions: &[SessionReport], probe: &ProbeResult) -> Option<InterferenceVerdict> {
    let missing: Vec<u16> = probe
        .requested_ports
        .iter()
        .copied()
        .filter(|port| {
            !sessions
                .iter()
                .any(|session| session.port == *port && session.concluded())
        })
        .collect();
    let scan_done = probe.scan_status.is_complete();
    if missing.is_empty() && scan_done && !sessions.is_empty() {
        return None;
    }

    let evidence: Vec<Evidence> = missing.iter().map(|port| Evidence::Coverage { port: *port }).collect();
    let mut reasons = Vec::new();
    if sessions.is_empty() {
        reasons.push("no session was run".to_string());
    }
    if !missing.is_empty() {
        let list = missing.iter().map(u16::to_string).collect::<Vec<_>>().join(", ");
        reasons.push(format!("no concluded session on port {list}"));
    }
    if let Some(reason) = probe.scan_status.reason() {
        reasons.push(format!("port scan incomplete ({reason})"));
    }
    Some(InterferenceVerdict::new(
        InterferenceCategory::Indeterminate,
        0.5,
        evidence,
        format!("no interference observed but coverage is partial: {}", reasons.join("; ")),
    ))
}
