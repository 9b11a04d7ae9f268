use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use chrono::{DateTime, Utc};
use proptest::prelude::*;

use super::*;
use crate::probe::{DnsSample, Hop, PathTrace, PortProbe, PortState, ProbeIncomplete, StepStatus};
use crate::session::{
    AbortCategory, AttemptOutcome, ChunkProgress, ConnectionAttempt, Direction, SessionAbort,
    SessionEvent, SessionPlan, SessionState, hint_for,
};
use crate::transport::TransportMode;

const TARGET: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 25));
const CHUNK: usize = 8 * 1024;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Builds a transcript event by event, keeping timestamps monotonic.
struct Transcript {
    report: SessionReport,
    clock: Duration,
}

impl Transcript {
    fn new(port: u16, transport: TransportMode) -> Self {
        Self {
            report: SessionReport {
                host: "mail.example.test".into(),
                port,
                transport,
                plan: SessionPlan::Deliver,
                started_at: DateTime::<Utc>::default(),
                events: Vec::new(),
                attempts: Vec::new(),
                final_state: SessionState::Connecting,
                abort: None,
                bytes_sent: 0,
            },
            clock: Duration::ZERO,
        }
    }

    fn attempt(mut self, outcome: AttemptOutcome) -> Self {
        self.report.attempts.push(ConnectionAttempt {
            host: self.report.host.clone(),
            address: Some(SocketAddr::new(TARGET, self.report.port)),
            port: self.report.port,
            transport_mode: self.report.transport,
            outcome,
            started: self.clock,
            duration: ms(5),
            error: None,
        });
        self
    }

    fn event(
        mut self,
        direction: Direction,
        state: SessionState,
        text: &str,
        latency: Duration,
        chunk: Option<ChunkProgress>,
    ) -> Self {
        self.clock += latency;
        self.report.events.push(SessionEvent {
            timestamp: self.clock,
            direction,
            raw_text: text.into(),
            latency_since_prior: latency,
            state,
            attempt: self.report.attempts.len().saturating_sub(1),
            bytes_sent: self.report.bytes_sent,
            chunk,
        });
        self
    }

    fn greeting(self) -> Self {
        self.event(
            Direction::Received,
            SessionState::Connecting,
            "220 mail.example.test ESMTP",
            ms(20),
            None,
        )
    }

    fn envelope(self) -> Self {
        self.event(Direction::Sent, SessionState::MailFrom, "MAIL FROM:<probe@example.test>", ms(1), None)
            .event(Direction::Received, SessionState::MailFrom, "250 OK", ms(5), None)
            .event(Direction::Sent, SessionState::RcptTo, "RCPT TO:<ops@example.test>", ms(1), None)
            .event(Direction::Received, SessionState::RcptTo, "250 OK", ms(5), None)
    }

    /// `count` chunks of 8 KiB; `latency(i)` is the time chunk `i` took.
    fn chunks(mut self, count: usize, latency: impl Fn(usize) -> Duration) -> Self {
        let mut elapsed = Duration::ZERO;
        for index in 0..count {
            let took = latency(index);
            elapsed += took;
            self.report.bytes_sent += CHUNK as u64;
            let progress = ChunkProgress {
                index: index + 1,
                total: count,
                bytes: CHUNK,
                cumulative_bytes: ((index + 1) * CHUNK) as u64,
                elapsed,
            };
            self = self.event(
                Direction::Sent,
                SessionState::DataTransfer,
                &format!("[chunk {}/{count}] {CHUNK} bytes", index + 1),
                took,
                Some(progress),
            );
        }
        self
    }

    fn closed(mut self) -> SessionReport {
        self = self.event(Direction::Local, SessionState::Closed, "session closed", ms(1), None);
        self.report.final_state = SessionState::Closed;
        self.report
    }

    fn aborted(mut self, state: SessionState, category: AbortCategory) -> SessionReport {
        self = self.event(
            Direction::Local,
            SessionState::Aborted,
            &format!("aborted in {state} ({category})"),
            ms(1),
            None,
        );
        self.report.final_state = SessionState::Aborted;
        self.report.abort = Some(SessionAbort {
            state,
            category,
            class: category.class(),
            message: category.to_string(),
            last_response: self.report.last_response().map(str::to_string),
            hint: hint_for(category, state).to_string(),
        });
        self.report
    }
}

fn delivered(port: u16, transport: TransportMode) -> SessionReport {
    Transcript::new(port, transport)
        .attempt(AttemptOutcome::Connected)
        .greeting()
        .envelope()
        .chunks(4, |_| ms(10))
        .closed()
}

fn connect_timeout(port: u16) -> SessionReport {
    Transcript::new(port, TransportMode::Plaintext)
        .attempt(AttemptOutcome::Timeout)
        .event(
            Direction::Local,
            SessionState::Connecting,
            "connect to 203.0.113.25 timed out",
            ms(3000),
            None,
        )
        .aborted(SessionState::Connecting, AbortCategory::Timeout)
}

fn reset_in_transfer(chunks_before_reset: usize) -> SessionReport {
    Transcript::new(587, TransportMode::OpportunisticTls)
        .attempt(AttemptOutcome::Connected)
        .greeting()
        .envelope()
        .chunks(chunks_before_reset, |_| ms(4))
        .aborted(SessionState::DataTransfer, AbortCategory::ConnectionReset)
}

fn probe(requested: &[u16], scan: &[(u16, PortState)]) -> ProbeResult {
    ProbeResult {
        target_host: "mail.example.test".into(),
        requested_ports: requested.to_vec(),
        resolved_ips: BTreeSet::from([TARGET]),
        dns_latency: Some(ms(12)),
        dns_samples: vec![DnsSample {
            latency: ms(12),
            addresses: vec![TARGET],
            error: None,
        }],
        prior_resolutions: Vec::new(),
        trace: PathTrace::new(
            TARGET,
            "stub",
            vec![
                Hop::answered(1, Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))), Some(ms(1))),
                Hop::silent(2),
                Hop::answered(3, Some(TARGET), Some(ms(25))),
            ],
        ),
        port_scan: scan
            .iter()
            .map(|(port, state)| {
                (
                    *port,
                    PortProbe {
                        port: *port,
                        state: *state,
                        rtt: Some(ms(25)),
                        attempts: 1,
                        detail: None,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>(),
        dns_status: StepStatus::Complete,
        trace_status: StepStatus::Complete,
        scan_status: StepStatus::Complete,
        started_at: DateTime::<Utc>::default(),
        elapsed: ms(900),
    }
}

#[test]
fn blocked_port_with_open_alternative_is_high_confidence() {
    let sessions = vec![connect_timeout(25), delivered(587, TransportMode::OpportunisticTls)];
    let probe = probe(&[25, 587], &[(25, PortState::Filtered), (587, PortState::Open)]);

    let verdict = classify(&sessions, &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::PortBlocked);
    assert!(verdict.confidence >= 0.9);
    assert_eq!(
        verdict.evidence,
        vec![
            Evidence::ConnectionAttempt { session: 0, attempt: 0 },
            Evidence::PortScan { port: 25 },
            Evidence::DnsResolution,
            Evidence::PathTrace,
            Evidence::PortScan { port: 587 },
        ]
    );
    insta::assert_snapshot!(
        verdict.to_string(),
        @"port_blocked (95% confidence): connections to port 25 (filtered) fail while DNS resolves and the path reaches the host; port 587 open on the same host"
    );
}

#[test]
fn blocked_port_without_alternative_still_needs_the_trace() {
    let sessions = vec![connect_timeout(25)];
    let probe = probe(&[25], &[(25, PortState::Closed)]);

    let verdict = classify(&sessions, &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::PortBlocked);
    assert!((verdict.confidence - 0.9).abs() < 1e-6);
}

#[test]
fn unconfirmed_path_lowers_confidence() {
    let sessions = vec![connect_timeout(25), delivered(587, TransportMode::OpportunisticTls)];
    let mut probe = probe(&[25, 587], &[(25, PortState::Filtered), (587, PortState::Open)]);
    probe.trace = PathTrace::default();
    probe.trace_status = StepStatus::Incomplete(ProbeIncomplete::Privilege("raw sockets".into()));

    let verdict = classify(&sessions, &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::PortBlocked);
    assert!(verdict.confidence < 0.9);
    assert!(!verdict.evidence.contains(&Evidence::PathTrace));
}

#[test]
fn unconfirmed_timeout_is_indeterminate() {
    let sessions = vec![connect_timeout(25)];
    let mut probe = probe(&[25], &[(25, PortState::Filtered)]);
    probe.trace_status = StepStatus::Incomplete(ProbeIncomplete::ToolMissing("traceroute".into()));

    let verdict = classify(&sessions, &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::Indeterminate);
    assert!(verdict.summary.contains("timeout during Connecting on port 25"));
}

#[test]
fn steady_implicit_tls_transfer_is_clean() {
    let session = Transcript::new(465, TransportMode::ImplicitTls)
        .attempt(AttemptOutcome::Connected)
        .greeting()
        .envelope()
        .chunks(256, |_| ms(1))
        .closed();
    assert_eq!(session.bytes_sent, 2 * 1024 * 1024);
    let probe = probe(&[465], &[(465, PortState::Open)]);

    let verdict = classify(&[session], &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::None);
    assert!(verdict.evidence.is_empty());
    assert!((verdict.confidence - 0.9).abs() < 1e-6);
}

#[test]
fn single_reset_cites_the_last_chunk_boundary() {
    let session = reset_in_transfer(6);
    let last_chunk = session.chunk_events().last().map(|(index, _)| index).unwrap();
    let probe = probe(&[587], &[(587, PortState::Open)]);

    let verdict = classify(&[session], &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::ConnectionReset);
    assert_eq!(
        verdict.evidence,
        vec![Evidence::SessionEvent { session: 0, event: last_chunk }]
    );
    assert!(verdict.summary.contains(&(6 * CHUNK).to_string()));
}

#[test]
fn resets_at_the_same_offset_suggest_dpi() {
    let sessions = vec![reset_in_transfer(6), reset_in_transfer(6)];
    let probe = probe(&[587], &[(587, PortState::Open)]);

    let verdict = classify(&sessions, &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::DpiSuspected);
    assert_eq!(verdict.evidence.len(), 2);
    assert!((verdict.confidence - 0.7).abs() < 1e-6);
}

#[test]
fn resets_far_apart_stay_connection_reset() {
    let sessions = vec![reset_in_transfer(2), reset_in_transfer(40)];
    let probe = probe(&[587], &[(587, PortState::Open)]);

    let verdict = classify(&sessions, &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::ConnectionReset);
}

#[test]
fn rate_drop_partway_is_throttling() {
    let session = Transcript::new(587, TransportMode::OpportunisticTls)
        .attempt(AttemptOutcome::Connected)
        .greeting()
        .envelope()
        .chunks(16, |index| if index < 8 { ms(5) } else { ms(20) })
        .closed();
    let probe = probe(&[587], &[(587, PortState::Open)]);

    let verdict = classify(&[session], &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::Throttled);
    assert!((verdict.confidence - 0.75).abs() < 1e-6);
    assert!(verdict.summary.contains("25%"));
}

#[test]
fn mild_slowdown_is_not_throttling() {
    let session = Transcript::new(587, TransportMode::OpportunisticTls)
        .attempt(AttemptOutcome::Connected)
        .greeting()
        .envelope()
        .chunks(16, |index| if index < 8 { ms(10) } else { ms(15) })
        .closed();
    let probe = probe(&[587], &[(587, PortState::Open)]);

    let verdict = classify(&[session], &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::None);
}

#[test]
fn vanished_resolution_is_dns_manipulation() {
    let mut probe = probe(&[587], &[]);
    probe.prior_resolutions = vec![BTreeSet::from([TARGET])];
    probe.resolved_ips.clear();
    probe.dns_samples = vec![DnsSample {
        latency: ms(30),
        addresses: Vec::new(),
        error: Some("no record found".into()),
    }];
    probe.scan_status = StepStatus::Incomplete(ProbeIncomplete::Failed("no address".into()));

    let verdict = classify(&[], &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::DnsManipulated);
    assert_eq!(verdict.evidence, vec![Evidence::DnsResolution]);
    assert!(verdict.summary.contains("now resolves to nothing"));
}

#[test]
fn disjoint_resolution_is_dns_manipulation() {
    let mut probe = probe(&[587], &[(587, PortState::Open)]);
    probe.prior_resolutions = vec![BTreeSet::from([IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7))])];
    let sessions = vec![delivered(587, TransportMode::OpportunisticTls)];

    let verdict = classify(&sessions, &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::DnsManipulated);
    assert!((verdict.confidence - 0.6).abs() < 1e-6);
}

#[test]
fn private_answer_for_public_name_is_dns_manipulation() {
    let private = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
    let mut probe = probe(&[587], &[(587, PortState::Open)]);
    probe.resolved_ips = BTreeSet::from([private]);
    let sessions = vec![delivered(587, TransportMode::OpportunisticTls)];

    let verdict = classify(&sessions, &probe, &ClassifierOptions::default());
    assert_eq!(verdict.category, InterferenceCategory::DnsManipulated);
    assert!(verdict.summary.contains("10.0.0.5"));

    let lab = ClassifierOptions {
        allow_private_resolution: true,
        ..ClassifierOptions::default()
    };
    assert_eq!(classify(&sessions, &probe, &lab).category, InterferenceCategory::None);
}

#[test]
fn ip_literal_and_localhost_are_exempt() {
    let sessions = vec![delivered(587, TransportMode::OpportunisticTls)];
    for host in ["192.168.1.10", "localhost", "relay.localhost"] {
        let mut probe = probe(&[587], &[(587, PortState::Open)]);
        probe.target_host = host.into();
        probe.resolved_ips = BTreeSet::from([IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))]);

        let verdict = classify(&sessions, &probe, &ClassifierOptions::default());
        assert_eq!(verdict.category, InterferenceCategory::None, "{host}");
    }
}

#[test]
fn answer_lost_between_samples_is_dns_manipulation() {
    let mut probe = probe(&[587], &[(587, PortState::Open)]);
    probe.dns_samples.push(DnsSample {
        latency: ms(9),
        addresses: Vec::new(),
        error: None,
    });
    let sessions = vec![delivered(587, TransportMode::OpportunisticTls)];

    let verdict = classify(&sessions, &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::DnsManipulated);
    assert_eq!(
        verdict.evidence,
        vec![Evidence::DnsSample { sample: 0 }, Evidence::DnsSample { sample: 1 }]
    );
}

#[test]
fn recipient_rejection_is_not_interference() {
    let session = Transcript::new(587, TransportMode::OpportunisticTls)
        .attempt(AttemptOutcome::Connected)
        .greeting()
        .event(Direction::Sent, SessionState::RcptTo, "RCPT TO:<nobody@example.test>", ms(1), None)
        .event(Direction::Received, SessionState::RcptTo, "550 5.1.1 user unknown", ms(5), None)
        .aborted(SessionState::RcptTo, AbortCategory::Rejected);
    let probe = probe(&[587], &[(587, PortState::Open)]);

    let verdict = classify(&[session], &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::None);
    assert!(!verdict.category.is_interference());
}

#[test]
fn transfer_timeouts_at_one_offset_suggest_dpi() {
    let stalled = || {
        Transcript::new(587, TransportMode::OpportunisticTls)
            .attempt(AttemptOutcome::Connected)
            .greeting()
            .envelope()
            .chunks(3, |_| ms(4))
            .event(Direction::Local, SessionState::DataTransfer, "no reply within 30000 ms", ms(30_000), None)
            .aborted(SessionState::DataTransfer, AbortCategory::Timeout)
    };
    let probe = probe(&[587], &[(587, PortState::Open)]);

    let verdict = classify(&[stalled(), stalled()], &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::DpiSuspected);
    assert!((verdict.confidence - 0.5).abs() < 1e-6);
    assert!(verdict.summary.contains(&(3 * CHUNK).to_string()));
}

#[test]
fn untested_port_keeps_verdict_indeterminate() {
    let sessions = vec![delivered(587, TransportMode::OpportunisticTls)];
    let probe = probe(&[25, 587], &[(25, PortState::Open), (587, PortState::Open)]);

    let verdict = classify(&sessions, &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::Indeterminate);
    assert_eq!(verdict.evidence, vec![Evidence::Coverage { port: 25 }]);
}

#[test]
fn incomplete_scan_keeps_verdict_indeterminate() {
    let sessions = vec![delivered(587, TransportMode::OpportunisticTls)];
    let mut probe = probe(&[587], &[]);
    probe.scan_status = StepStatus::Incomplete(ProbeIncomplete::Deadline);

    let verdict = classify(&sessions, &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::Indeterminate);
    assert!(verdict.summary.contains("deadline"));
}

#[test]
fn cancelled_session_does_not_count_as_coverage() {
    let session = Transcript::new(587, TransportMode::OpportunisticTls)
        .attempt(AttemptOutcome::Connected)
        .greeting()
        .aborted(SessionState::Greeted, AbortCategory::Cancelled);
    let probe = probe(&[587], &[(587, PortState::Open)]);

    let verdict = classify(&[session], &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::Indeterminate);
}

fn starttls_missing(required: bool) -> SessionReport {
    let offered = Transcript::new(587, TransportMode::OpportunisticTls)
        .attempt(AttemptOutcome::Connected)
        .greeting()
        .event(Direction::Sent, SessionState::Greeted, "EHLO localhost", ms(1), None)
        .event(Direction::Received, SessionState::Greeted, "250-mail.example.test\n250 AUTH PLAIN", ms(5), None);
    if required {
        offered.aborted(SessionState::Greeted, AbortCategory::TlsUnavailable)
    } else {
        offered
            .event(
                Direction::Local,
                SessionState::Greeted,
                "policy: STARTTLS not advertised; continuing in plaintext",
                ms(1),
                None,
            )
            .envelope()
            .chunks(2, |_| ms(10))
            .closed()
    }
}

#[test]
fn required_starttls_missing_on_open_port_is_not_clean() {
    let probe = probe(&[587], &[(587, PortState::Open)]);

    let verdict = classify(&[starttls_missing(true)], &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::DpiSuspected);
    assert!(verdict.confidence < 0.5);
    assert_eq!(
        verdict.evidence,
        vec![
            Evidence::SessionEvent { session: 0, event: 3 },
            Evidence::PortScan { port: 587 },
        ]
    );
    assert!(verdict.summary.contains("STARTTLS"));
}

#[test]
fn starttls_fallback_without_scan_is_indeterminate() {
    let probe = probe(&[587], &[]);

    let verdict = classify(&[starttls_missing(false)], &probe, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::Indeterminate);
    assert_eq!(verdict.evidence, vec![Evidence::SessionEvent { session: 0, event: 3 }]);
}

#[test]
fn blocked_relay_port_points_at_open_submission_ports() {
    let sessions = vec![connect_timeout(25), delivered(587, TransportMode::OpportunisticTls)];
    let network = probe(
        &[25, 465, 587],
        &[(25, PortState::Filtered), (465, PortState::Open), (587, PortState::Open)],
    );

    let verdict = classify(&sessions, &network, &ClassifierOptions::default());

    assert_eq!(
        recommendations(&verdict, &network),
        vec!["Use port 587 or 465 instead of port 25".to_string()]
    );
}

#[test]
fn blocked_port_without_alternative_suggests_a_relay() {
    let sessions = vec![connect_timeout(25)];
    let network = probe(&[25], &[(25, PortState::Closed)]);

    let verdict = classify(&sessions, &network, &ClassifierOptions::default());
    let advice = recommendations(&verdict, &network);

    assert_eq!(advice.len(), 1);
    assert!(advice[0].starts_with("Port 25 is unreachable"));
}

#[test]
fn dpi_on_a_named_provider_path_recommends_a_tunnel_once() {
    let sessions = vec![reset_in_transfer(6), reset_in_transfer(6)];
    let mut network = probe(&[465, 587], &[(465, PortState::Open), (587, PortState::Open)]);
    network.trace = PathTrace::new(
        TARGET,
        "traceroute",
        vec![
            Hop::answered(1, Some(IpAddr::V4(Ipv4Addr::new(96, 108, 0, 1))), Some(ms(9)))
                .with_hostname("po-1.boston.comcast.net"),
            Hop::answered(2, Some(TARGET), Some(ms(25))),
        ],
    );

    let verdict = classify(&sessions, &network, &ClassifierOptions::default());
    assert_eq!(verdict.category, InterferenceCategory::DpiSuspected);

    let advice = recommendations(&verdict, &network);
    assert_eq!(
        advice,
        vec![
            "Use implicit TLS on port 465 so no SMTP command crosses the network before encryption".to_string(),
            "Route the submission through a VPN or an alternative SMTP relay".to_string(),
            "The path crosses Comcast; if the restriction persists, use a VPN or an alternative SMTP relay"
                .to_string(),
        ]
    );
}

#[test]
fn clean_verdict_has_no_advice() {
    let sessions = vec![delivered(587, TransportMode::OpportunisticTls)];
    let network = probe(&[587], &[(587, PortState::Open)]);

    let verdict = classify(&sessions, &network, &ClassifierOptions::default());

    assert_eq!(verdict.category, InterferenceCategory::None);
    assert!(recommendations(&verdict, &network).is_empty());
}

#[test]
fn non_routable_ranges() {
    for ip in ["127.0.0.1", "10.1.2.3", "172.16.0.9", "192.168.0.1", "169.254.1.1", "100.64.0.1", "0.0.0.0", "::1", "fd00::1", "fe80::1"] {
        assert!(is_non_routable(&ip.parse().unwrap()), "{ip}");
    }
    for ip in ["203.0.113.25", "8.8.8.8", "100.128.0.1", "2001:db8::25"] {
        assert!(!is_non_routable(&ip.parse().unwrap()), "{ip}");
    }
}

#[test]
fn confidence_is_clamped() {
    let verdict = InterferenceVerdict::new(InterferenceCategory::Throttled, 1.7, Vec::new(), "x");
    assert_eq!(verdict.confidence, 1.0);
    assert_eq!(verdict.confidence_percent(), 100);
}

proptest! {
    #[test]
    fn classification_is_idempotent(
        latencies in proptest::collection::vec(1u64..200, 4..40),
        reset in any::<bool>(),
        scan_open in any::<bool>(),
    ) {
        let transcript = Transcript::new(587, TransportMode::OpportunisticTls)
            .attempt(AttemptOutcome::Connected)
            .greeting()
            .envelope()
            .chunks(latencies.len(), |index| ms(latencies[index]));
        let session = if reset {
            transcript.aborted(SessionState::DataTransfer, AbortCategory::ConnectionReset)
        } else {
            transcript.closed()
        };
        let state = if scan_open { PortState::Open } else { PortState::Filtered };
        let sessions = vec![session, connect_timeout(25)];
        let probe = probe(&[25, 587], &[(25, PortState::Filtered), (587, state)]);
        let options = ClassifierOptions::default();

        let first = classify(&sessions, &probe, &options);
        let second = classify(&sessions.clone(), &probe.clone(), &options);
        prop_assert_eq!(first, second);
    }
}
