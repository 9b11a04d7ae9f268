use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use trust_dns_resolver::error::ResolveError;

use super::*;
use crate::cancel::CancelToken;

type LookupFn = dyn Fn(&str, usize) -> Result<Vec<IpAddr>, ResolveError> + Send + Sync;

/// Resolver stub; the closure also receives how many lookups came before.
struct StubResolver {
    on_lookup: Box<LookupFn>,
    calls: AtomicUsize,
}

impl StubResolver {
    fn new<F>(f: F) -> Self
    where
        F: Fn(&str, usize) -> Result<Vec<IpAddr>, ResolveError> + Send + Sync + 'static,
    {
        Self {
            on_lookup: Box::new(f),
            calls: AtomicUsize::new(0),
        }
    }

    fn fixed(ips: Vec<IpAddr>) -> Self {
        Self::new(move |_, _| Ok(ips.clone()))
    }
}

impl ResolveHost for StubResolver {
    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.on_lookup)(host, call)
    }
}

struct StubTracer {
    hops: Vec<Hop>,
    delay: Duration,
}

impl PathTracer for StubTracer {
    fn trace(
        &self,
        destination: IpAddr,
        _options: &ProbeOptions,
        _cancel: &CancelToken,
    ) -> Result<PathTrace, ProbeIncomplete> {
        std::thread::sleep(self.delay);
        Ok(PathTrace::new(destination, "stub", self.hops.clone()))
    }
}

struct FailingTracer(ProbeIncomplete);

impl PathTracer for FailingTracer {
    fn trace(
        &self,
        _destination: IpAddr,
        _options: &ProbeOptions,
        _cancel: &CancelToken,
    ) -> Result<PathTrace, ProbeIncomplete> {
        Err(self.0.clone())
    }
}

/// Answers per port from a table; ports missing from the table time out.
struct StubDialer {
    answers: BTreeMap<u16, Vec<io::ErrorKind>>,
    calls: Mutex<Vec<u16>>,
}

impl StubDialer {
    fn new(answers: &[(u16, &[io::ErrorKind])]) -> Self {
        Self {
            answers: answers
                .iter()
                .map(|(port, kinds)| (*port, kinds.to_vec()))
                .collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls_for(&self, port: u16) -> usize {
        self.calls.lock().unwrap().iter().filter(|p| **p == port).count()
    }
}

const OPEN: io::ErrorKind = io::ErrorKind::Other;

impl PortDialer for StubDialer {
    fn dial(&self, addr: SocketAddr, _timeout: Duration) -> io::Result<()> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(addr.port());
            calls.iter().filter(|p| **p == addr.port()).count() - 1
        };
        let kind = self
            .answers
            .get(&addr.port())
            .and_then(|kinds| kinds.get(attempt).or(kinds.last()))
            .copied()
            .unwrap_or(io::ErrorKind::TimedOut);
        if kind == OPEN {
            Ok(())
        } else {
            Err(io::Error::new(kind, "stub"))
        }
    }
}

const TARGET: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 25));

fn path_to_target() -> Vec<Hop> {
    vec![
        Hop::answered(1, Some("192.168.1.1".parse().unwrap()), Some(Duration::from_millis(1))),
        Hop::silent(2),
        Hop::answered(3, Some(TARGET), Some(Duration::from_millis(20))),
    ]
}

fn prober(
    options: ProbeOptions,
    resolver: StubResolver,
    tracer: Option<Arc<dyn PathTracer>>,
    dialer: Arc<StubDialer>,
) -> Prober {
    Prober::with_parts(options, Arc::new(resolver), tracer, dialer)
}

fn stub_tracer() -> Option<Arc<dyn PathTracer>> {
    Some(Arc::new(StubTracer {
        hops: path_to_target(),
        delay: Duration::ZERO,
    }))
}

#[test]
fn full_probe_reports_every_step() {
    let dialer = Arc::new(StubDialer::new(&[
        (25, &[io::ErrorKind::TimedOut]),
        (465, &[OPEN]),
        (587, &[OPEN]),
        (2525, &[io::ErrorKind::ConnectionRefused]),
    ]));
    let prober = prober(
        ProbeOptions::default(),
        StubResolver::fixed(vec![TARGET]),
        stub_tracer(),
        Arc::clone(&dialer),
    );
    let result = prober.run("mail.example.test", &CancelToken::new());

    assert!(result.is_complete());
    assert_eq!(result.requested_ports, vec![25, 465, 587, 2525]);
    assert!(result.resolved_ips.contains(&TARGET));
    assert_eq!(result.dns_samples.len(), 2);
    assert!(result.dns_latency.is_some());
    assert!(result.path_reaches_target());
    assert_eq!(result.port_state(25), Some(PortState::Filtered));
    assert_eq!(result.port_state(465), Some(PortState::Open));
    assert_eq!(result.port_state(2525), Some(PortState::Closed));
    assert_eq!(result.open_ports().collect::<Vec<_>>(), vec![465, 587]);
}

#[test]
fn filtered_port_is_retried_once() {
    let dialer = Arc::new(StubDialer::new(&[(25, &[io::ErrorKind::TimedOut])]));
    let options = ProbeOptions {
        ports: vec![25],
        ..ProbeOptions::default()
    };
    let prober = prober(options, StubResolver::fixed(vec![TARGET]), stub_tracer(), Arc::clone(&dialer));
    let result = prober.run("mail.example.test", &CancelToken::new());

    let probe = &result.port_scan[&25];
    assert_eq!(probe.state, PortState::Filtered);
    assert_eq!(probe.attempts, 2);
    assert_eq!(dialer.calls_for(25), 2);
}

#[test]
fn transient_failure_recovers_on_retry() {
    let dialer = Arc::new(StubDialer::new(&[(587, &[io::ErrorKind::TimedOut, OPEN])]));
    let options = ProbeOptions {
        ports: vec![587],
        ..ProbeOptions::default()
    };
    let prober = prober(options, StubResolver::fixed(vec![TARGET]), stub_tracer(), dialer);
    let result = prober.run("mail.example.test", &CancelToken::new());

    let probe = &result.port_scan[&587];
    assert_eq!(probe.state, PortState::Open);
    assert_eq!(probe.attempts, 2);
}

#[test]
fn refused_port_is_not_retried() {
    let dialer = Arc::new(StubDialer::new(&[(25, &[io::ErrorKind::ConnectionRefused])]));
    let options = ProbeOptions {
        ports: vec![25],
        ..ProbeOptions::default()
    };
    let prober = prober(options, StubResolver::fixed(vec![TARGET]), stub_tracer(), Arc::clone(&dialer));
    let result = prober.run("mail.example.test", &CancelToken::new());

    assert_eq!(result.port_scan[&25].attempts, 1);
    assert_eq!(dialer.calls_for(25), 1);
}

#[test]
fn dns_failure_leaves_empty_addresses_without_error() {
    let dialer = Arc::new(StubDialer::new(&[]));
    let prober = prober(
        ProbeOptions::default(),
        StubResolver::new(|_, _| Err(ResolveError::from("SERVFAIL"))),
        stub_tracer(),
        dialer,
    );
    let result = prober.run("mail.example.test", &CancelToken::new());

    assert!(result.dns_status.is_complete());
    assert!(!result.dns_resolved());
    assert!(result.dns_samples.iter().all(|s| s.error.is_some()));
    assert!(matches!(result.scan_status, StepStatus::Incomplete(ProbeIncomplete::Failed(_))));
    assert!(matches!(result.trace_status, StepStatus::Incomplete(_)));
}

#[test]
fn earlier_resolutions_are_attached() {
    let dialer = Arc::new(StubDialer::new(&[]));
    let options = ProbeOptions {
        ports: vec![587],
        trace_strategy: TraceStrategy::Disabled,
        ..ProbeOptions::default()
    };
    let prober = prober(options, StubResolver::fixed(vec![TARGET]), None, dialer);

    let first = prober.run("Mail.Example.Test.", &CancelToken::new());
    assert!(first.prior_resolutions.is_empty());
    let second = prober.run("mail.example.test", &CancelToken::new());
    assert_eq!(second.prior_resolutions.len(), 1);
    assert!(second.prior_resolutions[0].contains(&TARGET));
}

#[test]
fn disabled_tracer_marks_step_incomplete() {
    let dialer = Arc::new(StubDialer::new(&[(587, &[OPEN])]));
    let options = ProbeOptions {
        ports: vec![587],
        ..ProbeOptions::default()
    };
    let prober = prober(options, StubResolver::fixed(vec![TARGET]), None, dialer);
    let result = prober.run("mail.example.test", &CancelToken::new());

    assert_eq!(result.trace_status, StepStatus::Incomplete(ProbeIncomplete::Disabled));
    assert!(result.scan_status.is_complete());
    assert!(!result.path_reaches_target());
}

#[test]
fn unprivileged_tracer_is_incomplete_not_fatal() {
    let dialer = Arc::new(StubDialer::new(&[(587, &[OPEN])]));
    let tracer: Arc<dyn PathTracer> =
        Arc::new(FailingTracer(ProbeIncomplete::Privilege("raw socket".into())));
    let options = ProbeOptions {
        ports: vec![587],
        ..ProbeOptions::default()
    };
    let prober = prober(options, StubResolver::fixed(vec![TARGET]), Some(tracer), dialer);
    let result = prober.run("mail.example.test", &CancelToken::new());

    assert!(matches!(
        result.trace_status.reason(),
        Some(ProbeIncomplete::Privilege(_))
    ));
    assert!(result.dns_resolved());
}

#[test]
fn deadline_marks_slow_step_incomplete() {
    let dialer = Arc::new(StubDialer::new(&[(587, &[OPEN])]));
    let tracer: Arc<dyn PathTracer> = Arc::new(StubTracer {
        hops: path_to_target(),
        delay: Duration::from_secs(5),
    });
    let options = ProbeOptions {
        ports: vec![587],
        deadline: Duration::from_millis(300),
        ..ProbeOptions::default()
    };
    let prober = prober(options, StubResolver::fixed(vec![TARGET]), Some(tracer), dialer);
    let result = prober.run("mail.example.test", &CancelToken::new());

    assert_eq!(result.trace_status, StepStatus::Incomplete(ProbeIncomplete::Deadline));
    assert!(result.scan_status.is_complete());
    assert!(result.elapsed < Duration::from_secs(5));
}

#[test]
fn cancelled_probe_returns_partial_result() {
    let dialer = Arc::new(StubDialer::new(&[]));
    let cancel = CancelToken::new();
    cancel.cancel();
    let prober = prober(ProbeOptions::default(), StubResolver::fixed(vec![TARGET]), stub_tracer(), dialer);
    let result = prober.run("mail.example.test", &cancel);

    assert!(!result.is_complete());
    assert!(matches!(
        result.scan_status.reason(),
        Some(ProbeIncomplete::Cancelled)
    ));
}

/// Answers 587 at once; any other port hangs until the operator aborts.
struct InterruptingDialer {
    cancel: CancelToken,
}

impl PortDialer for InterruptingDialer {
    fn dial(&self, addr: SocketAddr, _timeout: Duration) -> io::Result<()> {
        if addr.port() == 587 {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(200));
        self.cancel.cancel();
        std::thread::sleep(Duration::from_millis(500));
        Err(io::Error::new(io::ErrorKind::TimedOut, "stub"))
    }
}

#[test]
fn cancelling_mid_scan_keeps_finished_ports() {
    let cancel = CancelToken::new();
    let options = ProbeOptions {
        ports: vec![25, 587],
        trace_strategy: TraceStrategy::Disabled,
        ..ProbeOptions::default()
    };
    let prober = Prober::with_parts(
        options,
        Arc::new(StubResolver::fixed(vec![TARGET])),
        None,
        Arc::new(InterruptingDialer {
            cancel: cancel.clone(),
        }),
    );
    let result = prober.run("mail.example.test", &cancel);

    assert_eq!(result.port_state(587), Some(PortState::Open));
    assert_eq!(result.port_state(25), None);
    assert_eq!(result.scan_status, StepStatus::Incomplete(ProbeIncomplete::Cancelled));
    assert!(result.elapsed < Duration::from_millis(700));
}

#[test]
fn connect_errors_map_to_port_states() {
    let state = |kind| classify_connect_error(&io::Error::new(kind, "x"));
    assert_eq!(state(io::ErrorKind::ConnectionRefused), PortState::Closed);
    assert_eq!(state(io::ErrorKind::TimedOut), PortState::Filtered);
    assert_eq!(state(io::ErrorKind::HostUnreachable), PortState::Filtered);
    assert_eq!(state(io::ErrorKind::PermissionDenied), PortState::Error);
}

#[test]
fn parses_linux_traceroute_output() {
    let output = "\
traceroute to 203.0.113.25 (203.0.113.25), 15 hops max, 60 byte packets
 1  192.168.1.1  0.512 ms
 2  *
 3  10.20.0.1  8.104 ms
 4  203.0.113.25  21.7 ms
";
    let hops = parse_traceroute(output, TARGET, 15);
    assert_eq!(hops.len(), 4);
    assert!(!hops[1].reached);
    assert_eq!(hops[1].ip, None);
    assert_eq!(hops[3].ip, Some(TARGET));
    assert_eq!(hops[0].rtt, Some(Duration::from_micros(512)));
    let trace = PathTrace::new(TARGET, "traceroute", hops);
    assert!(trace.reached_destination());
    assert_eq!(trace.loss_percent(), 25.0);
}

#[test]
fn parses_windows_tracert_output() {
    let output = "\
Tracing route to 203.0.113.25 over a maximum of 30 hops

  1    <1 ms    <1 ms    <1 ms  192.168.1.1
  2     *        *        *     Request timed out.
  3    12 ms    11 ms    12 ms  203.0.113.25

Trace complete.
";
    let hops = parse_traceroute(output, TARGET, 30);
    assert_eq!(hops.len(), 3);
    assert_eq!(hops[0].rtt, Some(Duration::from_millis(1)));
    assert!(!hops[1].reached);
    assert_eq!(hops[2].ip, Some(TARGET));
}

#[test]
fn resolved_hop_names_reveal_the_provider() {
    let output = "\
traceroute to mail.example.test (203.0.113.25), 15 hops max, 60 byte packets
 1  gateway.home (192.168.1.1)  0.512 ms
 2  po-1-rur01.boston.ma.boston.comcast.net (96.108.0.1)  9.104 ms
 3  *
 4  203.0.113.25 (203.0.113.25)  21.7 ms
";
    let hops = parse_traceroute(output, TARGET, 15);
    assert_eq!(hops.len(), 4);
    assert_eq!(hops[0].hostname.as_deref(), Some("gateway.home"));
    assert_eq!(hops[1].ip, Some("96.108.0.1".parse().unwrap()));
    assert_eq!(hops[1].rtt, Some(Duration::from_micros(9104)));
    assert_eq!(hops[2].hostname, None);
    assert_eq!(hops[3].hostname, None);

    let trace = PathTrace::new(TARGET, "traceroute", hops);
    assert_eq!(trace.isp.as_deref(), Some("Comcast"));
    assert!(trace.reached_destination());
}

#[test]
fn tracert_names_are_read_before_brackets() {
    let output = "\
Tracing route to mail.example.test [203.0.113.25]
over a maximum of 30 hops:

  1    <1 ms    <1 ms    <1 ms  router.local [192.168.1.1]
  2    14 ms    13 ms    14 ms  lo0.bras1.fios.verizon.net [100.41.0.1]
  3    22 ms    21 ms    22 ms  203.0.113.25
";
    let hops = parse_traceroute(output, TARGET, 30);
    assert_eq!(hops.len(), 3);
    assert_eq!(hops[0].hostname.as_deref(), Some("router.local"));
    assert_eq!(hops[2].hostname, None);
    assert_eq!(detect_isp(&hops).as_deref(), Some("Verizon"));
}

#[test]
fn unknown_hop_names_leave_provider_unset() {
    let hops = vec![
        Hop::answered(1, Some("192.168.1.1".parse().unwrap()), None).with_hostname("gateway.home"),
        Hop::answered(2, Some(TARGET), None).with_hostname("mx.example.test"),
    ];
    assert_eq!(detect_isp(&hops), None);
}

fn traced(method: &str, hops: Vec<Hop>) -> ProbeResult {
    ProbeResult {
        target_host: "mail.example.test".into(),
        requested_ports: vec![587],
        resolved_ips: std::collections::BTreeSet::from([TARGET]),
        dns_latency: None,
        dns_samples: Vec::new(),
        prior_resolutions: Vec::new(),
        trace: PathTrace::new(TARGET, method, hops),
        port_scan: BTreeMap::new(),
        dns_status: StepStatus::Complete,
        trace_status: StepStatus::Complete,
        scan_status: StepStatus::Complete,
        started_at: chrono::Utc::now(),
        elapsed: Duration::ZERO,
    }
}

#[test]
fn lossy_slow_path_is_flagged() {
    let result = traced(
        "traceroute",
        vec![
            Hop::answered(1, Some("192.168.1.1".parse().unwrap()), Some(Duration::from_millis(150))),
            Hop::silent(2),
            Hop::answered(3, Some(TARGET), Some(Duration::from_millis(350))),
        ],
    );

    let flags = result.path_flags();
    assert_eq!(flags.len(), 2);
    assert!(matches!(flags[0], PathFlag::HighLoss { percent } if percent > 33.0 && percent < 34.0));
    assert_eq!(flags[1], PathFlag::HighLatency { average: Duration::from_millis(250) });
    assert_eq!(flags[1].to_string(), "high latency: 250.0 ms average hop round trip");
}

#[test]
fn socket_trace_silence_is_not_loss() {
    let mut result = traced(
        "socket",
        vec![Hop::silent(1), Hop::silent(2), Hop::answered(3, Some(TARGET), Some(Duration::from_millis(20)))],
    );
    assert!(result.path_flags().is_empty());

    result.trace_status = StepStatus::Incomplete(ProbeIncomplete::Deadline);
    result.trace.method = "traceroute".into();
    assert!(result.path_flags().is_empty());
}

#[test]
fn parser_honours_hop_ceiling() {
    let output = " 1  10.0.0.1  1 ms\n 2  10.0.0.2  2 ms\n 3  10.0.0.3  3 ms\n";
    let hops = parse_traceroute(output, TARGET, 2);
    assert_eq!(hops.len(), 2);
    assert_eq!(hops.last().map(|hop| hop.ttl), Some(2));
}

#[test]
fn trace_strategy_parses_aliases() {
    assert_eq!("off".parse::<TraceStrategy>(), Ok(TraceStrategy::Disabled));
    assert_eq!("Socket".parse::<TraceStrategy>(), Ok(TraceStrategy::Socket));
    assert!("icmp".parse::<TraceStrategy>().is_err());
}

#[test]
#[ignore = "requires loopback TCP binding"]
fn tcp_dialer_sees_open_and_closed_loopback_ports() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let open = listener.local_addr().expect("addr").port();
    let closed = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        probe.local_addr().expect("addr").port()
    };
    let options = ProbeOptions {
        ports: vec![open, closed],
        trace_strategy: TraceStrategy::Disabled,
        ..ProbeOptions::default()
    };
    let prober = Prober::with_parts(
        options,
        Arc::new(StubResolver::fixed(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])),
        None,
        Arc::new(TcpDialer),
    );
    let result = prober.run("localhost", &CancelToken::new());

    assert_eq!(result.port_state(open), Some(PortState::Open));
    assert_eq!(result.port_state(closed), Some(PortState::Closed));
}
