use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::cancel::CancelToken;

use super::options::{ProbeOptions, TraceStrategy};
use super::types::{Hop, PathTrace, ProbeIncomplete};

/// Walks the network path to `destination`.
///
/// Implementations must stop at the destination or after `max_hops`, and keep
/// going past silent hops.
pub trait PathTracer: Send + Sync {
    fn trace(
        &self,
        destination: IpAddr,
        options: &ProbeOptions,
        cancel: &CancelToken,
    ) -> Result<PathTrace, ProbeIncomplete>;
}

/// Builds the tracer matching `strategy`. `None` means tracing is disabled.
pub fn tracer_for(strategy: TraceStrategy) -> Option<Box<dyn PathTracer>> {
    match strategy {
        TraceStrategy::Auto => Some(Box::new(AutoTracer::default())),
        TraceStrategy::External => Some(Box::new(ExternalTraceroute::default())),
        TraceStrategy::Socket => Some(Box::new(SocketTracer)),
        TraceStrategy::Disabled => None,
    }
}

/// Runs the platform `traceroute` (`tracert` on Windows) and parses its output.
#[derive(Debug, Clone)]
pub struct ExternalTraceroute {
    program: String,
}

impl Default for ExternalTraceroute {
    fn default() -> Self {
        let program = if cfg!(windows) { "tracert" } else { "traceroute" };
        Self {
            program: program.to_string(),
        }
    }
}

impl ExternalTraceroute {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, destination: IpAddr, options: &ProbeOptions) -> Command {
        let mut cmd = Command::new(&self.program);
        let max_hops = options.max_hops().to_string();
        if cfg!(windows) {
            let wait_ms = options.hop_timeout.as_millis().max(1).to_string();
            cmd.args(["-h", &max_hops, "-w", &wait_ms]);
        } else {
            let wait_secs = options.hop_timeout.as_secs().max(1).to_string();
            cmd.args(["-q", "1", "-m", &max_hops, "-w", &wait_secs]);
        }
        cmd.arg(destination.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl PathTracer for ExternalTraceroute {
    fn trace(
        &self,
        destination: IpAddr,
        options: &ProbeOptions,
        cancel: &CancelToken,
    ) -> Result<PathTrace, ProbeIncomplete> {
        let mut child = self
            .command(destination, options)
            .spawn()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => ProbeIncomplete::ToolMissing(self.program.clone()),
                io::ErrorKind::PermissionDenied => ProbeIncomplete::Privilege(err.to_string()),
                _ => ProbeIncomplete::Failed(format!("cannot start {}: {err}", self.program)),
            })?;

        // drained on a thread so a chatty child never blocks on a full pipe
        let stdout = child.stdout.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut out = String::new();
                let _ = pipe.read_to_string(&mut out);
                out
            })
        });

        let started = Instant::now();
        let status = loop {
            if cancel.is_cancelled() || started.elapsed() > options.trace_timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(if cancel.is_cancelled() {
                    ProbeIncomplete::Cancelled
                } else {
                    ProbeIncomplete::Deadline
                });
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(err) => return Err(ProbeIncomplete::Failed(err.to_string())),
            }
        };

        let output = stdout
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }

        let hops = parse_traceroute(&output, destination, options.max_hops());
        if hops.is_empty() && !status.success() {
            let message = stderr.trim().to_string();
            let lower = message.to_ascii_lowercase();
            if lower.contains("permission") || lower.contains("not permitted") {
                return Err(ProbeIncomplete::Privilege(message));
            }
            return Err(ProbeIncomplete::Failed(if message.is_empty() {
                format!("{} exited with {status}", self.program)
            } else {
                message
            }));
        }
        Ok(PathTrace::new(destination, self.program.as_str(), hops))
    }
}

fn hop_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d{1,3})\s+(.*)$").ok())
        .as_ref()
}

fn rtt_value() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<?(\d+(?:\.\d+)?)\s*ms").ok())
        .as_ref()
}

/// Parses `traceroute` or `tracert` output, with or without name resolution.
/// Header and footer lines are skipped; a line of asterisks becomes a silent
/// hop. A name printed before a bracketed address becomes the hop hostname.
pub fn parse_traceroute(output: &str, destination: IpAddr, max_hops: u8) -> Vec<Hop> {
    let mut hops: Vec<Hop> = Vec::new();
    let (Some(hop_line), Some(rtt_value)) = (hop_line(), rtt_value()) else {
        return hops;
    };
    for line in output.lines() {
        let Some(caps) = hop_line.captures(line) else {
            continue;
        };
        let Ok(ttl) = caps[1].parse::<u8>() else {
            continue;
        };
        if ttl == 0 || ttl > max_hops || hops.last().is_some_and(|hop| hop.ttl >= ttl) {
            continue;
        }
        let rest = &caps[2];
        let tokens: Vec<&str> = rest.split_whitespace().collect();
        let found = tokens.iter().enumerate().find_map(|(index, token)| {
            let bare = token.trim_matches(|c| matches!(c, '(' | ')' | '[' | ']' | ','));
            let ip = bare.parse::<IpAddr>().ok()?;
            Some((index, ip, bare.len() != token.len()))
        });
        let ip = found.map(|(_, ip, _)| ip);
        let hostname = found
            .filter(|(index, _, bracketed)| *bracketed && *index > 0)
            .map(|(index, _, _)| tokens[index - 1])
            .filter(|name| {
                name.parse::<IpAddr>().is_err() && name.chars().any(|c| c.is_ascii_alphabetic())
            });
        let rtt = rtt_value
            .captures(rest)
            .and_then(|caps| caps[1].parse::<f64>().ok())
            .map(|ms| Duration::from_micros((ms * 1000.0).round() as u64));

        let hop = match (ip, hostname) {
            (Some(ip), Some(name)) => Hop::answered(ttl, Some(ip), rtt).with_hostname(name),
            (Some(ip), None) => Hop::answered(ttl, Some(ip), rtt),
            (None, _) => Hop::silent(ttl),
        };
        hops.push(hop);
        if ip == Some(destination) {
            break;
        }
    }
    hops
}

/// Fallback tracer: TCP connects with an increasing TTL. Intermediate routers
/// answer with ICMP that an unprivileged socket cannot read, so only the
/// destination hop carries an address.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketTracer;

impl PathTracer for SocketTracer {
    fn trace(
        &self,
        destination: IpAddr,
        options: &ProbeOptions,
        cancel: &CancelToken,
    ) -> Result<PathTrace, ProbeIncomplete> {
        let addr = SocketAddr::new(destination, options.trace_port);
        let mut hops = Vec::new();
        for ttl in 1..=options.max_hops() {
            if cancel.is_cancelled() {
                return Err(ProbeIncomplete::Cancelled);
            }
            let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
                .map_err(socket_error)?;
            let limited = match destination {
                IpAddr::V4(_) => socket.set_ttl(u32::from(ttl)),
                IpAddr::V6(_) => socket.set_unicast_hops_v6(u32::from(ttl)),
            };
            limited.map_err(socket_error)?;

            let start = Instant::now();
            let result = socket.connect_timeout(&addr.into(), options.hop_timeout);
            let rtt = start.elapsed();
            match result {
                Ok(()) => {
                    hops.push(Hop::answered(ttl, Some(destination), Some(rtt)));
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                    hops.push(Hop::answered(ttl, Some(destination), Some(rtt)));
                    break;
                }
                Err(err) => {
                    tracing::trace!(ttl, error = %err, "socket hop silent");
                    hops.push(Hop::silent(ttl));
                }
            }
        }
        Ok(PathTrace::new(destination, "socket", hops))
    }
}

fn socket_error(err: io::Error) -> ProbeIncomplete {
    match err.kind() {
        io::ErrorKind::PermissionDenied => ProbeIncomplete::Privilege(err.to_string()),
        io::ErrorKind::Unsupported => ProbeIncomplete::Unsupported(err.to_string()),
        _ => ProbeIncomplete::Failed(err.to_string()),
    }
}

/// External tool first, TTL-limited sockets when the tool is missing, lacks
/// privilege or fails.
#[derive(Debug, Clone, Default)]
pub struct AutoTracer {
    external: ExternalTraceroute,
    socket: SocketTracer,
}

impl PathTracer for AutoTracer {
    fn trace(
        &self,
        destination: IpAddr,
        options: &ProbeOptions,
        cancel: &CancelToken,
    ) -> Result<PathTrace, ProbeIncomplete> {
        match self.external.trace(destination, options, cancel) {
            Ok(trace) => Ok(trace),
            Err(err @ (ProbeIncomplete::Cancelled | ProbeIncomplete::Deadline)) => Err(err),
            Err(err) => {
                tracing::info!(%destination, reason = %err, "external traceroute unavailable, using socket tracer");
                self.socket.trace(destination, options, cancel)
            }
        }
    }
}
