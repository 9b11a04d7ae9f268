use std::io;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;

use super::types::{PortProbe, PortState, ProbeIncomplete, StepStatus};

/// Opens (and immediately drops) one TCP connection.
pub trait PortDialer: Send + Sync {
    fn dial(&self, addr: SocketAddr, timeout: Duration) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl PortDialer for TcpDialer {
    fn dial(&self, addr: SocketAddr, timeout: Duration) -> io::Result<()> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        let _ = stream.shutdown(std::net::Shutdown::Both);
        Ok(())
    }
}

/// Maps a connect failure to the state it reveals about the port.
pub fn classify_connect_error(err: &io::Error) -> PortState {
    match err.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => PortState::Closed,
        io::ErrorKind::TimedOut
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable => PortState::Filtered,
        _ => PortState::Error,
    }
}

/// Probes one port, retrying once when the first answer is ambiguous.
pub(crate) fn probe_port(
    dialer: &dyn PortDialer,
    ip: IpAddr,
    port: u16,
    timeout: Duration,
    cancel: &CancelToken,
) -> PortProbe {
    let addr = SocketAddr::new(ip, port);
    let mut attempts = 0u8;
    loop {
        attempts += 1;
        let start = Instant::now();
        let result = dialer.dial(addr, timeout);
        let rtt = start.elapsed();
        let (state, detail) = match &result {
            Ok(()) => (PortState::Open, None),
            Err(err) => (classify_connect_error(err), Some(err.to_string())),
        };
        let transient = matches!(state, PortState::Filtered | PortState::Error);
        if transient && attempts < 2 && !cancel.is_cancelled() {
            tracing::debug!(%addr, %state, "retrying port probe");
            continue;
        }
        tracing::debug!(%addr, %state, attempts, ?rtt, "port probed");
        return PortProbe {
            port,
            state,
            rtt: (state == PortState::Open || state == PortState::Closed).then_some(rtt),
            attempts,
            detail,
        };
    }
}

/// Scans every port on its own thread and hands each result to `finished` as
/// soon as that port is known, so a caller that stops waiting keeps what was
/// measured. Ports whose thread could not be started are recorded as `error`.
pub(crate) fn scan_ports(
    dialer: &dyn PortDialer,
    ip: IpAddr,
    ports: &[u16],
    timeout: Duration,
    cancel: &CancelToken,
    finished: &(dyn Fn(PortProbe) + Sync),
) -> StepStatus {
    if cancel.is_cancelled() {
        return StepStatus::Incomplete(ProbeIncomplete::Cancelled);
    }
    thread::scope(|scope| {
        let handles: Vec<_> = ports
            .iter()
            .map(|&port| {
                let handle = thread::Builder::new()
                    .name(format!("probe-port-{port}"))
                    .spawn_scoped(scope, move || {
                        finished(probe_port(dialer, ip, port, timeout, cancel));
                    });
                (port, handle)
            })
            .collect();
        for (port, handle) in handles {
            let failed = |detail: String| PortProbe {
                port,
                state: PortState::Error,
                rtt: None,
                attempts: 0,
                detail: Some(detail),
            };
            match handle {
                Ok(handle) => {
                    if handle.join().is_err() {
                        finished(failed("port probe panicked".into()));
                    }
                }
                Err(err) => finished(failed(format!("cannot start port probe: {err}"))),
            }
        }
    });
    if cancel.is_cancelled() {
        StepStatus::Incomplete(ProbeIncomplete::Cancelled)
    } else {
        StepStatus::Complete
    }
}
