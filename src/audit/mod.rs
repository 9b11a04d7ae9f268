//! Traffic auditor.
//!
//! Samples the process's own connections on a background thread and checks
//! every new remote endpoint against an [`AllowList`]. Anything unexpected is
//! logged as it is seen and counted in the [`AuditSummary`].

mod table;
mod types;

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;

pub use table::{ConnectionTable, ProcNetTable, parse_proc_net};
pub use types::{AllowList, AuditError, AuditRecord, AuditSummary, SocketPair, SocketProtocol};

#[derive(Debug, Default)]
struct AuditLog {
    records: Vec<AuditRecord>,
    seen: BTreeSet<(SocketProtocol, IpAddr, u16)>,
    note: Option<String>,
}

impl AuditLog {
    fn observe(&mut self, allow: &AllowList, pair: &SocketPair) {
        let remote_addr = types::canonical(pair.remote.ip());
        if !self.seen.insert((pair.protocol, remote_addr, pair.remote.port())) {
            return;
        }
        let service = allow.check(&pair.remote).map(str::to_string);
        let record = AuditRecord {
            timestamp: Utc::now(),
            protocol: pair.protocol,
            local_port: pair.local.port(),
            remote_addr,
            remote_port: pair.remote.port(),
            expected: service.is_some(),
            service,
        };
        if record.expected {
            tracing::debug!(remote = %pair.remote, service = record.service.as_deref(), "expected connection");
        } else {
            tracing::warn!(remote = %pair.remote, protocol = %pair.protocol, "unexpected connection");
        }
        self.records.push(record);
    }
}

/// Running auditor. Dropping it without [`finish`](Self::finish) stops the
/// sampler and discards the records.
#[derive(Debug)]
pub struct TrafficAuditor {
    log: Arc<Mutex<AuditLog>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TrafficAuditor {
    /// Starts sampling `table` every `interval`. The first sample is taken
    /// right away and a last one when the auditor finishes.
    pub fn start(
        mut table: Box<dyn ConnectionTable>,
        allow: AllowList,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let log = Arc::new(Mutex::new(AuditLog::default()));
        let stop = Arc::new(AtomicBool::new(false));
        let interval = interval.max(Duration::from_millis(10));

        let handle = {
            let log = Arc::clone(&log);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("traffic-audit".into())
                .spawn(move || {
                    tracing::info!(interval_ms = interval.as_millis() as u64, "traffic audit started");
                    loop {
                        match table.snapshot() {
                            Ok(pairs) => {
                                let mut log = lock(&log);
                                for pair in &pairs {
                                    log.observe(&allow, pair);
                                }
                            }
                            Err(AuditError::Unsupported(reason)) => {
                                tracing::warn!(%reason, "traffic audit disabled");
                                lock(&log).note = Some(format!("audit unavailable: {reason}"));
                                break;
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "traffic audit sample failed");
                                lock(&log).note = Some(format!("audit partial: {err}"));
                            }
                        }
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        thread::park_timeout(interval);
                    }
                })?
        };

        Ok(Self {
            log,
            stop,
            handle: Some(handle),
        })
    }

    /// Records observed so far.
    pub fn records(&self) -> Vec<AuditRecord> {
        lock(&self.log).records.clone()
    }

    /// Takes a final sample, stops the sampler and summarises the run.
    pub fn finish(mut self) -> AuditSummary {
        self.halt();
        let log = std::mem::take(&mut *lock(&self.log));
        let summary = AuditSummary::from_records(log.records, log.note);
        tracing::info!(
            total = summary.total,
            expected = summary.expected,
            unexpected = summary.unexpected,
            "traffic audit finished"
        );
        summary
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                lock(&self.log).note = Some("audit sampler panicked".into());
            }
        }
    }
}

impl Drop for TrafficAuditor {
    fn drop(&mut self) {
        self.halt();
    }
}

fn lock(log: &Mutex<AuditLog>) -> MutexGuard<'_, AuditLog> {
    log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
