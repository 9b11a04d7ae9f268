#![forbid(unsafe_code)]
//! smtpdiag_lib — diagnostic de livraison SMTP et détection d'interférences FAI
//!
//! One run drives an instrumented SMTP session, probes the network path in
//! parallel, optionally audits the process' own connections, and ends with an
//! [`InterferenceVerdict`] folded into a [`DiagnosticReport`].

pub mod audit;
pub mod cancel;
pub mod classify;
pub mod diagnose;
pub mod probe;
pub mod report;
pub mod session;
pub mod transport;

pub use audit::{AllowList, AuditRecord, AuditSummary, TrafficAuditor};
pub use cancel::CancelToken;
pub use classify::{
    ClassifierOptions, Evidence, InterferenceCategory, InterferenceVerdict, classify,
    recommendations,
};
pub use diagnose::{
    DiagError, DiagnosticConfig, ImapTarget, SmtpTarget, normalize_host, run_diagnostics,
    run_probe,
};
pub use probe::{PathFlag, PortState, ProbeOptions, ProbeResult, Prober, TraceStrategy};
pub use report::{
    DiagnosticReport, EXIT_CLEAN, EXIT_INTERFERENCE, render_probe_human, write_atomic,
};
pub use session::{
    Credentials, Envelope, SessionError, SessionOptions, SessionReport, SessionState,
    drive_session,
};
pub use transport::{TransportMode, TransportSelection, select_transport};
