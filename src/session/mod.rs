//! SMTP session driver.
//!
//! [`SessionDriver`] walks one submission session through
//! `Connecting → Greeted → TLSNegotiating → Authenticating → MailFrom → RcptTo →
//! DataTransfer → Quitting → Closed` (or `Aborted` from any non-terminal
//! state) and records every exchange as a timestamped [`SessionEvent`].
//! Secrets never reach the transcript: the [`Redactor`] runs before an event
//! is stored.

mod driver;
mod error;
mod options;
mod redact;
mod stream;
mod types;

use std::net::{SocketAddr, ToSocketAddrs};

pub use driver::SessionDriver;
pub use error::{AbortCategory, ErrorClass, SessionError, hint_for};
pub use options::{Credentials, Envelope, SessionOptions, SessionTarget};
pub use redact::{REDACTION_MARKER, Redactor};
pub use stream::{Connect, SmtpChannel, TcpChannel, TcpConnector};
pub use types::{
    AttemptOutcome, ChunkProgress, ConnectionAttempt, Direction, POLICY_NOTE, SessionAbort,
    SessionEvent, SessionPlan, SessionReport, SessionState, SmtpReply,
};

use crate::cancel::CancelToken;

pub(crate) use driver::dot_stuff;

/// Resolves `host:port` through the system resolver, IPv4 and IPv6 alike.
pub fn resolve_addrs(host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
    let mut addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    addrs.dedup();
    Ok(addrs)
}

/// Resolves the target and drives one session over real sockets.
///
/// A resolution failure is not an error here: the session aborts in
/// `Connecting` and the report explains why.
pub fn drive_session(
    target: &SessionTarget,
    options: &SessionOptions,
    plan: SessionPlan,
    message: &[u8],
    cancel: &CancelToken,
) -> Result<SessionReport, native_tls::Error> {
    let connector = TcpConnector::new(options.accept_invalid_certs)?;
    let addrs = match resolve_addrs(&target.host, target.port()) {
        Ok(addrs) => addrs,
        Err(err) => {
            tracing::warn!(host = %target.host, error = %err, "address resolution failed");
            Vec::new()
        }
    };
    let driver = SessionDriver::new(&connector, options, cancel);
    Ok(driver.run(target, &addrs, plan, message))
}
