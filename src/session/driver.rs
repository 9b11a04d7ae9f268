use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::cancel::CancelToken;
use crate::transport::TransportMode;

use super::error::{SessionError, hint_for};
use super::options::{SessionOptions, SessionTarget};
use super::redact::{Redactor, encode, plain_blob};
use super::stream::{Connect, Connection, SmtpChannel};
use super::types::{
    AttemptOutcome, ChunkProgress, ConnectionAttempt, Direction, POLICY_NOTE, SessionAbort,
    SessionEvent, SessionPlan, SessionReport, SessionState, SmtpReply,
};

const DEFAULT_HELO: &str = "localhost";

/// Drives one SMTP session and narrates it as a [`SessionReport`].
pub struct SessionDriver<'a, C> {
    connector: &'a C,
    options: &'a SessionOptions,
    cancel: &'a CancelToken,
}

/// Transcript builder. Only the driver appends; the report hands out the
/// finished vector.
struct Recorder {
    host: String,
    clock: Instant,
    last: Duration,
    events: Vec<SessionEvent>,
    state: SessionState,
    attempt: usize,
    bytes_sent: u64,
    redactor: Redactor,
}

impl Recorder {
    fn new(host: &str, redactor: Redactor) -> Self {
        Self {
            host: host.to_string(),
            clock: Instant::now(),
            last: Duration::ZERO,
            events: Vec::new(),
            state: SessionState::Connecting,
            attempt: 0,
            bytes_sent: 0,
            redactor,
        }
    }

    fn now(&self) -> Duration {
        self.clock.elapsed().max(self.last)
    }

    fn begin_attempt(&mut self, attempt: usize) -> Duration {
        let now = self.now();
        self.last = now;
        self.attempt = attempt;
        now
    }

    fn record(&mut self, direction: Direction, text: &str) -> usize {
        self.push(direction, text, None)
    }

    fn push(&mut self, direction: Direction, text: &str, chunk: Option<ChunkProgress>) -> usize {
        let timestamp = self.now();
        let latency_since_prior = timestamp.saturating_sub(self.last);
        self.last = timestamp;
        let raw_text = self.redactor.redact(text).into_owned();
        tracing::trace!(
            host = %self.host,
            state = %self.state,
            "{} {}",
            direction.marker(),
            raw_text
        );
        self.events.push(SessionEvent {
            timestamp,
            direction,
            raw_text,
            latency_since_prior,
            state: self.state,
            attempt: self.attempt,
            bytes_sent: self.bytes_sent,
            chunk,
        });
        self.events.len() - 1
    }

    fn sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(host = %self.host, from = %self.state, to = %next, "session state");
        self.state = next;
    }

    fn last_response(&self) -> Option<String> {
        self.events
            .iter()
            .rev()
            .find(|event| event.direction == Direction::Received)
            .map(|event| event.raw_text.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMechanism {
    Plain,
    Login,
}

impl AuthMechanism {
    /// PLAIN needs one round trip and carries the same secret as LOGIN, so it
    /// ranks first among what this driver can speak.
    fn strongest(advertised: &[String]) -> Option<Self> {
        [Self::Plain, Self::Login]
            .into_iter()
            .find(|mechanism| advertised.iter().any(|name| name == mechanism.as_str()))
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an exchange ended when no error escaped it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exchange {
    Finished,
    /// Optional `STARTTLS` upgrade failed; the session restarts in plaintext.
    Downgraded,
}

impl<'a, C: Connect> SessionDriver<'a, C> {
    pub fn new(connector: &'a C, options: &'a SessionOptions, cancel: &'a CancelToken) -> Self {
        Self {
            connector,
            options,
            cancel,
        }
    }

    /// Runs the session to a terminal state. Failures never escape: they end in
    /// `Aborted` with the cause described in [`SessionReport::abort`].
    pub fn run(
        &self,
        target: &SessionTarget,
        addrs: &[SocketAddr],
        plan: SessionPlan,
        message: &[u8],
    ) -> SessionReport {
        let redactor = target
            .credentials
            .as_ref()
            .map(Redactor::for_credentials)
            .unwrap_or_default();
        let started_at = Utc::now();
        let mut rec = Recorder::new(&target.host, redactor);
        let mut attempts = Vec::new();

        tracing::info!(
            host = %target.host,
            port = target.port(),
            transport = %target.selection.mode,
            ?plan,
            "session starting"
        );

        let mut mode = target.selection.mode;
        let mut candidates = addrs;
        let abort = loop {
            let mut conn = match self.connect(&mut rec, &mut attempts, target, mode, candidates) {
                Ok(conn) => conn,
                Err(err) => {
                    let err = self.settle(err);
                    break Some(self.describe(&rec, &err));
                }
            };
            let abort = match self.exchange(&mut conn, &mut rec, target, mode, plan, message) {
                Ok(Exchange::Finished) => {
                    self.quit(&mut conn, &mut rec);
                    None
                }
                Ok(Exchange::Downgraded) => {
                    conn.channel.shutdown();
                    rec.record(Direction::Local, "connection closed");
                    if let Some(attempt) = attempts.last_mut() {
                        attempt.outcome = AttemptOutcome::Failed;
                        attempt.error = Some("TLS upgrade failed".into());
                        attempt.duration = rec.now().saturating_sub(attempt.started);
                        if let Some(addr) = addrs.iter().find(|addr| Some(**addr) == attempt.address) {
                            candidates = std::slice::from_ref(addr);
                        }
                    }
                    mode = TransportMode::Plaintext;
                    rec.transition(SessionState::Connecting);
                    continue;
                }
                Err(err) => {
                    let err = self.settle(err);
                    let abort = self.describe(&rec, &err);
                    if allows_quit(&err) {
                        self.quit_quietly(&mut conn, &mut rec);
                    }
                    Some(abort)
                }
            };
            conn.channel.shutdown();
            rec.record(Direction::Local, "connection closed");
            break abort;
        };

        match &abort {
            Some(abort) => {
                tracing::warn!(
                    host = %target.host,
                    port = target.port(),
                    state = %abort.state,
                    category = %abort.category,
                    "session aborted"
                );
                rec.transition(SessionState::Aborted);
                let note = format!(
                    "aborted in {} ({}): {}",
                    abort.state, abort.category, abort.message
                );
                rec.record(Direction::Local, &note);
            }
            None => {
                rec.transition(SessionState::Closed);
                rec.record(Direction::Local, "session closed");
            }
        }

        // the last attempt owns every event up to the terminal note
        if let Some(attempt) = attempts.last_mut() {
            attempt.duration = rec.now().saturating_sub(attempt.started);
        }

        SessionReport {
            host: target.host.clone(),
            port: target.port(),
            transport: target.selection.mode,
            plan,
            started_at,
            final_state: rec.state,
            bytes_sent: rec.bytes_sent,
            events: rec.events,
            attempts,
            abort,
        }
    }

    fn connect(
        &self,
        rec: &mut Recorder,
        attempts: &mut Vec<ConnectionAttempt>,
        target: &SessionTarget,
        mode: TransportMode,
        addrs: &[SocketAddr],
    ) -> Result<Connection<C::Channel>, SessionError> {
        if addrs.is_empty() {
            rec.record(
                Direction::Local,
                &format!("no address resolved for {}", target.host),
            );
            return Err(SessionError::NoAddress {
                host: target.host.clone(),
            });
        }

        let mut last_err = None;
        for addr in addrs {
            self.check_cancel()?;
            let started = rec.begin_attempt(attempts.len());
            rec.record(Direction::Local, &format!("connecting to {addr} ({mode})"));
            let mut attempt = ConnectionAttempt {
                host: target.host.clone(),
                address: Some(*addr),
                port: target.port(),
                transport_mode: mode,
                outcome: AttemptOutcome::Connected,
                started,
                duration: Duration::ZERO,
                error: None,
            };

            match self
                .connector
                .connect(addr, self.options.connect_timeout, self.cancel)
            {
                Ok(channel) => {
                    let mut conn = Connection::new(channel);
                    rec.record(Direction::Local, &format!("TCP connected to {addr}"));
                    if mode == TransportMode::ImplicitTls {
                        if let Err(err) = self.implicit_tls(&mut conn, rec, target) {
                            attempt.outcome = AttemptOutcome::Failed;
                            attempt.error = Some(err.to_string());
                            attempt.duration = rec.now().saturating_sub(started);
                            attempts.push(attempt);
                            conn.channel.shutdown();
                            return Err(err);
                        }
                    }
                    attempts.push(attempt);
                    return Ok(conn);
                }
                Err(err) => {
                    tracing::info!(host = %target.host, %addr, error = %err, "connect failed");
                    rec.record(
                        Direction::Local,
                        &format!("connect to {addr} failed: {err}"),
                    );
                    attempt.outcome = AttemptOutcome::from_io(&err);
                    attempt.error = Some(err.to_string());
                    attempt.duration = rec.now().saturating_sub(started);
                    attempts.push(attempt);
                    last_err = Some(SessionError::Connect {
                        target: addr.to_string(),
                        source: err,
                    });
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SessionError::NoAddress {
            host: target.host.clone(),
        }))
    }

    fn implicit_tls(
        &self,
        conn: &mut Connection<C::Channel>,
        rec: &mut Recorder,
        target: &SessionTarget,
    ) -> Result<(), SessionError> {
        conn.channel
            .set_timeout(self.options.greeting_timeout)
            .map_err(|err| SessionError::from_io(rec.state, err))?;
        let start = Instant::now();
        rec.record(Direction::Local, "TLS handshake started (implicit)");
        conn.channel.upgrade_tls(&target.host)?;
        record_tls_established(conn, rec, start);
        Ok(())
    }

    fn exchange(
        &self,
        conn: &mut Connection<C::Channel>,
        rec: &mut Recorder,
        target: &SessionTarget,
        mode: TransportMode,
        plan: SessionPlan,
        message: &[u8],
    ) -> Result<Exchange, SessionError> {
        let options = self.options;
        conn.channel
            .set_timeout(options.greeting_timeout)
            .map_err(|err| SessionError::from_io(rec.state, err))?;
        let greeting = self.read_reply(conn, rec, options.greeting_timeout)?;
        if greeting.code != 220 {
            expect_completion(&greeting, "greeting")?;
            return Err(SessionError::Protocol(format!(
                "unexpected greeting code {}",
                greeting.code
            )));
        }
        rec.transition(SessionState::Greeted);

        let helo = options.helo_name(DEFAULT_HELO);
        let mut capabilities = self.ehlo(conn, rec, &helo)?;
        if mode == TransportMode::OpportunisticTls {
            match self.starttls(conn, rec, target, &helo, capabilities)? {
                Some(reply) => capabilities = reply,
                None => return Ok(Exchange::Downgraded),
            }
        }

        if plan == SessionPlan::Handshake {
            return Ok(Exchange::Finished);
        }

        rec.transition(SessionState::Authenticating);
        self.authenticate(conn, rec, target, &capabilities)?;

        rec.transition(SessionState::MailFrom);
        let mail_from = format!("MAIL FROM:<{}>", target.envelope.mail_from);
        let reply = self.command(conn, rec, &mail_from, options.command_timeout)?;
        expect_completion(&reply, "MAIL FROM")?;

        rec.transition(SessionState::RcptTo);
        if target.envelope.rcpt_to.is_empty() {
            return Err(SessionError::Protocol("no recipient configured".into()));
        }
        for rcpt in &target.envelope.rcpt_to {
            let reply = self.command(conn, rec, &format!("RCPT TO:<{rcpt}>"), options.command_timeout)?;
            expect_completion(&reply, "RCPT TO")?;
        }

        let reply = self.command(conn, rec, "DATA", options.command_timeout)?;
        if !reply.is_positive_intermediate() {
            expect_completion(&reply, "DATA")?;
            return Err(SessionError::Protocol(format!(
                "DATA answered with {} instead of 354",
                reply.code
            )));
        }

        rec.transition(SessionState::DataTransfer);
        self.transfer(conn, rec, message)?;

        self.write(conn, rec, b".\r\n")?;
        rec.record(Direction::Sent, ".");
        conn.channel
            .set_timeout(options.data_timeout)
            .map_err(|err| SessionError::from_io(rec.state, err))?;
        let reply = self.read_reply(conn, rec, options.data_timeout)?;
        expect_completion(&reply, "end of data")?;
        Ok(Exchange::Finished)
    }

    fn ehlo(
        &self,
        conn: &mut Connection<C::Channel>,
        rec: &mut Recorder,
        helo: &str,
    ) -> Result<SmtpReply, SessionError> {
        let timeout = self.options.command_timeout;
        let reply = self.command(conn, rec, &format!("EHLO {helo}"), timeout)?;
        if reply.is_positive_completion() {
            return Ok(reply);
        }
        if reply.is_permanent_failure() {
            rec.record(Direction::Local, "EHLO refused; falling back to HELO");
            let reply = self.command(conn, rec, &format!("HELO {helo}"), timeout)?;
            expect_completion(&reply, "HELO")?;
            return Ok(reply);
        }
        expect_completion(&reply, "EHLO")?;
        Ok(reply)
    }

    /// Returns `None` when an optional upgrade failed after the server agreed to
    /// it; the caller reconnects in plaintext.
    fn starttls(
        &self,
        conn: &mut Connection<C::Channel>,
        rec: &mut Recorder,
        target: &SessionTarget,
        helo: &str,
        capabilities: SmtpReply,
    ) -> Result<Option<SmtpReply>, SessionError> {
        let required = target.selection.tls_required;
        if !capabilities.has_capability("STARTTLS") {
            if required {
                return Err(SessionError::TlsUnavailable {
                    reason: "STARTTLS not advertised in the EHLO reply".into(),
                });
            }
            tracing::warn!(host = %target.host, "STARTTLS not advertised, continuing in plaintext");
            rec.record(
                Direction::Local,
                &format!("{POLICY_NOTE} STARTTLS not advertised; continuing in plaintext"),
            );
            return Ok(Some(capabilities));
        }

        rec.transition(SessionState::TlsNegotiating);
        let reply = self.command(conn, rec, "STARTTLS", self.options.command_timeout)?;
        if reply.code != 220 {
            if required {
                return Err(SessionError::TlsUnavailable {
                    reason: format!("STARTTLS refused with {}", reply.code),
                });
            }
            tracing::warn!(host = %target.host, code = reply.code, "STARTTLS refused, continuing in plaintext");
            rec.record(
                Direction::Local,
                &format!("{POLICY_NOTE} STARTTLS refused with {}; continuing in plaintext", reply.code),
            );
            return Ok(Some(capabilities));
        }

        let dropped = conn.discard_buffer();
        if dropped > 0 {
            rec.record(
                Direction::Local,
                &format!("discarded {dropped} bytes received ahead of the TLS handshake"),
            );
        }
        let start = Instant::now();
        rec.record(Direction::Local, "TLS handshake started");
        if let Err(err) = conn.channel.upgrade_tls(&target.host) {
            if required || self.cancel.is_cancelled() {
                return Err(err);
            }
            tracing::warn!(host = %target.host, error = %err, "STARTTLS upgrade failed, reconnecting in plaintext");
            rec.record(
                Direction::Local,
                &format!("{POLICY_NOTE} TLS upgrade failed ({err}); reconnecting in plaintext"),
            );
            return Ok(None);
        }
        record_tls_established(conn, rec, start);
        self.ehlo(conn, rec, helo).map(Some)
    }

    fn authenticate(
        &self,
        conn: &mut Connection<C::Channel>,
        rec: &mut Recorder,
        target: &SessionTarget,
        capabilities: &SmtpReply,
    ) -> Result<(), SessionError> {
        let Some(credentials) = &target.credentials else {
            rec.record(Direction::Local, "no credentials configured; skipping AUTH");
            return Ok(());
        };

        let advertised = capabilities.auth_mechanisms();
        let mechanism = AuthMechanism::strongest(&advertised).ok_or_else(|| {
            SessionError::AuthRejected(format!(
                "no supported AUTH mechanism advertised (server offers: {})",
                if advertised.is_empty() {
                    "none".to_string()
                } else {
                    advertised.join(" ")
                }
            ))
        })?;
        rec.record(
            Direction::Local,
            &format!("authenticating with {mechanism} (single attempt)"),
        );

        let timeout = self.options.command_timeout;
        let reply = match mechanism {
            AuthMechanism::Plain => {
                let line = format!("AUTH PLAIN {}", plain_blob(credentials));
                self.command(conn, rec, &line, timeout)?
            }
            AuthMechanism::Login => {
                let reply = self.command(conn, rec, "AUTH LOGIN", timeout)?;
                expect_challenge(&reply)?;
                let reply = self.command(conn, rec, &encode(&credentials.username), timeout)?;
                expect_challenge(&reply)?;
                self.command(conn, rec, &encode(&credentials.password), timeout)?
            }
        };
        if reply.is_positive_completion() {
            Ok(())
        } else {
            Err(SessionError::AuthRejected(reply.raw()))
        }
    }

    fn transfer(
        &self,
        conn: &mut Connection<C::Channel>,
        rec: &mut Recorder,
        message: &[u8],
    ) -> Result<(), SessionError> {
        let payload = dot_stuff(message);
        let total_bytes = payload.len();
        conn.channel
            .set_timeout(self.options.command_timeout)
            .map_err(|err| SessionError::from_io(rec.state, err))?;

        if total_bytes <= self.options.chunk_threshold {
            self.write(conn, rec, &payload)?;
            rec.record(Direction::Sent, &format!("[message] {total_bytes} bytes"));
            return Ok(());
        }

        let chunk_size = self.options.chunk_size();
        let total = total_bytes.div_ceil(chunk_size);
        rec.record(
            Direction::Local,
            &format!("large message: {total_bytes} bytes in {total} chunks of {chunk_size} bytes"),
        );
        let started = Instant::now();
        let mut cumulative = 0u64;
        for (index, chunk) in payload.chunks(chunk_size).enumerate() {
            self.check_cancel()?;
            self.write(conn, rec, chunk)?;
            cumulative += chunk.len() as u64;
            let progress = ChunkProgress {
                index,
                total,
                bytes: chunk.len(),
                cumulative_bytes: cumulative,
                elapsed: started.elapsed(),
            };
            let text = format!(
                "[chunk {}/{total}] {} bytes ({cumulative}/{total_bytes})",
                index + 1,
                chunk.len()
            );
            rec.push(Direction::Sent, &text, Some(progress));
        }
        Ok(())
    }

    fn command(
        &self,
        conn: &mut Connection<C::Channel>,
        rec: &mut Recorder,
        line: &str,
        timeout: Duration,
    ) -> Result<SmtpReply, SessionError> {
        self.check_cancel()?;
        conn.channel
            .set_timeout(timeout)
            .map_err(|err| SessionError::from_io(rec.state, err))?;
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        self.write(conn, rec, &data)?;
        rec.record(Direction::Sent, line);
        self.read_reply(conn, rec, timeout)
    }

    fn write(
        &self,
        conn: &mut Connection<C::Channel>,
        rec: &mut Recorder,
        data: &[u8],
    ) -> Result<(), SessionError> {
        conn.channel
            .write_all(data)
            .map_err(|err| SessionError::from_io(rec.state, err))?;
        rec.sent(data.len());
        Ok(())
    }

    fn read_reply(
        &self,
        conn: &mut Connection<C::Channel>,
        rec: &mut Recorder,
        timeout: Duration,
    ) -> Result<SmtpReply, SessionError> {
        match conn.read_reply(rec.state) {
            Ok(reply) => {
                rec.record(Direction::Received, &reply.raw());
                Ok(reply)
            }
            Err(err) => {
                if matches!(err, SessionError::Timeout { .. }) && !self.cancel.is_cancelled() {
                    rec.record(
                        Direction::Local,
                        &format!("no reply within {} ms", timeout.as_millis()),
                    );
                }
                Err(err)
            }
        }
    }

    fn quit(&self, conn: &mut Connection<C::Channel>, rec: &mut Recorder) {
        rec.transition(SessionState::Quitting);
        match self.command(conn, rec, "QUIT", self.options.command_timeout) {
            Ok(reply) if reply.is_positive_completion() => {}
            Ok(reply) => {
                rec.record(
                    Direction::Local,
                    &format!("unexpected QUIT reply {}", reply.code),
                );
            }
            Err(err) => {
                rec.record(Direction::Local, &format!("QUIT not acknowledged: {err}"));
            }
        }
    }

    /// Polite goodbye after a server-side refusal; its outcome does not matter.
    fn quit_quietly(&self, conn: &mut Connection<C::Channel>, rec: &mut Recorder) {
        if let Err(err) = self.command(conn, rec, "QUIT", self.options.command_timeout) {
            tracing::debug!(host = %rec.host, error = %err, "QUIT after abort failed");
        }
    }

    fn check_cancel(&self) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            Err(SessionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Errors caused by the operator's abort surface as `Cancelled` whatever the
    /// socket reported.
    fn settle(&self, err: SessionError) -> SessionError {
        if self.cancel.is_cancelled() {
            SessionError::Cancelled
        } else {
            err
        }
    }

    fn describe(&self, rec: &Recorder, err: &SessionError) -> SessionAbort {
        let state = match err {
            SessionError::Timeout { state }
            | SessionError::Reset { state, .. }
            | SessionError::Io { state, .. } => *state,
            _ => rec.state,
        };
        let category = err.category();
        SessionAbort {
            state,
            category,
            class: category.class(),
            message: rec.redactor.redact(&err.to_string()).into_owned(),
            last_response: rec.last_response(),
            hint: hint_for(category, state).to_string(),
        }
    }
}

fn record_tls_established<C: SmtpChannel>(conn: &Connection<C>, rec: &mut Recorder, start: Instant) {
    let elapsed = start.elapsed().as_millis();
    let note = match conn.channel.tls_details() {
        Some(details) => format!("TLS established in {elapsed} ms ({details})"),
        None => format!("TLS established in {elapsed} ms"),
    };
    tracing::info!(host = %rec.host, "{note}");
    rec.record(Direction::Local, &note);
}

fn allows_quit(err: &SessionError) -> bool {
    matches!(
        err,
        SessionError::Rejected { .. }
            | SessionError::Deferred { .. }
            | SessionError::AuthRejected(_)
            | SessionError::TlsUnavailable { .. }
            | SessionError::Protocol(_)
    )
}

fn expect_completion(reply: &SmtpReply, command: &str) -> Result<(), SessionError> {
    if reply.is_positive_completion() {
        Ok(())
    } else if reply.is_transient_failure() {
        Err(SessionError::Deferred {
            command: command.to_string(),
            code: reply.code,
        })
    } else if reply.is_permanent_failure() {
        Err(SessionError::Rejected {
            command: command.to_string(),
            code: reply.code,
        })
    } else {
        Err(SessionError::Protocol(format!(
            "unexpected reply {} to {command}",
            reply.code
        )))
    }
}

fn expect_challenge(reply: &SmtpReply) -> Result<(), SessionError> {
    if reply.code == 334 {
        Ok(())
    } else {
        Err(SessionError::AuthRejected(reply.raw()))
    }
}

/// Doubles a leading `.` on every line and makes sure the payload ends with
/// CRLF so the end-of-data sentinel stands on its own line.
pub(crate) fn dot_stuff(message: &[u8]) -> Cow<'_, [u8]> {
    let needs_stuffing = message.first() == Some(&b'.')
        || message.windows(2).any(|pair| pair == b"\n.");
    let needs_crlf = !message.ends_with(b"\r\n");
    if !needs_stuffing && !needs_crlf {
        return Cow::Borrowed(message);
    }

    let mut out = Vec::with_capacity(message.len() + 16);
    let mut at_line_start = true;
    for &byte in message {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }
    if needs_crlf {
        out.extend_from_slice(b"\r\n");
    }
    Cow::Owned(out)
}
