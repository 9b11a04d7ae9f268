//! Transport selection.
//!
//! The public entry point is [`select_transport`], a pure mapping from the target
//! port and the operator's TLS preference to a [`TransportMode`]. The session
//! driver receives the selection once and never re-branches on the port.

mod types;

pub use types::{TransportMode, TransportSelection};

use phf::phf_map;

const SERVICE_NAMES: phf::Map<u16, &'static str> = phf_map! {
    25u16 => "SMTP",
    465u16 => "SMTPS (implicit TLS)",
    587u16 => "Submission (STARTTLS)",
    2525u16 => "SMTP (alternative)",
    143u16 => "IMAP",
    993u16 => "IMAPS",
    53u16 => "DNS",
};

/// Ports that speak SMTP in plaintext first and may upgrade with `STARTTLS`.
pub const STARTTLS_PORTS: [u16; 3] = [25, 587, 2525];
pub const IMPLICIT_TLS_PORT: u16 = 465;

/// The submission ports probed when the operator does not supply a list.
pub const DEFAULT_SUBMISSION_PORTS: [u16; 4] = [25, 465, 587, 2525];

pub fn service_name(port: u16) -> Option<&'static str> {
    SERVICE_NAMES.get(&port).copied()
}

/// Chooses the connection strategy for `port`.
///
/// `use_tls` is the explicit operator preference: `Some(true)` makes TLS
/// mandatory, `Some(false)` disables it, `None` lets the port decide (TLS is then
/// attempted but optional). An unknown port without a preference falls back to
/// plaintext and carries a warning instead of failing.
pub fn select_transport(port: u16, use_tls: Option<bool>) -> TransportSelection {
    if port == IMPLICIT_TLS_PORT {
        let selection = TransportSelection::new(port, TransportMode::ImplicitTls, true);
        return match use_tls {
            Some(false) => selection
                .with_warning("port 465 always negotiates TLS before SMTP; use_tls=false ignored"),
            _ => selection,
        };
    }

    let known = STARTTLS_PORTS.contains(&port);
    match (use_tls, known) {
        (Some(true), _) => TransportSelection::new(port, TransportMode::OpportunisticTls, true),
        (Some(false), _) => TransportSelection::new(port, TransportMode::Plaintext, false),
        (None, true) => TransportSelection::new(port, TransportMode::OpportunisticTls, false),
        (None, false) => TransportSelection::new(port, TransportMode::Plaintext, false)
            .with_warning(format!(
                "port {port} is not a known submission port and no TLS preference was given; \
                 credentials would travel in plaintext"
            )),
    }
}
