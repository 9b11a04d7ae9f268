//! Operator advice derived from a verdict and the probe behind it.

use std::collections::BTreeSet;

use crate::probe::{PortState, ProbeResult};
use crate::transport::IMPLICIT_TLS_PORT;

use super::types::{Evidence, InterferenceCategory, InterferenceVerdict};

/// Plain SMTP relay port, the one access providers most often filter.
const RELAY_PORT: u16 = 25;
/// Submission ports worth switching to, most preferred first.
const ALTERNATIVE_PORTS: [u16; 3] = [587, 465, 2525];

/// Concrete next steps for the operator, most specific first. Empty for a
/// clean verdict.
pub fn recommendations(verdict: &InterferenceVerdict, probe: &ProbeResult) -> Vec<String> {
    let mut advice = Advice::default();
    if verdict.category == InterferenceCategory::None {
        return advice.0;
    }

    let cited: BTreeSet<u16> = verdict
        .evidence
        .iter()
        .filter_map(|evidence| match evidence {
            Evidence::PortScan { port } if verdict.category == InterferenceCategory::PortBlocked => {
                Some(*port)
            }
            _ => None,
        })
        .collect();
    let blocked = probe
        .port_scan
        .values()
        .filter(|scan| scan.state.is_unreachable())
        .map(|scan| scan.port)
        .filter(|port| *port == RELAY_PORT || cited.contains(port));
    for port in blocked {
        let open: Vec<String> = ALTERNATIVE_PORTS
            .iter()
            .filter(|alt| **alt != port && probe.port_state(**alt) == Some(PortState::Open))
            .map(u16::to_string)
            .collect();
        if open.is_empty() {
            advice.push(format!(
                "Port {port} is unreachable and no alternative submission port answered; send through a relay outside this network"
            ));
        } else {
            advice.push(format!("Use port {} instead of port {port}", open.join(" or ")));
        }
    }

    match verdict.category {
        InterferenceCategory::ConnectionReset | InterferenceCategory::DpiSuspected => {
            if probe.port_state(IMPLICIT_TLS_PORT) == Some(PortState::Open) {
                advice.push(format!(
                    "Use implicit TLS on port {IMPLICIT_TLS_PORT} so no SMTP command crosses the network before encryption"
                ));
            }
            advice.push("Route the submission through a VPN or an alternative SMTP relay".into());
        }
        InterferenceCategory::Throttled => {
            advice.push("Send large messages through an SMTP relay outside this network, or split them".into());
        }
        InterferenceCategory::DnsManipulated => {
            advice.push(
                "Resolve the server through another resolver (or DNS over HTTPS) and compare the addresses".into(),
            );
        }
        InterferenceCategory::Indeterminate => {
            let uncovered: Vec<String> = verdict
                .evidence
                .iter()
                .filter_map(|evidence| match evidence {
                    Evidence::Coverage { port } => Some(port.to_string()),
                    _ => None,
                })
                .collect();
            if !uncovered.is_empty() {
                advice.push(format!(
                    "Re-run the diagnosis so port {} gets a concluded session",
                    uncovered.join(", ")
                ));
            }
            if !probe.is_complete() {
                advice.push(
                    "Re-run with a longer probe deadline, or with privileges for the path trace, to complete the network probe"
                        .into(),
                );
            }
        }
        InterferenceCategory::PortBlocked | InterferenceCategory::None => {}
    }

    if verdict.category.is_interference() {
        if let Some(isp) = &probe.trace.isp {
            advice.push(format!(
                "The path crosses {isp}; if the restriction persists, use a VPN or an alternative SMTP relay"
            ));
        }
    }
    advice.0
}

#[derive(Default)]
struct Advice(Vec<String>);

impl Advice {
    fn push(&mut self, line: String) {
        if !self.0.contains(&line) {
            self.0.push(line);
        }
    }
}
