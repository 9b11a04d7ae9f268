use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;

const LINE_WIDTH: usize = 76;

/// Message to send: the file as-is, or a generated probe message.
pub fn load(path: Option<&Path>, from: &str, to: &[String], size: Option<usize>) -> Result<Vec<u8>> {
    match path {
        Some(path) => std::fs::read(path).with_context(|| format!("read message {}", path.display())),
        None => Ok(probe_message(from, to, size.unwrap_or(0))),
    }
}

/// Minimal RFC 5322 message, padded with filler lines up to `size` bytes.
pub fn probe_message(from: &str, to: &[String], size: usize) -> Vec<u8> {
    let now = Utc::now();
    let domain = from.rsplit_once('@').map(|(_, domain)| domain).unwrap_or("localhost");
    let mut msg = String::new();
    let _ = write!(msg, "From: <{from}>\r\n");
    let _ = write!(msg, "To: {}\r\n", to.iter().map(|rcpt| format!("<{rcpt}>")).collect::<Vec<_>>().join(", "));
    let _ = write!(msg, "Subject: smtpdiag delivery probe\r\n");
    let _ = write!(msg, "Date: {}\r\n", now.to_rfc2822());
    let _ = write!(msg, "Message-ID: <{}.smtpdiag@{domain}>\r\n", now.timestamp_micros());
    msg.push_str("MIME-Version: 1.0\r\n");
    msg.push_str("Content-Type: text/plain; charset=us-ascii\r\n\r\n");
    msg.push_str("Test message sent by smtpdiag to measure SMTP delivery.\r\n");

    let mut line = 0usize;
    while msg.len() < size {
        let remaining = size - msg.len();
        let width = remaining.saturating_sub(2).min(LINE_WIDTH);
        let label = format!("{line:08} ");
        let mut filler: String = label.chars().chain(std::iter::repeat('x')).take(width).collect();
        filler.push_str("\r\n");
        msg.push_str(&filler);
        line += 1;
        if width == 0 {
            break;
        }
    }
    msg.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_message_has_headers_and_body() {
        let msg = probe_message("probe@example.test", &["ops@example.test".to_string()], 0);
        let text = String::from_utf8(msg).unwrap();
        assert!(text.starts_with("From: <probe@example.test>\r\nTo: <ops@example.test>\r\n"));
        assert!(text.contains("@example.test>\r\n"));
        assert!(text.contains("\r\n\r\nTest message"));
        assert!(text.ends_with("\r\n"));
    }

    #[test]
    fn probe_message_reaches_requested_size() {
        let msg = probe_message("probe@example.test", &["ops@example.test".to_string()], 64 * 1024);
        assert!(msg.len() >= 64 * 1024);
        assert!(msg.len() < 64 * 1024 + LINE_WIDTH + 2);
        let text = String::from_utf8(msg).unwrap();
        assert!(text.split("\r\n").all(|line| line.len() <= 998));
    }
}
