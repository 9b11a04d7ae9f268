use std::borrow::Cow;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use super::options::Credentials;

pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Replaces every known secret with [`REDACTION_MARKER`].
#[derive(Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl std::fmt::Debug for Redactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redactor")
            .field("secrets", &self.secrets.len())
            .finish()
    }
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Covers the password and every encoded form it takes on the wire:
    /// the `AUTH PLAIN` blob and the `AUTH LOGIN` answers.
    pub fn for_credentials(credentials: &Credentials) -> Self {
        let mut redactor = Self::new();
        redactor.add(&credentials.password);
        redactor.add(plain_blob(credentials));
        redactor.add(STANDARD.encode(credentials.username.as_bytes()));
        redactor.add(STANDARD.encode(credentials.password.as_bytes()));
        redactor
    }

    pub fn add(&mut self, secret: impl AsRef<str>) {
        let secret = secret.as_ref();
        if secret.is_empty() || self.secrets.iter().any(|known| known == secret) {
            return;
        }
        self.secrets.push(secret.to_string());
        // longest first so an encoded blob is replaced before its fragments
        self.secrets
            .sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn redact<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut out = Cow::Borrowed(text);
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = Cow::Owned(out.replace(secret.as_str(), REDACTION_MARKER));
            }
        }
        out
    }
}

/// `base64("\0username\0password")`, the `AUTH PLAIN` initial response.
pub(crate) fn plain_blob(credentials: &Credentials) -> String {
    let mut raw = Vec::with_capacity(credentials.username.len() + credentials.password.len() + 2);
    raw.push(0);
    raw.extend_from_slice(credentials.username.as_bytes());
    raw.push(0);
    raw.extend_from_slice(credentials.password.as_bytes());
    STANDARD.encode(raw)
}

pub(crate) fn encode(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}
