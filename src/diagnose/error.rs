use thiserror::Error;

/// Run-level failures. Anything that goes wrong inside a session or a probe
/// step is recorded in the report instead.
#[derive(Debug, Error)]
pub enum DiagError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("host IDNA conversion failed for {host}")]
    Idna {
        host: String,
        #[source]
        source: idna::Errors,
    },
    #[error("resolver initialization failed: {source}")]
    ResolverInit {
        #[source]
        source: std::io::Error,
    },
    #[error("TLS connector initialization failed: {source}")]
    Tls {
        #[source]
        source: native_tls::Error,
    },
    #[error("cannot start {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{name} thread panicked")]
    WorkerPanicked { name: &'static str },
    #[error("cannot write {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[cfg(feature = "with-serde")]
    #[error("report serialization failed: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[cfg(feature = "with-csv")]
    #[error("CSV export failed: {source}")]
    Csv {
        #[source]
        source: csv::Error,
    },
}

impl DiagError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    pub(crate) fn idna(host: &str, source: idna::Errors) -> Self {
        Self::Idna {
            host: host.to_string(),
            source,
        }
    }

    pub(crate) fn resolver_init(source: std::io::Error) -> Self {
        Self::ResolverInit { source }
    }

    pub(crate) fn tls(source: native_tls::Error) -> Self {
        Self::Tls { source }
    }

    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn spawn(name: &'static str, source: std::io::Error) -> Self {
        Self::Spawn { name, source }
    }
}
