use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use smtpdiag_lib::{
    Credentials, DiagnosticConfig, Envelope, ImapTarget, ProbeOptions, SmtpTarget, TraceStrategy,
};

#[derive(Parser)]
#[command(name = "smtpdiag-cli", version)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,

    /// format: human|json|ndjson|csv
    #[arg(long, global = true, default_value = "human", env = "SMTPDIAG_FORMAT")]
    pub format: String,

    /// écrit le rapport dans un fichier (écriture atomique)
    #[arg(long, global = true, env = "SMTPDIAG_OUT")]
    pub out: Option<PathBuf>,

    /// journaux sur stderr: -v info, -vv debug, -vvv trace (sinon RUST_LOG)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// session SMTP instrumentée + sonde réseau + audit, puis verdict
    Diagnose(DiagnoseArgs),
    /// sonde réseau seule: DNS, traceroute, scan des ports
    Probe(ProbeArgs),
}

/// Cible et réglages de la sonde, communs aux deux sous-commandes.
#[derive(Args)]
pub struct TargetArgs {
    /// serveur SMTP (nom ou adresse IP)
    #[arg(env = "SMTPDIAG_SMTP_HOST")]
    pub host: String,

    /// port SMTP principal
    #[arg(long, default_value_t = 587, env = "SMTPDIAG_SMTP_PORT")]
    pub port: u16,

    /// ports sondés, séparés par des virgules (défaut: 25,465,587,2525)
    #[arg(long, value_delimiter = ',', env = "SMTPDIAG_PORTS")]
    pub ports: Vec<u16>,

    /// traceroute: auto|external|socket|disabled
    #[arg(long, env = "SMTPDIAG_TRACE")]
    pub trace: Option<TraceStrategy>,

    /// nombre maximum de sauts
    #[arg(long)]
    pub max_hops: Option<u8>,

    /// port TCP utilisé par le traceroute par sockets
    #[arg(long)]
    pub trace_port: Option<u16>,

    /// nombre de résolutions DNS successives
    #[arg(long)]
    pub dns_samples: Option<usize>,

    /// timeout de connexion du scan (ms)
    #[arg(long = "scan-timeout")]
    pub scan_timeout_ms: Option<u64>,

    /// durée maximale de la sonde (ms)
    #[arg(long = "probe-deadline")]
    pub probe_deadline_ms: Option<u64>,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

impl TargetArgs {
    pub fn probe_options(&self) -> ProbeOptions {
        let mut options = ProbeOptions::default();
        if !self.ports.is_empty() {
            options.ports = self.ports.clone();
        }
        if let Some(trace) = self.trace {
            options.trace_strategy = trace;
        }
        if let Some(max_hops) = self.max_hops {
            options.max_hops = max_hops;
        }
        if let Some(port) = self.trace_port {
            options.trace_port = port;
        }
        if let Some(samples) = self.dns_samples {
            options.dns_samples = samples;
        }
        if let Some(ms) = self.scan_timeout_ms {
            options.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.probe_deadline_ms {
            options.deadline = Duration::from_millis(ms);
        }
        options
    }

    /// Configuration minimale pour `probe`: pas d'enveloppe, pas de session.
    pub fn probe_config(&self) -> DiagnosticConfig {
        DiagnosticConfig {
            smtp: SmtpTarget::new(self.host.clone(), self.port),
            probe: self.probe_options(),
            ..DiagnosticConfig::default()
        }
    }
}

#[derive(Args)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub target: TargetArgs,
}

#[derive(Args)]
pub struct DiagnoseArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// exige TLS (implicite ou STARTTLS)
    #[arg(long, conflicts_with = "no_tls")]
    pub tls: bool,

    /// désactive TLS (ignoré sur 465)
    #[arg(long)]
    pub no_tls: bool,

    /// accepte les certificats invalides (serveurs de test)
    #[arg(long)]
    pub insecure: bool,

    /// identifiant SMTP AUTH
    #[arg(long, requires = "password", env = "SMTPDIAG_SMTP_USER")]
    pub user: Option<String>,

    /// mot de passe SMTP AUTH
    #[arg(long, requires = "user", env = "SMTPDIAG_SMTP_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// enveloppe MAIL FROM
    #[arg(long = "from", env = "SMTPDIAG_MAIL_FROM")]
    pub mail_from: String,

    /// destinataire(s) RCPT TO, séparés par des virgules
    #[arg(long = "to", required = true, value_delimiter = ',', env = "SMTPDIAG_RCPT_TO")]
    pub rcpt_to: Vec<String>,

    /// fichier message brut (sinon un message de test est généré)
    #[arg(long)]
    pub message: Option<PathBuf>,

    /// taille du message de test généré (octets)
    #[arg(long, conflicts_with = "message")]
    pub size: Option<usize>,

    /// nom utilisé pour EHLO/HELO
    #[arg(long, env = "SMTPDIAG_HELO")]
    pub helo: Option<String>,

    /// taille d'un morceau pendant DATA (octets)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// au-delà de cette taille le message part en morceaux (octets)
    #[arg(long)]
    pub chunk_threshold: Option<usize>,

    /// timeout de connexion SMTP (ms)
    #[arg(long = "connect-timeout")]
    pub connect_timeout_ms: Option<u64>,

    /// timeout par commande SMTP (ms)
    #[arg(long = "command-timeout")]
    pub command_timeout_ms: Option<u64>,

    /// attente de la réponse finale après DATA (ms)
    #[arg(long = "data-timeout")]
    pub data_timeout_ms: Option<u64>,

    /// serveur IMAP autorisé par l'audit
    #[arg(long, env = "SMTPDIAG_IMAP_HOST")]
    pub imap_host: Option<String>,

    /// port IMAP
    #[arg(long, default_value_t = 993, env = "SMTPDIAG_IMAP_PORT")]
    pub imap_port: u16,

    /// désactive l'audit des connexions du processus
    #[arg(long)]
    pub no_audit: bool,

    /// intervalle d'échantillonnage de l'audit (ms)
    #[arg(long = "audit-interval")]
    pub audit_interval_ms: Option<u64>,

    /// pas de session de poignée de main sur les autres ports sondés
    #[arg(long)]
    pub no_handshakes: bool,

    /// affiche la transcription complète de chaque session (format human)
    #[arg(long)]
    pub transcript: bool,

    /// sessions coupées au même offset avant de suspecter un DPI
    #[arg(long)]
    pub dpi_repeats: Option<usize>,

    /// fraction du débit initial en dessous de laquelle on parle de bridage
    #[arg(long)]
    pub throttle_factor: Option<f64>,

    /// accepte les réponses DNS privées (laboratoire)
    #[arg(long)]
    pub allow_private_dns: bool,
}

impl DiagnoseArgs {
    pub fn tls_preference(&self) -> Option<bool> {
        match (self.tls, self.no_tls) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }

    pub fn config(&self) -> Result<DiagnosticConfig> {
        let mut smtp = SmtpTarget::new(self.target.host.clone(), self.target.port);
        smtp.use_tls = self.tls_preference();
        smtp.credentials = match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some(Credentials::new(user, password)),
            (None, None) => None,
            _ => bail!("--user et --password vont ensemble"),
        };

        let mut config = DiagnosticConfig::new(
            smtp,
            Envelope::new(self.mail_from.clone(), self.rcpt_to.clone()),
        );
        config.probe = self.target.probe_options();

        let session = &mut config.session;
        session.accept_invalid_certs = self.insecure;
        if let Some(helo) = &self.helo {
            session.helo_domain = helo.clone();
        }
        if let Some(size) = self.chunk_size {
            session.chunk_size = size;
        }
        if let Some(threshold) = self.chunk_threshold {
            session.chunk_threshold = threshold;
        }
        if let Some(ms) = self.connect_timeout_ms {
            session.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.command_timeout_ms {
            session.greeting_timeout = Duration::from_millis(ms);
            session.command_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.data_timeout_ms {
            session.data_timeout = Duration::from_millis(ms);
        }

        let classifier = &mut config.classifier;
        if let Some(repeats) = self.dpi_repeats {
            classifier.dpi_min_repeats = repeats;
        }
        if let Some(factor) = self.throttle_factor {
            if !(0.0..1.0).contains(&factor) {
                bail!("--throttle-factor doit être dans [0, 1)");
            }
            classifier.throttle_factor = factor;
        }
        classifier.allow_private_resolution = self.allow_private_dns;

        config.imap = self.imap_host.as_ref().map(|host| ImapTarget {
            host: host.clone(),
            port: self.imap_port,
        });
        config.audit = !self.no_audit;
        if let Some(ms) = self.audit_interval_ms {
            config.audit_interval = Duration::from_millis(ms.max(1));
        }
        config.handshake_ports = !self.no_handshakes;
        Ok(config)
    }
}
