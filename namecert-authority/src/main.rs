//! namecert authority daemon.
//!
//! Loads the CA profile from the config directory, materializes the CA
//! key and certificate, and serves the protocol over a Unix socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use regex::Regex;
use tracing_subscriber::EnvFilter;

use namecert_core::challenge::email::EmailChallenge;
use namecert_core::challenge::possession::PossessionChallenge;
use namecert_core::challenge::{self, ChallengeRegistry};
use namecert_core::clock::SystemClock;
use namecert_core::packet::ValidityPeriod;
use namecert_core::{cert, Certificate, KeyPair};

use namecert_authority::config::{
    self, CaConfig, CA_CONFIG_FILE, CREDENTIAL_CONFIG_FILE, EMAIL_CONFIG_FILE,
};
use namecert_authority::sender::{CommandEmailSender, LogEmailSender};
use namecert_authority::service::CaService;
use namecert_authority::store::{MemoryCertStore, MemoryRequestStore};
use namecert_authority::{assignment, ipc};

/// Lifetime of a generated CA certificate.
const CA_CERT_VALIDITY_DAYS: i64 = 3_650;
/// Terminal request records linger this long for replay.
const TERMINAL_GRACE_SECS: i64 = 60;
/// Expiry sweep cadence.
const SWEEP_INTERVAL_SECS: u64 = 10;

#[derive(Parser)]
#[command(name = "namecert-authority", version, about)]
struct Cli {
    /// Path to ca.conf; empty selects $NDNCERT_SYSCONFDIR (or /etc/ndncert).
    #[arg(long, default_value = "")]
    config: String,

    /// Directory holding the CA key and certificate.
    #[arg(long, default_value = "./namecert-data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the authority daemon.
    Serve {
        /// Unix socket to listen on.
        #[arg(long, default_value = "namecert-ca.sock")]
        socket: PathBuf,

        /// External command delivering email PINs; defaults to logging.
        #[arg(long)]
        email_command: Option<String>,
    },

    /// Print the CA certificate in armored form.
    Certificate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_dir = if cli.config.is_empty() {
        config::default_config_dir()
    } else {
        PathBuf::from(&cli.config)
            .parent()
            .map(Path::to_owned)
            .unwrap_or_else(|| PathBuf::from("."))
    };
    let config_path = if cli.config.is_empty() {
        config_dir.join(CA_CONFIG_FILE)
    } else {
        PathBuf::from(&cli.config)
    };
    let config = CaConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let (key, ca_cert) = load_or_create_identity(&cli.data_dir, &config)?;

    match cli.command {
        Commands::Certificate => {
            print!("{}", ca_cert.to_pem());
            Ok(())
        }
        Commands::Serve {
            socket,
            email_command,
        } => serve(config, config_dir, key, ca_cert, socket, email_command).await,
    }
}

async fn serve(
    config: CaConfig,
    config_dir: PathBuf,
    key: KeyPair,
    ca_cert: Certificate,
    socket: PathBuf,
    email_command: Option<String>,
) -> Result<()> {
    let registry = Arc::new(build_registry(&config, &config_dir, email_command)?);
    let assignment = assignment::from_config(
        config.name_assignment.unwrap_or_default(),
        config.probe_parameter_keys(),
    );
    let profile = config.profile(ca_cert)?;

    let service = Arc::new(CaService::new(
        profile,
        key,
        assignment,
        registry,
        Arc::new(MemoryRequestStore::new(Duration::seconds(
            TERMINAL_GRACE_SECS,
        ))),
        Arc::new(MemoryCertStore::new()),
        Arc::new(SystemClock),
    )?);

    // Background expiry sweep.
    let sweeper = service.clone();
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            let swept = sweeper.sweep_expired().await;
            if swept > 0 {
                tracing::debug!(swept, "expiry sweep");
            }
        }
    });

    tokio::select! {
        result = ipc::serve(&socket, service) => result.context("socket server failed"),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            let _ = std::fs::remove_file(&socket);
            Ok(())
        }
    }
}

fn build_registry(
    config: &CaConfig,
    config_dir: &Path,
    email_command: Option<String>,
) -> Result<ChallengeRegistry> {
    let mut builder = ChallengeRegistry::builder();
    for name in config.challenge_names() {
        match name.as_str() {
            challenge::possession::CHALLENGE_TYPE => {
                let anchors =
                    config::load_trust_anchors(&config_dir.join(CREDENTIAL_CONFIG_FILE))
                        .context("loading possession trust anchors")?;
                builder = builder.register(Arc::new(PossessionChallenge::new(anchors)));
            }
            challenge::email::CHALLENGE_TYPE => {
                let email_config =
                    config::load_email_config(&config_dir.join(EMAIL_CONFIG_FILE))
                        .context("loading email challenge policy")?;
                let whitelist = email_config
                    .whitelist
                    .iter()
                    .map(|pattern| Regex::new(pattern))
                    .collect::<Result<Vec<_>, _>>()
                    .context("compiling email whitelist")?;
                let sender: Arc<dyn namecert_core::challenge::email::EmailSender> =
                    match &email_command {
                        Some(command) => Arc::new(CommandEmailSender::new(command.clone())),
                        None => Arc::new(LogEmailSender),
                    };
                builder = builder.register(Arc::new(EmailChallenge::new(whitelist, sender)));
            }
            other => anyhow::bail!("unsupported challenge in configuration: {other}"),
        }
    }
    Ok(builder.build())
}

/// Load the CA key and certificate from the data directory, creating
/// both on first start.
fn load_or_create_identity(data_dir: &Path, config: &CaConfig) -> Result<(KeyPair, Certificate)> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let key_path = data_dir.join("ca.key");
    let cert_path = data_dir.join("ca.cert");

    if key_path.exists() && cert_path.exists() {
        let key_raw = std::fs::read(&key_path).context("reading CA key")?;
        let key = KeyPair::from_bytes(&key_raw)
            .map_err(|error| anyhow::anyhow!("loading CA key: {error}"))?;
        let cert_text = std::fs::read_to_string(&cert_path).context("reading CA certificate")?;
        let cert = Certificate::from_pem(&cert_text)
            .map_err(|error| anyhow::anyhow!("loading CA certificate: {error}"))?;
        return Ok((key, cert));
    }

    let key = KeyPair::generate();
    let now = Utc::now();
    let cert = cert::self_signed(
        &key,
        &config.prefix()?,
        ValidityPeriod::new(now, now + Duration::days(CA_CERT_VALIDITY_DAYS)),
    );

    std::fs::write(&key_path, key.to_bytes()).context("writing CA key")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
            .context("restricting CA key permissions")?;
    }
    std::fs::write(&cert_path, cert.to_pem()).context("writing CA certificate")?;
    tracing::info!(cert = %cert.name(), "CA identity created");

    Ok((key, cert))
}
