//! namecert client CLI.
//!
//! Drives a certificate request against a local authority daemon:
//! discovers the CA profile, runs the handshake, walks the selected
//! challenge and fetches the issued certificate.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use namecert_core::challenge::email::{EmailChallenge, EmailSendError, EmailSender};
use namecert_core::challenge::possession::PossessionChallenge;
use namecert_core::challenge::{ChallengeRegistry, ClientContext};
use namecert_core::{Certificate, KeyPair, Name, RequestType, Status};

use namecert_client::ipc::Transport;
use namecert_client::request::{
    ca_profile_interest, on_ca_profile_response, on_cert_fetch_response, on_probe_response,
    probe_interest, Request,
};

#[derive(Parser)]
#[command(name = "namecert-client", version, about)]
struct Cli {
    /// Authority daemon socket.
    #[arg(long, default_value = "namecert-ca.sock")]
    socket: PathBuf,

    /// Authority name prefix.
    #[arg(long)]
    ca_prefix: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and print the CA profile.
    Info,

    /// Ask the authority for candidate identity names.
    Probe {
        /// Probe hints as key=value pairs.
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },

    /// Request a new certificate.
    New {
        /// Identity name to request.
        #[arg(long)]
        identity: String,

        /// Requested validity in days.
        #[arg(long, default_value_t = 30)]
        validity_days: i64,

        /// Challenge to run: "possession" or "email".
        #[arg(long)]
        challenge: String,

        /// Email address for the email challenge.
        #[arg(long)]
        email: Option<String>,

        /// Existing credential certificate (armored) for possession.
        #[arg(long)]
        credential: Option<PathBuf>,

        /// Raw 32-byte key file matching the credential.
        #[arg(long)]
        credential_key: Option<PathBuf>,

        /// Where to write the issued certificate (armored).
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Renew a certificate: same walk as `new` under a fresh key.
    Renew {
        #[arg(long)]
        identity: String,

        #[arg(long, default_value_t = 30)]
        validity_days: i64,

        #[arg(long)]
        challenge: String,

        #[arg(long)]
        email: Option<String>,

        #[arg(long)]
        credential: Option<PathBuf>,

        #[arg(long)]
        credential_key: Option<PathBuf>,

        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Revoke a certificate this authority issued.
    Revoke {
        /// The certificate to revoke (armored).
        #[arg(long)]
        certificate: PathBuf,

        /// Raw 32-byte key file matching the certificate; challenge
        /// rounds are signed with it.
        #[arg(long)]
        key: PathBuf,

        /// Challenge to run, as for `new`.
        #[arg(long)]
        challenge: String,

        #[arg(long)]
        email: Option<String>,

        #[arg(long)]
        credential: Option<PathBuf>,

        #[arg(long)]
        credential_key: Option<PathBuf>,
    },
}

/// The client never delivers mail; modules are instantiated only for
/// their requester-side operations.
struct NullSender;

#[async_trait]
impl EmailSender for NullSender {
    async fn send_code(
        &self,
        _email: &str,
        _code: &str,
        _ca_prefix: &Name,
        _cert_name: &Name,
    ) -> Result<(), EmailSendError> {
        Ok(())
    }
}

fn client_registry() -> Arc<ChallengeRegistry> {
    Arc::new(
        ChallengeRegistry::builder()
            .register(Arc::new(EmailChallenge::new(Vec::new(), Arc::new(NullSender))))
            .register(Arc::new(PossessionChallenge::new(Vec::new())))
            .build(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let ca_prefix =
        Name::parse(&cli.ca_prefix).map_err(|_| anyhow::anyhow!("invalid --ca-prefix"))?;

    let mut transport = Transport::connect(&cli.socket)
        .await
        .with_context(|| format!("connecting to {}", cli.socket.display()))?;

    let profile_data = transport.express(&ca_profile_interest(&ca_prefix)).await?;
    let profile = on_ca_profile_response(&profile_data)?;

    match cli.command {
        Commands::Info => {
            println!("ca-prefix:        {}", profile.ca_prefix);
            println!("ca-info:          {}", profile.ca_info);
            println!(
                "max-validity:     {}s",
                profile.max_validity_period.num_seconds()
            );
            if let Some(max_suffix) = profile.max_suffix_length {
                println!("max-suffix:       {max_suffix}");
            }
            println!("challenges:       {}", profile.supported_challenges.join(", "));
            println!("certificate:      {}", profile.certificate.name());
            Ok(())
        }

        Commands::Probe { params } => {
            let mut parameters = Vec::new();
            for entry in params {
                let (key, value) = entry
                    .split_once('=')
                    .context("probe parameters are key=value")?;
                parameters.push((key.to_owned(), value.to_owned()));
            }
            let reply = transport.express(&probe_interest(&profile, &parameters)).await?;
            for name in on_probe_response(&profile, &reply)? {
                println!("{name}");
            }
            Ok(())
        }

        Commands::New {
            identity,
            validity_days,
            challenge,
            email,
            credential,
            credential_key,
            out,
        } => {
            issue_flow(
                &mut transport,
                profile,
                RequestType::New,
                &identity,
                validity_days,
                &challenge,
                email,
                credential,
                credential_key,
                out,
            )
            .await
        }

        Commands::Renew {
            identity,
            validity_days,
            challenge,
            email,
            credential,
            credential_key,
            out,
        } => {
            issue_flow(
                &mut transport,
                profile,
                RequestType::Renew,
                &identity,
                validity_days,
                &challenge,
                email,
                credential,
                credential_key,
                out,
            )
            .await
        }

        Commands::Revoke {
            certificate,
            key,
            challenge,
            email,
            credential,
            credential_key,
        } => {
            let text = std::fs::read_to_string(&certificate)
                .with_context(|| format!("reading {}", certificate.display()))?;
            let cert = Certificate::from_pem(&text)
                .map_err(|error| anyhow::anyhow!("loading certificate: {error}"))?;
            let key_raw =
                std::fs::read(&key).with_context(|| format!("reading {}", key.display()))?;
            let cert_key = KeyPair::from_bytes(&key_raw)
                .map_err(|error| anyhow::anyhow!("loading certificate key: {error}"))?;

            let mut request = Request::new(
                profile,
                client_registry(),
                RequestType::Revoke,
                cert_key,
            );
            let interest = request.revoke_interest(&cert)?;
            let reply = transport.express(&interest).await?;
            request.on_session_response(&reply)?;

            run_challenge(
                &mut transport,
                &mut request,
                &challenge,
                email,
                credential,
                credential_key,
            )
            .await?;
            println!("revoked: {}", cert.name());
            Ok(())
        }
    }
}

/// Handshake, challenge walk and certificate fetch for NEW and RENEW.
#[allow(clippy::too_many_arguments)]
async fn issue_flow(
    transport: &mut Transport,
    profile: namecert_core::proto::CaProfile,
    request_type: RequestType,
    identity: &str,
    validity_days: i64,
    challenge: &str,
    email: Option<String>,
    credential: Option<PathBuf>,
    credential_key: Option<PathBuf>,
    out: Option<PathBuf>,
) -> Result<()> {
    let identity = Name::parse(identity).map_err(|_| anyhow::anyhow!("invalid --identity"))?;
    let mut request = Request::new(profile, client_registry(), request_type, KeyPair::generate());

    let now = Utc::now();
    let interest = request.new_interest(&identity, now, now + Duration::days(validity_days))?;
    let reply = transport.express(&interest).await?;
    let offered = request.on_session_response(&reply)?;
    tracing::info!(?offered, "session established");

    run_challenge(transport, &mut request, challenge, email, credential, credential_key).await?;

    let issued_reply = transport.express(&request.cert_fetch_interest()?).await?;
    let issued = on_cert_fetch_response(&issued_reply)?;
    println!("issued: {}", issued.name());
    if let Some(out) = out {
        std::fs::write(&out, issued.to_pem())
            .with_context(|| format!("writing {}", out.display()))?;
    }
    Ok(())
}

/// Walk challenge rounds until the request is terminal.
async fn run_challenge(
    transport: &mut Transport,
    request: &mut Request,
    challenge: &str,
    email: Option<String>,
    credential_path: Option<PathBuf>,
    credential_key_path: Option<PathBuf>,
) -> Result<()> {
    let credential = credential_path
        .map(|path| -> Result<Certificate> {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            Certificate::from_pem(&text)
                .map_err(|error| anyhow::anyhow!("loading credential: {error}"))
        })
        .transpose()?;
    let credential_key = credential_key_path
        .map(|path| -> Result<KeyPair> {
            let raw =
                std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            KeyPair::from_bytes(&raw)
                .map_err(|error| anyhow::anyhow!("loading credential key: {error}"))
        })
        .transpose()?;

    while !request.status.is_terminal() {
        let mut parameters: Vec<(String, Vec<u8>)> = request
            .select_or_continue_challenge(challenge)?
            .into_iter()
            .map(|(name, prompt)| {
                tracing::debug!(%name, %prompt, "challenge parameter requested");
                (name, Vec::new())
            })
            .collect();

        // The PIN comes from the user, everything else from context.
        let pin = if parameters.iter().any(|(name, _)| name == "code") {
            Some(prompt_line("PIN code: ").await?)
        } else {
            None
        };
        let context = ClientContext {
            email: email.clone(),
            pin,
            credential: credential.as_ref(),
            credential_key: credential_key.as_ref(),
            nonce: request.nonce,
            ..ClientContext::default()
        };
        request.fulfill_parameters(&mut parameters, &context)?;

        let interest = request.challenge_interest(&parameters)?;
        let reply = transport.express(&interest).await?;
        request.on_challenge_response(&reply)?;
        tracing::info!(
            status = %request.status,
            challenge_status = request.challenge_status.as_deref().unwrap_or("-"),
            remaining_tries = request.remaining_tries,
            remaining_time = request.remaining_time_secs,
            "challenge round complete"
        );
    }

    if request.status != Status::Success {
        bail!("request ended in {}", request.status);
    }
    Ok(())
}

async fn prompt_line(prompt: &str) -> Result<String> {
    use std::io::Write;
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(line.trim().to_owned())
}
