//! nebterm-server: persistent web terminal server.
//!
//! Accepts WebSocket connections on `/ws/terminal`, authenticates them with
//! a signed access token, and bridges each one to a long-lived PTY shell
//! keyed by user and terminal instance. Shells survive disconnects; the
//! newest connection for a key always takes over.

mod auth;
mod bridge;
mod config;
mod handshake;
mod server;
mod session;
mod transport;

use auth::TokenValidator;
use clap::{Parser, Subcommand};
use config::{ConfigOverrides, ServerConfig};
use server::TermServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// nebterm-server: persistent web terminal server
#[derive(Parser, Debug)]
#[command(name = "nebterm-server", version, about = "Persistent web terminal server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Directory new shells start in
    #[arg(long)]
    working_dir: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.nebterm/config.toml")]
    config: String,

    /// Generate self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// Token-signing secret
    #[arg(long, env = "NEBTERM_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a signed access token (development helper)
    Token {
        /// User id the token is issued for
        #[arg(long)]
        user_id: String,

        /// Display name carried in the token
        #[arg(long)]
        username: String,

        /// Lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl: u64,

        /// Issue a partial (second factor pending) token
        #[arg(long)]
        partial: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Resolve cert/key paths
    let (cert_path, key_path) = if cli.generate_cert {
        match generate_self_signed_cert() {
            Ok((c, k)) => {
                info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
                (Some(c), Some(k))
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    } else {
        (
            cli.cert.as_ref().map(PathBuf::from),
            cli.key.as_ref().map(PathBuf::from),
        )
    };

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let overrides = ConfigOverrides {
        port: cli.port,
        bind: cli.bind.clone(),
        working_dir: cli.working_dir.clone(),
        cert: cert_path.map(|p| p.to_string_lossy().into_owned()),
        key: key_path.map(|p| p.to_string_lossy().into_owned()),
        secret: cli.secret.clone(),
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let secret = match &server_config.secret {
        Some(secret) => secret.clone(),
        None => {
            if cli.command.is_none() {
                warn!("no token secret configured, generated a random one; tokens will not survive a restart");
            }
            nebterm_core::generate_secret()
        }
    };

    if let Some(Command::Token {
        user_id,
        username,
        ttl,
        partial,
    }) = &cli.command
    {
        if server_config.secret.is_none() {
            error!("token issuing needs a configured secret (--secret, NEBTERM_SECRET or [auth] secret)");
            std::process::exit(1);
        }
        match nebterm_core::create_token(&secret, user_id, username, *partial, *ttl) {
            Ok(token) => println!("{token}"),
            Err(e) => {
                error!(error = %e, "failed to create token");
                std::process::exit(1);
            }
        }
        return;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %server_config.listen_addr(),
        tls = server_config.tls_enabled(),
        "starting nebterm-server"
    );

    // Load TLS config
    let tls_config = match (&server_config.cert_path, &server_config.key_path) {
        (Some(cert), Some(key)) => match load_tls_config(cert, key) {
            Ok(cfg) => Some(Arc::new(cfg)),
            Err(e) => {
                error!(error = %e, "failed to load TLS config");
                std::process::exit(1);
            }
        },
        _ => None,
    };

    // Create server
    let validator = Arc::new(TokenValidator::new(secret));
    let term_server = Arc::new(TermServer::new(server_config, validator));

    // Run until shutdown signal
    tokio::select! {
        result = term_server.clone().run(tls_config) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                term_server.shutdown().await;
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    term_server.shutdown().await;
    info!("nebterm-server stopped");
}

/// Load TLS certificate and key from PEM files, returning a rustls ServerConfig.
fn load_tls_config(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> Result<rustls::ServerConfig, Box<dyn std::error::Error>> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| format!("cannot read cert {}: {e}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| format!("cannot read key {}: {e}", key_path.display()))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])?.ok_or("no private key found in PEM")?;

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    // WebSocket upgrade rides on HTTP/1.1
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(tls_config)
}

/// Generate a self-signed certificate for development use.
fn generate_self_signed_cert() -> Result<(PathBuf, PathBuf), Box<dyn std::error::Error>> {
    let nebterm_dir = dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".nebterm");
    std::fs::create_dir_all(&nebterm_dir)?;

    let cert_path = nebterm_dir.join("cert.pem");
    let key_path = nebterm_dir.join("key.pem");

    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "nebterm-server dev cert");

    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
