use anyhow::Result;
use clap::{Parser, Subcommand};
use credential_broker::auth::{
    system_clock, LocalCredentialManager, OidcProvider, StderrPrompt,
};
use credential_broker::web::BrokerServer;
use credential_broker::{BrokerError, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides configuration
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in with the device-code flow and cache the credential
    Login,
    /// Delete the cached credential
    Logout,
    /// Show the cached credential's state
    Status,
    /// Run the HTTP server
    Serve {
        /// Server host
        #[arg(long)]
        host: Option<String>,
        /// Server port
        #[arg(long)]
        port: Option<u16>,
        /// Transport mode (local, remote, auto)
        #[arg(long)]
        transport: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Command::Serve {
        ref host,
        ref port,
        ref transport,
    } = cli.command
    {
        if let Some(host) = host {
            config.server.host = host.clone();
        }
        if let Some(port) = port {
            config.server.port = *port;
        }
        if let Some(transport) = transport {
            config.transport = Some(transport.clone());
        }
    }

    init_logging(&config.logging.level, &config.logging.format)?;

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    let outcome = match cli.command {
        Command::Login => login(&config).await,
        Command::Logout => logout(&config).await,
        Command::Status => status(&config).await,
        Command::Serve { .. } => serve(config).await,
    };

    if let Err(ref e) = outcome {
        error!(kind = e.kind(), "{}", e);
        if let Some(hint) = e.remediation() {
            eprintln!("{}", hint);
        }
    }
    outcome.map_err(Into::into)
}

fn local_manager(config: &Config) -> Result<LocalCredentialManager, BrokerError> {
    let provider = Arc::new(OidcProvider::new(config.identity.clone())?);
    LocalCredentialManager::from_config(&config.local, provider, system_clock())
}

async fn login(config: &Config) -> Result<(), BrokerError> {
    let manager = local_manager(config)?;
    let token = manager.acquire(&StderrPrompt).await?;
    println!(
        "Signed in. Credential cached at {} (expires {}).",
        manager.store().path().display(),
        token.expires_at.to_rfc3339()
    );
    Ok(())
}

async fn logout(config: &Config) -> Result<(), BrokerError> {
    let manager = local_manager(config)?;
    if manager.logout().await? {
        println!("Cached credential removed.");
    } else {
        println!("No cached credential to remove.");
    }
    Ok(())
}

async fn status(config: &Config) -> Result<(), BrokerError> {
    let manager = local_manager(config)?;
    match manager.cached().await? {
        Some(token) => {
            let now = chrono::Utc::now();
            let state = if token.is_expired(now) { "expired" } else { "valid" };
            println!("Credential: {} ({})", token.fingerprint(), state);
            println!("Expires:    {}", token.expires_at.to_rfc3339());
            println!(
                "Refresh:    {}",
                if token.refresh_token.is_some() { "available" } else { "none" }
            );
            if let Some(ref scope) = token.scope {
                println!("Scope:      {}", scope);
            }
        }
        None => println!("Not signed in. Run '{} login'.", env!("CARGO_PKG_NAME")),
    }
    Ok(())
}

async fn serve(config: Config) -> Result<(), BrokerError> {
    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), credential_broker::VERSION);
    let provider = Arc::new(OidcProvider::new(config.identity.clone())?);
    let server = BrokerServer::build(config, provider.clone(), provider, system_clock())?;
    server.run().await
}

fn init_logging(level: &str, format: &str) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stderr keeps stdout free for command output
    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }
    Ok(())
}
