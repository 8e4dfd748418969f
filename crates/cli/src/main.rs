//! Pairlink CLI
//!
//! Shows and resets the client identity, manages the configuration file and
//! runs a full pairing against an in-process wallet.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use pairlink_client::config::{default_config_path, KeychainKind};
use pairlink_client::wallet_sim::WalletConfig;
use pairlink_client::{
    Config, ConnectionEvent, ConnectionManager, IdentityStore, KeychainBackend, KeychainManager,
    MemoryKeychain, MemoryRelayHub, SimulatedWallet, SystemKeychain,
};

/// Pairlink - pair a dApp with a remote wallet.
#[derive(Parser, Debug)]
#[command(name = "pairlink")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Show this client's id
    Id,

    /// Discard the identity and generate a new one
    ResetIdentity,

    /// Pair with an in-process wallet, sign a message and disconnect
    Demo {
        /// Message to sign
        #[arg(long, short, default_value = "Hello from Pairlink")]
        message: String,

        /// Have the wallet decline the signature
        #[arg(long)]
        reject: bool,
    },

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.log.level.clone()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    config.validate()?;

    match cli.command {
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::with_default_namespaces().save(&config_path)?;
            println!("Wrote {}", config_path.display());
        }
        command => match config.storage.backend {
            KeychainKind::System => {
                let keychain =
                    KeychainManager::with_service(SystemKeychain, &config.storage.keychain_service);
                run(command, keychain, &config).await?;
            }
            KeychainKind::Memory => {
                let keychain = KeychainManager::with_service(
                    Arc::new(MemoryKeychain::new()),
                    &config.storage.keychain_service,
                );
                run(command, keychain, &config).await?;
            }
        },
    }

    Ok(())
}

async fn run<B: KeychainBackend + 'static>(
    command: Commands,
    keychain: KeychainManager<B>,
    config: &Config,
) -> anyhow::Result<()> {
    match command {
        Commands::Id => {
            let identity = IdentityStore::new(keychain);
            let client_id = identity.client_id()?;
            println!("{}", client_id);
            println!("Fingerprint: {}", client_id.fingerprint());
            if let Some(record) = identity.last_session(pairlink_client::current_timestamp())? {
                println!("Last session: {} (expires {})", record.topic, record.expiry);
            }
        }
        Commands::ResetIdentity => {
            let identity = IdentityStore::new(keychain);
            identity.reset()?;
            tracing::info!("Identity reset");
            println!("New client id: {}", identity.client_id()?);
        }
        Commands::Demo { message, reject } => run_demo(keychain, config, &message, reject).await?,
        Commands::Config(_) => {}
    }
    Ok(())
}

async fn run_demo<B: KeychainBackend + 'static>(
    keychain: KeychainManager<B>,
    config: &Config,
    message: &str,
    reject: bool,
) -> anyhow::Result<()> {
    let hub = MemoryRelayHub::new();
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(hub.connect()),
        keychain,
        config.client_options(),
    )?);
    let mut events = manager.subscribe();

    let wallet_config = if reject {
        WalletConfig {
            requests: pairlink_client::wallet_sim::RequestBehavior::Reject {
                code: pairlink_client::protocol::messages::codes::USER_REJECTED,
                message: "User rejected the request.".into(),
            },
            ..Default::default()
        }
    } else {
        WalletConfig::default()
    };
    let wallet = SimulatedWallet::new(&hub, wallet_config);

    let client_id = manager.client_id()?;
    tracing::info!(client_id = %client_id.fingerprint(), "Starting demo pairing");
    println!("Client id: {}", client_id);
    let connecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect().await })
    };

    let uri = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            if let ConnectionEvent::PairingUri(uri) = event {
                return Some(uri);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
    .ok_or_else(|| anyhow::anyhow!("no pairing uri was published"))?;
    println!("Pairing URI: {}", uri);
    tracing::debug!("Handing pairing URI to the wallet");
    wallet.pair(&uri).await?;

    let session = connecting.await??;
    tracing::info!(topic = %session.topic.short(), peer = %session.peer.metadata.name, "Connected");
    println!("Connected to {} on {}", session.peer.metadata.name, session.topic.short());
    for account in session.accounts() {
        println!("  account {}", account);
    }

    let chain = session
        .default_chain()
        .ok_or_else(|| anyhow::anyhow!("wallet granted no accounts"))?;
    tracing::info!(chain = %chain, "Requesting signature");
    match manager.personal_sign(&chain, message).await {
        Ok(signature) => println!("Signature: {}", signature),
        Err(e) => {
            tracing::warn!(error = %e, "Signing failed");
            println!("Signing failed: {}", e);
        }
    }

    manager.disconnect().await;
    tracing::info!("Demo finished");
    println!("State: {}", manager.state());
    Ok(())
}
