//! Palisade node binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use palisade_chain::GenesisConfig;
use palisade_core::NodeConfig;
use palisade_crypto::derivation::{devnet_keypair, devnet_keypairs};
use palisade_crypto::keys::KeyPair;
use palisade_node::NodeBuilder;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "palisade-node")]
#[command(about = "Palisade Node - DPoS chain with two-stage BFT consensus")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node
    Run {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Genesis file path
        #[arg(short, long)]
        genesis: Option<PathBuf>,

        /// Run as validator
        #[arg(long)]
        validator: bool,

        /// P2P listen address
        #[arg(long)]
        p2p_addr: Option<String>,

        /// Data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Use devnet validator key number N instead of the stored node key
        #[arg(long)]
        devnet_index: Option<u32>,

        /// Phrase the devnet keys are derived from
        #[arg(long, default_value = "palisade devnet")]
        devnet_phrase: String,
    },

    /// Generate a new keypair
    Keygen {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate genesis configuration
    Genesis {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Chain name
        #[arg(long, default_value = "Palisade Devnet")]
        chain_name: String,

        /// Chain ID
        #[arg(long, default_value = "3")]
        chain_id: u64,

        /// Number of devnet validators to derive from the phrase
        #[arg(long, default_value = "0")]
        devnet_validators: u32,

        /// Phrase the devnet keys are derived from
        #[arg(long, default_value = "palisade devnet")]
        devnet_phrase: String,

        /// Deposit per devnet validator, in PAL
        #[arg(long, default_value = "20000")]
        deposit: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            genesis,
            validator,
            p2p_addr,
            data_dir,
            devnet_index,
            devnet_phrase,
        } => {
            let mut node_config = match config {
                Some(path) => NodeConfig::load(&path)?,
                None => NodeConfig::default(),
            };
            init_logging(&node_config.log_level);
            info!("Starting Palisade node...");

            if let Some(dir) = data_dir {
                node_config.data_dir = dir;
            }
            let genesis_config = match genesis {
                Some(path) => GenesisConfig::load(&path)?,
                None => GenesisConfig::devnet(node_config.chain_id),
            };
            let keypair = match devnet_index {
                Some(index) => devnet_keypair(&devnet_phrase, index)?,
                None => load_or_create_keypair(&node_config.data_dir)?,
            };

            let mut builder = NodeBuilder::new()
                .config(node_config)
                .keypair(keypair)
                .genesis(genesis_config);
            if validator {
                builder = builder.validator();
            }
            if let Some(addr) = p2p_addr {
                builder = builder.p2p_addr(&addr);
            }

            builder.build().start().await?;
        }

        Commands::Keygen { output } => {
            let keypair = KeyPair::generate();
            let json = serde_json::to_string_pretty(&key_info(&keypair))?;

            match output {
                Some(path) => {
                    std::fs::write(&path, &json)?;
                    println!("Keypair saved to: {}", path.display());
                }
                None => println!("{}", json),
            }
        }

        Commands::Genesis {
            output,
            chain_name,
            chain_id,
            devnet_validators,
            devnet_phrase,
            deposit,
        } => {
            let mut genesis = GenesisConfig {
                chain_name,
                ..GenesisConfig::devnet(chain_id)
            };
            for keypair in devnet_keypairs(&devnet_phrase, devnet_validators)? {
                genesis = genesis.add_validator(&keypair, deposit);
            }

            std::fs::write(&output, genesis.to_json()?)?;
            println!(
                "Genesis configuration with {} validators saved to: {}",
                genesis.validators.len(),
                output.display()
            );
        }
    }

    Ok(())
}

/// `RUST_LOG` wins over the configured level
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn key_info(keypair: &KeyPair) -> serde_json::Value {
    serde_json::json!({
        "public_key": keypair.public_key().to_hex(),
        "address": keypair.address().to_hex(),
        "secret_key": keypair.secret().to_hex(),
    })
}

fn load_or_create_keypair(data_dir: &Path) -> anyhow::Result<KeyPair> {
    let key_path = data_dir.join("node_key.json");

    if key_path.exists() {
        let content = std::fs::read_to_string(&key_path)?;
        let value: serde_json::Value = serde_json::from_str(&content)?;
        let secret_hex = value
            .get("secret_key")
            .and_then(|v| v.as_str())
            .with_context(|| format!("{} has no secret_key", key_path.display()))?;
        let keypair = KeyPair::from_secret_hex(secret_hex)?;
        info!("Loaded keypair from {}", key_path.display());
        return Ok(keypair);
    }

    std::fs::create_dir_all(data_dir)?;
    let keypair = KeyPair::generate();
    std::fs::write(&key_path, serde_json::to_string_pretty(&key_info(&keypair))?)?;
    info!("Generated new keypair, saved to {}", key_path.display());

    Ok(keypair)
}
