// Copyright (c) 2024 The Botho Foundation

//! BTH Custody Service
//!
//! Custodial deposit scanning, ledger and withdrawals for an ERC-20 token.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bth_custody_core::{
    request::{CreateUserRequest, ScanBlockRequest, WalletSummaryRequest, WithdrawalRequest},
    CustodyConfig,
};
use bth_custody_service::{
    CustodyEngine, CustodyService, Database, EthereumClient, KeyStore, Ledger,
};

#[derive(Parser)]
#[command(name = "bth-custody")]
#[command(about = "Custodial deposit and withdrawal service for the BTH token")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "custody.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the chain and reconcile withdrawals until interrupted
    Run,

    /// Create the database schema
    Migrate,

    /// Register a user and print its deposit address
    CreateUser {
        #[arg(long)]
        email: String,
    },

    /// Scan one confirmed block and credit its deposits
    ScanBlock {
        #[arg(long)]
        number: u64,
    },

    /// Withdraw tokens from a user's balance
    Withdraw {
        #[arg(long)]
        email: String,

        /// Destination address
        #[arg(long)]
        to: String,

        /// Amount in token units, e.g. 2.5
        #[arg(long)]
        amount: String,
    },

    /// Show a user's balance and history
    Summary {
        #[arg(long)]
        email: String,
    },

    /// Run one reconciliation pass over pending withdrawals
    Reconcile,

    /// Validate configuration file
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let config = match CustodyConfig::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            if matches!(cli.command, Commands::ValidateConfig) {
                eprintln!("Configuration validation failed: {}", e);
                std::process::exit(1);
            }
            anyhow::bail!("Failed to load config from {:?}: {}", cli.config, e);
        }
    };

    match cli.command {
        Commands::ValidateConfig => {
            println!("Configuration is valid.");
            println!("  RPC endpoint: {}", config.ethereum.rpc_url);
            println!(
                "  Token: {} ({} decimals)",
                config.ethereum.token_contract, config.ethereum.token_decimals
            );
            println!("  Confirmations: {}", config.ethereum.confirmations_required);
            println!("  Database: {}", config.ledger.db_path);
            Ok(())
        }
        Commands::Migrate => {
            open_database(&config)?;
            println!("Database ready at {}", config.ledger.db_path);
            Ok(())
        }
        command => {
            let service = build_service(config)?;
            execute(service, command).await
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn open_database(config: &CustodyConfig) -> Result<Database> {
    let db = Database::open(&config.ledger.db_path)
        .with_context(|| format!("Failed to open database {}", config.ledger.db_path))?;
    db.migrate()?;
    Ok(db)
}

fn build_service(config: CustodyConfig) -> Result<Arc<CustodyService>> {
    let db = open_database(&config)?;
    let keys = KeyStore::from_env(db.clone(), &config.custody)?;
    let chain = EthereumClient::new(&config.ethereum)?;
    info!("Connected to {}", config.ethereum.rpc_url);

    let service = CustodyService::new(config, Ledger::new(db), Arc::new(keys), Arc::new(chain))?;
    Ok(Arc::new(service))
}

async fn execute(service: Arc<CustodyService>, command: Commands) -> Result<()> {
    match command {
        Commands::Run => CustodyEngine::new(service).run().await?,
        Commands::CreateUser { email } => {
            let request = CreateUserRequest { email: Some(email) };
            print_json(&service.create_user(&request)?)?;
        }
        Commands::ScanBlock { number } => {
            let request = ScanBlockRequest {
                block_number: Some(number),
            };
            print_json(&service.scan_block(&request).await?)?;
        }
        Commands::Withdraw { email, to, amount } => {
            let request = WithdrawalRequest {
                user_email: Some(email),
                withdraw_address: Some(to),
                withdraw_amount: Some(amount),
            };
            print_json(&service.request_withdrawal(&request).await?)?;
        }
        Commands::Summary { email } => {
            let request = WalletSummaryRequest {
                user_email: Some(email),
            };
            print_json(&service.get_wallet_summary(&request)?)?;
        }
        Commands::Reconcile => print_json(&service.reconcile().await?)?,
        Commands::Migrate | Commands::ValidateConfig => {}
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
