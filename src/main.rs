//! utxo-wallet CLI
//!
//! Offline tooling around the wallet engine: decode transactions, classify
//! scripts, convert addresses, build multisig scripts and inspect scan state.

use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use std::path::PathBuf;
use utxo_wallet::cli;
use utxo_wallet::config::ChainConfig;
use utxo_wallet::multisig::MultisigKind;

#[derive(Parser)]
#[command(name = "utxo-wallet")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Transaction and scan tooling for Bitcoin-like chains", long_about = None)]
struct Cli {
    /// Chain configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network preset used when no config file is given
    #[arg(short, long, default_value = "bitcoin")]
    network: String,

    /// Ticker used when no config file is given
    #[arg(short, long, default_value = "BTC")]
    symbol: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a raw transaction
    Decode {
        /// Transaction hex
        tx_hex: String,
    },

    /// Classify a lock script
    Classify {
        /// Script hex
        script_hex: String,
    },

    /// Address conversions
    Address {
        #[command(subcommand)]
        action: AddressCommands,
    },

    /// Build an M-of-N multisig redeem script and address
    Multisig {
        /// Required signatures
        #[arg(short, long)]
        threshold: u8,

        /// Public keys in hex (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        pubkeys: Vec<String>,

        /// Output type
        #[arg(short, long, value_enum, default_value = "p2sh")]
        kind: KindArg,

        /// Sort keys lexicographically before building
        #[arg(long)]
        sort: bool,
    },

    /// Estimate the fee for a transaction shape
    Fee {
        #[arg(short, long)]
        inputs: usize,

        #[arg(short, long, default_value = "2")]
        outputs: usize,

        /// Fee rate in coins per byte
        #[arg(short, long)]
        rate: Decimal,
    },

    /// Show the scan cursor and retry queue
    Cursor {
        /// Scan store file; defaults to the configured data directory
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum AddressCommands {
    /// Show what an address pays to
    Decode { address: String },

    /// Encode a hash as an address
    Encode {
        /// Hash hex (20 bytes, or 32 for p2wsh)
        hash_hex: String,

        /// p2pkh, p2sh, p2wpkh or p2wsh
        #[arg(short, long, default_value = "p2pkh")]
        kind: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    P2sh,
    P2wsh,
}

impl From<KindArg> for MultisigKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::P2sh => MultisigKind::P2sh,
            KindArg::P2wsh => MultisigKind::P2wsh,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ChainConfig::load(path)?,
        None => ChainConfig::for_network(&cli.symbol, &cli.network)?,
    };
    log::debug!("Using {} with {:?}", config.symbol, config.address);

    match cli.command {
        Commands::Decode { tx_hex } => cli::cmd_decode(&config, &tx_hex)?,
        Commands::Classify { script_hex } => cli::cmd_classify(&config, &script_hex)?,
        Commands::Address { action } => match action {
            AddressCommands::Decode { address } => cli::cmd_address_decode(&config, &address)?,
            AddressCommands::Encode { hash_hex, kind } => cli::cmd_address_encode(&config, &hash_hex, &kind)?,
        },
        Commands::Multisig {
            threshold,
            pubkeys,
            kind,
            sort,
        } => cli::cmd_multisig(&config, threshold, &pubkeys, kind.into(), sort)?,
        Commands::Fee { inputs, outputs, rate } => cli::cmd_fee(&config, inputs, outputs, rate)?,
        Commands::Cursor { store } => cli::cmd_cursor(&config, store.as_deref())?,
    }

    Ok(())
}
