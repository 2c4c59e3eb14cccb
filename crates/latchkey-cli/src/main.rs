//! latchkey - coordination primitives from the command line

mod simulate;

use std::path::PathBuf;

use anyhow::Result;
use clap::builder::{PossibleValuesParser, TypedValueParser};
use clap::{Parser, Subcommand};
use latchkey_common::TokenCipher;
use latchkey_core::Settings;
use latchkey_core::logging::{LoggingConfig, init_logging};

#[derive(Parser)]
#[command(
    name = "latchkey",
    version,
    about = "Distributed locks, rate limits and anti-replay tokens"
)]
struct Cli {
    /// Settings file (defaults to conf/latchkey.* when present)
    #[arg(short, long, global = true, env = "LATCHKEY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a random base64 key for token.secret
    GenKey {
        /// AES key size
        #[arg(
            long,
            default_value = "256",
            value_parser = PossibleValuesParser::new(["128", "192", "256"])
                .map(|bits| bits.parse::<usize>().unwrap_or(256))
        )]
        bits: usize,
    },
    /// Run a coordination scenario against an in-process store
    Simulate(simulate::SimulateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::GenKey { bits } = cli.command {
        println!("{}", TokenCipher::generate_base64_key(bits)?);
        return Ok(());
    }

    let settings = Settings::load(cli.config.as_deref())?;
    let _logging_guard = init_logging(&LoggingConfig::from_settings(&settings.log))
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    match cli.command {
        Commands::Simulate(args) => simulate::run(args, &settings).await,
        Commands::GenKey { .. } => Ok(()),
    }
}
