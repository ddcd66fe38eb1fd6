//! Bastio agent command-line interface.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use bastio_agent::commands;
use bastio_agent::config::CliOverrides;
use bastio_agent::keys::DEFAULT_KEY_BITS;
use bastio_agent::logging;

#[derive(Parser)]
#[command(
    name = "bastio-agent",
    version,
    about = "Bastio agent responsible for provisioning system accounts",
    after_help = "Report bugs to support@bastio.com"
)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the agent private key
    #[arg(short = 'k', long = "agent-key", global = true, value_name = "FILE")]
    agent_key: Option<PathBuf>,

    /// Log human-readable debug output to stderr instead of JSON
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a new RSA private key for the agent
    GenerateKey {
        /// Number of bits to generate for the private key
        #[arg(long, default_value_t = DEFAULT_KEY_BITS)]
        bits: usize,
    },
    /// Upload this agent's public key to the backend
    UploadKey {
        /// Bastio API key
        #[arg(long = "api-key", value_name = "KEY")]
        api_key: Option<String>,
        /// Path to a new agent key replacing the one given by --agent-key
        #[arg(short = 'n', long = "new-agent-key", value_name = "FILE")]
        new_agent_key: Option<PathBuf>,
    },
    /// Start the agent in the foreground
    Start {
        /// Host name of the Bastio backend
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port of the backend to connect to
        #[arg(short = 'p', long)]
        port: Option<u16>,

        /// Minimum number of workers the pool keeps available
        #[arg(short = 'm', long = "min-workers")]
        min_workers: Option<usize>,

        /// Bastio API key
        #[arg(long = "api-key", value_name = "KEY")]
        api_key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.debug);

    let result = match cli.command {
        Command::GenerateKey { bits } => {
            commands::handle_generate_key(cli.config.as_deref(), cli.agent_key, bits).await
        }
        Command::UploadKey {
            api_key,
            new_agent_key,
        } => {
            commands::handle_upload_key(cli.config.as_deref(), cli.agent_key, api_key, new_agent_key)
                .await
        }
        Command::Start {
            host,
            port,
            min_workers,
            api_key,
        } => {
            let overrides = CliOverrides {
                host,
                port,
                min_workers,
                api_key,
                agent_key: cli.agent_key,
            };
            commands::handle_start(cli.config.as_deref(), overrides).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}
