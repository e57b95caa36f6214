//! prover-gateway
//!
//! Serves a proof-generation handler over a framed RPC protocol, admitting at
//! most `--max-conn` connections at a time.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────┐
//!                 │                   PROVER GATEWAY                     │
//!                 │                                                      │
//!   Client ───────┼─▶ BoundedListener ─▶ DispatchServer ─▶ dispatch actor │
//!                 │   (admission cap)     (accept loop)     (per conn)   │
//!                 │                                            │         │
//!                 │                                            ▼         │
//!                 │                                     RequestHandler   │
//!                 │                                   (ArtifactHandler)  │
//!                 │                                                      │
//!                 │  config ─ validation ─ lifecycle ─ observability     │
//!                 └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use prover_gateway::config::{load_config, LoadError, RawServerConfig};
use prover_gateway::lifecycle::shutdown_signal;
use prover_gateway::prover::ArtifactFactory;
use prover_gateway::ServiceLauncher;

#[derive(Parser)]
#[command(name = "prover-gateway", version)]
#[command(about = "Bounded-concurrency RPC front-end for proof generation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve proof requests on ADDRESS
    Serve(ServeArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Listen address: host:port, unix:/path or a socket path.
    /// Required unless --config supplies one
    #[arg(required_unless_present = "config")]
    address: Option<String>,

    /// Path to the compiled constraint system
    #[arg(long)]
    r1cs: Option<PathBuf>,

    /// Path to the proving key
    #[arg(long)]
    pk: Option<PathBuf>,

    /// Path to the verifying key
    #[arg(long)]
    vk: Option<PathBuf>,

    /// Maximum number of concurrent connections [default: 1]
    #[arg(long = "max-conn", allow_negative_numbers = true)]
    max_conn: Option<i64>,

    /// Log level, -1 (trace) to 5 (panic) [default: 1]
    #[arg(long = "log-level", allow_negative_numbers = true)]
    log_level: Option<i64>,

    /// TOML config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Disable coloured log output
    #[arg(long)]
    no_color: bool,
}

impl ServeArgs {
    fn into_raw_config(self) -> Result<RawServerConfig, LoadError> {
        let mut raw = match &self.config {
            Some(path) => load_config(path)?,
            None => RawServerConfig::default(),
        };

        if let Some(address) = self.address {
            raw.address = address;
        }
        if let Some(path) = self.r1cs {
            raw.artifacts.r1cs = path;
        }
        if let Some(path) = self.pk {
            raw.artifacts.proving_key = path;
        }
        if let Some(path) = self.vk {
            raw.artifacts.verifying_key = path;
        }
        if let Some(n) = self.max_conn {
            raw.max_connections = n;
        }
        if let Some(level) = self.log_level {
            raw.log_verbosity = level;
        }
        if self.no_color {
            raw.observability.plain_logs = true;
        }
        Ok(raw)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let raw = args.into_raw_config()?;
            ServiceLauncher::new()
                .launch(raw, &ArtifactFactory::new(), shutdown_signal())
                .await?;
        }
    }

    Ok(())
}
