use clap::{Parser, Subcommand};

use prover_gateway::config::validation::parse_address;
use prover_gateway::rpc::{Reply, RpcClient, Status};

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Client for the prover gateway", long_about = None)]
struct Cli {
    /// Gateway address: host:port, unix:/path or a socket path
    #[arg(short, long, default_value = "127.0.0.1:9999")]
    address: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show handler capacity, in-flight calls and artifact sizes
    Stats,
    /// Send one call with a UTF-8 body
    Call {
        method: String,
        #[arg(default_value = "")]
        body: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let (method, body) = match cli.command {
        Commands::Stats => ("stats".to_string(), Vec::new()),
        Commands::Call { method, body } => (method, body.into_bytes()),
    };

    let address = parse_address(&cli.address)?;
    let reply = RpcClient::connect_address(&address).await?.call(&method, body).await?;

    print_reply(reply)
}

fn print_reply(reply: Reply) -> Result<(), Box<dyn std::error::Error>> {
    if reply.status != Status::Ok {
        eprintln!("Error: gateway returned status {}", reply.status.as_str());
        eprintln!("{}", String::from_utf8_lossy(&reply.body));
        std::process::exit(1);
    }

    match serde_json::from_slice::<serde_json::Value>(&reply.body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", String::from_utf8_lossy(&reply.body)),
    }
    Ok(())
}
