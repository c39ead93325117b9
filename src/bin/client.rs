use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use cryptotcp::cli::{parse_client_command, ClientCommand, CLIENT_USAGE};
use cryptotcp::{Config, CryptoClient};
use tokio::io::{self, AsyncBufReadExt};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Interactive CryptoTCP client.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// TOML config file
    #[arg(long, env = "CRYPTOTCP_CONFIG")]
    config: Option<PathBuf>,

    /// Server address, overrides the config file
    #[arg(long, env = "CRYPTOTCP_ADDR")]
    addr: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let mut config = match &args.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::default(),
    };
    if let Some(addr) = args.addr {
        config.addr = addr;
    }

    let client = CryptoClient::connect(Arc::new(config)).await?;
    info!("Your ID is: {}", client.id());
    println!("\n{}\n", CLIENT_USAGE);

    // Print incoming messages
    let receiver = client.clone();
    let incoming = tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(Some(msg)) => info!("{} say: {}", msg.from, msg.body_str()),
                Ok(None) => break,
                Err(e) => {
                    error!("{}", e);
                    break;
                }
            }
        }
        info!("Stop handling connection");
    });

    let mut lines = io::BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_client_command(&line) {
            Ok(Some(ClientCommand::Status)) => info!("{}", client.status()),
            Ok(Some(ClientCommand::Close)) => break,
            Ok(Some(ClientCommand::To { id, text })) => {
                if let Err(e) = client.send(id, text).await {
                    error!("{}", e);
                }
            }
            Ok(None) => {}
            Err(e) => error!("{}", e),
        }
    }

    client.close().await;
    incoming.await?;
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
