use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use cryptotcp::cli::{parse_server_command, ServerCommand, SERVER_USAGE};
use cryptotcp::{Config, CryptoServer};
use tokio::io::{self, AsyncBufReadExt};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// CryptoTCP server with an operator console on stdin.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// TOML config file
    #[arg(long, env = "CRYPTOTCP_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
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

    let server = CryptoServer::bind(config).await?;
    info!("Starting CryptoTCP server on {}", server.local_addr()?);
    println!("\n{}\n", SERVER_USAGE);

    let runner = server.clone();
    let accept_loop = tokio::spawn(async move { runner.run().await });

    let mut lines = io::BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_server_command(&line) {
            Ok(Some(cmd)) => handle_command(&server, cmd).await,
            Ok(None) => {}
            Err(e) => error!("{}", e),
        }
    }

    // stdin closed; keep serving
    accept_loop.await??;
    Ok(())
}

async fn handle_command(server: &CryptoServer, cmd: ServerCommand) {
    match cmd {
        ServerCommand::Status => info!("Conn Num: {}", server.conn_count()),
        ServerCommand::ShowAllConn => {
            for conn in server.connections() {
                info!("{}", conn);
            }
        }
        ServerCommand::ShowConn(id) => match server.get(id) {
            Ok(conn) => info!("{}", conn),
            Err(e) => error!("{}", e),
        },
        ServerCommand::To { id, text } => {
            if let Err(e) = server.send_to(id, &text).await {
                error!("{}", e);
            }
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
