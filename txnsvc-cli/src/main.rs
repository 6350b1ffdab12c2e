//! txnsvc-cli - Command-line client for txnsvc
//!
//! Runs one call per invocation. Without a subcommand it creates a record
//! with a balance of 500 and prints its id.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use txnsvc_client::{Client, ConnectionConfig};

#[derive(Parser)]
#[command(name = "txnsvc-cli")]
#[command(about = "Command-line client for the txnsvc transaction service")]
#[command(version)]
struct Cli {
    /// Server address (`host:port`, or `:port` for localhost)
    #[arg(short, long, env = "TXNSVC_ADDR", default_value = "127.0.0.1:50051", value_parser = parse_addr)]
    addr: SocketAddr,

    /// Deadline for each call, in seconds
    #[arg(short, long, default_value_t = 5)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a record with a balance of 500 and print its id
    Demo,

    /// Ping the server
    Ping,

    /// Create a record
    Create {
        /// Initial balance
        #[arg(short, long, allow_negative_numbers = true)]
        balance: i32,
    },

    /// Get a record
    Get {
        /// Transaction ID
        id: String,
    },

    /// Overwrite the balance of a record
    Update {
        /// Transaction ID
        id: String,

        /// New balance
        #[arg(short, long, allow_negative_numbers = true)]
        balance: i32,
    },

    /// Delete a record
    Delete {
        /// Transaction ID
        id: String,
    },
}

/// Parses a server address. A bare `:port` means localhost.
fn parse_addr(raw: &str) -> Result<SocketAddr, String> {
    let raw = raw.trim();
    if let Some(port) = raw.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port in address '{}'", raw))?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }
    if let Ok(addr) = raw.parse() {
        return Ok(addr);
    }
    raw.to_socket_addrs()
        .map_err(|e| format!("cannot resolve '{}': {}", raw, e))?
        .next()
        .ok_or_else(|| format!("no addresses found for '{}'", raw))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = ConnectionConfig::new(cli.addr)
        .with_client_name("txnsvc-cli")
        .with_connect_timeout(Duration::from_secs(cli.timeout_secs))
        .with_request_timeout(Duration::from_secs(cli.timeout_secs));
    let client = Client::new(config);

    client.connect().await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    let cmd = cli.command.unwrap_or(Commands::Demo);
    let result = commands::execute(&client, cmd).await;

    if let Err(e) = client.close().await {
        tracing::debug!("Close failed: {}", e);
    }

    match result {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
