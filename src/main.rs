#![deny(clippy::all)]
#![warn(clippy::pedantic)]

//! `mcp-proxy` binary: CLI parsing, tracing setup and dispatch.

use clap::{CommandFactory, Parser, Subcommand};
use tracing::error;

use mcp_proxy::bridge;
use mcp_proxy::config::{CliOverrides, Config};
use mcp_proxy::server;
use mcp_proxy::{Isolation, ProxyError};

/// Relay between stdio child processes and SSE/HTTP peers.
#[derive(Parser)]
#[command(
    name = "mcp-proxy",
    version,
    after_help = "Examples:\n  \
        mcp-proxy stdio-to-sse http://localhost:8080/sse\n  \
        mcp-proxy sse-to-stdio --port 8080 -- node server.js --stdio"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Bridge this process's stdin/stdout to a remote SSE server.
    StdioToSse {
        /// SSE endpoint of the remote server, e.g. `http://host:8080/sse`.
        server_url: String,
    },
    /// Serve a stdio child process to remote peers over SSE + HTTP POST.
    SseToStdio {
        /// Preferred port; an ephemeral one is used if it is taken.
        #[arg(short, long)]
        port: Option<u16>,
        /// Interface to bind.
        #[arg(long)]
        host: Option<String>,
        /// `per-session` (default) or `shared`.
        #[arg(long)]
        isolation: Option<Isolation>,
        /// Child command line, e.g. `node server.js`.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        if let Err(e) = Cli::command().print_help() {
            eprintln!("Failed to print help: {e}");
            std::process::exit(1);
        }
        return;
    };

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            init_tracing("info");
            error!("Configuration error: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(&config.logging.level);

    let result = match command {
        Commands::StdioToSse { server_url } => {
            let result = run_bridge(&server_url, &config).await;
            if result.is_ok() {
                // The stdin reader sits on a blocking thread the runtime
                // would wait for on return.
                std::process::exit(0);
            }
            result
        }
        Commands::SseToStdio {
            port,
            host,
            isolation,
            command,
        } => {
            config.apply_cli(CliOverrides {
                host,
                port,
                isolation,
                command,
            });
            server::run(config).await
        }
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run_bridge(url: &str, config: &Config) -> Result<(), ProxyError> {
    let shutdown = server::shutdown_signal()?;
    let server = &config.server;
    bridge::run_bridge(
        url,
        &config.bridge,
        server.channel_capacity.max(1),
        server.max_body_bytes.max(1),
        shutdown,
    )
    .await?;
    Ok(())
}

/// Logs always go to stderr: in bridge mode stdout carries protocol traffic.
fn init_tracing(level: &str) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
