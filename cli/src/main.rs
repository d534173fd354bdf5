// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Ember Orchestrator CLI
//!
//! The `ember` binary runs the lifecycle orchestrator daemon and talks to it.
//!
//! ## Architecture
//!
//! - **Daemon mode**: `ember --daemon` serves the lifecycle API in the foreground
//! - **Client mode**: every other command calls the daemon's HTTP API
//! - **Detection**: Check PID file + HTTP health check
//!
//! ## Commands
//!
//! - `ember daemon start|stop|status` - Manage daemon lifecycle
//! - `ember instance create|status|cancel|complete|watch|escalations` - Instance operations
//! - `ember config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use ember_core::domain::config::OrchestratorConfigManifest;
use ember_orchestrator::commands::{self, ConfigCommand, DaemonCommand, InstanceCommand};
use ember_orchestrator::daemon;

/// Ember - ephemeral build agents with guaranteed teardown
#[derive(Parser)]
#[command(name = "ember")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Run the daemon in the foreground
    #[arg(long, global = true)]
    daemon: bool,

    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "EMBER_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// HTTP API port (default: spec.network.port, 8700)
    #[arg(long, global = true, env = "EMBER_PORT")]
    port: Option<u16>,

    /// HTTP API host (default: spec.network.bind_address, 127.0.0.1)
    #[arg(long, global = true, env = "EMBER_HOST")]
    host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "EMBER_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage daemon lifecycle
    #[command(name = "daemon")]
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Lifecycle instance operations
    #[command(name = "instance")]
    Instance {
        #[command(subcommand)]
        command: InstanceCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.daemon {
        let config = OrchestratorConfigManifest::load_or_default(cli.config.clone())
            .context("Failed to load configuration")?;
        let logging = &config.spec.observability.logging;
        init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging.format)?;

        info!("Starting Ember orchestrator in daemon mode");
        return daemon::start_daemon(config, cli.host, cli.port).await;
    }

    init_logging(cli.log_level.as_deref().unwrap_or("warn"), "text")?;

    let host = cli.host.as_deref().unwrap_or(daemon::DEFAULT_HOST);
    let port = cli.port.unwrap_or(daemon::DEFAULT_PORT);

    match cli.command {
        Some(Commands::Daemon { command }) => {
            commands::daemon::handle_command(command, cli.config, host, port).await
        }
        Some(Commands::Instance { command }) => {
            commands::instance::handle_command(command, host, port).await
        }
        Some(Commands::Config { command }) => {
            commands::config::handle_command(command, cli.config).await
        }
        None => {
            // No command provided - show help
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    if format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }

    Ok(())
}
