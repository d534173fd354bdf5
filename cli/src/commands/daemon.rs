// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon lifecycle management commands
//!
//! Commands: start, stop, status

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{info, warn};

use crate::daemon::{check_daemon_running, stop_daemon, DaemonStatus};
use ember_core::domain::config::{LedgerBackendKind, OrchestratorConfigManifest};

/// How long `daemon start` waits for the health endpoint to answer.
const STARTUP_WAIT: Duration = Duration::from_secs(10);

#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon in the background (if not already running)
    Start,

    /// Stop the daemon gracefully
    Stop {
        /// Force kill if daemon doesn't stop gracefully
        #[arg(short, long)]
        force: bool,

        /// Timeout in seconds (default: 30)
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },

    /// Check daemon status
    Status,
}

pub async fn handle_command(
    command: DaemonCommand,
    config_path: Option<PathBuf>,
    host: &str,
    port: u16,
) -> Result<()> {
    match command {
        DaemonCommand::Start => start(config_path, host, port).await,
        DaemonCommand::Stop { force, timeout } => stop(host, port, force, timeout).await,
        DaemonCommand::Status => {
            let status = check_daemon_running(host, port).await?;
            for line in describe(&status) {
                println!("{}", line);
            }
            Ok(())
        }
    }
}

async fn start(config_path: Option<PathBuf>, host: &str, port: u16) -> Result<()> {
    // Fail here rather than in the detached process
    let config = OrchestratorConfigManifest::load_or_default(config_path.clone())
        .context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;
    if config.spec.ledger.backend == LedgerBackendKind::Memory {
        println!(
            "{}",
            "WARNING: memory ledger; instances open at shutdown cannot be reaped on restart."
                .yellow()
                .bold()
        );
    }

    match check_daemon_running(host, port).await? {
        DaemonStatus::Running { pid, .. } => {
            println!("{}", format!("✓ Daemon already running (PID: {})", pid).green());
            return Ok(());
        }
        DaemonStatus::Unhealthy { pid, error } => {
            warn!(pid, "Replacing unhealthy daemon: {}", error);
            stop_daemon(false, 10).await?;
        }
        DaemonStatus::Stopped => {}
    }

    let (stdout_path, stderr_path) = log_paths(&std::env::temp_dir());
    let exe = std::env::current_exe().context("Failed to get current executable path")?;
    let mut cmd = background_command(&exe, config_path.as_deref(), host, port);
    cmd.stdin(Stdio::null())
        .stdout(std::fs::File::create(&stdout_path).context("Failed to create stdout log file")?)
        .stderr(std::fs::File::create(&stderr_path).context("Failed to create stderr log file")?);

    let child = cmd.spawn().context("Failed to spawn daemon process")?;
    info!(pid = child.id(), log = %stdout_path.display(), "Daemon spawned");

    let deadline = tokio::time::Instant::now() + STARTUP_WAIT;
    loop {
        if let DaemonStatus::Running { .. } = check_daemon_running(host, port).await? {
            println!("{}", format!("✓ Daemon started (PID: {})", child.id()).green());
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "Daemon did not become healthy within {:?}; see {} and {}",
                STARTUP_WAIT,
                stdout_path.display(),
                stderr_path.display()
            );
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

async fn stop(host: &str, port: u16, force: bool, timeout: u64) -> Result<()> {
    let pid = match check_daemon_running(host, port).await? {
        DaemonStatus::Stopped => {
            println!("{}", "ℹ Daemon not running".yellow());
            return Ok(());
        }
        DaemonStatus::Running { pid, in_flight, .. } => {
            if let Some(n) = in_flight.filter(|n| *n > 0) {
                println!("{}", format!("ℹ {} instance(s) in flight will be reaped on next start", n).yellow());
            }
            pid
        }
        DaemonStatus::Unhealthy { pid, .. } => pid,
    };

    info!(pid, force, "Stopping daemon");
    stop_daemon(force, timeout).await?;
    println!("{}", "✓ Daemon stopped".green());
    Ok(())
}

/// Re-exec of this binary in daemon mode, detached from the terminal's
/// process group.
fn background_command(exe: &Path, config_path: Option<&Path>, host: &str, port: u16) -> Command {
    let mut cmd = Command::new(exe);
    cmd.arg("--daemon")
        .arg("--host")
        .arg(host)
        .arg("--port")
        .arg(port.to_string());
    if let Some(config) = config_path {
        cmd.arg("--config").arg(config);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd
}

fn log_paths(dir: &Path) -> (PathBuf, PathBuf) {
    (dir.join("ember.out"), dir.join("ember.err"))
}

fn describe(status: &DaemonStatus) -> Vec<String> {
    match status {
        DaemonStatus::Running { pid, uptime, in_flight } => {
            let mut lines = vec![
                "✓ Daemon is running".green().to_string(),
                format!("  PID: {}", pid),
            ];
            if let Some(uptime) = uptime {
                lines.push(format!("  Uptime: {}", format_uptime(*uptime)));
            }
            if let Some(in_flight) = in_flight {
                lines.push(format!("  In-flight instances: {}", in_flight));
            }
            lines
        }
        DaemonStatus::Stopped => vec!["✗ Daemon is not running".red().to_string()],
        DaemonStatus::Unhealthy { pid, error } => {
            let (out, err) = log_paths(&std::env::temp_dir());
            vec![
                format!("⚠ Daemon unhealthy (PID: {})", pid).yellow().to_string(),
                format!("  Health check failed: {}", error),
                format!("  Logs: {} {}", out.display(), err.display()),
            ]
        }
    }
}

/// Largest two non-zero units, e.g. `2d 3h` or `4m 10s`.
fn format_uptime(secs: u64) -> String {
    let units = [(86_400, "d"), (3_600, "h"), (60, "m"), (1, "s")];
    let mut rest = secs;
    let parts: Vec<String> = units
        .iter()
        .filter_map(|(size, suffix)| {
            let value = rest / size;
            rest %= size;
            (value > 0).then(|| format!("{}{}", value, suffix))
        })
        .take(2)
        .collect();

    if parts.is_empty() {
        "0s".to_string()
    } else {
        parts.join(" ")
    }
}
