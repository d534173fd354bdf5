// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use ember_core::domain::config::{
    ComputeBackendKind, IdentityBackendKind, LedgerBackendKind, OrchestratorConfigManifest, RegistryBackendKind,
};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./ember-config.yaml)
        #[arg(short, long, default_value = "./ember-config.yaml")]
        output: PathBuf,

        /// Use in-process backends (simulated compute, static identity, memory ledger)
        #[arg(long)]
        local: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, local } => generate(output, local).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = OrchestratorConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. EMBER_CONFIG_PATH: {}",
            std::env::var("EMBER_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./ember-config.yaml");
        println!("  4. ~/.ember/config.yaml");
        println!("  5. /etc/ember/config.yaml");
        println!();
    }

    println!("{}", "Current configuration:".bold());
    println!();
    print!(
        "{}",
        serde_yaml::to_string(&config).context("Failed to render configuration")?
    );

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = OrchestratorConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, local: bool) -> Result<()> {
    let config = sample_config(local);

    config
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );
    if !local {
        println!("  Set spec.identity.endpoint and spec.registry.endpoint before starting the daemon.");
    }

    Ok(())
}

fn sample_config(local: bool) -> OrchestratorConfigManifest {
    let mut config = OrchestratorConfigManifest::default();
    if local {
        config.spec.ledger.backend = LedgerBackendKind::Memory;
        config.spec.compute.backend = ComputeBackendKind::Simulated;
        config.spec.identity.backend = IdentityBackendKind::Static;
        config.spec.registry.backend = RegistryBackendKind::Simulated;
    } else {
        config.spec.registry.token = Some("env:EMBER_REGISTRY_TOKEN".to_string());
        config.spec.identity.token = Some("env:EMBER_IDENTITY_TOKEN".to_string());
    }
    config
}
