// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Lifecycle instance commands
//!
//! Commands: create, status, cancel, complete, watch, escalations

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use colored::Colorize;
use serde_json::json;

use ember_core::domain::lifecycle::{InstanceCondition, InstanceId, InstanceStatus, JobOutcome};

use crate::daemon::client::StreamedEvent;
use crate::daemon::{check_daemon_running, DaemonClient, DaemonStatus};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SizeArg {
    Small,
    Medium,
    Large,
    Xlarge,
}

impl SizeArg {
    fn as_str(self) -> &'static str {
        match self {
            SizeArg::Small => "small",
            SizeArg::Medium => "medium",
            SizeArg::Large => "large",
            SizeArg::Xlarge => "xlarge",
        }
    }
}

#[derive(Subcommand)]
pub enum InstanceCommand {
    /// Provision a new ephemeral agent
    Create {
        /// Image or machine template to boot
        #[arg(long)]
        image: String,

        /// Size class
        #[arg(long, value_enum, default_value = "medium")]
        size: SizeArg,

        /// Role assumed in the target account
        #[arg(long)]
        role: String,

        /// External id presented when assuming the role
        #[arg(long)]
        external_id: Option<String>,

        /// Readiness deadline, e.g. "10m" (default: daemon setting)
        #[arg(long)]
        ready_deadline: Option<String>,

        /// Job deadline once in use, e.g. "2h" (default: daemon setting)
        #[arg(long)]
        job_deadline: Option<String>,

        /// Follow events until the instance finishes
        #[arg(short, long)]
        watch: bool,
    },

    /// Show instance status
    Status {
        /// Instance ID
        id: InstanceId,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Cancel an instance; teardown always runs
    Cancel {
        /// Instance ID
        id: InstanceId,
    },

    /// Signal that the job handed to the agent has finished
    Complete {
        /// Instance ID
        id: InstanceId,

        /// Mark the job as failed
        #[arg(long)]
        failed: bool,

        /// Free-form outcome detail
        #[arg(long)]
        detail: Option<String>,
    },

    /// Stream lifecycle events until the instance finishes
    Watch {
        /// Instance ID
        id: InstanceId,
    },

    /// List teardowns that need manual intervention
    Escalations,
}

pub async fn handle_command(command: InstanceCommand, host: &str, port: u16) -> Result<()> {
    if let DaemonStatus::Stopped = check_daemon_running(host, port).await? {
        anyhow::bail!(
            "Daemon is not running at {}:{}. Start it with: ember daemon start",
            host,
            port
        );
    }

    let client = DaemonClient::new(host, port)?;

    match command {
        InstanceCommand::Create {
            image,
            size,
            role,
            external_id,
            ready_deadline,
            job_deadline,
            watch,
        } => {
            let mut request = json!({
                "resource_spec": { "image": image, "size": size.as_str() },
                "target_account_ref": { "role_ref": role, "external_id": external_id },
            });
            if let Some(deadline) = ready_deadline {
                request["ready_deadline"] = json!(deadline);
            }
            if let Some(deadline) = job_deadline {
                request["job_deadline"] = json!(deadline);
            }

            let id = client.create_instance(&request).await?;
            println!("{}", format!("✓ Instance created: {}", id).green());

            if watch {
                client.watch(id, print_event).await?;
            }
        }
        InstanceCommand::Status { id, json } => {
            let status = client.get_status(id).await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status).context("Failed to render status")?
                );
            } else {
                print_status(&status);
            }
        }
        InstanceCommand::Cancel { id } => {
            client.cancel(id).await?;
            println!("{}", format!("✓ Cancellation requested for {}", id).green());
        }
        InstanceCommand::Complete { id, failed, detail } => {
            let outcome = JobOutcome {
                success: !failed,
                detail,
            };
            client.complete(id, &outcome).await?;
            println!("{}", format!("✓ Completion signalled for {}", id).green());
        }
        InstanceCommand::Watch { id } => {
            client.watch(id, print_event).await?;
        }
        InstanceCommand::Escalations => {
            let records = client.list_escalations().await?;
            if records.is_empty() {
                println!("{}", "No escalations".green());
            }
            for record in records {
                println!(
                    "{} {} handle={} attempts={}",
                    record.escalated_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                    record.instance_id.to_string().red().bold(),
                    record
                        .resource_handle
                        .as_ref()
                        .map(|h| h.to_string())
                        .unwrap_or_else(|| "(unbound)".to_string()),
                    record.attempts,
                );
                println!("    role: {}", record.target_account_ref.role_ref);
                println!("    last error: {}", record.last_error);
            }
        }
    }

    Ok(())
}

fn print_status(status: &InstanceStatus) {
    let condition = match status.condition {
        InstanceCondition::Active => "active".cyan(),
        InstanceCondition::Terminated => "terminated".green(),
        InstanceCondition::Failed => "failed".red(),
        InstanceCondition::OrphanRisk => "ORPHAN RISK".red().bold(),
    };

    println!("{} {}", "Instance".bold(), status.id);
    println!("  State:     {} ({})", status.state, condition);
    if let Some(reason) = status.termination_reason {
        println!("  Reason:    {}", reason);
    }
    if let Some(handle) = &status.resource_handle {
        println!("  Resource:  {}", handle);
    }
    println!("  Created:   {}", status.created_at);
    if let Some(ready_at) = status.ready_at {
        println!("  Ready:     {}", ready_at);
    }
    if let Some(terminated_at) = status.terminated_at {
        println!("  Finished:  {}", terminated_at);
    }
    if let Some(outcome) = &status.job_outcome {
        let result = if outcome.success { "succeeded".green() } else { "failed".red() };
        println!("  Job:       {}", result);
        if let Some(detail) = &outcome.detail {
            println!("             {}", detail);
        }
    }
    if let Some(failure) = &status.failure {
        println!("  Failure:   {}", failure.red());
    }
}

fn print_event(event: StreamedEvent) {
    if event.kind == "status" {
        match serde_json::from_value::<InstanceStatus>(event.data) {
            Ok(status) => print_status(&status),
            Err(e) => eprintln!("{}", format!("Unreadable status snapshot: {}", e).yellow()),
        }
        return;
    }

    // Lifecycle events are externally tagged: {"StateChanged": {...}}
    let body = event
        .data
        .as_object()
        .and_then(|map| map.values().next())
        .cloned()
        .unwrap_or_default();

    match event.kind.as_str() {
        "state_changed" => println!(
            "{} {} → {}",
            "state".cyan(),
            body["from"].as_str().unwrap_or("?"),
            body["to"].as_str().unwrap_or("?").bold()
        ),
        "resource_bound" => println!(
            "{} {}",
            "bound".cyan(),
            body["resource_handle"].as_str().unwrap_or("?")
        ),
        "teardown_confirmed" => println!("{}", "teardown confirmed".green()),
        "teardown_escalated" => println!(
            "{} after {} attempts: {}",
            "TEARDOWN ESCALATED".red().bold(),
            body["attempts"],
            body["last_error"].as_str().unwrap_or("")
        ),
        "instance_finished" => println!(
            "{} {} ({})",
            "finished".bold(),
            body["state"].as_str().unwrap_or("?"),
            body["reason"].as_str().unwrap_or("?")
        ),
        other => println!("{} {}", other.dimmed(), body),
    }
}
