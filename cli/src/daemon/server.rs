// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon HTTP server implementation
//!
//! Wires the configured backends into a `LifecycleController`, tears down
//! whatever a previous run left open, and serves the lifecycle API until
//! Ctrl+C / SIGTERM. Instances still in flight at shutdown stay open in the
//! ledger and are reaped by the next start.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use ember_core::{
    application::{
        credential_broker::CredentialBroker,
        ledger_factory::{create_ledger, ledger_backend},
        lifecycle::{ControllerComponents, ControllerSettings, LifecycleController},
        provisioner::ResourceProvisioner,
        readiness::ReadinessWatcher,
        reaper::Reaper,
    },
    domain::{
        agent_registry::{AgentRegistry, WorkHandoff},
        compute::ComputeProvider,
        config::{
            resolve_secret, ComputeBackendKind, IdentityBackendKind, OrchestratorConfigManifest,
            RegistryBackendKind,
        },
        credentials::IdentityProvider,
    },
    infrastructure::{
        compute::{DockerComputeProvider, SimulatedComputeProvider},
        event_bus::EventBus,
        HttpAgentRegistry, HttpIdentityProvider, SimulatedAgentRegistry, StaticIdentityProvider,
    },
    presentation::api,
};

use super::{remove_pid_file, write_pid_file};

pub async fn start_daemon(
    config: OrchestratorConfigManifest,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    // Write PID file
    let pid = std::process::id();
    write_pid_file(pid)?;

    // Ensure PID file cleanup on exit
    let _guard = PidFileGuard;

    info!("Ember daemon starting (PID: {})", pid);

    config.validate().context("Configuration validation failed")?;
    info!("Configuration loaded: name={}", config.metadata.name);

    let network = &config.spec.network;
    let bind_address = host.unwrap_or_else(|| network.bind_address.clone());

    let metrics = &config.spec.observability.metrics;
    if metrics.enabled {
        let addr: SocketAddr = format!("{}:{}", bind_address, metrics.port)
            .parse()
            .context("Invalid metrics listen address")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Prometheus metrics on {}", addr);
    }

    let controller = build_controller(&config).await?;

    if config.spec.controller.reap_on_startup {
        let recovered = controller
            .recover()
            .await
            .context("Restart recovery failed")?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "Tearing down instances left open by a previous run");
        }
    } else {
        warn!("spec.controller.reap_on_startup is disabled; open ledger records are not reaped");
    }

    let addr = format!("{}:{}", bind_address, port.unwrap_or(network.port));
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Daemon listening on {}", addr);

    axum::serve(listener, api::app(controller.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!(
        in_flight = controller.in_flight(),
        "Daemon shutting down; open instances are reaped on next start"
    );

    Ok(())
}

/// Build every collaborator named by the configuration.
pub async fn build_controller(config: &OrchestratorConfigManifest) -> Result<LifecycleController> {
    let spec = &config.spec;

    let ledger = create_ledger(&ledger_backend(&spec.ledger)?).await?;

    let (compute, simulated): (Arc<dyn ComputeProvider>, Option<Arc<SimulatedComputeProvider>>) =
        match spec.compute.backend {
            ComputeBackendKind::Docker => {
                let docker = DockerComputeProvider::new(
                    spec.compute.socket_path.clone(),
                    spec.compute.network_mode.clone(),
                )
                .context("Failed to connect to Docker")?;
                info!("Compute backend: docker");
                (Arc::new(docker), None)
            }
            ComputeBackendKind::Simulated => {
                warn!(
                    quota = spec.compute.simulated_quota,
                    "Compute backend: simulated; no real resources are created"
                );
                let simulated = Arc::new(SimulatedComputeProvider::new(spec.compute.simulated_quota));
                (simulated.clone(), Some(simulated))
            }
        };

    let identity: Arc<dyn IdentityProvider> = match spec.identity.backend {
        IdentityBackendKind::Http => {
            let endpoint = spec
                .identity
                .endpoint
                .clone()
                .context("spec.identity.endpoint is required for the http backend")?;
            Arc::new(HttpIdentityProvider::new(
                endpoint,
                resolve_secret(&spec.identity.token)?,
                spec.credentials.session_duration,
            )?)
        }
        IdentityBackendKind::Static => {
            warn!("Identity backend: static; issuing local development credentials");
            Arc::new(StaticIdentityProvider::new(spec.credentials.session_duration))
        }
    };

    let (registry, handoff): (Arc<dyn AgentRegistry>, Arc<dyn WorkHandoff>) = match spec.registry.backend {
        RegistryBackendKind::Http => {
            let endpoint = spec
                .registry
                .endpoint
                .clone()
                .context("spec.registry.endpoint is required for the http backend")?;
            let registry = Arc::new(HttpAgentRegistry::new(endpoint, resolve_secret(&spec.registry.token)?)?);
            (registry.clone(), registry)
        }
        RegistryBackendKind::Simulated => {
            let compute = simulated
                .context("spec.registry.backend 'simulated' requires spec.compute.backend 'simulated'")?;
            let registry = Arc::new(SimulatedAgentRegistry::new(compute, spec.registry.simulated_boot_delay));
            (registry.clone(), registry)
        }
    };

    let components = ControllerComponents {
        ledger,
        broker: Arc::new(CredentialBroker::new(
            identity,
            spec.credentials.retry_policy(),
            spec.credentials.grace_window,
        )),
        provisioner: Arc::new(ResourceProvisioner::new(
            compute.clone(),
            spec.provisioning.retry_policy(),
            resolve_secret(&spec.provisioning.registration_secret)?,
        )),
        watcher: Arc::new(ReadinessWatcher::new(
            registry,
            spec.readiness.poll_interval,
            spec.readiness.poll_jitter,
        )),
        handoff,
        reaper: Arc::new(Reaper::new(
            compute,
            spec.reaper.retry_policy(),
            spec.reaper.wait_timeout,
        )),
        event_bus: EventBus::with_default_capacity(),
    };

    Ok(LifecycleController::new(
        components,
        ControllerSettings {
            ready_deadline: spec.controller.ready_deadline,
            job_deadline: spec.controller.job_deadline,
        },
    ))
}

struct PidFileGuard;

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = remove_pid_file();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
