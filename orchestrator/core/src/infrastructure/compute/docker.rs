// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Docker-backed compute provider.
//!
//! One container per lifecycle instance. The container name is derived from
//! the correlation id, so Docker itself rejects a second create for the same
//! instance (HTTP 409); the provider then reports `Conflict` and the
//! provisioner adopts the existing container. Labels carry the correlation id
//! for `find_by_correlation`.
//!
//! The local daemon does not need the scoped credential; it is accepted to
//! satisfy the provider contract.

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, ContainerStateStatusEnum, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    ListContainersOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::compute::{
    BootConfig, ComputeError, ComputeProvider, ResourceStatus, ResourceTags, LIFECYCLE_TAG,
};
use crate::domain::credentials::ScopedCredential;
use crate::domain::lifecycle::{InstanceId, ResourceHandle, ResourceSpec};

const IDENTITY_PROFILE_LABEL: &str = "ember.identity-profile";

pub struct DockerComputeProvider {
    docker: Docker,
    network_mode: Option<String>,
}

impl DockerComputeProvider {
    pub fn new(socket_path: Option<String>, network_mode: Option<String>) -> Result<Self, ComputeError> {
        // Connect to Docker daemon (custom socket or auto-detect)
        let docker = if let Some(path) = socket_path {
            #[cfg(unix)]
            let result = Docker::connect_with_unix(&path, 120, bollard::API_DEFAULT_VERSION);

            #[cfg(windows)]
            let result = Docker::connect_with_named_pipe(&path, 120, bollard::API_DEFAULT_VERSION);

            result.map_err(|e| {
                ComputeError::Transient(format!(
                    "Failed to connect to Docker at {}: {}\n\n\
                     Ensure Docker is running and the socket path is correct.",
                    path, e
                ))
            })?
        } else {
            Docker::connect_with_local_defaults().map_err(|e| {
                ComputeError::Transient(format!(
                    "Failed to connect to Docker: {}\n\n\
                     Common causes:\n\
                     - Docker daemon not running (check: docker ps)\n\
                     - Permission denied accessing Docker socket\n\
                     - On Linux: Current user not in 'docker' group",
                    e
                ))
            })?
        };

        Ok(Self { docker, network_mode })
    }

    /// Verify Docker daemon is accessible
    pub async fn healthcheck(&self) -> Result<(), ComputeError> {
        self.docker
            .ping()
            .await
            .map_err(|e| ComputeError::Transient(format!("Cannot connect to Docker daemon: {}", e)))?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), ComputeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!("Image {} not found locally, pulling", image);
        let options = CreateImageOptionsBuilder::default().from_image(image).build();
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(match e {
                    BollardError::DockerResponseServerError { status_code, message }
                        if status_code == 404 || status_code == 400 =>
                    {
                        ComputeError::InvalidImage(format!("{}: {}", image, message))
                    }
                    other => ComputeError::Transient(format!("Failed to pull image {}: {}", image, other)),
                });
            }
        }
        info!("Successfully pulled image: {}", image);
        Ok(())
    }
}

fn container_body(
    spec: &ResourceSpec,
    tags: &ResourceTags,
    boot: &BootConfig,
    default_network: Option<&str>,
) -> Result<ContainerCreateBody, ComputeError> {
    let mut labels = tags.to_labels();
    if let Some(profile) = &spec.identity_profile {
        labels.insert(IDENTITY_PROFILE_LABEL.to_string(), profile.clone());
    }

    let mut env = vec![format!("EMBER_AGENT_LABEL={}", boot.agent_label)];
    if let Some(token) = &boot.registration_token {
        env.push(format!("EMBER_REGISTRATION_TOKEN={}", token));
    }

    let memory = i64::try_from(spec.size.memory_bytes())
        .map_err(|_| ComputeError::Rejected(format!("memory limit out of range: {:?}", spec.size)))?;
    let host_config = HostConfig {
        memory: Some(memory),
        // Docker nano_cpus: 1 CPU = 1e9 nano CPUs, 1 milli CPU = 1e6 nano CPUs
        nano_cpus: Some(i64::from(spec.size.cpu_millis()) * 1_000_000),
        network_mode: spec.network.clone().or_else(|| default_network.map(str::to_string)),
        ..Default::default()
    };

    Ok(ContainerCreateBody {
        image: Some(spec.image.clone()),
        labels: Some(labels),
        env: Some(env),
        host_config: Some(host_config),
        ..Default::default()
    })
}

/// Map a Docker API error for a request whose effect is known to be nil
/// unless the daemon says otherwise.
fn classify(error: BollardError) -> ComputeError {
    match error {
        BollardError::DockerResponseServerError { status_code, message } => match status_code {
            404 => ComputeError::NotFound(message),
            409 => ComputeError::Conflict(message),
            400 | 403 => ComputeError::Rejected(message),
            _ => ComputeError::Transient(format!("docker returned {}: {}", status_code, message)),
        },
        other => ComputeError::Transient(other.to_string()),
    }
}

/// Create requests that fail in transit may still have reached the daemon.
fn classify_create(error: BollardError) -> ComputeError {
    match error {
        BollardError::DockerResponseServerError { status_code: 404, message } => {
            ComputeError::InvalidImage(message)
        }
        e @ BollardError::DockerResponseServerError { .. } => classify(e),
        other => ComputeError::Ambiguous(other.to_string()),
    }
}

/// Starting an already running container is not a failure.
fn classify_start(error: BollardError) -> Result<(), ComputeError> {
    match error {
        BollardError::DockerResponseServerError { status_code: 304, .. } => Ok(()),
        other => Err(classify(other)),
    }
}

fn map_status(status: Option<ContainerStateStatusEnum>) -> ResourceStatus {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => ResourceStatus::Creating,
        Some(ContainerStateStatusEnum::RUNNING)
        | Some(ContainerStateStatusEnum::PAUSED)
        | Some(ContainerStateStatusEnum::RESTARTING) => ResourceStatus::Running,
        Some(ContainerStateStatusEnum::REMOVING) | Some(ContainerStateStatusEnum::EXITED) => {
            ResourceStatus::Stopping
        }
        _ => ResourceStatus::Terminated,
    }
}

#[async_trait]
impl ComputeProvider for DockerComputeProvider {
    async fn create_resource(
        &self,
        _credential: &ScopedCredential,
        spec: &ResourceSpec,
        tags: &ResourceTags,
        boot: &BootConfig,
    ) -> Result<ResourceHandle, ComputeError> {
        let body = container_body(spec, tags, boot, self.network_mode.as_deref())?;
        self.ensure_image(&spec.image).await?;

        let name = tags.idempotency_token();
        let options = CreateContainerOptionsBuilder::default().name(&name).build();
        let response = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(classify_create)?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions>)
            .await
            .map_err(|e| match classify(e) {
                // The container exists; a failed start is not a failed create.
                ComputeError::NotFound(m) | ComputeError::Rejected(m) => ComputeError::Ambiguous(m),
                other => other,
            })?;

        info!(container = %response.id, name = %name, "Container started");
        Ok(ResourceHandle::new(response.id))
    }

    async fn start_resource(
        &self,
        _credential: &ScopedCredential,
        handle: &ResourceHandle,
    ) -> Result<(), ComputeError> {
        match self
            .docker
            .start_container(handle.as_str(), None::<StartContainerOptions>)
            .await
        {
            Ok(()) => {
                info!(container = %handle, "Container started");
                Ok(())
            }
            Err(e) => classify_start(e),
        }
    }

    async fn describe_resource(
        &self,
        _credential: &ScopedCredential,
        handle: &ResourceHandle,
    ) -> Result<ResourceStatus, ComputeError> {
        let inspect = self
            .docker
            .inspect_container(handle.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;
        Ok(map_status(inspect.state.and_then(|s| s.status)))
    }

    async fn terminate_resource(
        &self,
        _credential: &ScopedCredential,
        handle: &ResourceHandle,
    ) -> Result<(), ComputeError> {
        let options = RemoveContainerOptionsBuilder::default().force(true).v(true).build();
        self.docker
            .remove_container(handle.as_str(), Some(options))
            .await
            .map_err(|e| match classify(e) {
                // "removal already in progress"
                ComputeError::Conflict(m) => ComputeError::Transient(m),
                other => other,
            })
    }

    async fn wait_terminated(
        &self,
        credential: &ScopedCredential,
        handle: &ResourceHandle,
        timeout: Duration,
    ) -> Result<(), ComputeError> {
        let wait = async {
            loop {
                match self.describe_resource(credential, handle).await {
                    Err(ComputeError::NotFound(_)) => return Ok(()),
                    Err(e) => return Err(e),
                    Ok(status) => {
                        debug!(container = %handle, ?status, "Waiting for container removal");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ComputeError::Transient(format!("{} still present after {:?}", handle, timeout)))?
    }

    async fn find_by_correlation(
        &self,
        _credential: &ScopedCredential,
        correlation_id: InstanceId,
    ) -> Result<Vec<ResourceHandle>, ComputeError> {
        let filters = HashMap::from([(
            "label",
            vec![format!("{}={}", LIFECYCLE_TAG, correlation_id)],
        )]);
        let options = ListContainersOptionsBuilder::default().all(true).filters(&filters).build();
        let containers = self.docker.list_containers(Some(options)).await.map_err(classify)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| c.id)
            .map(ResourceHandle::new)
            .collect())
    }
}
