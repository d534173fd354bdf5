// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Orchestrator Configuration Types
//
// Defines the configuration schema for the ember orchestrator daemon:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Controller deadlines and readiness polling cadence
// - Retry budgets for credentials, provisioning and teardown
// - Ledger, compute, identity and registry backend selection
// - Network and observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::retry::RetryPolicy;

pub const API_VERSION: &str = "ember.dev/v1";
pub const KIND: &str = "OrchestratorConfig";

/// Top-level Kubernetes-style orchestrator configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfigManifest {
    /// API version (must be "ember.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "OrchestratorConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: OrchestratorConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable orchestrator name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Orchestrator configuration specification (content under spec:)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfigSpec {
    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub readiness: ReadinessConfig,

    #[serde(default)]
    pub credentials: CredentialsConfig,

    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    #[serde(default)]
    pub reaper: ReaperConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub compute: ComputeConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Global bound on AWAITING_READY
    #[serde(default = "default_ready_deadline", with = "humantime_serde")]
    pub ready_deadline: Duration,

    /// Default maximum job duration when the caller supplies none
    #[serde(default, with = "humantime_serde")]
    pub job_deadline: Option<Duration>,

    /// Run restart recovery before serving requests
    #[serde(default = "default_true")]
    pub reap_on_startup: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ready_deadline: default_ready_deadline(),
            job_deadline: None,
            reap_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Upper bound of the random delay added to every poll
    #[serde(default = "default_poll_jitter", with = "humantime_serde")]
    pub poll_jitter: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            poll_jitter: default_poll_jitter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Refresh credentials expiring within this window
    #[serde(default = "default_grace_window", with = "humantime_serde")]
    pub grace_window: Duration,

    #[serde(default = "default_credential_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_credential_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    #[serde(default = "default_credential_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Requested session lifetime
    #[serde(default = "default_session_duration", with = "humantime_serde")]
    pub session_duration: Duration,
}

impl CredentialsConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.base_delay, self.max_delay).with_jitter(self.base_delay / 2)
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            grace_window: default_grace_window(),
            max_attempts: default_credential_attempts(),
            base_delay: default_credential_base_delay(),
            max_delay: default_credential_max_delay(),
            session_duration: default_session_duration(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Attempts after an ambiguous create, each preceded by an absence check
    #[serde(default = "default_provision_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_provision_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    #[serde(default = "default_provision_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Shared secret the agent uses to register (supports "env:VAR_NAME")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_secret: Option<String>,
}

impl ProvisioningConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.base_delay, self.max_delay).with_jitter(self.base_delay / 2)
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_provision_attempts(),
            base_delay: default_provision_base_delay(),
            max_delay: default_provision_max_delay(),
            registration_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_reaper_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_reaper_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    #[serde(default = "default_reaper_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// How long a single attempt waits for the provider to report the resource gone
    #[serde(default = "default_wait_timeout", with = "humantime_serde")]
    pub wait_timeout: Duration,
}

impl ReaperConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.base_delay, self.max_delay).with_jitter(self.base_delay / 2)
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_reaper_attempts(),
            base_delay: default_reaper_base_delay(),
            max_delay: default_reaper_max_delay(),
            wait_timeout: default_wait_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackendKind {
    Memory,
    #[default]
    Sled,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub backend: LedgerBackendKind,

    /// Directory of the sled database
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,

    /// PostgreSQL connection string (supports "env:VAR_NAME")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackendKind::default(),
            path: default_ledger_path(),
            database_url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeBackendKind {
    #[default]
    Docker,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeConfig {
    #[serde(default)]
    pub backend: ComputeBackendKind,

    /// Path to Docker socket; platform default when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,

    /// Docker network mode applied when the resource spec names no network
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,

    /// Live-resource quota of the simulated backend
    #[serde(default = "default_simulated_quota")]
    pub simulated_quota: usize,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            backend: ComputeBackendKind::default(),
            socket_path: None,
            network_mode: None,
            simulated_quota: default_simulated_quota(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityBackendKind {
    #[default]
    Http,
    Static,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub backend: IdentityBackendKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Bearer token for the identity service (supports "env:VAR_NAME")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackendKind {
    #[default]
    Http,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub backend: RegistryBackendKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Bearer token for the work-receiving system (supports "env:VAR_NAME")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Time a simulated agent takes to come online
    #[serde(default = "default_boot_delay", with = "humantime_serde")]
    pub simulated_boot_delay: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackendKind::default(),
            endpoint: None,
            token: None,
            simulated_boot_delay: default_boot_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network bind address (e.g. "0.0.0.0" or "127.0.0.1")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// HTTP API port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Prometheus exporter port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_ready_deadline() -> Duration {
    Duration::from_secs(600)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_jitter() -> Duration {
    Duration::from_secs(2)
}

fn default_grace_window() -> Duration {
    Duration::from_secs(300)
}

fn default_credential_attempts() -> u32 {
    5
}

fn default_credential_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_credential_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_session_duration() -> Duration {
    Duration::from_secs(3600)
}

fn default_provision_attempts() -> u32 {
    3
}

fn default_provision_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_provision_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_reaper_attempts() -> u32 {
    8
}

fn default_reaper_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_reaper_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_wait_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("./ember-ledger")
}

fn default_max_connections() -> u32 {
    5
}

fn default_simulated_quota() -> usize {
    10
}

fn default_boot_delay() -> Duration {
    Duration::from_secs(20)
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8700
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9100
}

impl Default for OrchestratorConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "ember-orchestrator".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: OrchestratorConfigSpec::default(),
        }
    }
}

/// Resolve a secret reference (supports "env:VAR_NAME" syntax)
pub fn resolve_secret(value: &Option<String>) -> anyhow::Result<Option<String>> {
    match value {
        Some(v) => match v.strip_prefix("env:") {
            Some(var_name) => std::env::var(var_name)
                .map(Some)
                .map_err(|_| anyhow::anyhow!("Environment variable not set: {}", var_name)),
            None => Ok(Some(v.clone())),
        },
        None => Ok(None),
    }
}

impl OrchestratorConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. EMBER_CONFIG_PATH environment variable
    /// 2. ./ember-config.yaml (working directory)
    /// 3. ~/.ember/config.yaml (user home)
    /// 4. /etc/ember/config.yaml (system, Unix) or C:\ProgramData\Ember\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("EMBER_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./ember-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".ember").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/ember/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Ember\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing/invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("EMBER_DATABASE_URL") {
            tracing::info!("Environment override: EMBER_DATABASE_URL (ledger backend -> postgres)");
            self.spec.ledger.backend = LedgerBackendKind::Postgres;
            self.spec.ledger.database_url = Some(url);
        }

        if let Ok(path) = std::env::var("EMBER_LEDGER_PATH") {
            tracing::info!("Environment override: EMBER_LEDGER_PATH={}", path);
            self.spec.ledger.path = PathBuf::from(path);
        }

        if std::env::var("EMBER_REGISTRATION_SECRET").is_ok()
            && self.spec.provisioning.registration_secret.is_none()
        {
            tracing::info!("Environment override: EMBER_REGISTRATION_SECRET");
            self.spec.provisioning.registration_secret =
                Some("env:EMBER_REGISTRATION_SECRET".to_string());
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let spec = &self.spec;
        if spec.controller.ready_deadline.is_zero() {
            anyhow::bail!("spec.controller.ready_deadline must be greater than zero");
        }
        if matches!(spec.controller.job_deadline, Some(d) if d.is_zero()) {
            anyhow::bail!("spec.controller.job_deadline must be greater than zero when set");
        }
        if spec.readiness.poll_interval.is_zero() {
            anyhow::bail!("spec.readiness.poll_interval must be greater than zero");
        }

        for (section, attempts) in [
            ("credentials", spec.credentials.max_attempts),
            ("provisioning", spec.provisioning.max_attempts),
            ("reaper", spec.reaper.max_attempts),
        ] {
            if attempts == 0 {
                anyhow::bail!("spec.{}.max_attempts must be at least 1", section);
            }
        }

        if spec.credentials.grace_window >= spec.credentials.session_duration {
            anyhow::bail!("spec.credentials.grace_window must be shorter than session_duration");
        }

        if spec.ledger.backend == LedgerBackendKind::Postgres && spec.ledger.database_url.is_none() {
            anyhow::bail!("spec.ledger.database_url is required for the postgres backend");
        }
        if spec.identity.backend == IdentityBackendKind::Http && spec.identity.endpoint.is_none() {
            anyhow::bail!("spec.identity.endpoint is required for the http backend");
        }
        if spec.registry.backend == RegistryBackendKind::Http && spec.registry.endpoint.is_none() {
            anyhow::bail!("spec.registry.endpoint is required for the http backend");
        }
        if spec.registry.backend == RegistryBackendKind::Simulated
            && spec.compute.backend != ComputeBackendKind::Simulated
        {
            anyhow::bail!("spec.registry.backend 'simulated' requires spec.compute.backend 'simulated'");
        }

        for secret in [
            &spec.provisioning.registration_secret,
            &spec.ledger.database_url,
            &spec.identity.token,
            &spec.registry.token,
        ] {
            resolve_secret(secret)?;
        }

        Ok(())
    }
}
