// ABOUTME: Configuration types and parsing for shipyard.yml and deployment/<service>.yml.
// ABOUTME: Resolves secrets from the environment and builds provider, registry and reconciler settings.

mod deserialize;
mod env_value;
mod init;
mod service;
mod ssh;

pub use env_value::{EnvValue, resolve_env_map};
pub use init::{bootstrap_config, template_yaml};
pub use service::{DatabaseConfig, ServiceConfig};
pub use ssh::SshConfig;

use crate::deploy::ReconcilerSettings;
use crate::error::{Error, Result};
use crate::provider::{DEFAULT_API_URL, ProviderSettings};
use crate::registry::RegistryCredentials;
use crate::retry::RetryPolicies;
use crate::state::{ServiceSpec, default_state_dir};
use crate::types::ServiceName;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_FILENAME: &str = "shipyard.yml";
pub const CONFIG_FILENAME_ALT: &str = "shipyard.yaml";
/// Per-user fallback, relative to `$HOME`.
pub const USER_CONFIG: &str = ".config/shipyard/config.yml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub provider: ProviderConfig,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub registry: Option<RegistryConfig>,

    /// Where service records live. Defaults to `$HOME/.local/state/shipyard`.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    #[serde(default = "default_deployment_dir")]
    pub deployment_dir: PathBuf,

    #[serde(default)]
    pub retry: RetryPolicies,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub token: EnvValue,

    #[serde(default = "default_api_url")]
    pub api_url: String,

    pub region: String,

    /// Base image for new nodes; must ship a container engine.
    #[serde(default = "default_node_image")]
    pub node_image: String,

    #[serde(default = "default_size")]
    pub default_size: String,

    /// SSH key ids or fingerprints registered with the provider.
    #[serde(default)]
    pub ssh_keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    pub username: String,
    pub password: EnvValue,
    /// Registry host; Docker Hub when unset.
    #[serde(default)]
    pub server: Option<String>,
}

fn default_deployment_dir() -> PathBuf {
    PathBuf::from("deployment")
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_node_image() -> String {
    "docker-20-04".to_string()
}

fn default_size() -> String {
    "s-1vcpu-1gb".to_string()
}

impl RegistryConfig {
    pub fn credentials(&self) -> Result<RegistryCredentials> {
        Ok(RegistryCredentials {
            username: self.username.clone(),
            password: self.password.resolve("registry.password")?,
            server: self.server.clone(),
        })
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(Error::from)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load `shipyard.yml` from `dir`, falling back to the per-user config.
    pub fn discover(dir: &Path) -> Result<Self> {
        let mut candidates = vec![dir.join(CONFIG_FILENAME), dir.join(CONFIG_FILENAME_ALT)];
        if let Some(home) = std::env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(USER_CONFIG));
        }

        for path in &candidates {
            if path.exists() {
                tracing::debug!("using configuration {}", path.display());
                return Self::load(path);
            }
        }

        let looked = candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(Error::ConfigNotFound(looked))
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        self.state_dir.clone().or_else(default_state_dir).ok_or_else(|| {
            Error::InvalidConfig("HOME is not set; configure state_dir explicitly".to_string())
        })
    }

    pub fn provider_settings(&self) -> Result<ProviderSettings> {
        let token = self.provider.token.resolve("provider.token")?;
        if token.trim().is_empty() {
            return Err(Error::InvalidConfig("provider.token is empty".to_string()));
        }
        let mut settings = ProviderSettings::new(token);
        settings.api_url = self.provider.api_url.clone();
        settings.ssh_user = self.ssh.user.clone();
        settings.ssh_key_path = self.ssh.key_path.clone();
        settings.trust_first_connection = self.ssh.trust_first_connection;
        settings.known_hosts_path = self.ssh.known_hosts_path.clone();
        settings.command_timeout = self.ssh.command_timeout;
        settings.sudo = self.ssh.sudo;
        Ok(settings)
    }

    pub fn registry_credentials(&self) -> Result<Option<RegistryCredentials>> {
        self.registry
            .as_ref()
            .map(RegistryConfig::credentials)
            .transpose()
    }

    pub fn reconciler_settings(&self) -> Result<ReconcilerSettings> {
        Ok(ReconcilerSettings {
            policies: self.retry,
            registry_login: self.registry_credentials()?,
            ssh_keys: self.provider.ssh_keys.clone(),
            sudo: self.ssh.sudo,
        })
    }

    /// Load `deployment/<service>.yml` and turn it into the desired spec.
    ///
    /// With a colour, the service is named `<service>-<colour>` and its image
    /// is tagged with the colour.
    pub fn service(
        &self,
        service: &str,
        colour: Option<&str>,
    ) -> Result<(ServiceName, ServiceSpec)> {
        let base = ServiceName::new(service)?;
        let name = match colour {
            Some(colour) => base.with_colour(colour)?,
            None => base.clone(),
        };
        let config = ServiceConfig::load(&self.deployment_dir, &base)?;
        let spec = config.into_spec(&self.provider, colour)?;
        Ok((name, spec))
    }
}
