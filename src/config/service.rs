// ABOUTME: Per-service deployment config: deployment/<service>.yml plus optional -secrets.yml.
// ABOUTME: Converts into the ServiceSpec stored on the service record.

use super::ProviderConfig;
use super::deserialize::{deserialize_ports, deserialize_volumes};
use super::env_value::{EnvValue, resolve_env_map};
use crate::error::{Error, Result};
use crate::state::{DatabaseRequest, NodeClass, Readiness, ServiceSpec};
use crate::types::{DatabaseId, ImageRef, ServiceName};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Repository to build and push as. A missing tag becomes `latest`,
    /// or the colour when one is given.
    pub image: ImageRef,

    /// Build context. Without one, `image` is deployed as-is.
    #[serde(default)]
    pub context: Option<PathBuf>,

    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,

    #[serde(default)]
    pub size: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub node_image: Option<String>,

    #[serde(default, deserialize_with = "deserialize_ports")]
    pub ports: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, EnvValue>,

    #[serde(default, deserialize_with = "deserialize_volumes")]
    pub volumes: Vec<String>,

    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    #[serde(default)]
    pub readiness: Readiness,

    /// Extra environment kept out of version control; overrides `env`.
    #[serde(default)]
    pub secrets: BTreeMap<String, EnvValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DatabaseConfig {
    Attach {
        attach: String,
    },
    Create {
        #[serde(default = "default_engine")]
        engine: String,
        #[serde(default)]
        version: Option<String>,
        #[serde(default = "default_database_size")]
        size: String,
        #[serde(default = "default_num_nodes")]
        num_nodes: u32,
    },
}

#[derive(Debug, Default, Deserialize)]
struct SecretsFile {
    #[serde(default)]
    secrets: BTreeMap<String, EnvValue>,
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

fn default_engine() -> String {
    "pg".to_string()
}

fn default_database_size() -> String {
    "db-s-1vcpu-1gb".to_string()
}

fn default_num_nodes() -> u32 {
    1
}

impl From<DatabaseConfig> for DatabaseRequest {
    fn from(config: DatabaseConfig) -> Self {
        match config {
            DatabaseConfig::Attach { attach } => DatabaseRequest::Attach(DatabaseId::new(attach)),
            DatabaseConfig::Create {
                engine,
                version,
                size,
                num_nodes,
            } => DatabaseRequest::Create {
                engine,
                version,
                size,
                num_nodes,
            },
        }
    }
}

impl ServiceConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(Error::from)
    }

    /// Read `<dir>/<service>.yml` and merge `<dir>/<service>-secrets.yml` when present.
    pub fn load(dir: &Path, service: &ServiceName) -> Result<Self> {
        let path = dir.join(format!("{}.yml", service));
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ServiceConfigNotFound(path));
            }
            Err(e) => return Err(e.into()),
        };
        let mut config = Self::from_yaml(&content)?;

        let secrets_path = dir.join(format!("{}-secrets.yml", service));
        match std::fs::read_to_string(&secrets_path) {
            Ok(content) => {
                let file: SecretsFile = serde_yaml::from_str(&content)?;
                config.secrets.extend(file.secrets);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(config)
    }

    /// Resolve environment references and fill node defaults from the provider section.
    pub fn into_spec(self, provider: &ProviderConfig, colour: Option<&str>) -> Result<ServiceSpec> {
        let image = match (colour, self.image.tag()) {
            (Some(colour), _) => self.image.with_tag(colour),
            (None, Some(_)) => self.image,
            (None, None) => self.image.with_tag("latest"),
        };

        let mut env = resolve_env_map(&self.env)?;
        env.extend(resolve_env_map(&self.secrets)?);

        if let Some(context) = &self.context
            && !context.is_dir()
        {
            return Err(Error::InvalidConfig(format!(
                "build context {} is not a directory",
                context.display()
            )));
        }

        Ok(ServiceSpec {
            image,
            context: self.context,
            dockerfile: self.dockerfile,
            node: NodeClass {
                size: self.size.unwrap_or_else(|| provider.default_size.clone()),
                region: self.region.unwrap_or_else(|| provider.region.clone()),
                image: self
                    .node_image
                    .unwrap_or_else(|| provider.node_image.clone()),
            },
            ports: self.ports,
            env,
            volumes: self.volumes,
            database: self.database.map(DatabaseRequest::from),
            readiness: self.readiness,
        })
    }
}
