// ABOUTME: Cloud provider abstraction for nodes, managed databases and remote execution.
// ABOUTME: The reconciler only talks to infrastructure through the ProviderClient trait.

mod digitalocean;
mod error;

pub use digitalocean::{DEFAULT_API_URL, DigitalOceanProvider, ProviderSettings};
pub use error::ProviderError;

use crate::ssh::CommandOutput;
use crate::types::{DatabaseId, NodeId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag applied to every node this tool creates.
pub const MANAGED_TAG: &str = "shipyard";

/// Tag identifying the service a node was created for.
pub fn service_tag(service: &str) -> String {
    format!("shipyard-service-{}", service)
}

/// Request for a new compute node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub name: String,
    pub size: String,
    pub region: String,
    pub image: String,
    pub ssh_keys: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Provisioning,
    Ready,
    Error,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeStatus::Provisioning => "provisioning",
            NodeStatus::Ready => "ready",
            NodeStatus::Error => "error",
        })
    }
}

/// A node as the provider currently reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeHandle {
    pub id: NodeId,
    pub name: String,
    pub status: NodeStatus,
    pub ip_address: Option<String>,
    pub size: String,
    pub region: String,
    pub tags: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Request for a new managed database cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSpec {
    pub name: String,
    pub engine: String,
    pub version: Option<String>,
    pub size: String,
    pub region: String,
    pub num_nodes: u32,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseStatus {
    Creating,
    Online,
    Error,
}

impl fmt::Display for DatabaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DatabaseStatus::Creating => "creating",
            DatabaseStatus::Online => "online",
            DatabaseStatus::Error => "error",
        })
    }
}

/// A managed database as the provider currently reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseHandle {
    pub id: DatabaseId,
    pub name: String,
    pub engine: String,
    pub status: DatabaseStatus,
    /// Connection URI, once the cluster has one.
    pub endpoint: Option<String>,
    pub size: String,
    pub region: String,
}

/// Log output, one line per item.
pub type LogStream = BoxStream<'static, Result<String, ProviderError>>;

/// Narrow interface over the cloud provider.
///
/// Implementations perform exactly one remote operation per call. Retrying,
/// waiting and ordering are the caller's business.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn create_node(&self, spec: &NodeSpec) -> Result<NodeHandle, ProviderError>;

    async fn delete_node(&self, id: &NodeId) -> Result<(), ProviderError>;

    async fn describe_node(&self, id: &NodeId) -> Result<NodeHandle, ProviderError>;

    async fn node_status(&self, id: &NodeId) -> Result<NodeStatus, ProviderError> {
        Ok(self.describe_node(id).await?.status)
    }

    /// Nodes carrying `tag`, or every node when `tag` is None.
    async fn list_nodes(&self, tag: Option<&str>) -> Result<Vec<NodeHandle>, ProviderError>;

    async fn create_database(&self, spec: &DatabaseSpec)
    -> Result<DatabaseHandle, ProviderError>;

    async fn describe_database(&self, id: &DatabaseId) -> Result<DatabaseHandle, ProviderError>;

    async fn delete_database(&self, id: &DatabaseId) -> Result<(), ProviderError>;

    async fn list_databases(&self) -> Result<Vec<DatabaseHandle>, ProviderError>;

    /// Run a shell command on the node. A non-zero exit is not an error here;
    /// callers inspect the returned output.
    async fn exec_remote(&self, node: &NodeId, command: &str)
    -> Result<CommandOutput, ProviderError>;

    /// Like [`exec_remote`](Self::exec_remote) with `input` fed to the command's stdin.
    async fn exec_remote_with_input(
        &self,
        node: &NodeId,
        command: &str,
        input: &[u8],
    ) -> Result<CommandOutput, ProviderError>;

    /// Stream the log of `container` on the node, optionally only the last `tail` lines.
    async fn fetch_log(
        &self,
        node: &NodeId,
        container: &str,
        tail: Option<u64>,
    ) -> Result<LogStream, ProviderError>;
}
