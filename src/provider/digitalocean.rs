// ABOUTME: DigitalOcean implementation of ProviderClient over the v2 REST API.
// ABOUTME: Droplets are nodes, managed database clusters are databases, SSH runs remote commands.

use super::{
    DatabaseHandle, DatabaseSpec, DatabaseStatus, LogStream, NodeHandle, NodeSpec, NodeStatus,
    ProviderClient, ProviderError,
};
use crate::ssh::{CommandOutput, Session, SessionConfig};
use crate::types::{DatabaseId, NodeId};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.digitalocean.com";

/// Everything the provider needs, resolved from configuration up front.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub api_url: String,
    pub token: String,
    pub ssh_user: String,
    pub ssh_key_path: Option<PathBuf>,
    pub trust_first_connection: bool,
    pub known_hosts_path: Option<PathBuf>,
    pub command_timeout: Duration,
    /// Prefix docker invocations with sudo on the node.
    pub sudo: bool,
}

impl ProviderSettings {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token: token.into(),
            ssh_user: "root".to_string(),
            ssh_key_path: None,
            trust_first_connection: true,
            known_hosts_path: None,
            command_timeout: Duration::from_secs(600),
            sudo: false,
        }
    }
}

pub struct DigitalOceanProvider {
    http: reqwest::Client,
    settings: ProviderSettings,
    /// Public addresses of nodes already described, keyed by id.
    addresses: Mutex<HashMap<NodeId, String>>,
}

impl std::fmt::Debug for DigitalOceanProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalOceanProvider")
            .field("api_url", &self.settings.api_url)
            .field("ssh_user", &self.settings.ssh_user)
            .finish_non_exhaustive()
    }
}

impl DigitalOceanProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self, ProviderError> {
        if settings.token.trim().is_empty() {
            return Err(ProviderError::Config("API token is empty".to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("shipyard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Config(e.to_string()))?;

        Ok(Self {
            http,
            settings,
            addresses: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.api_url.trim_end_matches('/'), path)
    }

    async fn send<B: Serialize + ?Sized + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut request = self
            .http
            .request(method.clone(), self.url(path))
            .bearer_auth(&self.settings.token);
        if let Some(body) = body {
            request = request.json(body);
        }

        tracing::debug!(%method, path, "provider request");
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .json::<ApiError>()
            .await
            .map(|e| e.message)
            .unwrap_or_else(|_| status.to_string());

        Err(match status {
            StatusCode::NOT_FOUND => ProviderError::NotFound {
                kind: "resource",
                id: path.to_string(),
            },
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
            s if s.is_server_error() => ProviderError::Unavailable(format!("{}: {}", s, message)),
            s => ProviderError::Rejected {
                status: s.as_u16(),
                message,
            },
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let response = self.send::<()>(Method::GET, path, None).await?;
        Ok(response.json().await?)
    }

    async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        let response = self.send(Method::POST, path, Some(body)).await?;
        Ok(response.json().await?)
    }

    async fn delete(&self, path: &str) -> Result<(), ProviderError> {
        self.send::<()>(Method::DELETE, path, None).await?;
        Ok(())
    }

    fn remember_address(&self, node: &NodeHandle) {
        if let Some(ip) = &node.ip_address {
            self.addresses.lock().insert(node.id.clone(), ip.clone());
        }
    }

    async fn address_of(&self, id: &NodeId) -> Result<String, ProviderError> {
        let cached = self.addresses.lock().get(id).cloned();
        if let Some(ip) = cached {
            return Ok(ip);
        }
        let node = self.describe_node(id).await?;
        node.ip_address.ok_or_else(|| ProviderError::NoAddress {
            node: id.to_string(),
        })
    }

    async fn session(&self, id: &NodeId) -> Result<Session, ProviderError> {
        let host = self.address_of(id).await?;
        let mut config = SessionConfig::new(host, &self.settings.ssh_user)
            .trust_on_first_use(self.settings.trust_first_connection)
            .command_timeout(self.settings.command_timeout);
        if let Some(key) = &self.settings.ssh_key_path {
            config = config.key_path(key);
        }
        if let Some(known_hosts) = &self.settings.known_hosts_path {
            config = config.known_hosts_path(known_hosts);
        }

        Session::connect(config)
            .await
            .map_err(|source| ProviderError::Ssh {
                node: id.to_string(),
                source,
            })
    }

    fn docker(&self) -> &'static str {
        if self.settings.sudo { "sudo docker" } else { "docker" }
    }
}

#[async_trait]
impl ProviderClient for DigitalOceanProvider {
    async fn create_node(&self, spec: &NodeSpec) -> Result<NodeHandle, ProviderError> {
        let request = CreateDroplet {
            name: &spec.name,
            region: &spec.region,
            size: &spec.size,
            image: &spec.image,
            ssh_keys: &spec.ssh_keys,
            tags: &spec.tags,
        };
        let response: DropletEnvelope = self.post("/v2/droplets", &request).await?;
        let node = response.droplet.into_handle();
        tracing::info!(node = %node.id, name = %node.name, "droplet created");
        Ok(node)
    }

    async fn delete_node(&self, id: &NodeId) -> Result<(), ProviderError> {
        self.delete(&format!("/v2/droplets/{}", id))
            .await
            .map_err(|e| not_found_as(e, "node", id.as_str()))?;
        self.addresses.lock().remove(id);
        Ok(())
    }

    async fn describe_node(&self, id: &NodeId) -> Result<NodeHandle, ProviderError> {
        let response: DropletEnvelope = self
            .get(&format!("/v2/droplets/{}", id))
            .await
            .map_err(|e| not_found_as(e, "node", id.as_str()))?;
        let node = response.droplet.into_handle();
        self.remember_address(&node);
        Ok(node)
    }

    async fn list_nodes(&self, tag: Option<&str>) -> Result<Vec<NodeHandle>, ProviderError> {
        let path = match tag {
            Some(tag) => format!(
                "/v2/droplets?per_page=200&tag_name={}",
                urlencoding::encode(tag)
            ),
            None => "/v2/droplets?per_page=200".to_string(),
        };
        let response: DropletList = self.get(&path).await?;
        let nodes: Vec<NodeHandle> = response
            .droplets
            .into_iter()
            .map(Droplet::into_handle)
            .collect();
        for node in &nodes {
            self.remember_address(node);
        }
        Ok(nodes)
    }

    async fn create_database(
        &self,
        spec: &DatabaseSpec,
    ) -> Result<DatabaseHandle, ProviderError> {
        let request = CreateCluster {
            name: &spec.name,
            engine: &spec.engine,
            version: spec.version.as_deref(),
            size: &spec.size,
            region: &spec.region,
            num_nodes: spec.num_nodes,
            tags: &spec.tags,
        };
        let response: ClusterEnvelope = self.post("/v2/databases", &request).await?;
        let database = response.database.into_handle();
        tracing::info!(database = %database.id, name = %database.name, "database cluster created");
        Ok(database)
    }

    async fn describe_database(&self, id: &DatabaseId) -> Result<DatabaseHandle, ProviderError> {
        let response: ClusterEnvelope = self
            .get(&format!("/v2/databases/{}", id))
            .await
            .map_err(|e| not_found_as(e, "database", id.as_str()))?;
        Ok(response.database.into_handle())
    }

    async fn delete_database(&self, id: &DatabaseId) -> Result<(), ProviderError> {
        self.delete(&format!("/v2/databases/{}", id))
            .await
            .map_err(|e| not_found_as(e, "database", id.as_str()))
    }

    async fn list_databases(&self) -> Result<Vec<DatabaseHandle>, ProviderError> {
        let response: ClusterList = self.get("/v2/databases").await?;
        Ok(response
            .databases
            .unwrap_or_default()
            .into_iter()
            .map(Cluster::into_handle)
            .collect())
    }

    async fn exec_remote(
        &self,
        node: &NodeId,
        command: &str,
    ) -> Result<CommandOutput, ProviderError> {
        let session = self.session(node).await?;
        tracing::debug!(node = %node, command, "remote exec");
        let result = session.exec(command).await;
        close(session, node).await;
        result.map_err(|source| ProviderError::Ssh {
            node: node.to_string(),
            source,
        })
    }

    async fn exec_remote_with_input(
        &self,
        node: &NodeId,
        command: &str,
        input: &[u8],
    ) -> Result<CommandOutput, ProviderError> {
        let session = self.session(node).await?;
        tracing::debug!(node = %node, command, "remote exec with stdin");
        let result = session.exec_with_input(command, input).await;
        close(session, node).await;
        result.map_err(|source| ProviderError::Ssh {
            node: node.to_string(),
            source,
        })
    }

    async fn fetch_log(
        &self,
        node: &NodeId,
        container: &str,
        tail: Option<u64>,
    ) -> Result<LogStream, ProviderError> {
        let session = self.session(node).await?;
        let command = match tail {
            Some(n) => format!("{} logs --tail {} {} 2>&1", self.docker(), n, container),
            None => format!("{} logs {} 2>&1", self.docker(), container),
        };
        let node_name = node.to_string();
        let chunks = session
            .exec_stream(&command)
            .await
            .map_err(|source| ProviderError::Ssh {
                node: node_name.clone(),
                source,
            })?
            .map(move |chunk| {
                chunk.map_err(|source| ProviderError::Ssh {
                    node: node_name.clone(),
                    source,
                })
            })
            .boxed();
        Ok(split_lines(chunks))
    }
}

async fn close(session: Session, node: &NodeId) {
    if let Err(e) = session.disconnect().await {
        tracing::debug!(node = %node, "ssh disconnect failed: {}", e);
    }
}

/// Turn a generic 404 into one naming the resource that was asked for.
fn not_found_as(err: ProviderError, kind: &'static str, id: &str) -> ProviderError {
    if err.is_not_found() {
        ProviderError::not_found(kind, id)
    } else {
        err
    }
}

/// Re-chunk a byte stream into lines without their terminators.
fn split_lines(chunks: BoxStream<'static, Result<Bytes, ProviderError>>) -> LogStream {
    stream::unfold(
        (chunks, Vec::<u8>::new(), false),
        |(mut chunks, mut buf, mut done)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let rest = buf.split_off(pos + 1);
                    let line = String::from_utf8_lossy(&buf[..pos])
                        .trim_end_matches('\r')
                        .to_string();
                    return Some((Ok(line), (chunks, rest, done)));
                }
                if done {
                    if buf.is_empty() {
                        return None;
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    return Some((Ok(line), (chunks, Vec::new(), true)));
                }
                match chunks.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(e), (chunks, buf, true))),
                    None => done = true,
                }
            }
        },
    )
    .boxed()
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Serialize)]
struct CreateDroplet<'a> {
    name: &'a str,
    region: &'a str,
    size: &'a str,
    image: &'a str,
    ssh_keys: &'a [String],
    tags: &'a [String],
}

#[derive(Debug, Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Debug, Deserialize)]
struct DropletList {
    droplets: Vec<Droplet>,
}

#[derive(Debug, Deserialize)]
struct Droplet {
    id: u64,
    name: String,
    status: String,
    #[serde(default)]
    networks: Networks,
    #[serde(default)]
    size_slug: String,
    region: Option<Region>,
    #[serde(default)]
    tags: Vec<String>,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct Networks {
    #[serde(default)]
    v4: Vec<NetworkV4>,
}

#[derive(Debug, Deserialize)]
struct NetworkV4 {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct Region {
    slug: String,
}

impl Droplet {
    fn public_ipv4(&self) -> Option<String> {
        self.networks
            .v4
            .iter()
            .find(|n| n.kind == "public")
            .map(|n| n.ip_address.clone())
    }

    fn into_handle(self) -> NodeHandle {
        let ip_address = self.public_ipv4();
        let status = droplet_status(&self.status, ip_address.is_some());
        NodeHandle {
            id: NodeId::new(self.id.to_string()),
            name: self.name,
            status,
            ip_address,
            size: self.size_slug,
            region: self.region.map(|r| r.slug).unwrap_or_default(),
            tags: self.tags,
            created_at: self.created_at,
        }
    }
}

/// A droplet is only usable once it is active and reachable.
fn droplet_status(status: &str, has_public_ip: bool) -> NodeStatus {
    match status {
        "active" if has_public_ip => NodeStatus::Ready,
        "active" | "new" => NodeStatus::Provisioning,
        _ => NodeStatus::Error,
    }
}

#[derive(Serialize)]
struct CreateCluster<'a> {
    name: &'a str,
    engine: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'a str>,
    size: &'a str,
    region: &'a str,
    num_nodes: u32,
    tags: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ClusterEnvelope {
    database: Cluster,
}

#[derive(Debug, Deserialize)]
struct ClusterList {
    databases: Option<Vec<Cluster>>,
}

#[derive(Debug, Deserialize)]
struct Cluster {
    id: String,
    name: String,
    engine: String,
    status: String,
    connection: Option<Connection>,
    #[serde(default)]
    size: String,
    #[serde(default)]
    region: String,
}

#[derive(Debug, Deserialize)]
struct Connection {
    uri: Option<String>,
}

impl Cluster {
    fn into_handle(self) -> DatabaseHandle {
        DatabaseHandle {
            id: DatabaseId::new(self.id),
            name: self.name,
            engine: self.engine,
            status: match self.status.as_str() {
                "online" => DatabaseStatus::Online,
                "creating" | "migrating" | "resizing" | "forking" => DatabaseStatus::Creating,
                _ => DatabaseStatus::Error,
            },
            endpoint: self
                .connection
                .and_then(|c| c.uri)
                .filter(|uri| !uri.is_empty()),
            size: self.size,
            region: self.region,
        }
    }
}
