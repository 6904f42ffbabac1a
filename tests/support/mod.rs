// ABOUTME: Test support utilities.
// ABOUTME: In-memory provider and registry fakes that record calls and accept injected failures.

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use shipyard::controller::ServiceController;
use shipyard::deploy::ReconcilerSettings;
use shipyard::provider::{
    DatabaseHandle, DatabaseSpec, DatabaseStatus, LogStream, NodeHandle, NodeSpec, NodeStatus,
    ProviderClient, ProviderError,
};
use shipyard::registry::{BuildRequest, RegistryClient, RegistryError};
use shipyard::retry::{RetryPolicies, RetryPolicy};
use shipyard::ssh::CommandOutput;
use shipyard::state::{
    DatabaseRequest, NodeClass, Readiness, ServiceSpec, StateStore,
};
use shipyard::types::{DatabaseId, ImageRef, NodeId};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::Notify;

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests. Safe to call multiple times.
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::from_default_env()
            .add_directive("shipyard=debug".parse().unwrap());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Public address every fake node gets once it boots.
pub const NODE_IP: &str = "203.0.113.7";

pub fn endpoint(database: &str) -> String {
    format!("postgresql://doadmin@{}:25060/defaultdb", database)
}

pub fn output(exit_code: u32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

/// Scripted answer for remote commands containing `pattern`.
struct Rule {
    pattern: String,
    output: CommandOutput,
    remaining: Option<u32>,
}

#[derive(Default)]
struct ProviderState {
    next_id: u64,
    nodes: BTreeMap<String, NodeHandle>,
    node_polls: HashMap<String, u32>,
    databases: BTreeMap<String, DatabaseHandle>,
    database_polls: HashMap<String, u32>,
    calls: Vec<String>,
    commands: Vec<String>,
    inputs: Vec<Vec<u8>>,
    failures: HashMap<&'static str, VecDeque<ProviderError>>,
    gates: HashMap<&'static str, Arc<Notify>>,
    rules: Vec<Rule>,
    containers: u32,
    log_lines: Vec<String>,
    /// Created nodes still to end up in the error state.
    failing_boots: u32,
}

/// A cloud that boots nodes after a number of describe polls and runs every
/// remote command successfully unless told otherwise.
pub struct FakeProvider {
    state: Mutex<ProviderState>,
    boot_polls: u32,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl FakeProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProviderState {
                log_lines: vec!["listening on :8000".to_string()],
                ..Default::default()
            }),
            boot_polls: 1,
        }
    }

    /// Nodes and databases come up on the `polls`-th describe.
    pub fn with_boot_polls(mut self, polls: u32) -> Self {
        self.boot_polls = polls;
        self
    }

    /// Created nodes end up in the error state instead of booting.
    pub fn with_failing_boots(self) -> Self {
        self.with_failing_first_boots(u32::MAX)
    }

    /// The first `count` created nodes end up in the error state.
    pub fn with_failing_first_boots(mut self, count: u32) -> Self {
        self.state.get_mut().failing_boots = count;
        self
    }

    /// Operation names (`create_node`, `delete_database`, ...) in call order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == op).count()
    }

    /// Remote commands in execution order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn ran(&self, fragment: &str) -> bool {
        self.state.lock().commands.iter().any(|c| c.contains(fragment))
    }

    pub fn inputs(&self) -> Vec<Vec<u8>> {
        self.state.lock().inputs.clone()
    }

    pub fn nodes(&self) -> Vec<NodeHandle> {
        self.state.lock().nodes.values().cloned().collect()
    }

    pub fn databases(&self) -> Vec<DatabaseHandle> {
        self.state.lock().databases.values().cloned().collect()
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: &'static str, error: ProviderError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Park the next call of `op` until the returned handle is notified.
    pub fn block_next(&self, op: &'static str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().gates.insert(op, gate.clone());
        gate
    }

    /// Answer remote commands containing `pattern` with `output`, `times`
    /// times or forever when `times` is None.
    pub fn respond(&self, pattern: &str, output: CommandOutput, times: Option<u32>) {
        self.state.lock().rules.push(Rule {
            pattern: pattern.to_string(),
            output,
            remaining: times,
        });
    }

    /// Put a node into the cloud without going through `create_node`.
    pub fn seed_node(&self, name: &str, tags: Vec<String>, status: NodeStatus) -> NodeId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = NodeId::new(format!("{}", 1000 + state.next_id));
        let node = NodeHandle {
            id: id.clone(),
            name: name.to_string(),
            status,
            ip_address: (status == NodeStatus::Ready).then(|| NODE_IP.to_string()),
            size: "s-1vcpu-1gb".to_string(),
            region: "ams3".to_string(),
            tags,
            created_at: None,
        };
        state.nodes.insert(id.to_string(), node);
        id
    }

    /// Put an online database into the cloud.
    pub fn seed_database(&self, name: &str) -> DatabaseId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = DatabaseId::new(format!("db-{}", state.next_id));
        let db = DatabaseHandle {
            id: id.clone(),
            name: name.to_string(),
            engine: "pg".to_string(),
            status: DatabaseStatus::Online,
            endpoint: Some(endpoint(name)),
            size: "db-s-1vcpu-1gb".to_string(),
            region: "ams3".to_string(),
        };
        state.databases.insert(id.to_string(), db);
        id
    }

    /// Remove a node behind the tool's back.
    pub fn forget_node(&self, id: &NodeId) {
        self.state.lock().nodes.remove(id.as_str());
    }

    async fn enter(&self, op: &'static str) -> Result<(), ProviderError> {
        let gate = {
            let mut state = self.state.lock();
            state.calls.push(op.to_string());
            if let Some(err) = state.failures.get_mut(op).and_then(VecDeque::pop_front) {
                return Err(err);
            }
            state.gates.remove(op)
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }

    fn answer(&self, command: &str) -> CommandOutput {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.commands.push(command.to_string());

        if let Some(rule) = state.rules.iter_mut().find(|r| {
            command.contains(&r.pattern) && r.remaining.is_none_or(|n| n > 0)
        }) {
            if let Some(n) = rule.remaining.as_mut() {
                *n -= 1;
            }
            return rule.output.clone();
        }

        if command.contains(" run -d ") {
            state.containers += 1;
            return output(0, &format!("c0ffee{:04}\n", state.containers), "");
        }
        if command.contains(" inspect ") {
            return output(0, "running\n", "");
        }
        if command.contains(" logs ") {
            return output(0, &state.log_lines.join("\n"), "");
        }
        output(0, "", "")
    }
}

#[async_trait]
impl ProviderClient for FakeProvider {
    async fn create_node(&self, spec: &NodeSpec) -> Result<NodeHandle, ProviderError> {
        self.enter("create_node").await?;
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("{}", 1000 + state.next_id);
        let node = NodeHandle {
            id: NodeId::new(id.clone()),
            name: spec.name.clone(),
            status: NodeStatus::Provisioning,
            ip_address: None,
            size: spec.size.clone(),
            region: spec.region.clone(),
            tags: spec.tags.clone(),
            created_at: None,
        };
        state.nodes.insert(id, node.clone());
        Ok(node)
    }

    async fn delete_node(&self, id: &NodeId) -> Result<(), ProviderError> {
        self.enter("delete_node").await?;
        self.state
            .lock()
            .nodes
            .remove(id.as_str())
            .map(|_| ())
            .ok_or_else(|| ProviderError::not_found("droplet", id.as_str()))
    }

    async fn describe_node(&self, id: &NodeId) -> Result<NodeHandle, ProviderError> {
        self.enter("describe_node").await?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let polls = {
            let polls = state.node_polls.entry(id.to_string()).or_default();
            *polls += 1;
            *polls
        };
        let node = state
            .nodes
            .get_mut(id.as_str())
            .ok_or_else(|| ProviderError::not_found("droplet", id.as_str()))?;
        if node.status == NodeStatus::Provisioning && state.failing_boots > 0 {
            state.failing_boots -= 1;
            node.status = NodeStatus::Error;
        } else if node.status == NodeStatus::Provisioning && polls >= self.boot_polls {
            node.status = NodeStatus::Ready;
            node.ip_address = Some(NODE_IP.to_string());
        }
        Ok(node.clone())
    }

    async fn list_nodes(&self, tag: Option<&str>) -> Result<Vec<NodeHandle>, ProviderError> {
        self.enter("list_nodes").await?;
        Ok(self
            .state
            .lock()
            .nodes
            .values()
            .filter(|n| tag.is_none_or(|t| n.tags.iter().any(|nt| nt == t)))
            .cloned()
            .collect())
    }

    async fn create_database(
        &self,
        spec: &DatabaseSpec,
    ) -> Result<DatabaseHandle, ProviderError> {
        self.enter("create_database").await?;
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("db-{}", state.next_id);
        let db = DatabaseHandle {
            id: DatabaseId::new(id.clone()),
            name: spec.name.clone(),
            engine: spec.engine.clone(),
            status: DatabaseStatus::Creating,
            endpoint: None,
            size: spec.size.clone(),
            region: spec.region.clone(),
        };
        state.databases.insert(id, db.clone());
        Ok(db)
    }

    async fn describe_database(&self, id: &DatabaseId) -> Result<DatabaseHandle, ProviderError> {
        self.enter("describe_database").await?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let polls = {
            let polls = state.database_polls.entry(id.to_string()).or_default();
            *polls += 1;
            *polls
        };
        let db = state
            .databases
            .get_mut(id.as_str())
            .ok_or_else(|| ProviderError::not_found("database", id.as_str()))?;
        if db.status == DatabaseStatus::Creating && polls >= self.boot_polls {
            db.status = DatabaseStatus::Online;
            db.endpoint = Some(endpoint(&db.name));
        }
        Ok(db.clone())
    }

    async fn delete_database(&self, id: &DatabaseId) -> Result<(), ProviderError> {
        self.enter("delete_database").await?;
        self.state
            .lock()
            .databases
            .remove(id.as_str())
            .map(|_| ())
            .ok_or_else(|| ProviderError::not_found("database", id.as_str()))
    }

    async fn list_databases(&self) -> Result<Vec<DatabaseHandle>, ProviderError> {
        self.enter("list_databases").await?;
        Ok(self.state.lock().databases.values().cloned().collect())
    }

    async fn exec_remote(
        &self,
        node: &NodeId,
        command: &str,
    ) -> Result<CommandOutput, ProviderError> {
        self.enter("exec_remote").await?;
        if !self.state.lock().nodes.contains_key(node.as_str()) {
            return Err(ProviderError::not_found("droplet", node.as_str()));
        }
        Ok(self.answer(command))
    }

    async fn exec_remote_with_input(
        &self,
        node: &NodeId,
        command: &str,
        input: &[u8],
    ) -> Result<CommandOutput, ProviderError> {
        self.state.lock().inputs.push(input.to_vec());
        self.exec_remote(node, command).await
    }

    async fn fetch_log(
        &self,
        node: &NodeId,
        _container: &str,
        tail: Option<u64>,
    ) -> Result<LogStream, ProviderError> {
        self.enter("fetch_log").await?;
        let state = self.state.lock();
        if !state.nodes.contains_key(node.as_str()) {
            return Err(ProviderError::not_found("droplet", node.as_str()));
        }
        let mut lines = state.log_lines.clone();
        if let Some(tail) = tail {
            let skip = lines.len().saturating_sub(tail as usize);
            lines.drain(..skip);
        }
        Ok(Box::pin(stream::iter(lines.into_iter().map(Ok::<String, ProviderError>))))
    }
}

#[derive(Default)]
struct RegistryState {
    builds: Vec<BuildRequest>,
    pushes: Vec<ImageRef>,
    build_failures: VecDeque<RegistryError>,
    push_failures: VecDeque<RegistryError>,
}

/// Builds instantly and pins every push to a fresh digest.
#[derive(Default)]
pub struct FakeRegistry {
    state: Mutex<RegistryState>,
}

#[allow(dead_code)]
impl FakeRegistry {
    pub fn builds(&self) -> Vec<BuildRequest> {
        self.state.lock().builds.clone()
    }

    pub fn pushes(&self) -> Vec<ImageRef> {
        self.state.lock().pushes.clone()
    }

    pub fn fail_next_build(&self, error: RegistryError) {
        self.state.lock().build_failures.push_back(error);
    }

    pub fn fail_next_push(&self, error: RegistryError) {
        self.state.lock().push_failures.push_back(error);
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn build(&self, request: &BuildRequest) -> Result<ImageRef, RegistryError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.builds.push(request.clone());
        if let Some(err) = state.build_failures.pop_front() {
            return Err(err);
        }
        Ok(request.image.clone())
    }

    async fn push(&self, image: &ImageRef) -> Result<ImageRef, RegistryError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(err) = state.push_failures.pop_front() {
            return Err(err);
        }
        state.pushes.push(image.clone());
        let digest = format!("sha256:{:064x}", state.pushes.len());
        Ok(image.with_digest(&digest))
    }
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(
        3,
        Duration::from_millis(1),
        Duration::from_millis(5),
        Duration::from_millis(500),
    )
}

pub fn fast_settings() -> ReconcilerSettings {
    let policy = fast_policy();
    ReconcilerSettings {
        policies: RetryPolicies {
            provider_call: policy,
            node_ready: policy,
            database_ready: policy,
            container_start: policy,
            readiness: policy,
        },
        ..Default::default()
    }
}

/// A service built from a local context, no database, ready as soon as it runs.
#[allow(dead_code)]
pub fn spec(context: &std::path::Path) -> ServiceSpec {
    ServiceSpec {
        image: ImageRef::parse("registry.example.com/acme/web:latest").unwrap(),
        context: Some(context.to_path_buf()),
        dockerfile: "Dockerfile".to_string(),
        node: NodeClass {
            size: "s-1vcpu-1gb".to_string(),
            region: "ams3".to_string(),
            image: "docker-20-04".to_string(),
        },
        ports: vec!["80:8000".to_string()],
        env: BTreeMap::from([("LOG_LEVEL".to_string(), "info".to_string())]),
        volumes: vec![],
        database: None,
        readiness: Readiness {
            settle: Duration::ZERO,
            cmd: None,
        },
    }
}

#[allow(dead_code)]
pub fn spec_with_database(context: &std::path::Path) -> ServiceSpec {
    ServiceSpec {
        database: Some(DatabaseRequest::Create {
            engine: "pg".to_string(),
            version: None,
            size: "db-s-1vcpu-1gb".to_string(),
            num_nodes: 1,
        }),
        ..spec(context)
    }
}

pub type Controller = ServiceController<FakeProvider, FakeRegistry>;

/// A controller over fresh fakes and a temporary state directory.
pub struct Harness {
    pub provider: Arc<FakeProvider>,
    pub registry: Arc<FakeRegistry>,
    pub controller: Controller,
    pub dir: tempfile::TempDir,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self::with_provider(FakeProvider::new())
    }

    pub fn with_provider(provider: FakeProvider) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(provider);
        let registry = Arc::new(FakeRegistry::default());
        let controller = Self::controller_for(&provider, &registry, dir.path());
        Self {
            provider,
            registry,
            controller,
            dir,
        }
    }

    /// Another controller sharing this harness's fakes and state directory.
    pub fn second_controller(&self) -> Controller {
        Self::controller_for(&self.provider, &self.registry, self.dir.path())
    }

    fn controller_for(
        provider: &Arc<FakeProvider>,
        registry: &Arc<FakeRegistry>,
        root: &std::path::Path,
    ) -> Controller {
        let store = StateStore::open(root.join("state")).unwrap();
        ServiceController::new(provider.clone(), registry.clone(), store, fast_settings())
    }

    pub fn store(&self) -> &StateStore {
        self.controller.store()
    }

    /// A build context directory inside the harness.
    pub fn context(&self) -> std::path::PathBuf {
        let path = self.dir.path().join("app");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("Dockerfile"), "FROM scratch\n").unwrap();
        path
    }
}
