// ABOUTME: Drives a service record toward its desired state one committed step at a time.
// ABOUTME: Handles launch, redeploy with container swap and rollback, and teardown.

use super::container::{DockerCli, FAILURE_LOG_LINES, RunSpec};
use super::error::{
    DeployError, InvalidSpecSnafu, NotReadySnafu, ProviderSnafu, RefreshSnafu, RegistrySnafu,
    ResourceFailedSnafu, StateSnafu,
};
use super::plan::{DeploymentPlan, PlanKind, Step, database_name};
use crate::diagnostics::{Diagnostics, Warning};
use crate::provider::{
    DatabaseHandle, DatabaseSpec, DatabaseStatus, MANAGED_TAG, NodeHandle, NodeSpec, NodeStatus,
    ProviderClient, ProviderError, service_tag,
};
use crate::registry::{BuildRequest, RegistryClient, RegistryCredentials};
use crate::retry::{Probe, RetryPolicies, WaitError, poll_until, retry};
use crate::ssh::CommandOutput;
use crate::state::{
    DatabaseRef, DatabaseRequest, NodeRef, RollbackPoint, ServiceRecord, ServiceSpec,
    ServiceStatus, StateStore,
};
use crate::types::{ContainerId, DatabaseId, ImageRef, NodeId};
use snafu::{OptionExt, ResultExt};
use std::path::PathBuf;

/// Knobs the reconciler needs beyond the service's own spec.
#[derive(Debug, Clone, Default)]
pub struct ReconcilerSettings {
    pub policies: RetryPolicies,
    /// Used for `docker login` on the node before pulling.
    pub registry_login: Option<RegistryCredentials>,
    /// Provider SSH key ids or fingerprints installed on new nodes.
    pub ssh_keys: Vec<String>,
    /// Prefix docker commands on the node with `sudo`.
    pub sudo: bool,
}

/// What a teardown removed and where the final record went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub archived: PathBuf,
    pub deleted_nodes: Vec<NodeId>,
    pub deleted_database: Option<DatabaseId>,
}

/// How far a container swap got on the node.
#[derive(Debug, Default, Clone, Copy)]
struct Swap {
    old_stopped: bool,
    old_renamed: bool,
    /// A replacement was started, or may have been.
    touched: bool,
}

/// Executes deployment plans against a provider, a registry and the state store.
///
/// Every step's effect is committed to the store before the next step starts,
/// so an interrupted run leaves a record the next launch can resume from.
/// The caller holds the service lock for the whole run.
pub struct Reconciler<'a, P: ?Sized, R: ?Sized> {
    provider: &'a P,
    registry: &'a R,
    store: &'a StateStore,
    settings: &'a ReconcilerSettings,
    docker: DockerCli,
}

impl<'a, P, R> Reconciler<'a, P, R>
where
    P: ProviderClient + ?Sized,
    R: RegistryClient + ?Sized,
{
    pub fn new(
        provider: &'a P,
        registry: &'a R,
        store: &'a StateStore,
        settings: &'a ReconcilerSettings,
    ) -> Self {
        Self {
            provider,
            registry,
            store,
            settings,
            docker: DockerCli::new(settings.sudo),
        }
    }

    /// Bring a new, failed or interrupted service up to `running`.
    pub async fn launch(
        &self,
        record: &mut ServiceRecord,
        diag: &mut Diagnostics,
    ) -> Result<(), DeployError> {
        self.refresh(record, diag).await?;
        let plan = DeploymentPlan::for_launch(record);
        self.execute(&plan, record, diag).await
    }

    /// Rebuild and swap the container of a running service to `spec`.
    /// An interrupted redeploy is continued against the state it replaced.
    /// Services that are not running resume their launch instead.
    pub async fn redeploy(
        &self,
        record: &mut ServiceRecord,
        spec: ServiceSpec,
        diag: &mut Diagnostics,
    ) -> Result<(), DeployError> {
        self.refresh(record, diag).await?;
        if record.rollback.is_none()
            && record.status == ServiceStatus::Running
            && record.node().is_some()
        {
            record.rollback = Some(RollbackPoint::of(record));
        }
        record.spec = spec;
        let plan = DeploymentPlan::for_redeploy(record);
        self.execute(&plan, record, diag).await
    }

    /// Reconcile the record's view of its node and database with the provider.
    /// Resources the provider no longer knows are dropped from the record, and
    /// nodes it reports as failed are deleted so a launch creates a new one.
    pub async fn refresh(
        &self,
        record: &mut ServiceRecord,
        diag: &mut Diagnostics,
    ) -> Result<(), DeployError> {
        let policy = &self.settings.policies.provider_call;
        let mut changed = false;
        let mut nodes = Vec::with_capacity(record.nodes.len());

        for node in &record.nodes {
            let id = &node.id;
            match retry(policy, "describe node", || self.provider.describe_node(id)).await {
                Ok(handle) if handle.status == NodeStatus::Error => {
                    tracing::warn!(service = %record.name, node = %id, "node failed, deleting it");
                    match retry(policy, "delete node", || self.provider.delete_node(id)).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => diag.warn(Warning::resource_cleanup(format!(
                            "failed node {} ({}) was not deleted: {}",
                            id, node.name, e
                        ))),
                    }
                    changed = true;
                }
                Ok(handle) => {
                    let ready = node.ready && handle.status == NodeStatus::Ready;
                    if ready != node.ready || handle.ip_address != node.ip_address {
                        changed = true;
                    }
                    nodes.push(NodeRef {
                        id: node.id.clone(),
                        name: node.name.clone(),
                        ip_address: handle.ip_address,
                        ready,
                    });
                }
                Err(e) if e.is_not_found() => {
                    tracing::warn!(service = %record.name, node = %id, "node no longer exists, dropping it from the record");
                    changed = true;
                }
                Err(source) => {
                    return Err(source).context(RefreshSnafu {
                        resource: format!("node {}", id),
                    });
                }
            }
        }

        let database = match &record.database {
            None => None,
            Some(db) => {
                let id = &db.id;
                match retry(policy, "describe database", || {
                    self.provider.describe_database(id)
                })
                .await
                {
                    Ok(handle) => {
                        let endpoint = online_endpoint(&handle);
                        if endpoint != db.endpoint {
                            changed = true;
                        }
                        Some(DatabaseRef {
                            endpoint,
                            ..db.clone()
                        })
                    }
                    Err(e) if e.is_not_found() => {
                        tracing::warn!(service = %record.name, database = %id, "database no longer exists, dropping it from the record");
                        changed = true;
                        None
                    }
                    Err(source) => {
                        return Err(source).context(RefreshSnafu {
                            resource: format!("database {}", id),
                        });
                    }
                }
            }
        };

        if changed {
            record.nodes = nodes;
            record.database = database;
            self.commit(record)?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        plan: &DeploymentPlan,
        record: &mut ServiceRecord,
        diag: &mut Diagnostics,
    ) -> Result<(), DeployError> {
        tracing::info!(service = %record.name, kind = ?plan.kind(), steps = plan.len(), "starting reconciliation");

        let mut swap = Swap::default();

        if plan.kind() == PlanKind::Launch {
            record.rollback = None;
        }
        record.status = plan.initial_status();
        record.last_error = None;
        self.commit(record)?;

        for (index, step) in plan.steps().enumerate() {
            tracing::info!(service = %record.name, %step, "step started");
            if let Err(err) = self.run_step(step, plan, record, &mut swap, diag).await {
                tracing::warn!(service = %record.name, %step, "step failed: {}", err);
                return Err(match plan.kind() {
                    PlanKind::Launch => self.mark_failed(record, err),
                    PlanKind::Redeploy => self.roll_back(record, swap, err).await,
                });
            }
            record.status = plan.status_after(index);
            if record.status == ServiceStatus::Running {
                record.rollback = None;
            }
            self.commit(record)?;
        }

        tracing::info!(service = %record.name, image = ?record.image.as_ref().map(ToString::to_string), "service running");
        Ok(())
    }

    async fn run_step(
        &self,
        step: Step,
        plan: &DeploymentPlan,
        record: &mut ServiceRecord,
        swap: &mut Swap,
        diag: &mut Diagnostics,
    ) -> Result<(), DeployError> {
        match step {
            Step::CreateNode => self.create_node(record).await,
            Step::AwaitNode => self.await_node(record).await,
            Step::CreateDatabase => self.create_database(record).await,
            Step::AwaitDatabase => self.await_database(record).await,
            Step::BuildImage => self.build_image(record, plan.kind()).await,
            Step::StartContainer => self.start_container(record).await,
            Step::ReplaceContainer => {
                self.replace_container(record, swap, plan.is_resumed())
                    .await
            }
            Step::CheckReadiness => self.check_readiness(record).await,
            Step::RetireContainer => {
                self.retire_container(record, diag).await;
                Ok(())
            }
        }
    }

    fn commit(&self, record: &mut ServiceRecord) -> Result<(), DeployError> {
        record.touch();
        self.store.put(record).context(StateSnafu)
    }

    /// Record a failed launch. Committed resources stay so the next launch resumes.
    fn mark_failed(&self, record: &mut ServiceRecord, err: DeployError) -> DeployError {
        record.status = ServiceStatus::Failed;
        record.last_error = Some(err.diagnostic());
        if let Err(e) = self.commit(record) {
            tracing::error!(service = %record.name, "failed to record launch failure: {}", e);
        }
        err
    }

    /// Put the previous container back after a failed redeploy. When the
    /// previous container is gone, its image is started again instead.
    async fn roll_back(
        &self,
        record: &mut ServiceRecord,
        swap: Swap,
        cause: DeployError,
    ) -> DeployError {
        let point = record.rollback.take();
        let restored = if swap.old_stopped {
            tracing::info!(service = %record.name, "restoring previous container");
            self.restore_previous(record, swap).await.map(|()| None)
        } else if swap.touched {
            tracing::info!(service = %record.name, "previous container gone, starting its image again");
            self.rerun_previous(record, point.as_ref()).await.map(Some)
        } else {
            Ok(None)
        };

        match restored {
            Ok(rerun) => {
                if let Some(point) = point {
                    point.restore(record);
                }
                if rerun.is_some() {
                    record.container = rerun;
                }
                record.status = ServiceStatus::Running;
                record.last_error = Some(cause.diagnostic());
                if let Err(e) = self.commit(record) {
                    tracing::error!(service = %record.name, "failed to record rollback: {}", e);
                }
                DeployError::rolled_back(record.image.as_ref(), cause)
            }
            Err(rollback) => {
                record.status = ServiceStatus::Failed;
                record.last_error = Some(format!(
                    "{}\nrollback failed: {}",
                    cause.diagnostic(),
                    rollback
                ));
                if let Err(e) = self.commit(record) {
                    tracing::error!(service = %record.name, "failed to record rollback failure: {}", e);
                }
                DeployError::RollbackFailed {
                    cause: Box::new(cause),
                    rollback: Box::new(rollback),
                }
            }
        }
    }

    async fn restore_previous(&self, record: &ServiceRecord, swap: Swap) -> Result<(), DeployError> {
        let step = Step::ReplaceContainer;
        let node = self.node_id(record, step)?;
        let name = record.name.as_str();

        if swap.old_renamed {
            self.exec(&node, &self.docker.remove_if_exists(name), step)
                .await?;
            let retired = record.name.retired_container();
            self.exec_checked(&node, &self.docker.rename(&retired, name), step)
                .await?;
        }
        self.exec_checked(&node, &self.docker.start(name), step)
            .await?;
        Ok(())
    }

    async fn rerun_previous(
        &self,
        record: &ServiceRecord,
        point: Option<&RollbackPoint>,
    ) -> Result<ContainerId, DeployError> {
        let step = Step::ReplaceContainer;
        let node = self.node_id(record, step)?;
        let image = point
            .and_then(|p| p.image.as_ref())
            .context(InvalidSpecSnafu {
                step,
                message: "no previous image to start again",
            })?;
        let spec = point.map_or(&record.spec, |p| &p.spec);
        let database_url = record.database.as_ref().and_then(|db| db.endpoint.as_deref());
        let run = RunSpec::from_spec(record.name.as_str(), image, spec, database_url)
            .map_err(|message| DeployError::InvalidSpec { step, message })?;

        self.exec(&node, &self.docker.remove_if_exists(&run.name), step)
            .await?;
        self.pull(&node, image, step).await?;
        let output = self.exec_checked(&node, &self.docker.run(&run), step).await?;
        let container = ContainerId::new(output.stdout.trim());
        tracing::info!(service = %record.name, container = %container, "previous image started again");
        Ok(container)
    }

    async fn create_node(&self, record: &mut ServiceRecord) -> Result<(), DeployError> {
        let tag = service_tag(record.name.as_str());
        let class = &record.spec.node;
        let spec = NodeSpec {
            name: record.name.to_string(),
            size: class.size.clone(),
            region: class.region.clone(),
            image: class.image.clone(),
            ssh_keys: self.settings.ssh_keys.clone(),
            tags: vec![MANAGED_TAG.to_string(), tag.clone()],
        };

        let node = retry(&self.settings.policies.provider_call, "create node", || {
            self.adopt_or_create_node(&tag, &spec)
        })
        .await
        .context(ProviderSnafu {
            step: Step::CreateNode,
        })?;

        tracing::info!(service = %record.name, node = %node.id, "node requested");
        record.nodes.push(NodeRef {
            ready: false,
            id: node.id,
            name: node.name,
            ip_address: node.ip_address,
        });
        Ok(())
    }

    /// A node tagged for this service that a crashed run created but never
    /// recorded is taken over instead of creating a second one.
    async fn adopt_or_create_node(
        &self,
        tag: &str,
        spec: &NodeSpec,
    ) -> Result<NodeHandle, ProviderError> {
        let existing = self.provider.list_nodes(Some(tag)).await?;
        if let Some(node) = existing
            .into_iter()
            .find(|n| n.status != NodeStatus::Error)
        {
            tracing::info!(node = %node.id, "adopting untracked node {}", node.name);
            return Ok(node);
        }
        self.provider.create_node(spec).await
    }

    async fn await_node(&self, record: &mut ServiceRecord) -> Result<(), DeployError> {
        let step = Step::AwaitNode;
        let id = self.node_id(record, step)?;

        let handle = poll_until(&self.settings.policies.node_ready, "node", || {
            self.probe_node(&id)
        })
        .await
        .map_err(|e| wait_failed(e, step, format!("node {}", id)))?;

        if let Some(node) = record.nodes.first_mut() {
            node.ip_address = handle.ip_address;
            node.ready = true;
        }
        tracing::info!(service = %record.name, node = %id, "node ready");
        Ok(())
    }

    /// A node counts as ready once the provider says so and its container
    /// engine answers over SSH.
    async fn probe_node(&self, id: &NodeId) -> Result<Probe<NodeHandle>, DeployError> {
        let step = Step::AwaitNode;
        let handle = self
            .provider
            .describe_node(id)
            .await
            .context(ProviderSnafu { step })?;

        match handle.status {
            NodeStatus::Provisioning => Ok(Probe::NotYet(format!("node {} provisioning", id))),
            NodeStatus::Error => ResourceFailedSnafu {
                step,
                resource: format!("node {}", id),
            }
            .fail(),
            NodeStatus::Ready => {
                let output = self.exec(id, &self.docker.probe(), step).await?;
                if output.success() {
                    Ok(Probe::Ready(handle))
                } else {
                    Ok(Probe::NotYet(format!(
                        "container engine not answering: {}",
                        output.stderr.trim()
                    )))
                }
            }
        }
    }

    async fn create_database(&self, record: &mut ServiceRecord) -> Result<(), DeployError> {
        let step = Step::CreateDatabase;
        let policy = &self.settings.policies.provider_call;
        let Some(request) = record.spec.database.clone() else {
            return Ok(());
        };

        let database = match request {
            DatabaseRequest::Create {
                engine,
                version,
                size,
                num_nodes,
            } => {
                let spec = DatabaseSpec {
                    name: database_name(record.name.as_str()),
                    engine,
                    version,
                    size,
                    region: record.spec.node.region.clone(),
                    num_nodes,
                    tags: vec![
                        MANAGED_TAG.to_string(),
                        service_tag(record.name.as_str()),
                    ],
                };
                let handle = retry(policy, "create database", || {
                    self.adopt_or_create_database(&spec)
                })
                .await
                .context(ProviderSnafu { step })?;
                DatabaseRef {
                    endpoint: online_endpoint(&handle),
                    id: handle.id,
                    name: handle.name,
                    owned: true,
                }
            }
            DatabaseRequest::Attach(id) => {
                let handle = retry(policy, "describe database", || {
                    self.provider.describe_database(&id)
                })
                .await
                .context(ProviderSnafu { step })?;
                DatabaseRef {
                    endpoint: online_endpoint(&handle),
                    id: handle.id,
                    name: handle.name,
                    owned: false,
                }
            }
        };

        tracing::info!(service = %record.name, database = %database.id, owned = database.owned, "database recorded");
        record.database = Some(database);
        Ok(())
    }

    async fn adopt_or_create_database(
        &self,
        spec: &DatabaseSpec,
    ) -> Result<DatabaseHandle, ProviderError> {
        let existing = self.provider.list_databases().await?;
        if let Some(db) = existing
            .into_iter()
            .find(|db| db.name == spec.name && db.status != DatabaseStatus::Error)
        {
            tracing::info!(database = %db.id, "adopting untracked database {}", db.name);
            return Ok(db);
        }
        self.provider.create_database(spec).await
    }

    async fn await_database(&self, record: &mut ServiceRecord) -> Result<(), DeployError> {
        let step = Step::AwaitDatabase;
        let Some(id) = record.database.as_ref().map(|db| db.id.clone()) else {
            return InvalidSpecSnafu {
                step,
                message: "no database recorded to wait for",
            }
            .fail();
        };

        let endpoint = poll_until(
            &self.settings.policies.database_ready,
            "database",
            || self.probe_database(&id),
        )
        .await
        .map_err(|e| wait_failed(e, step, format!("database {}", id)))?;

        if let Some(db) = record.database.as_mut() {
            db.endpoint = Some(endpoint);
        }
        tracing::info!(service = %record.name, database = %id, "database online");
        Ok(())
    }

    async fn probe_database(&self, id: &DatabaseId) -> Result<Probe<String>, DeployError> {
        let step = Step::AwaitDatabase;
        let handle = self
            .provider
            .describe_database(id)
            .await
            .context(ProviderSnafu { step })?;

        match (handle.status, handle.endpoint) {
            (DatabaseStatus::Online, Some(endpoint)) => Ok(Probe::Ready(endpoint)),
            (DatabaseStatus::Error, _) => ResourceFailedSnafu {
                step,
                resource: format!("database {}", id),
            }
            .fail(),
            (status, _) => Ok(Probe::NotYet(format!("database {} {}", id, status))),
        }
    }

    async fn build_image(&self, record: &mut ServiceRecord, kind: PlanKind) -> Result<(), DeployError> {
        let step = Step::BuildImage;
        let image = match &record.spec.context {
            None => {
                tracing::info!(service = %record.name, image = %record.spec.image, "using prebuilt image");
                record.spec.image.clone()
            }
            Some(context) => {
                let request = BuildRequest {
                    context: context.clone(),
                    dockerfile: record.spec.dockerfile.clone(),
                    image: record.spec.image.clone(),
                };
                let built = self
                    .registry
                    .build(&request)
                    .await
                    .context(RegistrySnafu { step })?;
                let pushed = retry(&self.settings.policies.provider_call, "push image", || {
                    self.registry.push(&built)
                })
                .await
                .context(RegistrySnafu { step })?;
                tracing::info!(service = %record.name, image = %pushed, "image pushed");
                pushed
            }
        };

        if kind == PlanKind::Redeploy {
            // A resumed redeploy may already have replaced `image`.
            record.previous_image = match &record.rollback {
                Some(point) => point.image.clone(),
                None => record.image.clone(),
            };
        }
        record.image = Some(image);
        Ok(())
    }

    fn run_spec(&self, record: &ServiceRecord, step: Step) -> Result<RunSpec, DeployError> {
        let image = record.image.as_ref().context(InvalidSpecSnafu {
            step,
            message: "no image has been built",
        })?;
        let database_url = record.database.as_ref().and_then(|db| db.endpoint.as_deref());
        RunSpec::from_spec(record.name.as_str(), image, &record.spec, database_url)
            .map_err(|message| DeployError::InvalidSpec { step, message })
    }

    async fn start_container(&self, record: &mut ServiceRecord) -> Result<(), DeployError> {
        let step = Step::StartContainer;
        let node = self.node_id(record, step)?;
        let run = self.run_spec(record, step)?;
        let retired = record.name.retired_container();

        let container = retry(
            &self.settings.policies.container_start,
            "start container",
            || self.start_once(&node, &run, &retired),
        )
        .await?;

        tracing::info!(service = %record.name, container = %container, "container started");
        record.container = Some(container);
        Ok(())
    }

    async fn start_once(
        &self,
        node: &NodeId,
        run: &RunSpec,
        retired: &str,
    ) -> Result<ContainerId, DeployError> {
        let step = Step::StartContainer;
        self.pull(node, &run.image, step).await?;
        // Leftovers from an interrupted launch or swap.
        self.exec(node, &self.docker.remove_if_exists(&run.name), step)
            .await?;
        self.exec(node, &self.docker.remove_if_exists(retired), step)
            .await?;
        let output = self.exec_checked(node, &self.docker.run(run), step).await?;
        Ok(ContainerId::new(output.stdout.trim()))
    }

    async fn replace_container(
        &self,
        record: &mut ServiceRecord,
        swap: &mut Swap,
        resumed: bool,
    ) -> Result<(), DeployError> {
        let step = Step::ReplaceContainer;
        let node = self.node_id(record, step)?;
        let run = self.run_spec(record, step)?;
        let name = record.name.as_str();
        let retired = record.name.retired_container();

        retry(&self.settings.policies.container_start, "pull image", || {
            self.pull(&node, &run.image, step)
        })
        .await?;

        if resumed && self.previous_set_aside(record, &node).await? {
            // An earlier run got past the rename; whatever holds the name is
            // its half-started replacement.
            tracing::info!(service = %record.name, "previous container already set aside as {}", retired);
            self.exec(&node, &self.docker.remove_if_exists(name), step)
                .await?;
            swap.old_stopped = true;
            swap.old_renamed = true;
        } else {
            self.exec(&node, &self.docker.remove_if_exists(&retired), step)
                .await?;

            let stopped = self.exec(&node, &self.docker.stop(name), step).await?;
            if stopped.success() {
                swap.old_stopped = true;
                self.exec_checked(&node, &self.docker.rename(name, &retired), step)
                    .await?;
                swap.old_renamed = true;
            } else {
                tracing::info!(service = %record.name, "no previous container to stop: {}", stopped.stderr.trim());
            }
        }

        swap.touched = true;
        let output = self
            .exec_checked(&node, &self.docker.run(&run), step)
            .await?;
        let container = ContainerId::new(output.stdout.trim());
        tracing::info!(service = %record.name, container = %container, "replacement container started");
        record.container = Some(container);
        Ok(())
    }

    /// The container the interrupted redeploy replaces already carries the
    /// retired name.
    async fn previous_set_aside(
        &self,
        record: &ServiceRecord,
        node: &NodeId,
    ) -> Result<bool, DeployError> {
        let Some(previous) = record.rollback.as_ref().and_then(|p| p.container.as_ref()) else {
            return Ok(false);
        };
        let output = self
            .exec(node, &self.docker.name_of(previous.as_str()), Step::ReplaceContainer)
            .await?;
        let retired = format!("/{}", record.name.retired_container());
        Ok(output.success() && output.stdout.trim() == retired)
    }

    async fn check_readiness(&self, record: &mut ServiceRecord) -> Result<(), DeployError> {
        let step = Step::CheckReadiness;
        let node = self.node_id(record, step)?;
        let name = record.name.to_string();
        let readiness = &record.spec.readiness;

        if !readiness.settle.is_zero() {
            tracing::debug!(service = %record.name, settle = ?readiness.settle, "letting container settle");
            tokio::time::sleep(readiness.settle).await;
        }

        let cmd = readiness.cmd.as_deref();
        let result = poll_until(&self.settings.policies.readiness, "container", || {
            self.probe_container(&node, &name, cmd)
        })
        .await;

        match result {
            Ok(()) => {
                tracing::info!(service = %record.name, "container ready");
                Ok(())
            }
            Err(e) => {
                let err = wait_failed(e, step, format!("container {}", name));
                Err(self.with_logs(&node, &name, err).await)
            }
        }
    }

    async fn probe_container(
        &self,
        node: &NodeId,
        name: &str,
        cmd: Option<&str>,
    ) -> Result<Probe<()>, DeployError> {
        let step = Step::CheckReadiness;
        let output = self.exec(node, &self.docker.status(name), step).await?;
        if !output.success() {
            return Ok(Probe::NotYet(format!(
                "container not inspectable: {}",
                output.stderr.trim()
            )));
        }

        match output.stdout.trim() {
            "running" => {
                let Some(cmd) = cmd else {
                    return Ok(Probe::Ready(()));
                };
                let check = self
                    .exec(node, &self.docker.exec_shell(name, cmd), step)
                    .await?;
                if check.success() {
                    Ok(Probe::Ready(()))
                } else {
                    Ok(Probe::NotYet(format!(
                        "readiness command exited with status {}",
                        check.exit_code
                    )))
                }
            }
            state @ ("exited" | "dead") => NotReadySnafu {
                step,
                container: name,
                reason: format!("container {}", state),
                logs: String::new(),
            }
            .fail(),
            other => Ok(Probe::NotYet(format!("container {}", other))),
        }
    }

    /// Turn a readiness failure into `NotReady` carrying the container's last output.
    async fn with_logs(&self, node: &NodeId, name: &str, err: DeployError) -> DeployError {
        let logs = match self
            .provider
            .exec_remote(node, &self.docker.logs(name, FAILURE_LOG_LINES))
            .await
        {
            Ok(output) => output.stdout,
            Err(e) => {
                tracing::debug!(container = name, "could not fetch container logs: {}", e);
                String::new()
            }
        };

        let reason = match err {
            DeployError::NotReady { reason, .. } => reason,
            other => other.to_string(),
        };
        DeployError::NotReady {
            step: Step::CheckReadiness,
            container: name.to_string(),
            reason,
            logs,
        }
    }

    /// Remove the previous container. Failure leaves it stopped and is only a warning.
    async fn retire_container(&self, record: &ServiceRecord, diag: &mut Diagnostics) {
        let retired = record.name.retired_container();
        let Some(node) = record.node().map(|n| n.id.clone()) else {
            return;
        };

        match self
            .provider
            .exec_remote(&node, &self.docker.remove(&retired))
            .await
        {
            Ok(output) if output.success() => {
                tracing::info!(service = %record.name, "previous container removed");
            }
            Ok(output) => diag.warn(Warning::container_retire(format!(
                "previous container {} was not removed: {}",
                retired,
                output.stderr.trim()
            ))),
            Err(e) => diag.warn(Warning::container_retire(format!(
                "previous container {} was not removed: {}",
                retired, e
            ))),
        }
    }

    /// Delete everything the record owns, archive it and drop it from the store.
    ///
    /// Deletion failures do not stop the teardown; they end up as warnings on
    /// the archived record.
    pub async fn teardown(
        &self,
        mut record: ServiceRecord,
        diag: &mut Diagnostics,
    ) -> Result<TeardownReport, DeployError> {
        let policy = &self.settings.policies.provider_call;
        record.status = ServiceStatus::Terminating;
        record.last_error = None;
        self.commit(&mut record)?;

        let mut deleted_nodes = Vec::new();
        for node in &record.nodes {
            let id = &node.id;
            match retry(policy, "delete node", || self.provider.delete_node(id)).await {
                Ok(()) => deleted_nodes.push(id.clone()),
                Err(e) if e.is_not_found() => {
                    tracing::debug!(node = %id, "node already gone");
                    deleted_nodes.push(id.clone());
                }
                Err(e) => diag.warn(Warning::resource_cleanup(format!(
                    "node {} ({}) was not deleted: {}",
                    id, node.name, e
                ))),
            }
        }

        let mut deleted_database = None;
        if let Some(db) = &record.database {
            if !db.owned {
                diag.warn(Warning::resource_retained(format!(
                    "database {} was attached, not created, and is kept",
                    db.name
                )));
            } else {
                let users: Vec<String> = self
                    .store
                    .referencing_database(&db.id)
                    .context(StateSnafu)?
                    .into_iter()
                    .filter(|name| *name != record.name)
                    .map(|name| name.to_string())
                    .collect();

                if !users.is_empty() {
                    diag.warn(Warning::resource_retained(format!(
                        "database {} is kept, still used by {}",
                        db.name,
                        users.join(", ")
                    )));
                } else {
                    let id = &db.id;
                    match retry(policy, "delete database", || {
                        self.provider.delete_database(id)
                    })
                    .await
                    {
                        Ok(()) => deleted_database = Some(id.clone()),
                        Err(e) if e.is_not_found() => deleted_database = Some(id.clone()),
                        Err(e) => diag.warn(Warning::resource_cleanup(format!(
                            "database {} was not deleted: {}",
                            db.name, e
                        ))),
                    }
                }
            }
        }

        record.warnings = diag.messages();
        record.status = ServiceStatus::Absent;
        record.touch();
        let archived = self.store.archive(&record).context(StateSnafu)?;
        self.store.delete(&record.name).context(StateSnafu)?;

        tracing::info!(service = %record.name, warnings = record.warnings.len(), "service terminated");
        Ok(TeardownReport {
            archived,
            deleted_nodes,
            deleted_database,
        })
    }

    fn node_id(&self, record: &ServiceRecord, step: Step) -> Result<NodeId, DeployError> {
        record
            .node()
            .map(|n| n.id.clone())
            .ok_or(DeployError::MissingNode { step })
    }

    async fn exec(
        &self,
        node: &NodeId,
        command: &str,
        step: Step,
    ) -> Result<CommandOutput, DeployError> {
        tracing::debug!(node = %node, "remote: {}", command);
        self.provider
            .exec_remote(node, command)
            .await
            .context(ProviderSnafu { step })
    }

    /// Like [`exec`](Self::exec), but a non-zero exit is an error.
    async fn exec_checked(
        &self,
        node: &NodeId,
        command: &str,
        step: Step,
    ) -> Result<CommandOutput, DeployError> {
        let output = self.exec(node, command, step).await?;
        check_exit(output, command, step)
    }

    async fn pull(&self, node: &NodeId, image: &ImageRef, step: Step) -> Result<(), DeployError> {
        if let Some(credentials) = &self.settings.registry_login {
            let (command, password) = self.docker.login(credentials);
            let output = self
                .provider
                .exec_remote_with_input(node, &command, &password)
                .await
                .context(ProviderSnafu { step })?;
            check_exit(output, &command, step)?;
        }
        self.exec_checked(node, &self.docker.pull(image), step)
            .await?;
        Ok(())
    }
}

fn check_exit(output: CommandOutput, command: &str, step: Step) -> Result<CommandOutput, DeployError> {
    if output.success() {
        Ok(output)
    } else {
        Err(DeployError::Remote {
            step,
            command: command.to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

fn online_endpoint(handle: &DatabaseHandle) -> Option<String> {
    match handle.status {
        DatabaseStatus::Online => handle.endpoint.clone(),
        _ => None,
    }
}

fn wait_failed(err: WaitError<DeployError>, step: Step, what: String) -> DeployError {
    match err {
        WaitError::TimedOut { waited, last } => DeployError::Timeout {
            step,
            what,
            waited,
            last,
        },
        WaitError::Failed(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_zero_exit_becomes_remote_error() {
        let output = CommandOutput {
            exit_code: 125,
            stdout: String::new(),
            stderr: "Conflict. The container name \"/web\" is already in use\n".into(),
        };
        let err = check_exit(output, "docker run", Step::StartContainer).unwrap_err();
        match err {
            DeployError::Remote {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 125);
                assert!(!stderr.ends_with('\n'));
            }
            other => panic!("expected Remote, got {:?}", other),
        }
    }

    #[test]
    fn endpoint_only_when_online() {
        let mut handle = DatabaseHandle {
            id: DatabaseId::new("db-1"),
            name: "web-db".into(),
            engine: "pg".into(),
            status: DatabaseStatus::Creating,
            endpoint: Some("postgresql://doadmin@web-db:25060/defaultdb".into()),
            size: "db-s-1vcpu-1gb".into(),
            region: "ams3".into(),
        };
        assert_eq!(online_endpoint(&handle), None);
        handle.status = DatabaseStatus::Online;
        assert!(online_endpoint(&handle).is_some());
    }

    #[test]
    fn timeout_keeps_last_observation() {
        let err = wait_failed(
            WaitError::TimedOut {
                waited: std::time::Duration::from_secs(300),
                last: "node 42 provisioning".into(),
            },
            Step::AwaitNode,
            "node 42".into(),
        );
        assert!(err.to_string().contains("node 42 provisioning"));
        assert_eq!(err.step(), Some(Step::AwaitNode));
    }
}
