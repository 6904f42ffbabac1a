// ABOUTME: User-facing operations: launch, redeploy, terminate, log, list and node/database management.
// ABOUTME: Each intent takes the service lock, loads the record and hands it to the reconciler.

use crate::deploy::{DeployError, Reconciler, ReconcilerSettings, TeardownReport};
use crate::diagnostics::{Diagnostics, Warning};
use crate::error::{ErrorClass, deploy_class, provider_class, registry_class, state_class};
use crate::provider::{
    DatabaseHandle, DatabaseSpec, LogStream, NodeHandle, NodeSpec, ProviderClient, ProviderError,
};
use crate::registry::{BuildRequest, RegistryClient, RegistryError};
use crate::retry::retry;
use crate::state::{ServiceLock, ServiceRecord, ServiceSpec, ServiceStatus, StateError, StateStore};
use crate::types::{DatabaseId, ImageRef, NodeId, ServiceName};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// One operator request, with validated arguments.
#[derive(Debug, Clone)]
pub enum Intent {
    Launch {
        name: ServiceName,
        spec: ServiceSpec,
        force: bool,
    },
    Redeploy {
        name: ServiceName,
        spec: ServiceSpec,
        force: bool,
    },
    Terminate {
        name: ServiceName,
        force: bool,
    },
    Log {
        name: ServiceName,
        tail: Option<u64>,
    },
    List,
    Build {
        spec: ServiceSpec,
    },
    NodeList,
    NodeCreate {
        spec: NodeSpec,
    },
    NodeDestroy {
        id: NodeId,
    },
    DatabaseList,
    DatabaseCreate {
        spec: DatabaseSpec,
    },
    DatabaseDestroy {
        id: DatabaseId,
    },
}

/// What a successful intent produced.
pub enum Outcome {
    Deployed(Box<ServiceRecord>),
    /// `report` is `None` when there was nothing to terminate.
    Terminated {
        name: ServiceName,
        report: Option<TeardownReport>,
    },
    Log(LogStream),
    Services(Vec<ServiceRecord>),
    Built(ImageRef),
    Nodes(Vec<NodeHandle>),
    NodeCreated(NodeHandle),
    NodeDestroyed(NodeId),
    Databases(Vec<DatabaseHandle>),
    DatabaseCreated(DatabaseHandle),
    DatabaseDestroyed(DatabaseId),
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Deployed(record) => f.debug_tuple("Deployed").field(record).finish(),
            Outcome::Terminated { name, report } => f
                .debug_struct("Terminated")
                .field("name", name)
                .field("report", report)
                .finish(),
            Outcome::Log(_) => f.write_str("Log(..)"),
            Outcome::Services(records) => f.debug_tuple("Services").field(records).finish(),
            Outcome::Built(image) => f.debug_tuple("Built").field(image).finish(),
            Outcome::Nodes(nodes) => f.debug_tuple("Nodes").field(nodes).finish(),
            Outcome::NodeCreated(node) => f.debug_tuple("NodeCreated").field(node).finish(),
            Outcome::NodeDestroyed(id) => f.debug_tuple("NodeDestroyed").field(id).finish(),
            Outcome::Databases(dbs) => f.debug_tuple("Databases").field(dbs).finish(),
            Outcome::DatabaseCreated(db) => f.debug_tuple("DatabaseCreated").field(db).finish(),
            Outcome::DatabaseDestroyed(id) => {
                f.debug_tuple("DatabaseDestroyed").field(id).finish()
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("service {name} already exists ({status})")]
    AlreadyExists {
        name: ServiceName,
        status: ServiceStatus,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{resource} is still used by {}", .services.join(", "))]
    ResourceInUse {
        resource: String,
        services: Vec<String>,
    },

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ControllerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ControllerError::AlreadyExists { .. }
            | ControllerError::NotFound(_)
            | ControllerError::InvalidState(_)
            | ControllerError::InvalidRequest(_) => ErrorClass::User,
            ControllerError::ResourceInUse { .. } => ErrorClass::ResourceInUse,
            ControllerError::Deploy(e) => deploy_class(e),
            ControllerError::State(e) => state_class(e),
            ControllerError::Provider(e) => provider_class(e),
            ControllerError::Registry(e) => registry_class(e),
        }
    }
}

/// Translates intents into reconciler runs and store queries.
///
/// Holds no state of its own beyond its collaborators; two controllers over
/// the same state directory coordinate through the per-service lock.
pub struct ServiceController<P: ?Sized, R: ?Sized> {
    provider: Arc<P>,
    registry: Arc<R>,
    store: StateStore,
    settings: ReconcilerSettings,
}

impl<P, R> ServiceController<P, R>
where
    P: ProviderClient + ?Sized,
    R: RegistryClient + ?Sized,
{
    pub fn new(
        provider: Arc<P>,
        registry: Arc<R>,
        store: StateStore,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            provider,
            registry,
            store,
            settings,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn reconciler(&self) -> Reconciler<'_, P, R> {
        Reconciler::new(&*self.provider, &*self.registry, &self.store, &self.settings)
    }

    pub async fn handle(
        &self,
        intent: Intent,
        diag: &mut Diagnostics,
    ) -> Result<Outcome, ControllerError> {
        match intent {
            Intent::Launch { name, spec, force } => self
                .launch(name, spec, force, diag)
                .await
                .map(|r| Outcome::Deployed(Box::new(r))),
            Intent::Redeploy { name, spec, force } => self
                .redeploy(name, spec, force, diag)
                .await
                .map(|r| Outcome::Deployed(Box::new(r))),
            Intent::Terminate { name, force } => {
                let report = self.terminate(&name, force, diag).await?;
                Ok(Outcome::Terminated { name, report })
            }
            Intent::Log { name, tail } => self.log(&name, tail).await.map(Outcome::Log),
            Intent::List => Ok(Outcome::Services(self.store.list()?)),
            Intent::Build { spec } => self.build(&spec).await.map(Outcome::Built),
            Intent::NodeList => Ok(Outcome::Nodes(self.provider.list_nodes(None).await?)),
            Intent::NodeCreate { spec } => {
                Ok(Outcome::NodeCreated(self.provider.create_node(&spec).await?))
            }
            Intent::NodeDestroy { id } => {
                self.destroy_node(&id).await?;
                Ok(Outcome::NodeDestroyed(id))
            }
            Intent::DatabaseList => Ok(Outcome::Databases(self.provider.list_databases().await?)),
            Intent::DatabaseCreate { spec } => Ok(Outcome::DatabaseCreated(
                self.provider.create_database(&spec).await?,
            )),
            Intent::DatabaseDestroy { id } => {
                self.destroy_database(&id).await?;
                Ok(Outcome::DatabaseDestroyed(id))
            }
        }
    }

    /// Launch a new service, or resume one whose previous launch failed or was interrupted.
    pub async fn launch(
        &self,
        name: ServiceName,
        spec: ServiceSpec,
        force: bool,
        diag: &mut Diagnostics,
    ) -> Result<ServiceRecord, ControllerError> {
        let lock = self.lock(&name, force, diag)?;

        let mut record = match self.store.get(&name)? {
            Some(existing)
                if matches!(
                    existing.status,
                    ServiceStatus::Running | ServiceStatus::Terminating
                ) =>
            {
                return Err(ControllerError::AlreadyExists {
                    name,
                    status: existing.status,
                });
            }
            Some(existing) if existing.status != ServiceStatus::Absent => {
                tracing::info!(service = %name, status = %existing.status, "resuming previous launch");
                let mut existing = existing;
                existing.spec = spec;
                existing
            }
            _ => ServiceRecord::new(name, spec),
        };

        self.reconciler().launch(&mut record, diag).await?;
        release(lock, diag);
        Ok(record)
    }

    /// Rebuild and replace the container of an existing service on its current node.
    pub async fn redeploy(
        &self,
        name: ServiceName,
        spec: ServiceSpec,
        force: bool,
        diag: &mut Diagnostics,
    ) -> Result<ServiceRecord, ControllerError> {
        let lock = self.lock(&name, force, diag)?;

        let mut record = self
            .store
            .get(&name)?
            .filter(|r| r.status != ServiceStatus::Absent)
            .ok_or_else(|| ControllerError::NotFound(format!("service {}", name)))?;

        self.reconciler().redeploy(&mut record, spec, diag).await?;
        release(lock, diag);
        Ok(record)
    }

    /// Tear the service down. Terminating a service that does not exist succeeds.
    pub async fn terminate(
        &self,
        name: &ServiceName,
        force: bool,
        diag: &mut Diagnostics,
    ) -> Result<Option<TeardownReport>, ControllerError> {
        let lock = self.lock(name, force, diag)?;

        let Some(record) = self.store.get(name)? else {
            tracing::info!(service = %name, "nothing to terminate");
            release(lock, diag);
            return Ok(None);
        };

        let report = self.reconciler().teardown(record, diag).await?;
        release(lock, diag);
        Ok(Some(report))
    }

    /// Stream the container log from the service's node.
    pub async fn log(
        &self,
        name: &ServiceName,
        tail: Option<u64>,
    ) -> Result<LogStream, ControllerError> {
        let record = self
            .store
            .get(name)?
            .ok_or_else(|| ControllerError::NotFound(format!("service {}", name)))?;
        let node = record
            .node()
            .ok_or_else(|| ControllerError::NotFound(format!("node of service {}", name)))?;

        let gone = |e: ProviderError| {
            if e.is_not_found() {
                ControllerError::NotFound(format!("node {} of service {}", node.id, name))
            } else {
                ControllerError::Provider(e)
            }
        };
        self.provider.describe_node(&node.id).await.map_err(gone)?;
        self.provider
            .fetch_log(&node.id, name.as_str(), tail)
            .await
            .map_err(gone)
    }

    /// Build and push a service image outside of any deployment.
    pub async fn build(&self, spec: &ServiceSpec) -> Result<ImageRef, ControllerError> {
        let Some(context) = &spec.context else {
            return Err(ControllerError::InvalidRequest(format!(
                "{} has no build context",
                spec.image
            )));
        };
        let request = BuildRequest {
            context: context.clone(),
            dockerfile: spec.dockerfile.clone(),
            image: spec.image.clone(),
        };
        let built = self.registry.build(&request).await?;
        let pushed = retry(&self.settings.policies.provider_call, "push image", || {
            self.registry.push(&built)
        })
        .await?;
        Ok(pushed)
    }

    async fn destroy_node(&self, id: &NodeId) -> Result<(), ControllerError> {
        let users = self.store.referencing_node(id)?;
        if !users.is_empty() {
            return Err(ControllerError::ResourceInUse {
                resource: format!("node {}", id),
                services: users.iter().map(ToString::to_string).collect(),
            });
        }
        self.provider.delete_node(id).await?;
        Ok(())
    }

    async fn destroy_database(&self, id: &DatabaseId) -> Result<(), ControllerError> {
        let users = self.store.referencing_database(id)?;
        if !users.is_empty() {
            return Err(ControllerError::ResourceInUse {
                resource: format!("database {}", id),
                services: users.iter().map(ToString::to_string).collect(),
            });
        }
        self.provider.delete_database(id).await?;
        Ok(())
    }

    fn lock(
        &self,
        name: &ServiceName,
        force: bool,
        diag: &mut Diagnostics,
    ) -> Result<ServiceLock, ControllerError> {
        match self.store.lock(name, force) {
            Ok(lock) => {
                if let Some(broken) = lock.broken() {
                    diag.warn(Warning::lock_break(format!("{}: {}", name, broken)));
                }
                Ok(lock)
            }
            Err(StateError::LockHeld {
                holder,
                pid,
                started_at,
                ..
            }) => Err(ControllerError::InvalidState(format!(
                "another operation on {} is in progress (pid {} on {} since {}); use --force if it is gone",
                name, pid, holder, started_at
            ))),
            Err(StateError::LockPending { since, .. }) => Err(ControllerError::InvalidState(format!(
                "another operation on {} is acquiring its lock (since {}); use --force if it is gone",
                name, since
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

fn release(lock: ServiceLock, diag: &mut Diagnostics) {
    let service = lock.service().clone();
    if let Err(e) = lock.release() {
        diag.warn(Warning::lock_release(format!("{}: {}", service, e)));
    }
}
