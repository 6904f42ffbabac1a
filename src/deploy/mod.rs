// ABOUTME: Service reconciliation: plans, their execution against provider and registry, and teardown.
// ABOUTME: Exports the reconciler, plan types and the docker command builder used on nodes.

mod container;
mod error;
mod plan;
mod reconciler;

pub use container::{DockerCli, FAILURE_LOG_LINES, PortMapping, Protocol, RunSpec, VolumeMount};
pub use error::{DeployError, DeployErrorKind};
pub use plan::{DeploymentPlan, PlanKind, Step, database_name};
pub use reconciler::{Reconciler, ReconcilerSettings, TeardownReport};
