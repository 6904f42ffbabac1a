// ABOUTME: Reconciliation error types with SNAFU context selectors.
// ABOUTME: Every failure names the plan step it came from; kind() supports programmatic handling.

use super::plan::Step;
use crate::provider::ProviderError;
use crate::registry::RegistryError;
use crate::retry::Transient;
use crate::state::StateError;
use crate::types::ImageRef;
use snafu::Snafu;
use std::time::Duration;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DeployError {
    #[snafu(display("{step}: provider call failed: {source}"))]
    Provider { step: Step, source: ProviderError },

    #[snafu(display("{step}: image registry failed: {source}"))]
    Registry { step: Step, source: RegistryError },

    #[snafu(display("{step}: gave up waiting for {what} after {waited:?}, last seen: {last}"))]
    Timeout {
        step: Step,
        what: String,
        waited: Duration,
        last: String,
    },

    #[snafu(display("{step}: {resource} entered error state"))]
    ResourceFailed { step: Step, resource: String },

    #[snafu(display("{step}: `{command}` exited with status {exit_code}: {stderr}"))]
    Remote {
        step: Step,
        command: String,
        exit_code: u32,
        stderr: String,
    },

    #[snafu(display("{step}: container {container} is not ready: {reason}"))]
    NotReady {
        step: Step,
        container: String,
        reason: String,
        logs: String,
    },

    #[snafu(display("{step}: invalid service spec: {message}"))]
    InvalidSpec { step: Step, message: String },

    #[snafu(display("{step}: service has no node"))]
    MissingNode { step: Step },

    #[snafu(display("checking {resource} against the provider failed: {source}"))]
    Refresh {
        resource: String,
        source: ProviderError,
    },

    #[snafu(display("state store: {source}"))]
    State { source: StateError },

    #[snafu(display("redeploy failed, still running {image}: {cause}"))]
    RolledBack {
        image: String,
        cause: Box<DeployError>,
    },

    #[snafu(display("redeploy failed ({cause}) and restoring the previous container failed: {rollback}"))]
    RollbackFailed {
        cause: Box<DeployError>,
        rollback: Box<DeployError>,
    },
}

/// Error kind for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployErrorKind {
    Provider,
    Registry,
    Timeout,
    ResourceFailed,
    RemoteCommand,
    NotReady,
    InvalidSpec,
    MissingNode,
    Refresh,
    State,
    RolledBack,
    RollbackFailed,
}

impl DeployError {
    pub fn kind(&self) -> DeployErrorKind {
        match self {
            DeployError::Provider { .. } => DeployErrorKind::Provider,
            DeployError::Registry { .. } => DeployErrorKind::Registry,
            DeployError::Timeout { .. } => DeployErrorKind::Timeout,
            DeployError::ResourceFailed { .. } => DeployErrorKind::ResourceFailed,
            DeployError::Remote { .. } => DeployErrorKind::RemoteCommand,
            DeployError::NotReady { .. } => DeployErrorKind::NotReady,
            DeployError::InvalidSpec { .. } => DeployErrorKind::InvalidSpec,
            DeployError::MissingNode { .. } => DeployErrorKind::MissingNode,
            DeployError::Refresh { .. } => DeployErrorKind::Refresh,
            DeployError::State { .. } => DeployErrorKind::State,
            DeployError::RolledBack { .. } => DeployErrorKind::RolledBack,
            DeployError::RollbackFailed { .. } => DeployErrorKind::RollbackFailed,
        }
    }

    /// The step that failed, when the error belongs to one.
    pub fn step(&self) -> Option<Step> {
        match self {
            DeployError::Provider { step, .. }
            | DeployError::Registry { step, .. }
            | DeployError::Timeout { step, .. }
            | DeployError::ResourceFailed { step, .. }
            | DeployError::Remote { step, .. }
            | DeployError::NotReady { step, .. }
            | DeployError::InvalidSpec { step, .. }
            | DeployError::MissingNode { step } => Some(*step),
            DeployError::RolledBack { cause, .. } | DeployError::RollbackFailed { cause, .. } => {
                cause.step()
            }
            DeployError::Refresh { .. } | DeployError::State { .. } => None,
        }
    }

    /// Text recorded as the service's last error, including captured container output.
    pub fn diagnostic(&self) -> String {
        match self {
            DeployError::NotReady { logs, .. } if !logs.trim().is_empty() => {
                format!("{}\n--- last container output ---\n{}", self, logs.trim_end())
            }
            DeployError::RolledBack { cause, .. } => cause.diagnostic(),
            _ => self.to_string(),
        }
    }

    pub(crate) fn rolled_back(image: Option<&ImageRef>, cause: DeployError) -> Self {
        DeployError::RolledBack {
            image: image.map_or_else(|| "previous container".to_string(), ToString::to_string),
            cause: Box::new(cause),
        }
    }
}

impl Transient for DeployError {
    /// Remote command failures during container start are usually registry
    /// or network trouble and worth another attempt.
    fn is_transient(&self) -> bool {
        match self {
            DeployError::Provider { source, .. } | DeployError::Refresh { source, .. } => {
                source.is_transient()
            }
            DeployError::Registry { source, .. } => source.is_transient(),
            DeployError::Remote { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_step_are_exposed() {
        let err = DeployError::MissingNode {
            step: Step::StartContainer,
        };
        assert_eq!(err.kind(), DeployErrorKind::MissingNode);
        assert_eq!(err.step(), Some(Step::StartContainer));
        assert_eq!(err.to_string(), "start-container: service has no node");
    }

    #[test]
    fn rolled_back_reports_inner_step() {
        let cause = DeployError::Remote {
            step: Step::ReplaceContainer,
            command: "docker run".into(),
            exit_code: 125,
            stderr: "port is already allocated".into(),
        };
        let err = DeployError::rolled_back(None, cause);
        assert_eq!(err.kind(), DeployErrorKind::RolledBack);
        assert_eq!(err.step(), Some(Step::ReplaceContainer));
    }

    #[test]
    fn diagnostic_includes_container_logs() {
        let err = DeployError::NotReady {
            step: Step::CheckReadiness,
            container: "web".into(),
            reason: "container exited".into(),
            logs: "panic: missing DATABASE_URL\n".into(),
        };
        let text = err.diagnostic();
        assert!(text.contains("container exited"));
        assert!(text.ends_with("panic: missing DATABASE_URL"));
    }

    #[test]
    fn build_failures_are_not_retried() {
        let err = DeployError::Registry {
            step: Step::BuildImage,
            source: RegistryError::BuildFailed {
                image: "web:v1".into(),
                message: "RUN cargo build exited 101".into(),
            },
        };
        assert!(!err.is_transient());
    }
}
