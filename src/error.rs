// ABOUTME: Application-wide error type for the shipyard binary and configuration loading.
// ABOUTME: Classifies every failure as user, infrastructure or resource-in-use for exit codes.

use crate::controller::ControllerError;
use crate::deploy::{DeployError, DeployErrorKind};
use crate::provider::ProviderError;
use crate::registry::RegistryError;
use crate::retry::Transient;
use crate::state::StateError;
use crate::types::{ParseImageRefError, ServiceNameError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("file already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("configuration file not found (looked in {0})")]
    ConfigNotFound(String),

    #[error("service configuration not found: {0}")]
    ServiceConfigNotFound(PathBuf),

    #[error("{key}: environment variable {var} is not set and has no default")]
    MissingEnvVar { key: String, var: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid service name: {0}")]
    ServiceName(#[from] ServiceNameError),

    #[error("invalid image reference: {0}")]
    ImageRef(#[from] ParseImageRefError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("interrupted; the service keeps its last committed state")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How a failure is reported to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input, unknown or duplicate name. Never retried.
    User,
    /// Network trouble or rate limiting that outlasted the retry budget.
    TransientInfra,
    /// Build failure, rejected request, resource error, exhausted waits.
    FatalInfra,
    /// A destructive operation refused because the resource is still referenced.
    ResourceInUse,
}

impl ErrorClass {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorClass::User => 2,
            ErrorClass::ResourceInUse => 3,
            ErrorClass::TransientInfra | ErrorClass::FatalInfra => 1,
        }
    }

    pub fn is_infrastructure(self) -> bool {
        matches!(self, ErrorClass::TransientInfra | ErrorClass::FatalInfra)
    }
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Controller(e) => e.class(),
            Error::Provider(e) => provider_class(e),
            Error::Registry(e) => registry_class(e),
            Error::State(e) => state_class(e),
            Error::Io(_) | Error::Interrupted => ErrorClass::FatalInfra,
            Error::AlreadyExists(_)
            | Error::ConfigNotFound(_)
            | Error::ServiceConfigNotFound(_)
            | Error::MissingEnvVar { .. }
            | Error::InvalidConfig(_)
            | Error::ServiceName(_)
            | Error::ImageRef(_)
            | Error::Yaml(_) => ErrorClass::User,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Interrupted => 130,
            other => other.class().exit_code(),
        }
    }
}

pub(crate) fn provider_class(err: &ProviderError) -> ErrorClass {
    match err {
        ProviderError::NotFound { .. } | ProviderError::Config(_) => ErrorClass::User,
        e if e.is_transient() => ErrorClass::TransientInfra,
        _ => ErrorClass::FatalInfra,
    }
}

pub(crate) fn registry_class(err: &RegistryError) -> ErrorClass {
    match err {
        RegistryError::Context { .. } => ErrorClass::User,
        RegistryError::PushFailed { .. } | RegistryError::Unavailable(_) => ErrorClass::TransientInfra,
        _ => ErrorClass::FatalInfra,
    }
}

pub(crate) fn state_class(err: &StateError) -> ErrorClass {
    match err {
        StateError::NotFound(_)
        | StateError::LockHeld { .. }
        | StateError::LockPending { .. } => ErrorClass::User,
        _ => ErrorClass::FatalInfra,
    }
}

pub(crate) fn deploy_class(err: &DeployError) -> ErrorClass {
    match err.kind() {
        DeployErrorKind::InvalidSpec => ErrorClass::User,
        _ => ErrorClass::FatalInfra,
    }
}
