// ABOUTME: Image build and push abstraction.
// ABOUTME: A build yields a tagged ImageRef; a push yields the same reference pinned to its digest.

mod docker;

pub use docker::DockerRegistry;

use crate::retry::Transient;
use crate::types::ImageRef;
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot read build context {path}: {reason}")]
    Context { path: PathBuf, reason: String },

    #[error("build of {image} failed: {message}")]
    BuildFailed { image: String, message: String },

    #[error("push of {image} failed: {message}")]
    PushFailed { image: String, message: String },

    #[error("registry refused credentials for {image}: {message}")]
    Unauthorized { image: String, message: String },

    #[error("registry reported no digest for {0}")]
    NoDigest(String),

    #[error("container engine unavailable: {0}")]
    Unavailable(String),
}

impl Transient for RegistryError {
    /// A broken build stays broken; pushes and daemon hiccups may recover.
    fn is_transient(&self) -> bool {
        matches!(self, Self::PushFailed { .. } | Self::Unavailable(_))
    }
}

/// Credentials for the image registry. Also used for `docker login` on nodes.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    /// Registry host; Docker Hub when None.
    pub server: Option<String>,
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("server", &self.server)
            .finish()
    }
}

/// What to build and under which name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub context: PathBuf,
    /// Dockerfile path relative to the context.
    pub dockerfile: String,
    pub image: ImageRef,
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Build the image and tag it locally as `request.image`.
    async fn build(&self, request: &BuildRequest) -> Result<ImageRef, RegistryError>;

    /// Push a built image, returning the reference pinned to the pushed digest.
    async fn push(&self, image: &ImageRef) -> Result<ImageRef, RegistryError>;
}
