// ABOUTME: RegistryClient backed by the local Docker daemon through bollard.
// ABOUTME: Tars the build context, streams build output, pushes and reads back the repo digest.

use super::{BuildRequest, RegistryClient, RegistryCredentials, RegistryError};
use crate::types::ImageRef;
use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::query_parameters::{BuildImageOptions, PushImageOptions};
use futures::StreamExt;
use std::path::{Path, PathBuf};

pub struct DockerRegistry {
    client: Docker,
    credentials: Option<RegistryCredentials>,
}

impl std::fmt::Debug for DockerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRegistry")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl DockerRegistry {
    /// Connect to the daemon named by DOCKER_HOST, or the platform default socket.
    pub fn connect(credentials: Option<RegistryCredentials>) -> Result<Self, RegistryError> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            credentials,
        })
    }

    /// Check the daemon answers.
    pub async fn ping(&self) -> Result<(), RegistryError> {
        self.client
            .ping()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn docker_credentials(&self) -> Option<DockerCredentials> {
        self.credentials.as_ref().map(|c| DockerCredentials {
            username: Some(c.username.clone()),
            password: Some(c.password.clone()),
            serveraddress: c.server.clone(),
            ..Default::default()
        })
    }

    async fn repo_digest(&self, image: &ImageRef) -> Result<String, RegistryError> {
        let tagged = image.tagged();
        let inspect = self
            .client
            .inspect_image(&tagged)
            .await
            .map_err(|e| RegistryError::Unavailable(format!("inspect {}: {}", tagged, e)))?;

        let repository = image.repository();
        inspect
            .repo_digests
            .unwrap_or_default()
            .iter()
            .find_map(|entry| digest_for(entry, &repository))
            .ok_or(RegistryError::NoDigest(tagged))
    }
}

/// Extract the digest from a `repo@sha256:…` entry belonging to `repository`.
fn digest_for(entry: &str, repository: &str) -> Option<String> {
    let (repo, digest) = entry.split_once('@')?;
    let matches = repo == repository
        // Docker Hub entries may carry an implicit prefix.
        || repo.strip_prefix("docker.io/") == Some(repository)
        || repo.strip_prefix("docker.io/library/") == Some(repository);
    matches.then(|| digest.to_string())
}

/// Pack the build context directory into an in-memory tar archive.
fn pack_context(context: &Path) -> Result<Vec<u8>, RegistryError> {
    let context_error = |e: std::io::Error| RegistryError::Context {
        path: context.to_path_buf(),
        reason: e.to_string(),
    };

    if !context.is_dir() {
        return Err(RegistryError::Context {
            path: context.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }

    let mut archive = tar::Builder::new(Vec::new());
    archive.follow_symlinks(false);
    archive.append_dir_all(".", context).map_err(context_error)?;
    archive.into_inner().map_err(context_error)
}

async fn pack_context_blocking(context: PathBuf) -> Result<Vec<u8>, RegistryError> {
    let path = context.clone();
    tokio::task::spawn_blocking(move || pack_context(&path))
        .await
        .map_err(|e| RegistryError::Context {
            path: context,
            reason: e.to_string(),
        })?
}

#[async_trait]
impl RegistryClient for DockerRegistry {
    async fn build(&self, request: &BuildRequest) -> Result<ImageRef, RegistryError> {
        let tagged = request.image.tagged();
        let archive = pack_context_blocking(request.context.clone()).await?;
        tracing::info!(image = %tagged, context = %request.context.display(), bytes = archive.len(), "building image");

        let options = BuildImageOptions {
            dockerfile: request.dockerfile.clone(),
            t: Some(tagged.clone()),
            rm: true,
            ..Default::default()
        };

        let mut output = self.client.build_image(
            options,
            None,
            Some(bollard::body_full(archive.into())),
        );

        while let Some(step) = output.next().await {
            match step {
                Ok(info) => {
                    if let Some(detail) = info.error_detail {
                        return Err(RegistryError::BuildFailed {
                            image: tagged,
                            message: detail.message.unwrap_or_else(|| "unknown error".to_string()),
                        });
                    }
                    if let Some(line) = info.stream {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            tracing::debug!(image = %tagged, "{}", line);
                        }
                    }
                }
                Err(bollard::errors::Error::DockerStreamError { error }) => {
                    return Err(RegistryError::BuildFailed {
                        image: tagged,
                        message: error,
                    });
                }
                Err(e) => return Err(RegistryError::Unavailable(e.to_string())),
            }
        }

        Ok(request.image.with_tag(request.image.tag().unwrap_or("latest")))
    }

    async fn push(&self, image: &ImageRef) -> Result<ImageRef, RegistryError> {
        let tagged = image.tagged();
        let options = PushImageOptions {
            tag: image.tag().map(str::to_string),
            ..Default::default()
        };
        tracing::info!(image = %tagged, "pushing image");

        let mut progress =
            self.client
                .push_image(&image.repository(), Some(options), self.docker_credentials());

        while let Some(step) = progress.next().await {
            let info = step.map_err(|e| RegistryError::PushFailed {
                image: tagged.clone(),
                message: e.to_string(),
            })?;
            if let Some(detail) = info.error_detail {
                let message = detail.message.unwrap_or_else(|| "unknown error".to_string());
                let lowered = message.to_lowercase();
                if lowered.contains("unauthorized") || lowered.contains("denied") {
                    return Err(RegistryError::Unauthorized {
                        image: tagged,
                        message,
                    });
                }
                return Err(RegistryError::PushFailed {
                    image: tagged,
                    message,
                });
            }
        }

        let digest = self.repo_digest(image).await?;
        let pinned = image.with_digest(&digest);
        tracing::info!(image = %pinned, "pushed");
        Ok(pinned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_own_repository_only() {
        assert_eq!(
            digest_for("ghcr.io/acme/web@sha256:abc", "ghcr.io/acme/web"),
            Some("sha256:abc".to_string())
        );
        assert_eq!(digest_for("ghcr.io/acme/api@sha256:abc", "ghcr.io/acme/web"), None);
        assert_eq!(digest_for("ghcr.io/acme/web:v1", "ghcr.io/acme/web"), None);
    }

    #[test]
    fn digest_accepts_docker_hub_prefix() {
        assert_eq!(
            digest_for("docker.io/acme/web@sha256:def", "acme/web"),
            Some("sha256:def".to_string())
        );
    }

    #[test]
    fn context_must_be_a_directory() {
        let err = pack_context(Path::new("/nonexistent/shipyard-context")).unwrap_err();
        assert!(matches!(err, RegistryError::Context { .. }));
    }

    #[test]
    fn context_is_packed_with_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        std::fs::write(dir.path().join("app.sh"), "echo hi\n").unwrap();

        let bytes = pack_context(dir.path()).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();

        assert!(names.iter().any(|n| n.ends_with("Dockerfile")));
        assert!(names.iter().any(|n| n.ends_with("app.sh")));
    }
}
