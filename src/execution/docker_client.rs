//! Docker API wrapper using the bollard crate.
//!
//! This module provides the container operations extraction needs:
//! create (never start), copy a path out, and remove.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, RemoveContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::environment::EnvironmentRef;
use crate::error::DockerError;
use crate::execution::archive::unpack_stripped_until;
use crate::execution::runtime::EnvironmentRuntime;

/// Label carrying the case ID on every environment this crate creates.
pub const CASE_LABEL: &str = "arvo-corpus.case";

/// Label carrying the side (`vul`/`fix`) on every environment.
pub const SIDE_LABEL: &str = "arvo-corpus.side";

/// Configuration for creating a new container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Unique name for the container.
    pub name: String,
    /// Docker image to use.
    pub image: String,
    /// Command recorded on the container. It is never run.
    pub cmd: Vec<String>,
    /// Labels attached to the container.
    pub labels: HashMap<String, String>,
}

impl ContainerConfig {
    /// Creates a new container configuration with the given name and image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cmd: vec!["/bin/true".to_string()],
            labels: HashMap::new(),
        }
    }

    /// Configuration for one side of a case, with a unique name.
    pub fn for_reference(reference: &EnvironmentRef) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!(
            "arvo-corpus-{}-{}-{}",
            reference.case_id,
            reference.side.tag_suffix(),
            &suffix[..8]
        );
        Self::new(name, reference.image.clone())
            .with_label(CASE_LABEL, reference.case_id.to_string())
            .with_label(SIDE_LABEL, reference.side.tag_suffix())
    }

    /// Sets the recorded command.
    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    /// Adds a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Docker client wrapper for environment operations.
pub struct DockerClient {
    docker: Docker,
    pull_missing: bool,
}

impl DockerClient {
    /// Creates a new Docker client connecting to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `DockerError::DaemonUnavailable` if the Docker daemon is not accessible.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self::from_docker(docker))
    }

    /// Creates a new Docker client from an existing bollard Docker instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self {
            docker,
            pull_missing: true,
        }
    }

    /// Whether to pull images that are not present locally.
    pub fn with_pull_missing(mut self, pull: bool) -> Self {
        self.pull_missing = pull;
        self
    }

    /// Checks if an image exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    /// Pulls a Docker image from a registry.
    ///
    /// # Arguments
    ///
    /// * `image` - Image name with tag (e.g., "n132/arvo:25402-vul")
    pub async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            result.map_err(|e| DockerError::ImageUnavailable {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }

    /// Creates a stopped container.
    ///
    /// # Returns
    ///
    /// The container ID on success.
    pub async fn create_container(&self, config: ContainerConfig) -> Result<String, DockerError> {
        if !self.image_exists(&config.image).await {
            if !self.pull_missing {
                return Err(DockerError::ImageUnavailable {
                    image: config.image.clone(),
                    reason: "not present locally and pulling is disabled".to_string(),
                });
            }
            tracing::info!(image = %config.image, "Pulling image");
            self.pull_image(&config.image).await?;
        }

        let container_config = Config {
            image: Some(config.image.clone()),
            cmd: Some(config.cmd.clone()),
            labels: Some(config.labels.clone()),
            network_disabled: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| DockerError::CreateFailed {
                image: config.image.clone(),
                reason: e.to_string(),
            })?;

        for warning in &response.warnings {
            tracing::debug!(container = %config.name, warning = %warning, "Docker create warning");
        }

        Ok(response.id)
    }

    /// Streams `path` out of a container and unpacks it at `dest`.
    ///
    /// The archive is spooled to a temporary file next to `dest` and unpacked
    /// on the blocking pool.
    pub async fn download(&self, id: &str, path: &str, dest: &Path) -> Result<(), DockerError> {
        let spool_dir = dest.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(spool_dir).await?;
        let spool = tempfile::NamedTempFile::new_in(spool_dir)?;
        let mut file = tokio::fs::File::from_std(spool.reopen()?);

        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self.docker.download_from_container(id, Some(options));

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| match e {
                BollardError::DockerResponseServerError {
                    status_code: 404, ..
                } => DockerError::PathNotFound {
                    id: id.to_string(),
                    path: path.to_string(),
                },
                other => DockerError::CopyFailed {
                    id: id.to_string(),
                    path: path.to_string(),
                    reason: other.to_string(),
                },
            })?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        // Dropping this future (a deadline fired) stops the unpack at the
        // next archive entry.
        let cancel = CancelOnDrop::default();
        let flag = Arc::clone(&cancel.0);
        let dest = dest.to_path_buf();
        let written = tokio::task::spawn_blocking(move || {
            let reader = std::io::BufReader::new(std::fs::File::open(spool.path())?);
            unpack_stripped_until(reader, &dest, &flag)
        })
        .await
        .map_err(|e| DockerError::CopyFailed {
            id: id.to_string(),
            path: path.to_string(),
            reason: format!("unpack task failed: {e}"),
        })??;

        drop(cancel);
        tracing::debug!(container = %id, path = %path, entries = written, "Copied path out of container");
        Ok(())
    }

    /// Removes a container by ID.
    ///
    /// # Arguments
    ///
    /// * `id` - Container ID
    /// * `force` - Force removal even if running
    pub async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force,
            v: true, // Remove anonymous volumes
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| DockerError::RemoveFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        Ok(())
    }
}

#[async_trait]
impl EnvironmentRuntime for DockerClient {
    async fn ping(&self) -> Result<(), DockerError> {
        self.docker
            .ping()
            .await
            .map_err(|e| DockerError::DaemonUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn create(&self, reference: &EnvironmentRef) -> Result<String, DockerError> {
        self.create_container(ContainerConfig::for_reference(reference))
            .await
    }

    async fn copy_out(&self, handle: &str, path: &str, dest: &Path) -> Result<(), DockerError> {
        self.download(handle, path, dest).await
    }

    async fn remove(&self, handle: &str) -> Result<(), DockerError> {
        self.remove_container(handle, true).await
    }
}

#[derive(Default)]
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}
