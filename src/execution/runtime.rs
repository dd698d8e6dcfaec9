//! The environment runtime seam.
//!
//! Extraction only needs four operations from the container service: check it
//! is reachable, create a stopped environment, copy a path out of it, and
//! remove it. [`DockerClient`](super::DockerClient) implements them with
//! bollard; tests substitute an in-memory runtime.

use std::path::Path;

use async_trait::async_trait;

use crate::environment::EnvironmentRef;
use crate::error::DockerError;

/// Create/copy-out/remove operations on ephemeral environments.
#[async_trait]
pub trait EnvironmentRuntime: Send + Sync {
    /// Checks the runtime service is reachable.
    async fn ping(&self) -> Result<(), DockerError>;

    /// Instantiates a non-running environment and returns its handle.
    async fn create(&self, reference: &EnvironmentRef) -> Result<String, DockerError>;

    /// Copies `path` out of the environment to `dest` with `docker cp`
    /// semantics: a directory's contents land in `dest`, a file becomes `dest`.
    async fn copy_out(&self, handle: &str, path: &str, dest: &Path) -> Result<(), DockerError>;

    /// Removes the environment.
    async fn remove(&self, handle: &str) -> Result<(), DockerError>;
}
