//! Scoped lifecycle of one ephemeral environment.
//!
//! An [`EnvironmentLease`] is created together with its environment and must
//! be handed back through [`EnvironmentLease::release`]. A lease that is
//! dropped without release (its future was cancelled, or a caller bailed out
//! early) schedules the removal on the current tokio runtime, so every
//! created environment is removed on every exit path.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::environment::EnvironmentRef;
use crate::error::DockerError;
use crate::execution::runtime::EnvironmentRuntime;

/// A live ephemeral environment.
pub struct EnvironmentLease {
    runtime: Arc<dyn EnvironmentRuntime>,
    reference: EnvironmentRef,
    handle: Option<String>,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for EnvironmentLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentLease")
            .field("reference", &self.reference)
            .field("handle", &self.handle)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl EnvironmentLease {
    /// Instantiates the environment for `reference`.
    pub async fn acquire(
        runtime: Arc<dyn EnvironmentRuntime>,
        reference: &EnvironmentRef,
    ) -> Result<Self, DockerError> {
        let handle = runtime.create(reference).await?;
        tracing::debug!(image = %reference, handle = %handle, "Environment created");

        Ok(Self {
            runtime,
            reference: reference.clone(),
            handle: Some(handle),
            created_at: Utc::now(),
        })
    }

    /// Runtime handle of the environment.
    pub fn handle(&self) -> &str {
        self.handle.as_deref().unwrap_or_default()
    }

    pub fn reference(&self) -> &EnvironmentRef {
        &self.reference
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Copies `path` out of the environment into `dest`.
    pub async fn copy_out(&self, path: &str, dest: &Path) -> Result<(), DockerError> {
        self.runtime.copy_out(self.handle(), path, dest).await
    }

    /// Removes the environment, bounded by `timeout`.
    pub async fn release(mut self, timeout: Duration) -> Result<(), DockerError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, self.runtime.remove(&handle)).await {
            Ok(Ok(())) => {
                tracing::debug!(image = %self.reference, handle = %handle, "Environment removed");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DockerError::RemoveFailed {
                id: handle,
                reason: format!("timed out after {timeout:?}"),
            }),
        }
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                tracing::warn!(image = %self.reference, handle = %handle, "Environment lease dropped without release; removing in background");
                let runtime = Arc::clone(&self.runtime);
                rt.spawn(async move {
                    if let Err(e) = runtime.remove(&handle).await {
                        tracing::warn!(handle = %handle, error = %e, "Background environment removal failed");
                    }
                });
            }
            Err(_) => {
                tracing::error!(image = %self.reference, handle = %handle, "Environment leaked: no runtime available for removal");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{ImageResolver, Side};
    use crate::execution::testing::FakeRuntime;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let runtime = Arc::new(FakeRuntime::new());
        let reference = ImageResolver::default().reference(1, Side::PreFix);
        runtime.add_image(&reference.image, &[("src/core/a.c", b"x".as_slice())]);

        let lease = EnvironmentLease::acquire(runtime.clone(), &reference)
            .await
            .unwrap();
        assert!(!lease.handle().is_empty());
        assert_eq!(runtime.live(), 1);

        lease.release(Duration::from_secs(5)).await.unwrap();
        assert_eq!(runtime.created(), 1);
        assert_eq!(runtime.removed(), 1);
        assert_eq!(runtime.live(), 0);
    }

    #[tokio::test]
    async fn test_drop_without_release_removes() {
        let runtime = Arc::new(FakeRuntime::new());
        let reference = ImageResolver::default().reference(2, Side::PostFix);
        runtime.add_image(&reference.image, &[]);

        {
            let _lease = EnvironmentLease::acquire(runtime.clone(), &reference)
                .await
                .unwrap();
        }
        for _ in 0..50 {
            if runtime.removed() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(runtime.removed(), 1);
    }

    #[tokio::test]
    async fn test_release_timeout_reports_remove_failed() {
        let runtime = Arc::new(FakeRuntime::new().with_remove_delay(Duration::from_millis(200)));
        let reference = ImageResolver::default().reference(3, Side::PreFix);
        runtime.add_image(&reference.image, &[]);

        let lease = EnvironmentLease::acquire(runtime.clone(), &reference)
            .await
            .unwrap();
        let result = lease.release(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(DockerError::RemoveFailed { .. })));
    }
}
