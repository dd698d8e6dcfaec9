//! In-memory runtime used by unit tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::environment::EnvironmentRef;
use crate::error::DockerError;
use crate::execution::runtime::EnvironmentRuntime;

/// Images are flat lists of `(path, contents)`; a path ending in `/` is an
/// empty directory.
#[derive(Default)]
pub(crate) struct FakeRuntime {
    images: Mutex<HashMap<String, Vec<(String, Vec<u8>)>>>,
    handles: Mutex<HashMap<String, String>>,
    failing_removes: Mutex<HashSet<String>>,
    next: AtomicUsize,
    created: AtomicUsize,
    removed: AtomicUsize,
    peak: AtomicUsize,
    create_delay: Option<Duration>,
    remove_delay: Option<Duration>,
    copy_delay: Option<Duration>,
}

impl FakeRuntime {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers the environment, then answers `create` only after `delay`.
    pub(crate) fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub(crate) fn with_remove_delay(mut self, delay: Duration) -> Self {
        self.remove_delay = Some(delay);
        self
    }

    pub(crate) fn with_copy_delay(mut self, delay: Duration) -> Self {
        self.copy_delay = Some(delay);
        self
    }

    pub(crate) fn add_image(&self, image: &str, files: &[(&str, &[u8])]) {
        let files = files
            .iter()
            .map(|(p, b)| (p.trim_start_matches('/').to_string(), b.to_vec()))
            .collect();
        self.images.lock().unwrap().insert(image.to_string(), files);
    }

    pub(crate) fn fail_removal_of(&self, image: &str) {
        self.failing_removes.lock().unwrap().insert(image.to_string());
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    pub(crate) fn live(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    /// Most environments alive at the same time.
    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnvironmentRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), DockerError> {
        Ok(())
    }

    async fn create(&self, reference: &EnvironmentRef) -> Result<String, DockerError> {
        if !self.images.lock().unwrap().contains_key(&reference.image) {
            return Err(DockerError::ImageUnavailable {
                image: reference.image.clone(),
                reason: "manifest unknown".to_string(),
            });
        }
        let handle = format!("fake-{}", self.next.fetch_add(1, Ordering::SeqCst));
        let live = {
            let mut handles = self.handles.lock().unwrap();
            handles.insert(handle.clone(), reference.image.clone());
            handles.len()
        };
        self.created.fetch_add(1, Ordering::SeqCst);
        self.peak.fetch_max(live, Ordering::SeqCst);

        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(handle)
    }

    async fn copy_out(&self, handle: &str, path: &str, dest: &Path) -> Result<(), DockerError> {
        if let Some(delay) = self.copy_delay {
            tokio::time::sleep(delay).await;
        }
        let image = self
            .handles
            .lock()
            .unwrap()
            .get(handle)
            .cloned()
            .ok_or_else(|| DockerError::CopyFailed {
                id: handle.to_string(),
                path: path.to_string(),
                reason: "no such container".to_string(),
            })?;
        let files = self.images.lock().unwrap().get(&image).cloned().unwrap_or_default();

        let wanted = path.trim_start_matches('/').trim_end_matches('/');
        let prefix = format!("{wanted}/");
        let mut found = false;
        for (file, body) in files {
            if file == wanted {
                std::fs::create_dir_all(dest.parent().unwrap())?;
                std::fs::write(dest, &body)?;
                found = true;
            } else if let Some(rel) = file.strip_prefix(&prefix) {
                found = true;
                std::fs::create_dir_all(dest)?;
                if rel.is_empty() {
                    continue;
                }
                let target = dest.join(rel.trim_end_matches('/'));
                if rel.ends_with('/') {
                    std::fs::create_dir_all(&target)?;
                } else {
                    std::fs::create_dir_all(target.parent().unwrap())?;
                    std::fs::write(&target, &body)?;
                }
            }
        }

        if found {
            Ok(())
        } else {
            Err(DockerError::PathNotFound {
                id: handle.to_string(),
                path: path.to_string(),
            })
        }
    }

    async fn remove(&self, handle: &str) -> Result<(), DockerError> {
        if let Some(delay) = self.remove_delay {
            tokio::time::sleep(delay).await;
        }
        let image = self.handles.lock().unwrap().get(handle).cloned();
        if let Some(image) = image {
            if self.failing_removes.lock().unwrap().contains(&image) {
                return Err(DockerError::RemoveFailed {
                    id: handle.to_string(),
                    reason: "device or resource busy".to_string(),
                });
            }
        }
        self.handles.lock().unwrap().remove(handle);
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
