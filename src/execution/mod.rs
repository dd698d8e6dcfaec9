//! Docker execution layer for case extraction.
//!
//! Environments are created from a case image and never started: a stopped
//! container is enough to copy its filesystem out.
//!
//! # Architecture
//!
//! Every environment follows this lifecycle:
//! ```text
//! CREATE → COPY OUT (0..n paths) → REMOVE
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use arvo_corpus::environment::{ImageResolver, Side};
//! use arvo_corpus::execution::{DockerClient, EnvironmentLease};
//!
//! let runtime = Arc::new(DockerClient::new()?);
//! let reference = ImageResolver::default().reference(25402, Side::PreFix);
//!
//! let lease = EnvironmentLease::acquire(runtime, &reference).await?;
//! lease.copy_out("/src", &out_dir).await?;
//! lease.release(Duration::from_secs(60)).await?;
//! ```

pub mod archive;
pub mod container;
pub mod docker_client;
pub mod runtime;

#[cfg(test)]
pub(crate) mod testing;

pub use archive::{unpack_stripped, unpack_stripped_until};
pub use container::EnvironmentLease;
pub use docker_client::{ContainerConfig, DockerClient};
pub use runtime::EnvironmentRuntime;
