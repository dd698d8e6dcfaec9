//! arvo-corpus: paired vulnerable/fixed source corpus from ARVO case images.
//!
//! This library resolves ARVO cases against their metadata stores, copies the
//! source trees out of the pre-fix and post-fix images, separates fuzzing
//! harnesses from project source and assembles an idempotent on-disk corpus.

// Core modules
pub mod classify;
pub mod cli;
pub mod corpus;
pub mod environment;
pub mod error;
pub mod execution;
pub mod extract;
pub mod metadata;
pub mod pipeline;

// Re-export commonly used error types
pub use error::{CorpusError, DockerError, ExtractionError, MetadataError};
