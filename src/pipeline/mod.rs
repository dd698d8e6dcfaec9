//! Pipeline orchestration for corpus building.
//!
//! # Architecture
//!
//! - **Config**: layered configuration and the per-run [`RunContext`]
//! - **Orchestrator**: bounded-concurrency driver over a set of case IDs
//! - **Summary**: per-case outcomes and aggregate counts of one run
//!
//! # Pipeline Flow
//!
//! 1. **Preflight**: metadata stores sanity-checked, runtime pinged
//! 2. **Skip check**: intact complete entries are left alone unless forced
//! 3. **Resolution**: the case record and its two image references
//! 4. **Extraction**: pre-fix and post-fix environments, concurrently
//! 5. **Assembly**: classification, normalized layout, index row
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use arvo_corpus::execution::DockerClient;
//! use arvo_corpus::pipeline::{PipelineConfig, PipelineOrchestrator};
//!
//! let config = PipelineConfig::new().with_concurrency(8);
//! let runtime = Arc::new(DockerClient::new()?);
//! let orchestrator = PipelineOrchestrator::new(&config, runtime).await?;
//!
//! let (_abort_tx, abort_rx) = tokio::sync::watch::channel(false);
//! let summary = orchestrator.run(&[25402, 42470], abort_rx).await?;
//! print!("{}", summary.render_table());
//! ```

pub mod config;
pub mod orchestrator;
pub mod summary;

// Re-export main types for convenience
pub use config::{ConfigError, PipelineConfig, RunContext};
pub use orchestrator::{PipelineError, PipelineOrchestrator};
pub use summary::{CaseOutcome, OutcomeStatus, RunSummary, SummaryCounts};
