//! The assembled on-disk corpus.
//!
//! - **CorpusAssembler**: writes normalized per-case directories
//! - **CorpusIndex**: SQLite index of entries plus an event log
//! - **CaseManifest**: `case.json` describing how a case was built

pub mod assembler;
pub mod entry;
pub mod index;
pub mod manifest;

pub use assembler::{Assembly, CorpusAssembler, SideResult, WORK_DIR};
pub use entry::{CorpusEntry, EntryStatus};
pub use index::{CaseLock, CorpusEvent, CorpusIndex, EventAction, INDEX_FILE};
pub use manifest::{tree_digest, CaseManifest, CaseSummary, MANIFEST_FILE};
