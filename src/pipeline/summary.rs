//! Per-run accounting of case outcomes.

use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::corpus::{CorpusEntry, EntryStatus};

/// Final state of one requested case in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Complete,
    Partial,
    Failed,
    /// Already complete in the corpus; nothing was extracted.
    Skipped,
    /// The case could not be resolved; no corpus entry exists for it.
    MetadataUnavailable,
    /// Never started because the run was aborted.
    Cancelled,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Complete => "complete",
            OutcomeStatus::Partial => "partial",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::Skipped => "skipped",
            OutcomeStatus::MetadataUnavailable => "metadata_unavailable",
            OutcomeStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the case ends the run with a complete corpus entry.
    pub fn is_complete(&self) -> bool {
        matches!(self, OutcomeStatus::Complete | OutcomeStatus::Skipped)
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<EntryStatus> for OutcomeStatus {
    fn from(status: EntryStatus) -> Self {
        match status {
            EntryStatus::Complete => OutcomeStatus::Complete,
            EntryStatus::Partial => OutcomeStatus::Partial,
            EntryStatus::Failed => OutcomeStatus::Failed,
        }
    }
}

/// Outcome of one case.
#[derive(Debug, Clone, Serialize)]
pub struct CaseOutcome {
    pub case_id: u64,
    pub status: OutcomeStatus,
    pub reason: Option<String>,
    /// The corpus entry, when one exists after the run.
    pub entry: Option<CorpusEntry>,
    pub duration_ms: u64,
}

impl CaseOutcome {
    pub fn from_entry(entry: CorpusEntry, duration: Duration) -> Self {
        Self {
            case_id: entry.case_id,
            status: entry.status.into(),
            reason: entry.reason.clone(),
            entry: Some(entry),
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn skipped(entry: CorpusEntry) -> Self {
        Self {
            case_id: entry.case_id,
            status: OutcomeStatus::Skipped,
            reason: None,
            entry: Some(entry),
            duration_ms: 0,
        }
    }

    pub fn without_entry(
        case_id: u64,
        status: OutcomeStatus,
        reason: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            case_id,
            status,
            reason: Some(reason.into()),
            entry: None,
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Aggregate counts of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SummaryCounts {
    pub requested: usize,
    pub complete: usize,
    pub partial: usize,
    pub failed: usize,
    pub skipped: usize,
    pub metadata_unavailable: usize,
    pub cancelled: usize,
}

/// Outcomes of one orchestrator run, ordered by case ID.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub outcomes: Vec<CaseOutcome>,
    pub counts: SummaryCounts,
}

impl RunSummary {
    pub fn from_outcomes(mut outcomes: Vec<CaseOutcome>) -> Self {
        outcomes.sort_by_key(|o| o.case_id);

        let mut counts = SummaryCounts {
            requested: outcomes.len(),
            ..Default::default()
        };
        for outcome in &outcomes {
            match outcome.status {
                OutcomeStatus::Complete => counts.complete += 1,
                OutcomeStatus::Partial => counts.partial += 1,
                OutcomeStatus::Failed => counts.failed += 1,
                OutcomeStatus::Skipped => counts.skipped += 1,
                OutcomeStatus::MetadataUnavailable => counts.metadata_unavailable += 1,
                OutcomeStatus::Cancelled => counts.cancelled += 1,
            }
        }

        Self { outcomes, counts }
    }

    pub fn get(&self, case_id: u64) -> Option<&CaseOutcome> {
        self.outcomes.iter().find(|o| o.case_id == case_id)
    }

    /// True when every requested case ends with a complete entry.
    pub fn all_complete(&self) -> bool {
        self.outcomes.iter().all(|o| o.status.is_complete())
    }

    /// Plain-text table with one row per case and a totals line.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{:<10} {:<22} {:>9}  REASON", "CASE", "STATUS", "TIME");
        for outcome in &self.outcomes {
            let _ = writeln!(
                out,
                "{:<10} {:<22} {:>8.1}s  {}",
                outcome.case_id,
                outcome.status.as_str(),
                outcome.duration_ms as f64 / 1000.0,
                outcome.reason.as_deref().unwrap_or("-")
            );
        }

        let c = &self.counts;
        let _ = writeln!(
            out,
            "\n{} requested: {} complete, {} skipped, {} partial, {} failed, {} metadata unavailable, {} cancelled",
            c.requested,
            c.complete,
            c.skipped,
            c.partial,
            c.failed,
            c.metadata_unavailable,
            c.cancelled
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: u64, status: OutcomeStatus) -> CaseOutcome {
        CaseOutcome {
            case_id: id,
            status,
            reason: None,
            entry: None,
            duration_ms: 1500,
        }
    }

    #[test]
    fn test_counts_and_order() {
        let summary = RunSummary::from_outcomes(vec![
            outcome(3, OutcomeStatus::Failed),
            outcome(1, OutcomeStatus::Complete),
            outcome(2, OutcomeStatus::MetadataUnavailable),
            outcome(4, OutcomeStatus::Skipped),
        ]);

        let ids: Vec<u64> = summary.outcomes.iter().map(|o| o.case_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(summary.counts.requested, 4);
        assert_eq!(summary.counts.complete, 1);
        assert_eq!(summary.counts.failed, 1);
        assert_eq!(summary.counts.metadata_unavailable, 1);
        assert_eq!(summary.counts.skipped, 1);
        assert!(!summary.all_complete());
    }

    #[test]
    fn test_skipped_counts_as_complete() {
        let summary = RunSummary::from_outcomes(vec![
            outcome(1, OutcomeStatus::Complete),
            outcome(2, OutcomeStatus::Skipped),
        ]);
        assert!(summary.all_complete());
        assert!(RunSummary::default().all_complete());
    }

    #[test]
    fn test_render_table() {
        let mut failed = outcome(25402, OutcomeStatus::Failed);
        failed.reason = Some("post-fix: image missing".to_string());
        let table = RunSummary::from_outcomes(vec![failed]).render_table();

        assert!(table.starts_with("CASE"));
        assert!(table.contains("25402"));
        assert!(table.contains("post-fix: image missing"));
        assert!(table.contains("1.5s"));
        assert!(table.contains("1 requested: 0 complete"));
    }

    #[test]
    fn test_entry_status_maps_to_outcome() {
        assert_eq!(OutcomeStatus::from(EntryStatus::Partial), OutcomeStatus::Partial);
        assert_eq!(OutcomeStatus::MetadataUnavailable.to_string(), "metadata_unavailable");
    }
}
