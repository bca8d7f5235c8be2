use std::path::PathBuf;

use serde::Serialize;

use crate::buildinfo::BuildMetadata;
use crate::error::ItemError;
use crate::host::HostCapability;
use crate::probe::RuntimeOutcome;
use crate::verdict::{Aggregate, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryKind {
    GoBinary,
}

/// One Go executable found under the scan root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BinaryReport {
    /// Root-relative, `/`-separated.
    pub relative_path: String,
    pub kind: BinaryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub metadata: Option<BuildMetadata>,
    pub runtime: RuntimeOutcome,
    pub error: Option<ItemError>,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    /// Files the walker emitted.
    pub candidates: usize,
    pub other_executables: usize,
    pub walk_errors: usize,
    /// Candidates that vanished or became unreadable before classification.
    pub unreadable_candidates: usize,
    pub peak_concurrent_probes: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    pub schema_version: String,
    pub root: PathBuf,
    pub host: HostCapability,
    /// Sorted by `relative_path`.
    pub reports: Vec<BinaryReport>,
    pub aggregate: Aggregate,
    pub stats: ScanStats,
}

impl ScanResult {
    pub fn is_compliant(&self) -> bool {
        self.aggregate.verdict.is_compliant()
    }

    pub fn report(&self, relative_path: &str) -> Option<&BinaryReport> {
        self.reports
            .binary_search_by(|r| r.relative_path.as_str().cmp(relative_path))
            .ok()
            .map(|i| &self.reports[i])
    }
}
