//! Store interface (component F): the contract every backend implements
//! over indexed files and scan results.
//!
//! Generalizes the two-backend shape described in spec.md §4.F into a
//! single object-safe trait so the indexer/scanner pipelines never know
//! which concrete backend they're talking to.

pub mod kv;
pub mod relational;

use std::sync::Arc;

use crate::error::Result;

/// One entry per absolute, canonicalized path under protection.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IndexedFile {
    pub id: String,
    pub path: String,
    pub filename: String,
    pub content_digest: String,
    /// Serialized `SparseVector` bytes (crate::vectorize's wire format),
    /// present only when the file classified as text and yielded content
    /// at or above `min_content_length`.
    pub feature_vector: Option<Vec<u8>>,
    pub mtime: f64,
    pub indexed_at: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MatchKind {
    Exact,
    HighConfidence,
    Similarity,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Exact => "exact",
            MatchKind::HighConfidence => "high_confidence",
            MatchKind::Similarity => "similarity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(MatchKind::Exact),
            "high_confidence" => Some(MatchKind::HighConfidence),
            "similarity" => Some(MatchKind::Similarity),
            _ => None,
        }
    }
}

impl From<crate::similarity::MatchKind> for MatchKind {
    fn from(k: crate::similarity::MatchKind) -> Self {
        match k {
            crate::similarity::MatchKind::Exact => MatchKind::Exact,
            crate::similarity::MatchKind::HighConfidence => MatchKind::HighConfidence,
            crate::similarity::MatchKind::Similarity => MatchKind::Similarity,
        }
    }
}

/// One entry per match recorded during a scan.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScanResult {
    pub id: String,
    pub scan_id: String,
    pub scanned_path: String,
    pub match_kind: MatchKind,
    pub score: f64,
    pub matched_file_id: String,
    pub matched_file_path: String,
    pub matched_file_name: String,
    pub timestamp: f64,
}

/// A new scan result to be written; the backend assigns `id`/`timestamp`.
#[derive(Debug, Clone)]
pub struct NewScanResult {
    pub scan_id: String,
    pub scanned_path: String,
    pub match_kind: MatchKind,
    pub score: f64,
    pub matched_file_id: String,
    pub matched_file_path: String,
    pub matched_file_name: String,
}

/// Historical record of one indexer run, written at the end of
/// `indexer::run` — spec.md §4.G's `index_operations` table.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IndexOperation {
    pub id: String,
    pub path: String,
    pub status: String,
    pub total_files: usize,
    pub files_indexed: usize,
    pub files_skipped: usize,
    pub started_at: f64,
    pub completed_at: Option<f64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScanSummary {
    pub scan_id: String,
    pub matches_count: usize,
    pub timestamp: f64,
}

/// Contract shared by the relational and KV+vector backends (spec.md
/// §4.F). Implementations must be safe under concurrent callers upserting
/// distinct paths, and must enforce (R1): deleting all indexed files also
/// purges all scan results.
pub trait Store: Send + Sync {
    /// Idempotent on `path`: updates digest/vector/mtime/indexed_at if a
    /// row for `path` already exists, else inserts.
    fn upsert(
        &self,
        path: &str,
        filename: &str,
        digest: &str,
        vector: Option<&[u8]>,
        mtime: f64,
    ) -> Result<IndexedFile>;

    fn get_by_path(&self, path: &str) -> Result<Option<IndexedFile>>;
    fn get_by_id(&self, id: &str) -> Result<Option<IndexedFile>>;
    fn find_by_digest(&self, digest: &str) -> Result<Option<IndexedFile>>;

    fn list_all(&self) -> Result<Vec<IndexedFile>>;
    /// Indexed files that carry a feature vector, for assembling the scan
    /// matrix; `(id, vector_bytes)` pairs only, to avoid hauling every field
    /// of every row into memory.
    fn list_with_vectors(&self) -> Result<Vec<(String, Vec<u8>)>>;
    fn count(&self) -> Result<usize>;

    fn delete_by_id(&self, id: &str) -> Result<bool>;
    /// Deletes every indexed file and, per (R1), every scan result.
    /// Returns the number of indexed files removed.
    fn delete_all(&self) -> Result<usize>;

    fn add_scan_result(&self, result: NewScanResult) -> Result<ScanResult>;
    fn results_for(&self, scan_id: &str) -> Result<Vec<ScanResult>>;
    fn all_results(&self) -> Result<Vec<ScanResult>>;
    fn distinct_scan_count(&self) -> Result<usize>;
    fn result_count(&self) -> Result<usize>;
    /// Ordered by timestamp descending.
    fn scans_summary(&self) -> Result<Vec<ScanSummary>>;

    fn record_index_operation(&self, op: &IndexOperation) -> Result<()>;

    /// `(id, score)` pairs for indexed vectors scoring at or above
    /// `threshold`, sorted score-descending, at most `k`, no duplicates.
    /// Backends may satisfy this via linear cosine (relational) or a
    /// server-side ANN index (KV+vector).
    fn find_similar(&self, query_vector: &[u8], threshold: f64, k: usize) -> Result<Vec<(String, f64)>>;

    /// No-op for non-transactional backends.
    fn commit(&self) -> Result<()> {
        Ok(())
    }
    /// No-op for non-transactional backends.
    fn rollback(&self) -> Result<()> {
        Ok(())
    }
    /// Releases this handle back to its pool; does not tear the pool down.
    fn close(&self) -> Result<()> {
        Ok(())
    }
    fn health_check(&self) -> bool;
}

/// A cloneable handle into a `Store`, scoped to one worker's unit of work.
/// Workers acquire one of these per file rather than holding a bare
/// connection across the file-walk loop, matching spec.md §5's "acquisition
/// is scoped to a single unit of work".
pub type SharedStore = Arc<dyn Store>;

pub(crate) fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
