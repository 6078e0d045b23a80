//! Indexing pipeline (component J): walks a protected directory, hashes
//! and optionally vectorizes every admitted file, and upserts it into the
//! configured store.
//!
//! Two phases, same as the teacher's background indexer: a counting walk
//! establishes `total_files` for progress reporting, then a processing
//! walk fans files out across a rayon thread pool. Unlike the teacher,
//! there is no on-disk checkpoint or resumable import graph — a single
//! indexing run either completes, errors, or is cancelled.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use rayon::prelude::*;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::classify::{classify, FileClass};
use crate::engine::Engine;
use crate::error::Result;
use crate::progress::{ProgressUpdate, TaskStatus, TaskType};
use crate::store::{now_unix, IndexOperation};

/// Result of one complete (or cancelled) indexing run.
pub struct IndexRunOutcome {
    pub task_id: String,
    pub operation: IndexOperation,
}

fn file_mtime(path: &Path) -> Result<f64> {
    let meta = std::fs::metadata(path).map_err(|e| crate::error::DlpError::from_io(path, e))?;
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    Ok(modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0))
}

/// Walks `root`, returning every file whose basename is not ignored.
/// Directories whose basename is ignored are pruned entirely, matching
/// the ignore matcher's "basename-only" contract applied at every path
/// segment the walk descends into.
fn discover(root: &Path, engine: &Engine) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        if entry.depth() == 0 {
            return true;
        }
        !engine.ignore_matcher().should_ignore(entry.path())
    });
    for entry in walker.filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            out.push(entry.path().to_path_buf());
        }
    }
    out
}

/// Generates a fresh task id, runs a full index of `root` under it, and
/// returns the completed `IndexOperation`. Callers that need to observe
/// progress or request cancellation should `subscribe`/`cancel` on
/// `engine.progress()` using the returned task id before this call returns
/// (e.g. from another thread), since `run` itself blocks until completion.
pub fn run(engine: &Engine, root: &Path) -> Result<IndexRunOutcome> {
    let task_id = Uuid::new_v4().to_string();
    let operation = run_with_task_id(engine, root, &task_id)?;
    Ok(IndexRunOutcome { task_id, operation })
}

pub fn run_with_task_id(engine: &Engine, root: &Path, task_id: &str) -> Result<IndexOperation> {
    let root = engine.canonicalize_root(root)?;
    let root = root.as_path();

    let progress = engine.progress();
    progress.create(task_id.to_string(), TaskType::Index);
    progress.update(task_id, ProgressUpdate::default().status(TaskStatus::Counting));
    info!(task_id, root = %root.display(), "index task counting");

    let started_at = now_unix();
    let files = discover(root, engine);
    let total = files.len();
    progress.update(task_id, ProgressUpdate::default().total_files(total).status(TaskStatus::Processing));
    info!(task_id, total_files = total, "index task processing");

    let indexed = AtomicUsize::new(0);
    let skipped = AtomicUsize::new(0);
    let access_denied = AtomicUsize::new(0);

    let pool_size = engine.threading().max_workers.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(pool_size)
        .build()
        .map_err(|e| crate::error::DlpError::StoreUnavailable(e.to_string()))?;

    pool.install(|| {
        files.par_iter().for_each(|path| {
            if progress.is_cancelled(task_id) {
                return;
            }
            match index_one(engine, path) {
                Ok(true) => {
                    indexed.fetch_add(1, Ordering::Relaxed);
                    debug!(path = %path.display(), "indexed");
                }
                Ok(false) => {
                    skipped.fetch_add(1, Ordering::Relaxed);
                    debug!(path = %path.display(), "unchanged, skipped");
                }
                Err(crate::error::DlpError::AccessDenied { .. }) => {
                    access_denied.fetch_add(1, Ordering::Relaxed);
                    warn!(path = %path.display(), "access denied while indexing");
                    progress.update(task_id, ProgressUpdate::default().access_denied_one());
                }
                Err(e) => {
                    skipped.fetch_add(1, Ordering::Relaxed);
                    warn!(path = %path.display(), error = %e, "failed to index file");
                }
            }
            progress.update(
                task_id,
                ProgressUpdate::default()
                    .processed_one()
                    .current_file(Some(path.display().to_string())),
            );
        });
    });

    let was_cancelled = progress.is_cancelled(task_id);
    let final_status = if was_cancelled { TaskStatus::Cancelled } else { TaskStatus::Completed };
    progress.update(task_id, ProgressUpdate::default().status(final_status));
    if was_cancelled {
        progress.clear_cancelled(task_id);
    }
    info!(
        task_id,
        status = final_status.as_str(),
        indexed = indexed.load(Ordering::Relaxed),
        access_denied = access_denied.load(Ordering::Relaxed),
        "index task finished"
    );

    let op = IndexOperation {
        id: task_id.to_string(),
        path: root.display().to_string(),
        status: final_status.as_str().to_string(),
        total_files: total,
        files_indexed: indexed.load(Ordering::Relaxed),
        files_skipped: skipped.load(Ordering::Relaxed) + access_denied.load(Ordering::Relaxed),
        started_at,
        completed_at: Some(now_unix()),
        error_message: None,
    };
    engine.store().record_index_operation(&op)?;
    Ok(op)
}

/// Indexes a single file. Returns `Ok(true)` if it was (re)written to the
/// store, `Ok(false)` if it was up to date and skipped, `Err` for access or
/// I/O failures.
fn index_one(engine: &Engine, path: &Path) -> Result<bool> {
    let mtime = file_mtime(path)?;
    let class = classify(path);

    if let Some(existing) = engine.store().get_by_path(&path.display().to_string())? {
        let mtime_unchanged = (existing.mtime - mtime).abs() < f64::EPSILON;
        let skippable = !class.is_textual() || existing.feature_vector.is_some();
        if mtime_unchanged && skippable {
            return Ok(false);
        }
    }

    let digest = crate::hash::hash_file(path)?;
    let vector_bytes = if class.is_textual() {
        let text = engine.extractors().extract_text(path, class);
        if matches!(class, FileClass::Text) || !text.is_empty() {
            crate::vectorize::vectorize(&text, engine.similarity_config()).map(|v| v.to_bytes())
        } else {
            None
        }
    } else {
        None
    };

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    engine
        .store()
        .upsert(&path.display().to_string(), &filename, &digest, vector_bytes.as_deref(), mtime)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SensitivityPreset, SimilarityConfig};
    use crate::engine::Engine;
    use crate::ignore_matcher::IgnoreMatcher;
    use crate::store::relational::RelationalStore;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn test_engine() -> Engine {
        let store = Arc::new(RelationalStore::open(":memory:", &Default::default()).unwrap());
        Engine::new(
            IgnoreMatcher::empty(),
            SimilarityConfig::for_preset(SensitivityPreset::Medium),
            store,
            Default::default(),
        )
    }

    #[test]
    fn indexes_every_admitted_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "some content here that is long enough to matter").unwrap();
        std::fs::write(dir.path().join("b.txt"), "other content also long enough to be indexed here").unwrap();

        let engine = test_engine();
        let outcome = run(&engine, dir.path()).unwrap();
        assert_eq!(outcome.operation.total_files, 2);
        assert_eq!(outcome.operation.files_indexed, 2);
        assert_eq!(engine.store().count().unwrap(), 2);
    }

    #[test]
    fn ignored_files_are_excluded_from_total() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), "keep this content please").unwrap();
        std::fs::write(dir.path().join("skip.log"), "skip this content please").unwrap();

        let ignore = IgnoreMatcher::new(vec!["*.log".to_string()]);
        let store = Arc::new(RelationalStore::open(":memory:", &Default::default()).unwrap());
        let engine = Engine::new(
            ignore,
            SimilarityConfig::for_preset(SensitivityPreset::Medium),
            store,
            Default::default(),
        );

        let outcome = run(&engine, dir.path()).unwrap();
        assert_eq!(outcome.operation.total_files, 1);
    }

    #[test]
    fn reindexing_unchanged_file_skips_it() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "content that does not change between runs at all").unwrap();

        let engine = test_engine();
        let first = run(&engine, dir.path()).unwrap();
        assert_eq!(first.operation.files_indexed, 1);

        let second = run(&engine, dir.path()).unwrap();
        assert_eq!(second.operation.files_indexed, 0);
    }

    #[test]
    fn empty_directory_completes_with_zero_files() {
        let dir = tempdir().unwrap();
        let engine = test_engine();
        let outcome = run(&engine, dir.path()).unwrap();
        assert_eq!(outcome.operation.total_files, 0);
        assert_eq!(outcome.operation.status, "completed");
    }
}
