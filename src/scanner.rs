//! Scan pipeline (component K): walks a directory being checked for
//! leaked protected content, testing each file first for an exact digest
//! match and, failing that, for cosine similarity against the indexed
//! corpus.
//!
//! The similarity matrix is assembled once, up front, from every indexed
//! file that carries a feature vector, and shared immutably across all
//! scanning workers — rebuilding it per file would make the pipeline
//! quadratic in corpus size.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rayon::prelude::*;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::classify::{classify, FileClass};
use crate::engine::Engine;
use crate::error::Result;
use crate::progress::{ProgressUpdate, TaskStatus, TaskType};
use crate::similarity::{find_matches, VectorMatrix};
use crate::store::{now_unix, IndexedFile, MatchKind, NewScanResult, ScanResult};
use crate::vectorize::SparseVector;

pub struct ScanRunOutcome {
    pub task_id: String,
    pub scan_id: String,
    pub results: Vec<ScanResult>,
}

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

/// Loads every indexed file carrying a feature vector, returning the
/// dense matrix alongside the ordered `IndexedFile` rows it was built
/// from (matrix row `i` corresponds to `files[i]`).
fn load_matrix(engine: &Engine) -> Result<(VectorMatrix, Vec<IndexedFile>)> {
    let pairs = engine.store().list_with_vectors()?;
    let mut vectors = Vec::with_capacity(pairs.len());
    let mut files = Vec::with_capacity(pairs.len());
    for (id, bytes) in pairs {
        let Some(sparse) = SparseVector::from_bytes(&bytes) else {
            continue;
        };
        let Some(file) = engine.store().get_by_id(&id)? else {
            continue;
        };
        vectors.push(sparse);
        files.push(file);
    }
    let dim = engine.similarity_config().n_features;
    Ok((VectorMatrix::from_sparse(&vectors, dim), files))
}

pub fn run(engine: &Engine, root: &Path) -> Result<ScanRunOutcome> {
    let task_id = Uuid::new_v4().to_string();
    run_with_task_id(engine, root, &task_id)
}

pub fn run_with_task_id(engine: &Engine, root: &Path, task_id: &str) -> Result<ScanRunOutcome> {
    let root = engine.canonicalize_root(root)?;
    let root = root.as_path();

    let progress = engine.progress();
    progress.create(task_id.to_string(), TaskType::Scan);
    progress.update(task_id, ProgressUpdate::default().status(TaskStatus::Counting));
    info!(task_id, root = %root.display(), "scan task counting");

    let scan_id = Uuid::new_v4().to_string();
    let files = discover(root, engine);
    let total = files.len();
    progress.update(task_id, ProgressUpdate::default().total_files(total).status(TaskStatus::Processing));
    info!(task_id, scan_id, total_files = total, "scan task processing");

    let (matrix, indexed_files) = load_matrix(engine)?;
    let by_row: HashMap<usize, &IndexedFile> = indexed_files.iter().enumerate().map(|(i, f)| (i, f)).collect();

    let matches_found = AtomicUsize::new(0);
    let access_denied = AtomicUsize::new(0);
    let collected: Mutex<Vec<NewScanResult>> = Mutex::new(Vec::new());

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
            match scan_one(engine, path, &matrix, &by_row, &scan_id) {
                Ok(Some(result)) => {
                    debug!(path = %path.display(), kind = result.match_kind.as_str(), score = result.score, "match found");
                    matches_found.fetch_add(1, Ordering::Relaxed);
                    collected.lock().unwrap().push(result);
                }
                Ok(None) => {}
                Err(crate::error::DlpError::AccessDenied { .. }) => {
                    access_denied.fetch_add(1, Ordering::Relaxed);
                    warn!(path = %path.display(), "access denied while scanning");
                    progress.update(task_id, ProgressUpdate::default().access_denied_one());
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to scan file");
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

    let mut results = Vec::new();
    for new_result in collected.into_inner().unwrap() {
        results.push(engine.store().add_scan_result(new_result)?);
    }

    let was_cancelled = progress.is_cancelled(task_id);
    let final_status = if was_cancelled { TaskStatus::Cancelled } else { TaskStatus::Completed };
    progress.update(
        task_id,
        ProgressUpdate::default()
            .status(final_status)
            .indexed_or_matched_one_by(matches_found.load(Ordering::Relaxed)),
    );
    if was_cancelled {
        progress.clear_cancelled(task_id);
    }
    info!(
        task_id,
        scan_id = %scan_id,
        status = final_status.as_str(),
        matches = results.len(),
        access_denied = access_denied.load(Ordering::Relaxed),
        "scan task finished"
    );

    Ok(ScanRunOutcome { task_id: task_id.to_string(), scan_id, results })
}

/// Scans a single file, returning at most one match: an exact digest hit
/// wins outright; otherwise the highest-scoring similarity match (if any)
/// clears the configured threshold ladder.
fn scan_one(
    engine: &Engine,
    path: &Path,
    matrix: &VectorMatrix,
    by_row: &HashMap<usize, &IndexedFile>,
    scan_id: &str,
) -> Result<Option<NewScanResult>> {
    let digest = crate::hash::hash_file(path)?;

    if let Some(exact) = engine.store().find_by_digest(&digest)? {
        return Ok(Some(NewScanResult {
            scan_id: scan_id.to_string(),
            scanned_path: path.display().to_string(),
            match_kind: MatchKind::Exact,
            score: 1.0,
            matched_file_id: exact.id,
            matched_file_path: exact.path,
            matched_file_name: exact.filename,
        }));
    }

    let class = classify(path);
    if !class.is_textual() {
        return Ok(None);
    }
    let text = engine.extractors().extract_text(path, class);
    if text.is_empty() && !matches!(class, FileClass::Text) {
        return Ok(None);
    }

    let candidates = find_matches(&text, matrix, engine.similarity_config());
    let Some(best) = candidates.into_iter().next() else {
        return Ok(None);
    };
    let Some(file) = by_row.get(&best.index) else {
        return Ok(None);
    };

    Ok(Some(NewScanResult {
        scan_id: scan_id.to_string(),
        scanned_path: path.display().to_string(),
        match_kind: best.kind.into(),
        score: best.score,
        matched_file_id: file.id.clone(),
        matched_file_path: file.path.clone(),
        matched_file_name: file.filename.clone(),
    }))
}
