//! Cross-module scenarios from spec.md §8: index-then-scan exact match,
//! synonym-substitution similarity match, empty directory, ignored-files
//! filtering, digest-overwrite-on-reindex, and cooperative cancellation.

use std::sync::Arc;

use dlp_guard::config::{SensitivityPreset, SimilarityConfig, ThreadingConfig};
use dlp_guard::engine::Engine;
use dlp_guard::ignore_matcher::IgnoreMatcher;
use dlp_guard::progress::TaskStatus;
use dlp_guard::store::relational::RelationalStore;
use dlp_guard::store::MatchKind;
use dlp_guard::{indexer, scanner};
use tempfile::tempdir;

fn engine_with(ignore: IgnoreMatcher, preset: SensitivityPreset) -> Engine {
    let store = Arc::new(RelationalStore::open(":memory:", &Default::default()).unwrap());
    Engine::new(ignore, SimilarityConfig::for_preset(preset), store, ThreadingConfig::default())
}

fn engine() -> Engine {
    engine_with(IgnoreMatcher::empty(), SensitivityPreset::Medium)
}

const SENTENCE: &str =
    "The quick brown fox jumps over the lazy dog near the riverbank every single morning without fail. ";

/// Scenario 1: an identical copy elsewhere is flagged as an exact match.
#[test]
fn scenario_identical_copy_is_exact_match() {
    let protected = tempdir().unwrap();
    let scanned = tempdir().unwrap();
    std::fs::write(protected.path().join("a.txt"), SENTENCE.repeat(3)).unwrap();
    std::fs::write(scanned.path().join("b.txt"), SENTENCE.repeat(3)).unwrap();

    let engine = engine();
    indexer::run(&engine, protected.path()).unwrap();
    let outcome = scanner::run(&engine, scanned.path()).unwrap();

    assert_eq!(outcome.results.len(), 1);
    let result = &outcome.results[0];
    assert_eq!(result.match_kind, MatchKind::Exact);
    assert_eq!(result.score, 1.0);
    assert!(result.matched_file_path.ends_with("a.txt"));
}

/// Scenario 2: a near-duplicate with a handful of words swapped for
/// synonyms of similar length still crosses the similarity threshold under
/// the default `medium` preset, without qualifying as an exact digest match.
#[test]
fn scenario_synonym_substitution_is_similarity_or_high_confidence() {
    let protected = tempdir().unwrap();
    let scanned = tempdir().unwrap();
    let original = SENTENCE.repeat(3);
    let paraphrased = original
        .replace("quick", "swift")
        .replace("lazy", "sleepy")
        .replace("morning", "evening");
    assert_ne!(original, paraphrased);

    std::fs::write(protected.path().join("a.txt"), &original).unwrap();
    std::fs::write(scanned.path().join("b.txt"), &paraphrased).unwrap();

    let engine = engine();
    indexer::run(&engine, protected.path()).unwrap();
    let outcome = scanner::run(&engine, scanned.path()).unwrap();

    assert_eq!(outcome.results.len(), 1);
    let result = &outcome.results[0];
    assert!(matches!(result.match_kind, MatchKind::HighConfidence | MatchKind::Similarity));
    assert!(result.score >= 0.65);
}

/// Scenario 3: scanning against an empty index yields zero results and a
/// completed status.
#[test]
fn scenario_empty_index_yields_no_results() {
    let protected = tempdir().unwrap();
    let scanned = tempdir().unwrap();
    std::fs::write(scanned.path().join("whatever.txt"), SENTENCE.repeat(3)).unwrap();

    let engine = engine();
    let index_outcome = indexer::run(&engine, protected.path()).unwrap();
    assert_eq!(index_outcome.operation.status, "completed");

    let scan_outcome = scanner::run(&engine, scanned.path()).unwrap();
    assert!(scan_outcome.results.is_empty());
}

/// Scenario 4: `IGNORED_FILES`-style glob patterns exclude matching
/// basenames from the indexed total.
#[test]
fn scenario_ignored_files_excluded_from_index() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("app.log"), "log output that nobody should protect as sensitive").unwrap();
    std::fs::write(dir.path().join("notes.md"), "actual protected notes content of reasonable length").unwrap();

    let ignore = IgnoreMatcher::new(vec!["*.log".to_string(), ".DS_Store".to_string()]);
    let engine = engine_with(ignore, SensitivityPreset::Medium);

    let outcome = indexer::run(&engine, dir.path()).unwrap();
    assert_eq!(outcome.operation.total_files, 1);
    assert_eq!(engine.store().count().unwrap(), 1);
    let only = engine.store().list_all().unwrap();
    assert!(only[0].path.ends_with("notes.md"));
}

/// Scenario 6: upserting the same path twice with differing digests
/// overwrites in place rather than creating a second row.
#[test]
fn scenario_reindex_with_changed_content_overwrites_digest() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("doc.txt");
    std::fs::write(&file, "version one of the document contents here").unwrap();

    let engine = engine();
    indexer::run(&engine, dir.path()).unwrap();
    let first_digest = engine.store().get_by_path(&file.canonicalize().unwrap().display().to_string()).unwrap().unwrap().content_digest;

    // mtime must move forward for the pipeline to treat this as a change;
    // sleep briefly so the filesystem records a different mtime.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    std::fs::write(&file, "version two of the document contents, now rewritten").unwrap();

    indexer::run(&engine, dir.path()).unwrap();
    assert_eq!(engine.store().count().unwrap(), 1);
    let second_digest = engine.store().get_by_path(&file.canonicalize().unwrap().display().to_string()).unwrap().unwrap().content_digest;
    assert_ne!(first_digest, second_digest);
}

/// A running index task observes a cancellation request and transitions to
/// `cancelled` rather than completing normally.
#[test]
fn cancelling_an_index_task_transitions_to_cancelled() {
    let dir = tempdir().unwrap();
    for i in 0..50 {
        std::fs::write(dir.path().join(format!("file_{i}.txt")), format!("content body number {i} padded out")).unwrap();
    }

    let engine = engine();
    let task_id = uuid::Uuid::new_v4().to_string();
    engine.progress().cancel(&task_id);
    assert!(engine.progress().is_cancelled(&task_id));

    let op = indexer::run_with_task_id(&engine, dir.path(), &task_id).unwrap();
    assert_eq!(op.status, "cancelled");
    assert!(op.files_indexed <= op.total_files);

    let snapshot = engine.progress().get(&task_id).unwrap();
    assert_eq!(snapshot.status, TaskStatus::Cancelled);
}

/// Reindexing with unchanged bytes and an unchanged mtime is a no-op: the
/// second run indexes nothing new.
#[test]
fn reindexing_unchanged_file_is_a_noop() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("stable.txt"), "this content never changes between indexing runs at all").unwrap();

    let engine = engine();
    let first = indexer::run(&engine, dir.path()).unwrap();
    assert_eq!(first.operation.files_indexed, 1);

    let second = indexer::run(&engine, dir.path()).unwrap();
    assert_eq!(second.operation.files_indexed, 0);
    assert_eq!(engine.store().count().unwrap(), 1);
}
