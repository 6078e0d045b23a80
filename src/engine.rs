//! `Engine`: the explicit, owned replacement for the module-level
//! singletons spec.md §9 flags for redesign.
//!
//! The original keeps a global ignore-list store, a global similarity
//! config store, a global storage config store, and a global progress
//! store, all mutated in place by whichever request handler happens to run
//! first. Here, one `Engine` owns one `IgnoreMatcher`, one
//! `SimilarityConfig`, one `Arc<dyn Store>`, one `ProgressRegistry`, and one
//! `ThreadingConfig` for its lifetime; the indexer and scanner pipelines
//! take `&Engine` rather than reaching into statics.

use std::path::Path;
use std::sync::Arc;

use crate::classify::ExtractorFacade;
use crate::config::{SimilarityConfig, ThreadingConfig};
use crate::error::{DlpError, Result};
use crate::ignore_matcher::IgnoreMatcher;
use crate::progress::ProgressRegistry;
use crate::store::SharedStore;

/// Owns every handle the indexing/scanning pipelines need. Construct one
/// per process (or per embedding context); cheap to share via `Arc` if a
/// caller needs to run several tasks against the same engine concurrently,
/// since every field it holds is itself already internally synchronized.
pub struct Engine {
    ignore_matcher: IgnoreMatcher,
    similarity_config: SimilarityConfig,
    store: SharedStore,
    progress: ProgressRegistry,
    threading: ThreadingConfig,
    extractors: ExtractorFacade,
    allowed_roots: Vec<std::path::PathBuf>,
}

impl Engine {
    pub fn new(
        ignore_matcher: IgnoreMatcher,
        similarity_config: SimilarityConfig,
        store: SharedStore,
        threading: ThreadingConfig,
    ) -> Self {
        Self {
            ignore_matcher,
            similarity_config,
            store,
            progress: ProgressRegistry::new(),
            threading,
            extractors: ExtractorFacade::new(),
            allowed_roots: Vec::new(),
        }
    }

    /// Restricts `canonicalize_root` to paths under one of `roots`. An
    /// empty list (the default) means no allow-list is enforced.
    pub fn with_allowed_roots(mut self, roots: Vec<std::path::PathBuf>) -> Self {
        self.allowed_roots = roots;
        self
    }

    pub fn ignore_matcher(&self) -> &IgnoreMatcher {
        &self.ignore_matcher
    }

    pub fn similarity_config(&self) -> &SimilarityConfig {
        &self.similarity_config
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn progress(&self) -> &ProgressRegistry {
        &self.progress
    }

    pub fn threading(&self) -> &ThreadingConfig {
        &self.threading
    }

    pub fn extractors(&self) -> &ExtractorFacade {
        &self.extractors
    }

    pub fn register_extractor(&mut self, extractor: Arc<dyn crate::classify::TextExtractor>) {
        self.extractors.register(extractor);
    }

    /// Canonicalizes `path` (resolving symlinks, normalizing `.`/`..`),
    /// rejects paths containing a NUL byte, and — if an allow-list of roots
    /// is configured — rejects any path not prefixed by a listed root.
    /// Per spec.md §6: this must run before any I/O touches the path.
    pub fn canonicalize_root(&self, path: &Path) -> Result<std::path::PathBuf> {
        let raw = path.to_string_lossy();
        if raw.as_bytes().contains(&0) {
            return Err(DlpError::InvalidPath("path contains NUL byte".to_string()));
        }
        if raw.is_empty() {
            return Err(DlpError::InvalidPath("path is empty".to_string()));
        }
        let canonical = path
            .canonicalize()
            .map_err(|_| DlpError::InvalidPath(format!("path does not exist: {}", path.display())))?;
        if !canonical.is_dir() {
            return Err(DlpError::InvalidPath(format!("not a directory: {}", canonical.display())));
        }
        if !self.allowed_roots.is_empty() && !self.allowed_roots.iter().any(|root| canonical.starts_with(root)) {
            return Err(DlpError::InvalidPath(format!(
                "{} is outside the configured allow-list of scan roots",
                canonical.display()
            )));
        }
        Ok(canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensitivityPreset;
    use crate::store::relational::RelationalStore;
    use tempfile::tempdir;

    fn engine() -> Engine {
        let store = Arc::new(RelationalStore::open(":memory:", &Default::default()).unwrap());
        Engine::new(
            IgnoreMatcher::empty(),
            SimilarityConfig::for_preset(SensitivityPreset::Medium),
            store,
            ThreadingConfig::default(),
        )
    }

    #[test]
    fn canonicalize_rejects_nul_byte() {
        let e = engine();
        let bad = unsafe { String::from_utf8_unchecked(vec![b'/', 0u8]) };
        assert!(e.canonicalize_root(Path::new(&bad)).is_err());
    }

    #[test]
    fn canonicalize_rejects_nonexistent_path() {
        let e = engine();
        assert!(e.canonicalize_root(Path::new("/does/not/exist/zzz")).is_err());
    }

    #[test]
    fn canonicalize_accepts_real_directory() {
        let e = engine();
        let dir = tempdir().unwrap();
        let canonical = e.canonicalize_root(dir.path()).unwrap();
        assert!(canonical.is_absolute());
    }

    #[test]
    fn allow_list_rejects_paths_outside_roots() {
        let allowed = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let store = Arc::new(RelationalStore::open(":memory:", &Default::default()).unwrap());
        let e = Engine::new(
            IgnoreMatcher::empty(),
            SimilarityConfig::for_preset(SensitivityPreset::Medium),
            store,
            ThreadingConfig::default(),
        )
        .with_allowed_roots(vec![allowed.path().canonicalize().unwrap()]);

        assert!(e.canonicalize_root(outside.path()).is_err());
        assert!(e.canonicalize_root(allowed.path()).is_ok());
    }
}
