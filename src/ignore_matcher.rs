//! Basename-only glob ignore matcher with atomic whole-list replacement.
//!
//! Mirrors the pattern table semantics of an externally configured ignore
//! list: wildcard patterns match case-sensitively via glob syntax; patterns
//! with no wildcard metacharacters additionally match the basename
//! case-insensitively (so `.DS_Store` and `.ds_store` both hit a bare
//! `.DS_Store` entry).

use std::path::Path;
use std::sync::RwLock;

use globset::{Glob, GlobSet, GlobSetBuilder};

struct CompiledPatterns {
    patterns: Vec<String>,
    set: GlobSet,
}

fn compile(patterns: &[String]) -> CompiledPatterns {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        if let Ok(glob) = Glob::new(p) {
            builder.add(glob);
        }
    }
    let set = builder.build().unwrap_or_else(|_| GlobSetBuilder::new().build().unwrap());
    CompiledPatterns {
        patterns: patterns.to_vec(),
        set,
    }
}

fn is_wildcard(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Tests a basename against an ordered list of glob patterns. Readers
/// always see either the prior full list or the new one in full: mutation
/// swaps the whole compiled set under a write lock, never mutating the
/// pattern list element-by-element.
pub struct IgnoreMatcher {
    inner: RwLock<CompiledPatterns>,
}

impl IgnoreMatcher {
    pub fn new(patterns: Vec<String>) -> Self {
        Self {
            inner: RwLock::new(compile(&patterns)),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn patterns(&self) -> Vec<String> {
        self.inner.read().unwrap().patterns.clone()
    }

    /// Atomically replaces the full pattern list.
    pub fn set_patterns(&self, patterns: Vec<String>) {
        let compiled = compile(&patterns);
        *self.inner.write().unwrap() = compiled;
    }

    pub fn add_pattern(&self, pattern: &str) {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return;
        }
        let mut patterns = self.patterns();
        if !patterns.iter().any(|p| p == pattern) {
            patterns.push(pattern.to_string());
            self.set_patterns(patterns);
        }
    }

    pub fn remove_pattern(&self, pattern: &str) {
        let pattern = pattern.trim();
        let mut patterns = self.patterns();
        let before = patterns.len();
        patterns.retain(|p| p != pattern);
        if patterns.len() != before {
            self.set_patterns(patterns);
        }
    }

    /// Returns true iff `path`'s basename matches any configured pattern.
    /// Matching is basename-only, never full path.
    pub fn should_ignore(&self, path: impl AsRef<Path>) -> bool {
        let guard = self.inner.read().unwrap();
        if guard.patterns.is_empty() {
            return false;
        }
        let basename = match path.as_ref().file_name().and_then(|n| n.to_str()) {
            Some(b) => b,
            None => return false,
        };
        if guard.set.is_match(basename) {
            return true;
        }
        let basename_lower = basename.to_lowercase();
        guard
            .patterns
            .iter()
            .any(|p| !is_wildcard(p) && p.to_lowercase() == basename_lower)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_matcher_ignores_nothing() {
        let m = IgnoreMatcher::empty();
        assert!(!m.should_ignore("anything.txt"));
    }

    #[test]
    fn wildcard_pattern_matches_extension() {
        let m = IgnoreMatcher::new(vec!["*.log".to_string()]);
        assert!(m.should_ignore("app.log"));
        assert!(m.should_ignore("/var/log/deep/path/app.log"));
        assert!(!m.should_ignore("app.txt"));
    }

    #[test]
    fn non_wildcard_pattern_matches_case_insensitively() {
        let m = IgnoreMatcher::new(vec![".DS_Store".to_string()]);
        assert!(m.should_ignore(".DS_Store"));
        assert!(m.should_ignore(".ds_store"));
        assert!(!m.should_ignore("notds_store"));
    }

    #[test]
    fn matching_is_basename_only() {
        let m = IgnoreMatcher::new(vec!["node_modules".to_string()]);
        assert!(!m.should_ignore("/project/node_modules/pkg/index.js"));
        assert!(m.should_ignore("/project/node_modules"));
    }

    #[test]
    fn set_patterns_replaces_whole_list_atomically() {
        let m = IgnoreMatcher::new(vec!["*.log".to_string()]);
        assert!(m.should_ignore("a.log"));
        m.set_patterns(vec!["*.tmp".to_string()]);
        assert!(!m.should_ignore("a.log"));
        assert!(m.should_ignore("a.tmp"));
    }

    #[test]
    fn add_and_remove_pattern() {
        let m = IgnoreMatcher::empty();
        m.add_pattern("*.bak");
        assert!(m.should_ignore("x.bak"));
        m.remove_pattern("*.bak");
        assert!(!m.should_ignore("x.bak"));
    }
}
