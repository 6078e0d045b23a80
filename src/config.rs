//! Dotfile configuration: `KEY=VALUE` lines, parsed on startup and
//! atomically rewritten whenever the control surface changes a value.
//!
//! This deliberately does not use a TOML/structured format: the external
//! wire contract is the flat `KEY=VALUE` dotfile described by the
//! configuration surface, so the parser mirrors that directly rather than
//! reusing a generic serialization crate.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::{DlpError, Result};

/// A parsed `KEY=VALUE` dotfile, plus the path it was loaded from (if any).
#[derive(Debug, Clone, Default)]
pub struct Dotenv {
    values: BTreeMap<String, String>,
    path: Option<PathBuf>,
}

impl Dotenv {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load from `path` if it exists; otherwise returns an empty, path-bound
    /// instance (so a later `persist` still targets the right file).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| DlpError::from_io(&path, e))?;
            parse(&content)
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            values,
            path: Some(path),
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            None => default,
            Some(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"),
        }
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(default)
    }

    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        self.get(key)
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(default)
    }

    pub fn get_list(&self, key: &str, default: &[&str]) -> Vec<String> {
        match self.get(key) {
            None => default.iter().map(|s| s.to_string()).collect(),
            Some(v) => v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Atomically rewrite the backing dotfile: every key in `self.values`
    /// that already appears (commented or not) is replaced in place; any
    /// remaining new keys are appended under a single trailing section.
    /// The whole file is read, transformed in memory, then written back in
    /// one call, so readers never observe a half-written file.
    pub fn persist(&self) -> Result<()> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(()),
        };
        let existing = if path.exists() {
            fs::read_to_string(path).map_err(|e| DlpError::from_io(path, e))?
        } else {
            String::new()
        };
        let mut content = existing;
        let mut appended = Vec::new();

        for (key, value) in &self.values {
            let line_re = Regex::new(&format!(r"(?m)^#?\s*{}=.*$", regex::escape(key)))
                .map_err(|e| DlpError::ConfigError(e.to_string()))?;
            let new_line = format!("{key}={value}");
            if line_re.is_match(&content) {
                content = line_re.replace(&content, new_line.as_str()).to_string();
            } else {
                appended.push(new_line);
            }
        }

        if !appended.is_empty() {
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str("\n# auto-saved\n");
            for line in appended {
                content.push_str(&line);
                content.push('\n');
            }
        }

        fs::write(path, content).map_err(|e| DlpError::from_io(path, e))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn parse(content: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = trimmed.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

/// Default config file search path: `$DLP_CONFIG`, then `./dlp_guard.env`,
/// then `~/.config/dlp_guard/config.env`.
pub fn default_config_path() -> PathBuf {
    if let Ok(p) = std::env::var("DLP_CONFIG") {
        return PathBuf::from(p);
    }
    let cwd_candidate = PathBuf::from("dlp_guard.env");
    if cwd_candidate.exists() {
        return cwd_candidate;
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dlp_guard")
        .join("config.env")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensitivityPreset {
    Low,
    Medium,
    High,
    Custom,
}

impl SensitivityPreset {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "low" => SensitivityPreset::Low,
            "high" => SensitivityPreset::High,
            "custom" => SensitivityPreset::Custom,
            _ => SensitivityPreset::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SensitivityPreset::Low => "low",
            SensitivityPreset::Medium => "medium",
            SensitivityPreset::High => "high",
            SensitivityPreset::Custom => "custom",
        }
    }
}

/// Similarity / vectorization configuration, combining the preset
/// sensitivity ladder with the individually overridable vectorizer knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityConfig {
    pub sensitivity: SensitivityPreset,
    pub similarity_threshold: f64,
    pub high_confidence_threshold: f64,
    pub exact_match_threshold: f64,
    pub require_multiple_matches: bool,
    pub ngram_range_min: usize,
    pub ngram_range_max: usize,
    pub n_features: usize,
    pub use_idf: bool,
    pub sublinear_tf: bool,
    pub max_df: f64,
    pub min_df: f64,
    pub min_content_length: usize,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self::for_preset(SensitivityPreset::Medium)
    }
}

impl SimilarityConfig {
    pub fn for_preset(preset: SensitivityPreset) -> Self {
        let (similarity_threshold, high_confidence_threshold, require_multiple_matches, ngram_min, ngram_max) =
            match preset {
                SensitivityPreset::Low => (0.80, 0.92, true, 2, 4),
                SensitivityPreset::Medium => (0.65, 0.85, true, 1, 3),
                SensitivityPreset::High => (0.50, 0.75, false, 1, 2),
                SensitivityPreset::Custom => (0.65, 0.85, true, 1, 3),
            };
        Self {
            sensitivity: preset,
            similarity_threshold,
            high_confidence_threshold,
            exact_match_threshold: 0.98,
            require_multiple_matches,
            ngram_range_min: ngram_min,
            ngram_range_max: ngram_max,
            n_features: 8192,
            use_idf: false,
            sublinear_tf: false,
            max_df: 1.0,
            min_df: 0.0,
            min_content_length: 50,
        }
    }

    pub fn from_dotenv(env: &Dotenv) -> Self {
        let preset = SensitivityPreset::parse(&env.get_string("SIMILARITY_SENSITIVITY", "medium"));
        let mut cfg = Self::for_preset(preset);
        if let Some(v) = env.get("SIMILARITY_THRESHOLD") {
            if let Ok(v) = v.parse() {
                cfg.similarity_threshold = v;
                cfg.sensitivity = SensitivityPreset::Custom;
            }
        }
        if let Some(v) = env.get("SIMILARITY_HIGH_CONFIDENCE_THRESHOLD") {
            if let Ok(v) = v.parse() {
                cfg.high_confidence_threshold = v;
                cfg.sensitivity = SensitivityPreset::Custom;
            }
        }
        if let Some(v) = env.get("SIMILARITY_EXACT_MATCH_THRESHOLD") {
            if let Ok(v) = v.parse() {
                cfg.exact_match_threshold = v;
            }
        }
        cfg.require_multiple_matches =
            env.get_bool("SIMILARITY_REQUIRE_MULTIPLE_MATCHES", cfg.require_multiple_matches);
        cfg.min_content_length = env.get_int("SIMILARITY_MIN_CONTENT_LENGTH", cfg.min_content_length as i64) as usize;
        cfg.n_features = env.get_int("VECTORIZATION_N_FEATURES", cfg.n_features as i64) as usize;
        cfg.ngram_range_min = env.get_int("VECTORIZATION_NGRAM_MIN", cfg.ngram_range_min as i64) as usize;
        cfg.ngram_range_max = env.get_int("VECTORIZATION_NGRAM_MAX", cfg.ngram_range_max as i64) as usize;
        cfg.use_idf = env.get_bool("VECTORIZATION_USE_IDF", cfg.use_idf);
        cfg.sublinear_tf = env.get_bool("VECTORIZATION_SUBLINEAR_TF", cfg.sublinear_tf);
        cfg.max_df = env.get_float("VECTORIZATION_MAX_DF", cfg.max_df);
        cfg.min_df = env.get_float("VECTORIZATION_MIN_DF", cfg.min_df);
        cfg
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackendKind {
    Sqlite,
    Redis,
}

#[derive(Debug, Clone)]
pub struct ThreadingConfig {
    pub enabled: bool,
    pub max_workers: usize,
    pub batch_size: usize,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_workers: 4,
            batch_size: 50,
        }
    }
}

impl ThreadingConfig {
    pub fn from_dotenv(env: &Dotenv) -> Self {
        let max_workers = env.get_int("THREADING_MAX_WORKERS", 4).clamp(1, 32) as usize;
        Self {
            enabled: env.get_bool("THREADING_ENABLED", false),
            max_workers,
            batch_size: env.get_int("THREADING_BATCH_SIZE", 50) as usize,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisPoolConfig {
    pub max_connections: u32,
    pub min_idle_connections: u32,
    pub connection_timeout: f64,
    pub socket_timeout: f64,
    pub socket_connect_timeout: f64,
    pub retry_on_timeout: bool,
    pub health_check_interval: u64,
}

impl Default for RedisPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            min_idle_connections: 5,
            connection_timeout: 10.0,
            socket_timeout: 30.0,
            socket_connect_timeout: 10.0,
            retry_on_timeout: true,
            health_check_interval: 30,
        }
    }
}

impl RedisPoolConfig {
    pub fn from_dotenv(env: &Dotenv) -> Self {
        Self {
            max_connections: env.get_int("REDIS_POOL_MAX_CONNECTIONS", 50) as u32,
            min_idle_connections: env.get_int("REDIS_POOL_MIN_IDLE", 5) as u32,
            connection_timeout: env.get_float("REDIS_SOCKET_CONNECT_TIMEOUT", 10.0),
            socket_timeout: env.get_float("REDIS_SOCKET_TIMEOUT", 30.0),
            socket_connect_timeout: env.get_float("REDIS_SOCKET_CONNECT_TIMEOUT", 10.0),
            retry_on_timeout: env.get_bool("REDIS_RETRY_ON_TIMEOUT", true),
            health_check_interval: env.get_int("REDIS_HEALTH_CHECK_INTERVAL", 30) as u64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    pub vector_dim: usize,
    pub index_name: String,
    pub pool: RedisPoolConfig,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
            vector_dim: 8192,
            index_name: "idx:dlp_files".to_string(),
            pool: RedisPoolConfig::default(),
        }
    }
}

impl RedisConfig {
    pub fn from_dotenv(env: &Dotenv) -> Self {
        Self {
            host: env.get_string("REDIS_HOST", "localhost"),
            port: env.get_int("REDIS_PORT", 6379) as u16,
            password: env.get("REDIS_PASSWORD").map(|s| s.to_string()),
            db: env.get_int("REDIS_DB", 0),
            vector_dim: env.get_int("VECTORIZATION_N_FEATURES", 8192) as usize,
            index_name: "idx:dlp_files".to_string(),
            pool: RedisPoolConfig::from_dotenv(env),
        }
    }

    pub fn connection_url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{pw}@{}:{}/{}", self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqlitePoolConfig {
    pub pool_size: u32,
    pub max_overflow: u32,
    pub timeout_secs: u64,
    pub recycle_secs: u64,
    pub pre_ping: bool,
}

impl Default for SqlitePoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            max_overflow: 10,
            timeout_secs: 30,
            recycle_secs: 3600,
            pre_ping: true,
        }
    }
}

impl SqlitePoolConfig {
    pub fn from_dotenv(env: &Dotenv) -> Self {
        Self {
            pool_size: env.get_int("DB_POOL_SIZE", 5) as u32,
            max_overflow: env.get_int("DB_POOL_MAX_OVERFLOW", 10) as u32,
            timeout_secs: env.get_int("DB_POOL_TIMEOUT", 30) as u64,
            recycle_secs: env.get_int("DB_POOL_RECYCLE", 3600) as u64,
            pre_ping: env.get_bool("DB_POOL_PRE_PING", true),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    pub database_url: String,
    pub sqlite_pool: SqlitePoolConfig,
    pub redis: RedisConfig,
    pub threading: ThreadingConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Sqlite,
            database_url: "sqlite:///dlp_guard.db".to_string(),
            sqlite_pool: SqlitePoolConfig::default(),
            redis: RedisConfig::default(),
            threading: ThreadingConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn from_dotenv(env: &Dotenv) -> Result<Self> {
        let backend = match env.get_string("STORAGE_BACKEND", "sqlite").to_lowercase().as_str() {
            "redis" => StorageBackendKind::Redis,
            "sqlite" => StorageBackendKind::Sqlite,
            other => return Err(DlpError::ConfigError(format!("unknown STORAGE_BACKEND: {other}"))),
        };
        let database_url = env.get_string("DATABASE_URL", "sqlite:///dlp_guard.db");
        Ok(Self {
            backend,
            database_url,
            sqlite_pool: SqlitePoolConfig::from_dotenv(env),
            redis: RedisConfig::from_dotenv(env),
            threading: ThreadingConfig::from_dotenv(env),
        })
    }

    /// Resolves the sqlite database file path from `database_url`, erroring
    /// for schemes this crate cannot back with a real `Store`.
    pub fn sqlite_path(&self) -> Result<String> {
        if let Some(rest) = self.database_url.strip_prefix("sqlite:///") {
            return Ok(format!("/{rest}"));
        }
        if let Some(rest) = self.database_url.strip_prefix("sqlite://") {
            return Ok(rest.to_string());
        }
        if self.database_url.starts_with("postgresql://") || self.database_url.starts_with("postgres://") {
            return Err(DlpError::ConfigError(
                "DATABASE_URL uses postgresql:// but this build only backs sqlite:// with a real store"
                    .to_string(),
            ));
        }
        Err(DlpError::ConfigError(format!(
            "unrecognized DATABASE_URL scheme: {}",
            self.database_url
        )))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilesystemConfig {
    pub allowed_scan_directories: Vec<PathBuf>,
}

impl FilesystemConfig {
    pub fn from_dotenv(env: &Dotenv) -> Self {
        Self {
            allowed_scan_directories: env
                .get_list("ALLOWED_SCAN_DIRECTORIES", &[])
                .into_iter()
                .map(PathBuf::from)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_key_value_lines_and_ignores_comments() {
        let map = parse("# comment\nFOO=bar\n\nBAZ=1,2,3\n");
        assert_eq!(map.get("FOO").unwrap(), "bar");
        assert_eq!(map.get("BAZ").unwrap(), "1,2,3");
    }

    #[test]
    fn persist_replaces_existing_line_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.env");
        fs::write(&path, "IGNORED_FILES=*.log\nOTHER=1\n").unwrap();
        let mut env = Dotenv::load(&path).unwrap();
        env.set("IGNORED_FILES", "*.tmp,*.log");
        env.persist().unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().filter(|l| l.starts_with("IGNORED_FILES=")).count(), 1);
        assert!(content.contains("IGNORED_FILES=*.tmp,*.log"));
        assert!(content.contains("OTHER=1"));
    }

    #[test]
    fn persist_appends_new_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.env");
        let mut env = Dotenv::load(&path).unwrap();
        env.set("SIMILARITY_THRESHOLD", "0.7");
        env.persist().unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("SIMILARITY_THRESHOLD=0.7"));
    }

    #[test]
    fn presets_match_spec_table() {
        let low = SimilarityConfig::for_preset(SensitivityPreset::Low);
        assert_eq!(low.similarity_threshold, 0.80);
        assert_eq!(low.high_confidence_threshold, 0.92);
        assert!(low.require_multiple_matches);
        assert_eq!((low.ngram_range_min, low.ngram_range_max), (2, 4));

        let medium = SimilarityConfig::for_preset(SensitivityPreset::Medium);
        assert_eq!(medium.similarity_threshold, 0.65);
        assert_eq!(medium.high_confidence_threshold, 0.85);

        let high = SimilarityConfig::for_preset(SensitivityPreset::High);
        assert_eq!(high.similarity_threshold, 0.50);
        assert!(!high.require_multiple_matches);
    }

    #[test]
    fn round_trip_get_set_ignored_patterns_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.env");
        let mut env = Dotenv::load(&path).unwrap();
        env.set("IGNORED_FILES", "*.log,.DS_Store");
        env.persist().unwrap();

        let reloaded = Dotenv::load(&path).unwrap();
        let patterns = reloaded.get_list("IGNORED_FILES", &[]);
        let mut env2 = reloaded.clone();
        env2.set("IGNORED_FILES", patterns.join(","));
        env2.persist().unwrap();
        let final_content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            final_content.lines().filter(|l| l.starts_with("IGNORED_FILES=")).count(),
            1
        );
    }
}
