//! `dlp_guard` CLI: a thin `clap`-driven operator surface over the library
//! `Engine`. Mirrors the teacher's own CLI idiom
//! (`clap::Parser` + `anyhow::Result` + `tracing_subscriber::FmtSubscriber`),
//! generalized onto this crate's indexer/scanner pipelines instead of the
//! keyword search engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use dlp_guard::config::{Dotenv, FilesystemConfig, SimilarityConfig, StorageBackendKind, StorageConfig};
use dlp_guard::engine::Engine;
use dlp_guard::ignore_matcher::IgnoreMatcher;
use dlp_guard::store::kv::KvStore;
use dlp_guard::store::relational::RelationalStore;
use dlp_guard::store::SharedStore;
use dlp_guard::{indexer, scanner};

#[derive(Parser, Debug)]
#[command(name = "dlp_guard")]
#[command(author, version, about = "Content-similarity DLP engine", long_about = None)]
struct Cli {
    /// Path to the KEY=VALUE config dotfile. Defaults to $DLP_CONFIG, then
    /// ./dlp_guard.env, then the platform config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index a directory of protected files.
    Index {
        /// Root directory to index.
        root: PathBuf,
    },
    /// Scan a directory for copies or near-duplicates of indexed files.
    Scan {
        /// Root directory to scan.
        root: PathBuf,
        /// Print every match, not just a summary.
        #[arg(long)]
        details: bool,
    },
    /// Manage the basename ignore-pattern list.
    Ignore {
        #[command(subcommand)]
        action: IgnoreAction,
    },
    /// Show the effective configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum IgnoreAction {
    /// List the current ignore patterns.
    List,
    /// Add a glob pattern to the ignore list.
    Add { pattern: String },
    /// Remove a glob pattern from the ignore list.
    Remove { pattern: String },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the resolved similarity/storage/threading configuration.
    Show,
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn open_store(storage: &StorageConfig) -> Result<SharedStore> {
    match storage.backend {
        StorageBackendKind::Sqlite => {
            let path = storage.sqlite_path().context("resolving DATABASE_URL")?;
            let store = RelationalStore::open(&path, &storage.sqlite_pool).context("opening sqlite store")?;
            Ok(Arc::new(store))
        }
        StorageBackendKind::Redis => {
            let store = KvStore::open(&storage.redis).context("opening redis store")?;
            Ok(Arc::new(store))
        }
    }
}

fn build_engine(cli: &Cli) -> Result<(Engine, Dotenv)> {
    let config_path = cli.config.clone().unwrap_or_else(dlp_guard::config::default_config_path);
    let env = Dotenv::load(&config_path).context("loading config dotfile")?;

    let patterns = env.get_list("IGNORED_FILES", &[]);
    let ignore = IgnoreMatcher::new(patterns);
    let similarity = SimilarityConfig::from_dotenv(&env);
    let storage = StorageConfig::from_dotenv(&env)?;
    let filesystem = FilesystemConfig::from_dotenv(&env);
    let threading = storage.threading.clone();

    let store = open_store(&storage)?;
    if !store.health_check() {
        anyhow::bail!("configured storage backend failed its health check");
    }

    let engine =
        Engine::new(ignore, similarity, store, threading).with_allowed_roots(filesystem.allowed_scan_directories);
    Ok((engine, env))
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}").unwrap());
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Renders a unix-seconds timestamp (as stored on `IndexOperation`/
/// `ScanResult`) in the operator's local time, for human-facing CLI output.
fn format_local_time(unix_seconds: f64) -> String {
    match Local.timestamp_opt(unix_seconds as i64, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => "unknown".to_string(),
    }
}

fn bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap()
            .progress_chars("█▓░"),
    );
    pb
}

/// Runs the indexer on a background thread while the calling thread drains
/// its progress subscription onto a terminal progress bar; the teacher's
/// `ProgressBarManager` generalized from a spinner/bar pair driven by
/// `IndexingProgress` snapshots to one driven by `TaskProgress` snapshots.
fn run_index(engine: &Engine, root: PathBuf) -> Result<()> {
    let task_id = uuid::Uuid::new_v4().to_string();
    let rx = engine.progress().subscribe(&task_id);

    let outcome = std::thread::scope(|scope| {
        let worker = scope.spawn(|| indexer::run_with_task_id(engine, &root, &task_id));

        let spin = spinner("counting files...");
        let mut progress_bar: Option<ProgressBar> = None;
        for snapshot in rx.iter() {
            if snapshot.total_files > 0 && progress_bar.is_none() {
                spin.finish_and_clear();
                progress_bar = Some(bar(snapshot.total_files as u64));
            }
            if let Some(b) = &progress_bar {
                b.set_position(snapshot.files_processed as u64);
                b.set_message(snapshot.current_file.clone().unwrap_or_default());
            }
            if snapshot.status.is_terminal() {
                break;
            }
        }
        if let Some(b) = progress_bar {
            b.finish_and_clear();
        } else {
            spin.finish_and_clear();
        }

        worker.join().expect("indexer worker thread panicked")
    })?;

    let finished = outcome.completed_at.map(format_local_time).unwrap_or_else(|| "unknown".to_string());
    println!(
        "{}: {} total, {} indexed, {} skipped (finished {})",
        outcome.status, outcome.total_files, outcome.files_indexed, outcome.files_skipped, finished
    );
    Ok(())
}

fn run_scan(engine: &Engine, root: PathBuf, details: bool) -> Result<()> {
    let outcome = scanner::run(engine, &root)?;
    println!("scan {}: {} matches", outcome.scan_id, outcome.results.len());
    if details {
        for r in &outcome.results {
            println!(
                "  [{}] {} -> {} ({}, score {:.3})",
                format_local_time(r.timestamp),
                r.scanned_path,
                r.matched_file_path,
                r.match_kind.as_str(),
                r.score
            );
        }
    }
    Ok(())
}

fn run_ignore(env: &mut Dotenv, action: IgnoreAction) -> Result<()> {
    let mut patterns = env.get_list("IGNORED_FILES", &[]);
    match action {
        IgnoreAction::List => {
            for p in &patterns {
                println!("{p}");
            }
        }
        IgnoreAction::Add { pattern } => {
            if !patterns.iter().any(|p| p == &pattern) {
                patterns.push(pattern);
            }
            env.set("IGNORED_FILES", patterns.join(","));
            env.persist()?;
        }
        IgnoreAction::Remove { pattern } => {
            patterns.retain(|p| p != &pattern);
            env.set("IGNORED_FILES", patterns.join(","));
            env.persist()?;
        }
    }
    Ok(())
}

fn run_config_show(engine: &Engine) {
    let sim = engine.similarity_config();
    println!("sensitivity: {}", sim.sensitivity.as_str());
    println!("similarity_threshold: {}", sim.similarity_threshold);
    println!("high_confidence_threshold: {}", sim.high_confidence_threshold);
    println!("exact_match_threshold: {}", sim.exact_match_threshold);
    println!("ngram_range: [{}, {}]", sim.ngram_range_min, sim.ngram_range_max);
    println!("n_features: {}", sim.n_features);
    println!("require_multiple_matches: {}", sim.require_multiple_matches);
    println!("max_workers: {}", engine.threading().max_workers);
    println!("ignored: {}", engine.ignore_matcher().patterns().join(","));
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let (engine, mut env) = build_engine(&cli)?;

    match cli.command {
        Command::Index { root } => run_index(&engine, root),
        Command::Scan { root, details } => run_scan(&engine, root, details),
        Command::Ignore { action } => run_ignore(&mut env, action),
        Command::Config { action } => match action {
            ConfigAction::Show => {
                run_config_show(&engine);
                Ok(())
            }
        },
    }
}
