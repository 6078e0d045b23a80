//! Progress store (component I): a process-wide registry of per-task
//! state, publish/subscribe fan-out, and cooperative cancellation.
//!
//! Generalized from the teacher's single-engine `Arc<RwLock<IndexingProgress>>`
//! broadcast pattern (`search/background_indexer.rs::broadcast_progress`)
//! into a registry keyed by task id, matching `progress_store.py`'s
//! `create`/`update`/`subscribe`/`unsubscribe`/`cancel_task`/`is_cancelled`/
//! `clear_cancelled` one-to-one. Threaded, not async: pipelines here are
//! rayon/thread-based, so plain `std::sync::mpsc` bounded channels with
//! `try_send` (drop-on-full) stand in for the source's per-subscriber
//! asyncio queues.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

/// Bound on each subscriber's update channel; a slow subscriber drops
/// updates rather than backpressuring the publishing pipeline.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Index,
    Scan,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Index => "index",
            TaskType::Scan => "scan",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Counting,
    Processing,
    Completed,
    Cancelling,
    Cancelled,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Counting => "counting",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelling => "cancelling",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Error)
    }
}

/// Ephemeral, process-local task state (spec.md §3's `TaskProgress`).
#[derive(Debug, Clone)]
pub struct TaskProgress {
    pub task_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub total_files: usize,
    pub files_processed: usize,
    /// `files_indexed` for an index task, `matches_found` for a scan task.
    pub files_indexed_or_matches: usize,
    pub access_denied_count: usize,
    pub current_file: Option<String>,
    pub started_at: f64,
    pub completed_at: Option<f64>,
    pub error_message: Option<String>,
}

impl TaskProgress {
    fn new(task_id: String, task_type: TaskType) -> Self {
        Self {
            task_id,
            task_type,
            status: TaskStatus::Pending,
            total_files: 0,
            files_processed: 0,
            files_indexed_or_matches: 0,
            access_denied_count: 0,
            current_file: None,
            started_at: crate::store::now_unix(),
            completed_at: None,
            error_message: None,
        }
    }

    /// Human-readable completion message; access-denied counts are always
    /// included per spec.md §7's "Access-denied counts are included in
    /// completion messages".
    pub fn completion_message(&self) -> String {
        let verb = match self.task_type {
            TaskType::Index => "indexed",
            TaskType::Scan => "scanned",
        };
        format!(
            "{}: {} total, {} processed, {} {}, {} access denied",
            self.status.as_str(),
            self.total_files,
            self.files_processed,
            self.files_indexed_or_matches,
            verb,
            self.access_denied_count
        )
    }
}

/// A mutation applied to a `TaskProgress` under the registry's lock; built
/// with the setter methods below and passed to `ProgressRegistry::update`.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub status: Option<TaskStatus>,
    pub total_files: Option<usize>,
    pub files_processed_delta: usize,
    pub indexed_or_matches_delta: usize,
    pub access_denied_delta: usize,
    pub current_file: Option<Option<String>>,
    pub error_message: Option<String>,
}

impl ProgressUpdate {
    pub fn status(mut self, s: TaskStatus) -> Self {
        self.status = Some(s);
        self
    }
    pub fn total_files(mut self, n: usize) -> Self {
        self.total_files = Some(n);
        self
    }
    pub fn processed_one(mut self) -> Self {
        self.files_processed_delta += 1;
        self
    }
    pub fn indexed_or_matched_one(mut self) -> Self {
        self.indexed_or_matches_delta += 1;
        self
    }
    pub fn indexed_or_matched_one_by(mut self, n: usize) -> Self {
        self.indexed_or_matches_delta += n;
        self
    }
    pub fn access_denied_one(mut self) -> Self {
        self.access_denied_delta += 1;
        self
    }
    pub fn current_file(mut self, f: Option<String>) -> Self {
        self.current_file = Some(f);
        self
    }
    pub fn error_message(mut self, msg: impl Into<String>) -> Self {
        self.error_message = Some(msg.into());
        self
    }
}

struct Registry {
    tasks: HashMap<String, TaskProgress>,
    subscribers: HashMap<String, Vec<SyncSender<TaskProgress>>>,
    cancelled: HashSet<String>,
}

/// Process-wide registry keyed by task id. Owned by the `Engine` for its
/// lifetime per spec.md §9's globals-to-explicit-handles redesign; no
/// module-level singleton.
pub struct ProgressRegistry {
    inner: Mutex<Registry>,
}

impl Default for ProgressRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry {
                tasks: HashMap::new(),
                subscribers: HashMap::new(),
                cancelled: HashSet::new(),
            }),
        }
    }

    pub fn create(&self, task_id: impl Into<String>, task_type: TaskType) {
        let task_id = task_id.into();
        let mut reg = self.inner.lock().unwrap();
        reg.tasks.insert(task_id.clone(), TaskProgress::new(task_id, task_type));
    }

    /// Mutates the task under a short critical section, then publishes a
    /// snapshot to every subscriber's channel non-blockingly (drop on full).
    pub fn update(&self, task_id: &str, delta: ProgressUpdate) {
        let mut reg = self.inner.lock().unwrap();
        let snapshot = {
            let Some(task) = reg.tasks.get_mut(task_id) else {
                return;
            };
            if let Some(status) = delta.status {
                task.status = status;
                if status.is_terminal() {
                    task.completed_at = Some(crate::store::now_unix());
                }
            }
            if let Some(total) = delta.total_files {
                task.total_files = total;
            }
            task.files_processed += delta.files_processed_delta;
            task.files_indexed_or_matches += delta.indexed_or_matches_delta;
            task.access_denied_count += delta.access_denied_delta;
            if let Some(current) = delta.current_file {
                task.current_file = current;
            }
            if let Some(msg) = delta.error_message {
                task.error_message = Some(msg);
            }
            task.clone()
        };
        if let Some(subs) = reg.subscribers.get_mut(task_id) {
            subs.retain(|tx| match tx.try_send(snapshot.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Disconnected(_)) => false,
            });
        }
    }

    pub fn get(&self, task_id: &str) -> Option<TaskProgress> {
        self.inner.lock().unwrap().tasks.get(task_id).cloned()
    }

    pub fn subscribe(&self, task_id: &str) -> Receiver<TaskProgress> {
        let (tx, rx) = sync_channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut reg = self.inner.lock().unwrap();
        reg.subscribers.entry(task_id.to_string()).or_default().push(tx);
        rx
    }

    /// Marks `task_id` cancelled and sets status to `cancelling`; the
    /// pipeline observes this via `is_cancelled` between files and
    /// transitions to `cancelled` once drained.
    pub fn cancel(&self, task_id: &str) {
        let mut reg = self.inner.lock().unwrap();
        reg.cancelled.insert(task_id.to_string());
        if let Some(task) = reg.tasks.get_mut(task_id) {
            task.status = TaskStatus::Cancelling;
        }
    }

    pub fn is_cancelled(&self, task_id: &str) -> bool {
        self.inner.lock().unwrap().cancelled.contains(task_id)
    }

    /// Called by the pipeline after it has drained in response to a
    /// cancellation, so the id can be reused by a later task with the same
    /// value (task ids are caller-supplied UUIDs, so collisions are
    /// vanishingly unlikely, but clearing keeps the cancelled set bounded).
    pub fn clear_cancelled(&self, task_id: &str) {
        self.inner.lock().unwrap().cancelled.remove(task_id);
    }

    /// Evicts a terminal task's state and subscriber list entirely.
    pub fn cleanup(&self, task_id: &str) {
        let mut reg = self.inner.lock().unwrap();
        reg.tasks.remove(task_id);
        reg.subscribers.remove(task_id);
        reg.cancelled.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_get_returns_pending_task() {
        let reg = ProgressRegistry::new();
        reg.create("t1", TaskType::Index);
        let t = reg.get("t1").unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.task_type, TaskType::Index);
    }

    #[test]
    fn update_applies_deltas_and_publishes_snapshot() {
        let reg = ProgressRegistry::new();
        reg.create("t1", TaskType::Scan);
        let rx = reg.subscribe("t1");
        reg.update("t1", ProgressUpdate::default().total_files(10).status(TaskStatus::Processing));
        reg.update("t1", ProgressUpdate::default().processed_one().indexed_or_matched_one());

        let snap = reg.get("t1").unwrap();
        assert_eq!(snap.total_files, 10);
        assert_eq!(snap.files_processed, 1);
        assert_eq!(snap.files_indexed_or_matches, 1);
        assert_eq!(snap.status, TaskStatus::Processing);

        let received: Vec<_> = rx.try_iter().collect();
        assert_eq!(received.len(), 2);
    }

    #[test]
    fn cancel_marks_cancelled_set_and_sets_status() {
        let reg = ProgressRegistry::new();
        reg.create("t1", TaskType::Index);
        assert!(!reg.is_cancelled("t1"));
        reg.cancel("t1");
        assert!(reg.is_cancelled("t1"));
        assert_eq!(reg.get("t1").unwrap().status, TaskStatus::Cancelling);
        reg.clear_cancelled("t1");
        assert!(!reg.is_cancelled("t1"));
    }

    #[test]
    fn terminal_status_sets_completed_at() {
        let reg = ProgressRegistry::new();
        reg.create("t1", TaskType::Index);
        reg.update("t1", ProgressUpdate::default().status(TaskStatus::Completed));
        assert!(reg.get("t1").unwrap().completed_at.is_some());
    }

    #[test]
    fn completion_message_includes_access_denied_count() {
        let reg = ProgressRegistry::new();
        reg.create("t1", TaskType::Index);
        reg.update(
            "t1",
            ProgressUpdate::default()
                .total_files(5)
                .processed_one()
                .access_denied_one()
                .status(TaskStatus::Completed),
        );
        let msg = reg.get("t1").unwrap().completion_message();
        assert!(msg.contains("1 access denied"));
    }

    #[test]
    fn dropped_subscriber_is_pruned_on_next_update() {
        let reg = ProgressRegistry::new();
        reg.create("t1", TaskType::Index);
        let rx = reg.subscribe("t1");
        drop(rx);

        reg.update("t1", ProgressUpdate::default().processed_one());
        assert_eq!(reg.inner.lock().unwrap().subscribers.get("t1").unwrap().len(), 0);
    }

    #[test]
    fn cleanup_removes_task_state() {
        let reg = ProgressRegistry::new();
        reg.create("t1", TaskType::Index);
        reg.cleanup("t1");
        assert!(reg.get("t1").is_none());
    }
}
