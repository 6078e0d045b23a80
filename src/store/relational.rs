//! Embedded relational backend (component G): three tables over a pooled
//! SQLite connection, grounded on `storage_sqlite.py`'s method set and
//! `database.py`'s pooling intent.
//!
//! File-backed databases get a bounded `r2d2` pool; `:memory:` databases are
//! pinned to a pool of size 1, since an in-memory SQLite database is private
//! to the connection that opened it and a second pooled connection would see
//! an entirely separate, empty database.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};

use crate::config::SqlitePoolConfig;
use crate::error::{DlpError, Result};
use crate::store::{now_unix, IndexOperation, IndexedFile, MatchKind, NewScanResult, ScanResult, ScanSummary, Store};
use crate::vectorize::SparseVector;

pub struct RelationalStore {
    pool: Pool<SqliteConnectionManager>,
}

impl RelationalStore {
    pub fn open(database_path: &str, config: &SqlitePoolConfig) -> Result<Self> {
        let is_memory = database_path == ":memory:";
        let manager = if is_memory {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(database_path)
        }
        .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;"));

        let max_size = if is_memory {
            1
        } else {
            (config.pool_size + config.max_overflow).max(1)
        };

        let mut builder = Pool::builder()
            .max_size(max_size)
            .connection_timeout(std::time::Duration::from_secs(config.timeout_secs.max(1)));
        if config.pre_ping {
            builder = builder.test_on_check_out(true);
        }
        let pool = builder
            .build(manager)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;

        let store = Self { pool };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS indexed_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                filename TEXT NOT NULL,
                content_digest TEXT NOT NULL,
                feature_vector BLOB,
                mtime REAL NOT NULL,
                indexed_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_indexed_files_digest ON indexed_files(content_digest);

            CREATE TABLE IF NOT EXISTS scan_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scan_id TEXT NOT NULL,
                scanned_path TEXT NOT NULL,
                match_kind TEXT NOT NULL,
                score REAL NOT NULL,
                matched_file_id INTEGER NOT NULL REFERENCES indexed_files(id) ON DELETE CASCADE,
                matched_file_path TEXT NOT NULL,
                matched_file_name TEXT NOT NULL,
                timestamp REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scan_results_scan_id ON scan_results(scan_id);

            CREATE TABLE IF NOT EXISTS index_operations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL,
                status TEXT NOT NULL,
                total_files INTEGER NOT NULL,
                files_indexed INTEGER NOT NULL,
                files_skipped INTEGER NOT NULL,
                started_at REAL NOT NULL,
                completed_at REAL,
                error_message TEXT
            );",
        )
        .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    fn row_to_indexed_file(row: &rusqlite::Row) -> rusqlite::Result<IndexedFile> {
        let id: i64 = row.get(0)?;
        Ok(IndexedFile {
            id: id.to_string(),
            path: row.get(1)?,
            filename: row.get(2)?,
            content_digest: row.get(3)?,
            feature_vector: row.get(4)?,
            mtime: row.get(5)?,
            indexed_at: row.get(6)?,
        })
    }

    fn row_to_scan_result(row: &rusqlite::Row) -> rusqlite::Result<ScanResult> {
        let id: i64 = row.get(0)?;
        let matched_file_id: i64 = row.get(5)?;
        let kind_str: String = row.get(3)?;
        Ok(ScanResult {
            id: id.to_string(),
            scan_id: row.get(1)?,
            scanned_path: row.get(2)?,
            match_kind: MatchKind::parse(&kind_str).unwrap_or(MatchKind::Similarity),
            score: row.get(4)?,
            matched_file_id: matched_file_id.to_string(),
            matched_file_path: row.get(6)?,
            matched_file_name: row.get(7)?,
            timestamp: row.get(8)?,
        })
    }
}

impl Store for RelationalStore {
    fn upsert(
        &self,
        path: &str,
        filename: &str,
        digest: &str,
        vector: Option<&[u8]>,
        mtime: f64,
    ) -> Result<IndexedFile> {
        let conn = self.conn()?;
        let indexed_at = now_unix();
        let mut stmt = conn
            .prepare_cached(
                "INSERT INTO indexed_files (path, filename, content_digest, feature_vector, mtime, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(path) DO UPDATE SET
                    filename = excluded.filename,
                    content_digest = excluded.content_digest,
                    feature_vector = excluded.feature_vector,
                    mtime = excluded.mtime,
                    indexed_at = excluded.indexed_at
                 RETURNING id, path, filename, content_digest, feature_vector, mtime, indexed_at",
            )
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        stmt.query_row(params![path, filename, digest, vector, mtime, indexed_at], Self::row_to_indexed_file)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))
    }

    fn get_by_path(&self, path: &str) -> Result<Option<IndexedFile>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, path, filename, content_digest, feature_vector, mtime, indexed_at
             FROM indexed_files WHERE path = ?1",
            params![path],
            Self::row_to_indexed_file,
        )
        .optional()
        .map_err(|e| DlpError::StoreUnavailable(e.to_string()))
    }

    fn get_by_id(&self, id: &str) -> Result<Option<IndexedFile>> {
        let Ok(id_num) = id.parse::<i64>() else {
            return Ok(None);
        };
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, path, filename, content_digest, feature_vector, mtime, indexed_at
             FROM indexed_files WHERE id = ?1",
            params![id_num],
            Self::row_to_indexed_file,
        )
        .optional()
        .map_err(|e| DlpError::StoreUnavailable(e.to_string()))
    }

    fn find_by_digest(&self, digest: &str) -> Result<Option<IndexedFile>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, path, filename, content_digest, feature_vector, mtime, indexed_at
             FROM indexed_files WHERE content_digest = ?1 LIMIT 1",
            params![digest],
            Self::row_to_indexed_file,
        )
        .optional()
        .map_err(|e| DlpError::StoreUnavailable(e.to_string()))
    }

    fn list_all(&self) -> Result<Vec<IndexedFile>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, path, filename, content_digest, feature_vector, mtime, indexed_at FROM indexed_files")
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let rows = stmt
            .query_map([], Self::row_to_indexed_file)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))
    }

    fn list_with_vectors(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, feature_vector FROM indexed_files WHERE feature_vector IS NOT NULL")
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let vec: Vec<u8> = row.get(1)?;
                Ok((id.to_string(), vec))
            })
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))
    }

    fn count(&self) -> Result<usize> {
        let conn = self.conn()?;
        conn.query_row("SELECT COUNT(*) FROM indexed_files", [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))
    }

    fn delete_by_id(&self, id: &str) -> Result<bool> {
        let Ok(id_num) = id.parse::<i64>() else {
            return Ok(false);
        };
        let conn = self.conn()?;
        let changed = conn
            .execute("DELETE FROM indexed_files WHERE id = ?1", params![id_num])
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        Ok(changed > 0)
    }

    fn delete_all(&self) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn
            .execute("DELETE FROM indexed_files", [])
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        Ok(changed)
    }

    fn add_scan_result(&self, result: NewScanResult) -> Result<ScanResult> {
        let matched_id: i64 = result
            .matched_file_id
            .parse()
            .map_err(|_| DlpError::InvalidPath(format!("invalid matched_file_id: {}", result.matched_file_id)))?;
        let conn = self.conn()?;
        let timestamp = now_unix();
        conn.query_row(
            "INSERT INTO scan_results
                (scan_id, scanned_path, match_kind, score, matched_file_id, matched_file_path, matched_file_name, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             RETURNING id, scan_id, scanned_path, match_kind, score, matched_file_id, matched_file_path, matched_file_name, timestamp",
            params![
                result.scan_id,
                result.scanned_path,
                result.match_kind.as_str(),
                result.score,
                matched_id,
                result.matched_file_path,
                result.matched_file_name,
                timestamp
            ],
            Self::row_to_scan_result,
        )
        .map_err(|e| DlpError::StoreUnavailable(e.to_string()))
    }

    fn results_for(&self, scan_id: &str) -> Result<Vec<ScanResult>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, scan_id, scanned_path, match_kind, score, matched_file_id, matched_file_path, matched_file_name, timestamp
                 FROM scan_results WHERE scan_id = ?1",
            )
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let rows = stmt
            .query_map(params![scan_id], Self::row_to_scan_result)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))
    }

    fn all_results(&self) -> Result<Vec<ScanResult>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, scan_id, scanned_path, match_kind, score, matched_file_id, matched_file_path, matched_file_name, timestamp
                 FROM scan_results",
            )
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let rows = stmt
            .query_map([], Self::row_to_scan_result)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))
    }

    fn distinct_scan_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        conn.query_row("SELECT COUNT(DISTINCT scan_id) FROM scan_results", [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))
    }

    fn result_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        conn.query_row("SELECT COUNT(*) FROM scan_results", [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))
    }

    fn scans_summary(&self) -> Result<Vec<ScanSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT scan_id, COUNT(*) as matches_count, MAX(timestamp) as ts
                 FROM scan_results GROUP BY scan_id ORDER BY ts DESC",
            )
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ScanSummary {
                    scan_id: row.get(0)?,
                    matches_count: row.get::<_, i64>(1)? as usize,
                    timestamp: row.get(2)?,
                })
            })
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))
    }

    fn record_index_operation(&self, op: &IndexOperation) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO index_operations
                (path, status, total_files, files_indexed, files_skipped, started_at, completed_at, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                op.path,
                op.status,
                op.total_files as i64,
                op.files_indexed as i64,
                op.files_skipped as i64,
                op.started_at,
                op.completed_at,
                op.error_message
            ],
        )
        .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    fn find_similar(&self, query_vector: &[u8], threshold: f64, k: usize) -> Result<Vec<(String, f64)>> {
        let Some(query) = SparseVector::from_bytes(query_vector) else {
            return Ok(Vec::new());
        };
        let dim = query.dim();
        let dense_query = query.to_dense(dim);
        let query_norm: f64 = dense_query.iter().map(|v| (*v as f64).powi(2)).sum::<f64>().sqrt();
        if query_norm == 0.0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(String, f64)> = Vec::new();
        for (id, bytes) in self.list_with_vectors()? {
            let Some(candidate) = SparseVector::from_bytes(&bytes) else {
                continue;
            };
            let dense_candidate = candidate.to_dense(dim);
            let mut dot = 0.0f64;
            let mut candidate_norm = 0.0f64;
            for (a, b) in dense_candidate.iter().zip(dense_query.iter()) {
                dot += (*a as f64) * (*b as f64);
                candidate_norm += (*a as f64).powi(2);
            }
            let candidate_norm = candidate_norm.sqrt();
            if candidate_norm == 0.0 {
                continue;
            }
            let score = dot / (candidate_norm * query_norm);
            if score >= threshold {
                scored.push((id, score));
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        scored.truncate(k);
        Ok(scored)
    }

    fn health_check(&self) -> bool {
        match self.conn() {
            Ok(conn) => conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SqlitePoolConfig;

    fn store() -> RelationalStore {
        RelationalStore::open(":memory:", &SqlitePoolConfig::default()).unwrap()
    }

    #[test]
    fn upsert_then_get_by_path_round_trips_digest() {
        let s = store();
        let f = s.upsert("/a/b.txt", "b.txt", "deadbeef", None, 100.0).unwrap();
        let got = s.get_by_path("/a/b.txt").unwrap().unwrap();
        assert_eq!(got.content_digest, "deadbeef");
        assert_eq!(got.id, f.id);
    }

    #[test]
    fn upsert_is_idempotent_on_path_and_overwrites_digest() {
        let s = store();
        s.upsert("/x/y", "y", "hash1", None, 1.0).unwrap();
        s.upsert("/x/y", "y", "hash2", None, 2.0).unwrap();
        assert_eq!(s.count().unwrap(), 1);
        assert_eq!(s.get_by_path("/x/y").unwrap().unwrap().content_digest, "hash2");
    }

    #[test]
    fn find_by_digest_locates_row() {
        let s = store();
        s.upsert("/a", "a", "hashA", None, 1.0).unwrap();
        let found = s.find_by_digest("hashA").unwrap();
        assert!(found.is_some());
        assert!(s.find_by_digest("missing").unwrap().is_none());
    }

    #[test]
    fn delete_all_cascades_to_scan_results() {
        let s = store();
        let f = s.upsert("/a", "a", "h", None, 1.0).unwrap();
        s.add_scan_result(NewScanResult {
            scan_id: "scan-1".to_string(),
            scanned_path: "/scan/a".to_string(),
            match_kind: MatchKind::Exact,
            score: 1.0,
            matched_file_id: f.id.clone(),
            matched_file_path: f.path.clone(),
            matched_file_name: f.filename.clone(),
        })
        .unwrap();
        assert_eq!(s.result_count().unwrap(), 1);
        let deleted = s.delete_all().unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(s.count().unwrap(), 0);
        assert_eq!(s.result_count().unwrap(), 0);
    }

    #[test]
    fn scans_summary_orders_by_timestamp_descending() {
        let s = store();
        let f = s.upsert("/a", "a", "h", None, 1.0).unwrap();
        for scan_id in ["scan-1", "scan-2"] {
            s.add_scan_result(NewScanResult {
                scan_id: scan_id.to_string(),
                scanned_path: "/scan/a".to_string(),
                match_kind: MatchKind::Exact,
                score: 1.0,
                matched_file_id: f.id.clone(),
                matched_file_path: f.path.clone(),
                matched_file_name: f.filename.clone(),
            })
            .unwrap();
        }
        let summary = s.scans_summary().unwrap();
        assert_eq!(summary.len(), 2);
        assert!(summary[0].timestamp >= summary[1].timestamp);
    }

    #[test]
    fn health_check_reports_true_for_open_store() {
        let s = store();
        assert!(s.health_check());
    }
}
