//! Remote key/value + vector backend (component H): JSON documents over a
//! Redis Stack deployment (RedisJSON + RediSearch), HNSW vector index,
//! dual connection pools. Grounded on `storage_redis.py`.
//!
//! Two `r2d2::Pool<RedisConnectionManager>` pools are kept, matching
//! `_get_connection_pool`/`_get_str_connection_pool`: one used for
//! vector-bearing JSON round-trips, one for plain search/admin commands.
//! The `redis` crate ships no first-party `r2d2` integration, so
//! `RedisConnectionManager` below is a small hand-written
//! `r2d2::ManageConnection` impl around `redis::Client`.

use r2d2::Pool;
use redis::Commands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RedisConfig;
use crate::error::{DlpError, Result};
use crate::store::{now_unix, IndexOperation, IndexedFile, MatchKind, NewScanResult, ScanResult, ScanSummary, Store};
use crate::vectorize::SparseVector;

const FILE_INDEX: &str = "idx:dlp_files";
const RESULT_INDEX: &str = "idx:dlp_results";
const FILE_PREFIX: &str = "file:";
const RESULT_PREFIX: &str = "result:";
const BY_PATH_KEY: &str = "dlp:by_path";
const FILE_IDS_KEY: &str = "dlp:file_ids";
const RESULT_IDS_KEY: &str = "dlp:result_ids";
const SCAN_IDS_KEY: &str = "dlp:scan_ids";
const SCAN_TIMESTAMPS_KEY: &str = "dlp:scan_timestamps";

#[derive(Debug, Clone)]
pub struct RedisConnectionManager {
    client: redis::Client,
}

impl RedisConnectionManager {
    fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        Ok(Self { client })
    }
}

impl r2d2::ManageConnection for RedisConnectionManager {
    type Connection = redis::Connection;
    type Error = redis::RedisError;

    fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        self.client.get_connection()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        redis::cmd("PING").query(conn)
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Document shape persisted under `file:{uuid}` — dense float32 vector so
/// RediSearch's JSON-path VECTOR field can index it directly.
#[derive(Debug, Serialize, Deserialize)]
struct FileDoc {
    id: String,
    path: String,
    filename: String,
    content_digest: String,
    vector: Option<Vec<f32>>,
    mtime: f64,
    indexed_at: f64,
}

impl FileDoc {
    fn into_indexed_file(self) -> IndexedFile {
        let feature_vector = self.vector.map(|dense| SparseVector::from_dense(&dense).to_bytes());
        IndexedFile {
            id: self.id,
            path: self.path,
            filename: self.filename,
            content_digest: self.content_digest,
            feature_vector,
            mtime: self.mtime,
            indexed_at: self.indexed_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ResultDoc {
    id: String,
    scan_id: String,
    scanned_path: String,
    match_kind: String,
    score: f64,
    matched_file_id: String,
    matched_file_path: String,
    matched_file_name: String,
    timestamp: f64,
}

impl From<ResultDoc> for ScanResult {
    fn from(d: ResultDoc) -> Self {
        ScanResult {
            id: d.id,
            scan_id: d.scan_id,
            scanned_path: d.scanned_path,
            match_kind: MatchKind::parse(&d.match_kind).unwrap_or(MatchKind::Similarity),
            score: d.score,
            matched_file_id: d.matched_file_id,
            matched_file_path: d.matched_file_path,
            matched_file_name: d.matched_file_name,
            timestamp: d.timestamp,
        }
    }
}

pub struct KvStore {
    binary_pool: Pool<RedisConnectionManager>,
    string_pool: Pool<RedisConnectionManager>,
    vector_dim: usize,
}

impl KvStore {
    pub fn open(config: &RedisConfig) -> Result<Self> {
        let url = config.connection_url();
        let manager_a = RedisConnectionManager::new(&url)?;
        let manager_b = RedisConnectionManager::new(&url)?;
        let binary_pool = Pool::builder()
            .max_size(config.pool.max_connections)
            .min_idle(Some(config.pool.min_idle_connections))
            .connection_timeout(std::time::Duration::from_secs_f64(config.pool.connection_timeout))
            .build(manager_a)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let string_pool = Pool::builder()
            .max_size(config.pool.max_connections)
            .min_idle(Some(config.pool.min_idle_connections))
            .connection_timeout(std::time::Duration::from_secs_f64(config.pool.connection_timeout))
            .build(manager_b)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;

        let store = Self {
            binary_pool,
            string_pool,
            vector_dim: config.vector_dim,
        };
        store.ensure_indices()?;
        Ok(store)
    }

    fn binary_conn(&self) -> Result<r2d2::PooledConnection<RedisConnectionManager>> {
        self.binary_pool.get().map_err(|e| DlpError::StoreUnavailable(e.to_string()))
    }

    fn string_conn(&self) -> Result<r2d2::PooledConnection<RedisConnectionManager>> {
        self.string_pool.get().map_err(|e| DlpError::StoreUnavailable(e.to_string()))
    }

    /// Creates the two RediSearch indices if absent; `FT.CREATE` errors
    /// complaining the index already exists are swallowed, matching
    /// `_create_indices`'s "create if missing" behavior.
    fn ensure_indices(&self) -> Result<()> {
        let mut conn = self.string_conn()?;
        let file_create = redis::cmd("FT.CREATE")
            .arg(FILE_INDEX)
            .arg("ON")
            .arg("JSON")
            .arg("PREFIX")
            .arg(1)
            .arg(FILE_PREFIX)
            .arg("SCHEMA")
            .arg("$.path")
            .arg("AS")
            .arg("path")
            .arg("TAG")
            .arg("$.filename")
            .arg("AS")
            .arg("filename")
            .arg("TEXT")
            .arg("$.content_digest")
            .arg("AS")
            .arg("file_hash")
            .arg("TAG")
            .arg("$.mtime")
            .arg("AS")
            .arg("last_modified")
            .arg("NUMERIC")
            .arg("$.indexed_at")
            .arg("AS")
            .arg("indexed_at")
            .arg("TEXT")
            .arg("$.vector")
            .arg("AS")
            .arg("vector")
            .arg("VECTOR")
            .arg("HNSW")
            .arg(10)
            .arg("TYPE")
            .arg("FLOAT32")
            .arg("DIM")
            .arg(self.vector_dim)
            .arg("DISTANCE_METRIC")
            .arg("COSINE")
            .arg("M")
            .arg(16)
            .arg("EF_CONSTRUCTION")
            .arg(200)
            .query::<redis::Value>(&mut conn);
        ignore_index_exists(file_create)?;

        let result_create = redis::cmd("FT.CREATE")
            .arg(RESULT_INDEX)
            .arg("ON")
            .arg("JSON")
            .arg("PREFIX")
            .arg(1)
            .arg(RESULT_PREFIX)
            .arg("SCHEMA")
            .arg("$.scan_id")
            .arg("AS")
            .arg("scan_id")
            .arg("TAG")
            .arg("$.scanned_path")
            .arg("AS")
            .arg("file_path")
            .arg("TEXT")
            .arg("$.match_kind")
            .arg("AS")
            .arg("match_type")
            .arg("TAG")
            .arg("$.score")
            .arg("AS")
            .arg("score")
            .arg("NUMERIC")
            .arg("$.matched_file_id")
            .arg("AS")
            .arg("matched_file_id")
            .arg("TAG")
            .arg("$.timestamp")
            .arg("AS")
            .arg("timestamp")
            .arg("NUMERIC")
            .query::<redis::Value>(&mut conn);
        ignore_index_exists(result_create)
    }

    fn json_set<T: Serialize>(&self, key: &str, doc: &T) -> Result<()> {
        let mut conn = self.binary_conn()?;
        let payload = serde_json::to_string(doc).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        redis::cmd("JSON.SET")
            .arg(key)
            .arg("$")
            .arg(payload)
            .query::<redis::Value>(&mut conn)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    fn json_get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.binary_conn()?;
        let raw: Option<String> = redis::cmd("JSON.GET")
            .arg(key)
            .arg("$")
            .query(&mut conn)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let Some(raw) = raw else { return Ok(None) };
        // RedisJSON's `JSON.GET ... $` wraps the document in a one-element array.
        let mut values: Vec<T> = serde_json::from_str(&raw).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        Ok(values.pop())
    }

    fn file_doc(&self, id: &str) -> Result<Option<FileDoc>> {
        self.json_get(&format!("{FILE_PREFIX}{id}"))
    }
}

fn ignore_index_exists(result: redis::RedisResult<redis::Value>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.to_string().contains("Index already exists") => Ok(()),
        Err(e) => Err(DlpError::StoreUnavailable(e.to_string())),
    }
}

fn pack_f32_le(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

impl Store for KvStore {
    fn upsert(
        &self,
        path: &str,
        filename: &str,
        digest: &str,
        vector: Option<&[u8]>,
        mtime: f64,
    ) -> Result<IndexedFile> {
        let mut conn = self.string_conn()?;
        let existing_id: Option<String> = conn
            .hget(BY_PATH_KEY, path)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let id = existing_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let indexed_at = now_unix();
        let dense_vector = vector
            .and_then(SparseVector::from_bytes)
            .map(|sv| sv.to_dense(self.vector_dim));

        let doc = FileDoc {
            id: id.clone(),
            path: path.to_string(),
            filename: filename.to_string(),
            content_digest: digest.to_string(),
            vector: dense_vector,
            mtime,
            indexed_at,
        };
        self.json_set(&format!("{FILE_PREFIX}{id}"), &doc)?;

        let _: () = conn
            .hset(BY_PATH_KEY, path, &id)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let _: () = conn
            .sadd(FILE_IDS_KEY, &id)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;

        Ok(doc.into_indexed_file())
    }

    fn get_by_path(&self, path: &str) -> Result<Option<IndexedFile>> {
        let mut conn = self.string_conn()?;
        let id: Option<String> = conn.hget(BY_PATH_KEY, path).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        match id {
            Some(id) => Ok(self.file_doc(&id)?.map(|d| d.into_indexed_file())),
            None => Ok(None),
        }
    }

    fn get_by_id(&self, id: &str) -> Result<Option<IndexedFile>> {
        Ok(self.file_doc(id)?.map(|d| d.into_indexed_file()))
    }

    fn find_by_digest(&self, digest: &str) -> Result<Option<IndexedFile>> {
        let mut conn = self.string_conn()?;
        let reply: redis::Value = redis::cmd("FT.SEARCH")
            .arg(FILE_INDEX)
            .arg(format!("@file_hash:{{{digest}}}"))
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query(&mut conn)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let Some(key) = first_search_key(&reply) else {
            return Ok(None);
        };
        let id = key.trim_start_matches(FILE_PREFIX);
        Ok(self.file_doc(id)?.map(|d| d.into_indexed_file()))
    }

    fn list_all(&self) -> Result<Vec<IndexedFile>> {
        let mut conn = self.string_conn()?;
        let ids: Vec<String> = conn.smembers(FILE_IDS_KEY).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = self.file_doc(&id)? {
                out.push(doc.into_indexed_file());
            }
        }
        Ok(out)
    }

    fn list_with_vectors(&self) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter_map(|f| f.feature_vector.map(|v| (f.id, v)))
            .collect())
    }

    fn count(&self) -> Result<usize> {
        let mut conn = self.string_conn()?;
        let n: usize = conn.scard(FILE_IDS_KEY).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        Ok(n)
    }

    fn delete_by_id(&self, id: &str) -> Result<bool> {
        let Some(doc) = self.file_doc(id)? else {
            return Ok(false);
        };
        let mut conn = self.string_conn()?;
        let _: () = conn
            .del(format!("{FILE_PREFIX}{id}"))
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let _: () = conn.hdel(BY_PATH_KEY, &doc.path).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let _: () = conn.srem(FILE_IDS_KEY, id).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        Ok(true)
    }

    fn delete_all(&self) -> Result<usize> {
        let mut conn = self.string_conn()?;
        let file_ids: Vec<String> = conn.smembers(FILE_IDS_KEY).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        for id in &file_ids {
            let _: () = conn.del(format!("{FILE_PREFIX}{id}")).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        }
        let _: () = conn.del(BY_PATH_KEY).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let _: () = conn.del(FILE_IDS_KEY).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;

        // (R1): purge every scan result too.
        let result_ids: Vec<String> = conn.smembers(RESULT_IDS_KEY).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        for id in &result_ids {
            let _: () = conn.del(format!("{RESULT_PREFIX}{id}")).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        }
        let _: () = conn.del(RESULT_IDS_KEY).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let _: () = conn.del(SCAN_IDS_KEY).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let _: () = conn.del(SCAN_TIMESTAMPS_KEY).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;

        Ok(file_ids.len())
    }

    fn add_scan_result(&self, result: NewScanResult) -> Result<ScanResult> {
        let id = Uuid::new_v4().to_string();
        let timestamp = now_unix();
        let doc = ResultDoc {
            id: id.clone(),
            scan_id: result.scan_id.clone(),
            scanned_path: result.scanned_path,
            match_kind: result.match_kind.as_str().to_string(),
            score: result.score,
            matched_file_id: result.matched_file_id,
            matched_file_path: result.matched_file_path,
            matched_file_name: result.matched_file_name,
            timestamp,
        };
        self.json_set(&format!("{RESULT_PREFIX}{id}"), &doc)?;

        let mut conn = self.string_conn()?;
        let _: () = conn.sadd(RESULT_IDS_KEY, &id).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let _: () = conn
            .sadd(format!("dlp:scan_members:{}", result.scan_id), &id)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let _: () = conn.sadd(SCAN_IDS_KEY, &result.scan_id).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let _: () = conn
            .zadd(SCAN_TIMESTAMPS_KEY, &result.scan_id, timestamp)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;

        Ok(doc.into())
    }

    fn results_for(&self, scan_id: &str) -> Result<Vec<ScanResult>> {
        let mut conn = self.string_conn()?;
        let ids: Vec<String> = conn
            .smembers(format!("dlp:scan_members:{scan_id}"))
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = self.json_get::<ResultDoc>(&format!("{RESULT_PREFIX}{id}"))? {
                out.push(doc.into());
            }
        }
        Ok(out)
    }

    fn all_results(&self) -> Result<Vec<ScanResult>> {
        let mut conn = self.string_conn()?;
        let ids: Vec<String> = conn.smembers(RESULT_IDS_KEY).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = self.json_get::<ResultDoc>(&format!("{RESULT_PREFIX}{id}"))? {
                out.push(doc.into());
            }
        }
        Ok(out)
    }

    fn distinct_scan_count(&self) -> Result<usize> {
        let mut conn = self.string_conn()?;
        let n: usize = conn.scard(SCAN_IDS_KEY).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        Ok(n)
    }

    fn result_count(&self) -> Result<usize> {
        let mut conn = self.string_conn()?;
        let n: usize = conn.scard(RESULT_IDS_KEY).map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        Ok(n)
    }

    fn scans_summary(&self) -> Result<Vec<ScanSummary>> {
        let mut conn = self.string_conn()?;
        let ranked: Vec<(String, f64)> = conn
            .zrevrange_withscores(SCAN_TIMESTAMPS_KEY, 0, -1)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
        let mut out = Vec::with_capacity(ranked.len());
        for (scan_id, timestamp) in ranked {
            let matches_count: usize = conn
                .scard(format!("dlp:scan_members:{scan_id}"))
                .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;
            out.push(ScanSummary { scan_id, matches_count, timestamp });
        }
        Ok(out)
    }

    fn record_index_operation(&self, op: &IndexOperation) -> Result<()> {
        self.json_set(&format!("dlp:index_op:{}", op.id), op)
    }

    fn find_similar(&self, query_vector: &[u8], threshold: f64, k: usize) -> Result<Vec<(String, f64)>> {
        let Some(sparse) = SparseVector::from_bytes(query_vector) else {
            return Ok(Vec::new());
        };
        let dense = sparse.to_dense(self.vector_dim);
        let bytes = pack_f32_le(&dense);
        let fetch_k = (2 * k).max(1);

        let mut conn = self.binary_conn()?;
        let reply: redis::Value = redis::cmd("FT.SEARCH")
            .arg(FILE_INDEX)
            .arg(format!("*=>[KNN {fetch_k} @vector $vec AS vector_score]"))
            .arg("PARAMS")
            .arg(2)
            .arg("vec")
            .arg(bytes)
            .arg("SORTBY")
            .arg("vector_score")
            .arg("DIALECT")
            .arg(2)
            .query(&mut conn)
            .map_err(|e| DlpError::StoreUnavailable(e.to_string()))?;

        let mut scored = parse_knn_reply(&reply);
        scored.retain(|(_, score)| *score >= threshold);
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        scored.dedup_by(|a, b| a.0 == b.0);
        scored.truncate(k);
        Ok(scored)
    }

    fn health_check(&self) -> bool {
        match self.string_conn() {
            Ok(mut conn) => redis::cmd("PING").query::<String>(&mut conn).is_ok(),
            Err(_) => false,
        }
    }
}

/// Extracts the first result key from an `FT.SEARCH` reply shaped
/// `[count, key1, fields1, key2, fields2, ...]`.
fn first_search_key(reply: &redis::Value) -> Option<String> {
    if let redis::Value::Array(items) = reply {
        if items.len() >= 2 {
            if let redis::Value::BulkString(bytes) = &items[1] {
                return Some(String::from_utf8_lossy(bytes).to_string());
            }
        }
    }
    None
}

/// Parses an `FT.SEARCH ... KNN` reply into `(file_id, similarity)` pairs,
/// converting RediSearch's cosine *distance* (`vector_score`, lower is
/// closer) into similarity (`1 - distance`).
fn parse_knn_reply(reply: &redis::Value) -> Vec<(String, f64)> {
    let mut out = Vec::new();
    let redis::Value::Array(items) = reply else {
        return out;
    };
    let mut i = 1;
    while i + 1 < items.len() {
        let key = match &items[i] {
            redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
            _ => {
                i += 2;
                continue;
            }
        };
        let id = key.trim_start_matches(FILE_PREFIX).to_string();
        let mut distance = None;
        if let redis::Value::Array(fields) = &items[i + 1] {
            let mut j = 0;
            while j + 1 < fields.len() {
                if let redis::Value::BulkString(name) = &fields[j] {
                    if name == b"vector_score" {
                        if let redis::Value::BulkString(val) = &fields[j + 1] {
                            distance = String::from_utf8_lossy(val).parse::<f64>().ok();
                        }
                    }
                }
                j += 2;
            }
        }
        if let Some(d) = distance {
            out.push((id, 1.0 - d));
        }
        i += 2;
    }
    out
}
