//! Persistent result store
//!
//! The cache directory holds a single SQLite database:
//! - `cache.db`: entries, the scope index and store metadata (WAL mode)
//!
//! A `CacheStore` is a handle, not a connection. Every operation opens its own
//! connection, so handles can be cloned across threads and several processes
//! can share one directory. SQLite's write lock is the only critical section;
//! waiting on it is bounded by `CacheLimits::lock_timeout`.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::models::{CacheEntry, CacheNamespace, CachePayload, CacheStats, NamespaceStats};
use crate::scope_index::{self, IndexRecord, ScopeCandidate};
use crate::signature::ScopeSignature;

/// Database file within the cache directory
pub const CACHE_DB: &str = "cache.db";

/// Payload format fingerprint computed by build.rs
pub const SCHEMA_HASH: &str = env!("CACHE_SCHEMA_HASH");

const MS_PER_DAY: i64 = 86_400_000;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS entries (
        namespace TEXT NOT NULL,
        key TEXT NOT NULL,
        payload BLOB NOT NULL,
        scope BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        size_bytes INTEGER NOT NULL,
        PRIMARY KEY (namespace, key)
    );
    CREATE INDEX IF NOT EXISTS idx_entries_created ON entries(created_at, key);
    CREATE INDEX IF NOT EXISTS idx_entries_expires ON entries(expires_at);
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

/// Bounds applied to a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLimits {
    /// Entry lifetime in days. 0 means every lookup misses.
    pub ttl_days: u64,
    /// Total stored bytes the store evicts down to
    pub size_limit_bytes: u64,
    /// Longest wait for another writer before `LockTimeout`
    pub lock_timeout: Duration,
    /// zstd level for stored payloads
    pub compression_level: i32,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            ttl_days: 7,
            size_limit_bytes: 100 * 1024 * 1024,
            lock_timeout: Duration::from_millis(5000),
            compression_level: 3,
        }
    }
}

impl CacheLimits {
    pub fn from_megabytes(ttl_days: u64, size_limit_mb: u64) -> Self {
        Self {
            ttl_days,
            size_limit_bytes: size_limit_mb.saturating_mul(1024 * 1024),
            ..Default::default()
        }
    }

    fn ttl_ms(&self) -> i64 {
        i64::try_from(self.ttl_days)
            .unwrap_or(i64::MAX)
            .saturating_mul(MS_PER_DAY)
    }
}

/// What an eviction pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub expired_removed: usize,
    pub evicted: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// What a `put` did besides writing its own entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutReport {
    pub size_bytes: u64,
    /// Older entries for the same query that were replaced
    pub superseded: usize,
    pub eviction: Option<EvictionReport>,
}

/// Handle to a cache directory
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
    limits: CacheLimits,
    closed: Arc<AtomicBool>,
}

impl CacheStore {
    /// Open (creating if needed) the store in `dir`.
    ///
    /// Drops every entry if the database was written by a different payload
    /// format, then sweeps expired entries.
    pub fn open(dir: impl AsRef<Path>, limits: CacheLimits) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let unavailable = |reason: String| Error::StoreUnavailable { path: dir.clone(), reason };

        std::fs::create_dir_all(&dir).map_err(|e| unavailable(e.to_string()))?;

        let store = Self {
            dir: dir.clone(),
            limits,
            closed: Arc::new(AtomicBool::new(false)),
        };

        store.init_db().map_err(|e| match e {
            Error::LockTimeout { .. } => e,
            other => unavailable(other.to_string()),
        })?;

        let swept = store.sweep_expired()?;
        log::info!("Opened cache store at {:?} ({} expired entries swept)", store.dir, swept);
        Ok(store)
    }

    fn init_db(&self) -> Result<()> {
        self.with_conn(|conn| {
            let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
            log::trace!("cache.db journal_mode={}", mode);

            conn.execute_batch(SCHEMA)?;
            conn.execute_batch(scope_index::SCHEMA)?;

            let stored: Option<String> = conn
                .query_row("SELECT value FROM meta WHERE key = 'schema_hash'", [], |row| row.get(0))
                .optional()?;

            if stored.as_deref() != Some(SCHEMA_HASH) {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let dropped = tx.execute("DELETE FROM entries", [])?;
                tx.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_hash', ?1)",
                    [SCHEMA_HASH],
                )?;
                tx.commit()?;
                if stored.is_some() {
                    log::info!("Cache format changed, dropped {} entries", dropped);
                }
            }
            Ok(())
        })
    }

    /// Checkpoint the WAL and refuse further operations on this handle and its clones
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.checkpoint_wal();
        self.closed.store(true, Ordering::SeqCst);
        log::info!("Closed cache store at {:?}", self.dir);
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.join(CACHE_DB)
    }

    pub fn limits(&self) -> &CacheLimits {
        &self.limits
    }

    fn connect(&self) -> Result<Connection> {
        if self.is_closed() {
            return Err(Error::StoreUnavailable {
                path: self.dir.clone(),
                reason: "store is closed".into(),
            });
        }
        let conn = Connection::open(self.db_path())?;
        conn.busy_timeout(self.limits.lock_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// Run `op` on a fresh connection, turning busy/locked failures into `LockTimeout`
    fn with_conn<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.connect().map_err(|e| self.classify(e))?;
        op(&mut conn).map_err(|e| self.classify(e))
    }

    fn classify(&self, err: Error) -> Error {
        match err {
            Error::Sqlite(rusqlite::Error::SqliteFailure(failure, _))
                if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                log::warn!("Cache lock not acquired within {:?}", self.limits.lock_timeout);
                Error::LockTimeout { waited: self.limits.lock_timeout }
            }
            other => other,
        }
    }

    /// Live entry for `key`, or `None` if absent or expired
    pub fn get(&self, namespace: CacheNamespace, key: &str) -> Result<Option<CacheEntry>> {
        self.get_at(namespace, key, Utc::now())
    }

    pub(crate) fn get_at(
        &self,
        namespace: CacheNamespace,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>> {
        let row = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT payload, scope, created_at, expires_at, size_bytes
                     FROM entries WHERE namespace = ?1 AND key = ?2 AND expires_at > ?3",
                    params![namespace.as_str(), key, now.timestamp_millis()],
                    |row| {
                        Ok((
                            row.get::<_, Vec<u8>>(0)?,
                            row.get::<_, Vec<u8>>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    },
                )
                .optional()?;
            Ok(row)
        })?;

        let Some((payload, scope, created_at, expires_at, size_bytes)) = row else {
            return Ok(None);
        };

        Ok(Some(CacheEntry {
            key: key.to_string(),
            namespace,
            payload: decode_payload(&payload)?,
            scope: ScopeSignature::from_bytes(&scope)?,
            created_at: from_millis(created_at),
            expires_at: from_millis(expires_at),
            size_bytes: size_bytes.max(0) as u64,
        }))
    }

    /// Store `payload` under `key`, replacing any previous entry for the key.
    ///
    /// With an index record, the entry is registered for scoped reuse and
    /// older entries for the same query are removed in the same transaction.
    /// An eviction pass follows if the store is over its size limit.
    pub fn put(
        &self,
        namespace: CacheNamespace,
        key: &str,
        payload: &CachePayload,
        scope: &ScopeSignature,
        index: Option<&IndexRecord>,
    ) -> Result<PutReport> {
        self.put_at(namespace, key, payload, scope, index, Utc::now())
    }

    pub(crate) fn put_at(
        &self,
        namespace: CacheNamespace,
        key: &str,
        payload: &CachePayload,
        scope: &ScopeSignature,
        index: Option<&IndexRecord>,
        now: DateTime<Utc>,
    ) -> Result<PutReport> {
        let payload_blob = encode_payload(payload, self.limits.compression_level)?;
        let scope_blob = scope.to_bytes()?;
        let size_bytes = (payload_blob.len() + scope_blob.len()) as u64;
        let created_at = now.timestamp_millis();
        let expires_at = created_at.saturating_add(self.limits.ttl_ms());

        let (superseded, total) = self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            tx.execute(
                "DELETE FROM entries WHERE namespace = ?1 AND key = ?2",
                params![namespace.as_str(), key],
            )?;
            tx.execute(
                "INSERT INTO entries (namespace, key, payload, scope, created_at, expires_at, size_bytes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    namespace.as_str(),
                    key,
                    payload_blob,
                    scope_blob,
                    created_at,
                    expires_at,
                    size_bytes as i64
                ],
            )?;

            let superseded = match index {
                Some(record) => scope_index::register(&tx, namespace, key, record)?,
                None => 0,
            };

            let total: i64 = tx.query_row("SELECT COALESCE(SUM(size_bytes), 0) FROM entries", [], |row| row.get(0))?;
            tx.commit()?;
            Ok((superseded, total.max(0) as u64))
        })?;

        log::debug!(
            "Stored {} entry {} ({} bytes, {} superseded)",
            namespace,
            short_key(key),
            size_bytes,
            superseded
        );

        let eviction = if total > self.limits.size_limit_bytes {
            Some(self.evict_to_fit_at(self.limits.size_limit_bytes, now)?)
        } else {
            None
        };

        Ok(PutReport { size_bytes, superseded, eviction })
    }

    /// Remove all entries, or all entries of one namespace. Returns the number removed.
    pub fn clear(&self, namespace: Option<CacheNamespace>) -> Result<usize> {
        let removed = self.with_conn(|conn| {
            let removed = match namespace {
                Some(ns) => conn.execute("DELETE FROM entries WHERE namespace = ?1", [ns.as_str()])?,
                None => conn.execute("DELETE FROM entries", [])?,
            };
            Ok(removed)
        })?;

        match namespace {
            Some(ns) => log::info!("Cleared {} {} entries", removed, ns),
            None => log::info!("Cleared {} cache entries", removed),
        }
        Ok(removed)
    }

    /// Delete every entry whose expiry has passed
    pub fn sweep_expired(&self) -> Result<usize> {
        self.sweep_expired_at(Utc::now())
    }

    pub(crate) fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM entries WHERE expires_at <= ?1", [now.timestamp_millis()])?)
        })?;
        if removed > 0 {
            log::debug!("Swept {} expired entries", removed);
        }
        Ok(removed)
    }

    /// Shrink the store to at most `limit_bytes`: expired entries first, then oldest by creation time
    pub fn evict_to_fit(&self, limit_bytes: u64) -> Result<EvictionReport> {
        self.evict_to_fit_at(limit_bytes, Utc::now())
    }

    pub(crate) fn evict_to_fit_at(&self, limit_bytes: u64, now: DateTime<Utc>) -> Result<EvictionReport> {
        let report = self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now_ms = now.timestamp_millis();

            // Snapshot, decide, then delete
            let rows: Vec<(String, String, i64, i64)> = {
                let mut stmt = tx.prepare(
                    "SELECT namespace, key, size_bytes, expires_at FROM entries ORDER BY created_at, key",
                )?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let bytes_before: u64 = rows.iter().map(|(_, _, size, _)| (*size).max(0) as u64).sum();
            let mut remaining = bytes_before;
            let mut doomed = Vec::new();
            let mut expired_removed = 0;

            for (ns, key, size, expires_at) in &rows {
                if *expires_at <= now_ms {
                    doomed.push((ns, key));
                    remaining -= (*size).max(0) as u64;
                    expired_removed += 1;
                }
            }
            for (ns, key, size, expires_at) in &rows {
                if remaining <= limit_bytes {
                    break;
                }
                if *expires_at > now_ms {
                    doomed.push((ns, key));
                    remaining -= (*size).max(0) as u64;
                }
            }

            {
                let mut delete = tx.prepare("DELETE FROM entries WHERE namespace = ?1 AND key = ?2")?;
                for (ns, key) in &doomed {
                    delete.execute(params![ns, key])?;
                }
            }
            tx.commit()?;

            Ok(EvictionReport {
                expired_removed,
                evicted: doomed.len() - expired_removed,
                bytes_before,
                bytes_after: remaining,
            })
        })?;

        if report.evicted > 0 || report.expired_removed > 0 {
            log::debug!(
                "Eviction: {} expired, {} evicted, {} -> {} bytes (limit {})",
                report.expired_removed,
                report.evicted,
                report.bytes_before,
                report.bytes_after,
                limit_bytes
            );
        }
        Ok(report)
    }

    /// Live index records sharing `shape`, newest first
    pub(crate) fn scope_candidates(&self, namespace: CacheNamespace, shape: &str) -> Result<Vec<ScopeCandidate>> {
        let now = Utc::now().timestamp_millis();
        self.with_conn(|conn| scope_index::candidates(conn, namespace, shape, now))
    }

    /// Occupancy per namespace
    pub fn stats(&self) -> Result<CacheStats> {
        let now = Utc::now().timestamp_millis();
        let (namespaces, expired_entries) = self.with_conn(|conn| {
            let mut counts = std::collections::HashMap::new();
            {
                let mut stmt = conn.prepare(
                    "SELECT namespace, COUNT(*), COALESCE(SUM(size_bytes), 0) FROM entries GROUP BY namespace",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
                })?;
                for row in rows {
                    let (ns, entries, bytes) = row?;
                    counts.insert(ns, (entries.max(0) as u64, bytes.max(0) as u64));
                }
            }

            let expired: i64 = conn.query_row(
                "SELECT COUNT(*) FROM entries WHERE expires_at <= ?1",
                [now],
                |row| row.get(0),
            )?;

            let namespaces: Vec<NamespaceStats> = CacheNamespace::ALL
                .iter()
                .map(|ns| {
                    let (entries, bytes) = counts.get(ns.as_str()).copied().unwrap_or((0, 0));
                    NamespaceStats { namespace: *ns, entries, bytes }
                })
                .collect();
            Ok((namespaces, expired.max(0) as u64))
        })?;

        Ok(CacheStats {
            cache_dir: self.dir.display().to_string(),
            total_entries: namespaces.iter().map(|n| n.entries).sum(),
            total_bytes: namespaces.iter().map(|n| n.bytes).sum(),
            namespaces,
            expired_entries,
            size_limit_bytes: self.limits.size_limit_bytes,
        })
    }

    /// Flush the WAL into the main database file and truncate it
    pub fn checkpoint_wal(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                let busy: i64 = row.get(0)?;
                let log_pages: i64 = row.get(1)?;
                let checkpointed: i64 = row.get(2)?;
                log::trace!(
                    "WAL checkpoint: busy={}, log_pages={}, checkpointed_pages={}",
                    busy,
                    log_pages,
                    checkpointed
                );
                Ok(())
            })?;
            Ok(())
        })
    }
}

fn encode_payload(payload: &CachePayload, level: i32) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(payload)?;
    Ok(zstd::encode_all(json.as_slice(), level)?)
}

fn decode_payload(blob: &[u8]) -> Result<CachePayload> {
    let json = zstd::decode_all(blob)?;
    Ok(serde_json::from_slice(&json)?)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(if ms > 0 {
        DateTime::<Utc>::MAX_UTC
    } else {
        DateTime::<Utc>::MIN_UTC
    })
}

pub(crate) fn short_key(key: &str) -> &str {
    &key[..key.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Match, SnippetLine};
    use crate::signature::ContentSignature;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn limits(ttl_days: u64, size_limit_bytes: u64) -> CacheLimits {
        CacheLimits {
            ttl_days,
            size_limit_bytes,
            ..Default::default()
        }
    }

    fn scope(path: &str) -> ScopeSignature {
        ScopeSignature::new([ContentSignature {
            path: PathBuf::from(path),
            size_bytes: 10,
            mtime_nanos: 1,
            content_hash: None,
        }])
    }

    fn matches(n: usize) -> CachePayload {
        CachePayload::Matches(
            (0..n)
                .map(|i| Match {
                    file_path: format!("/r/f{i}.txt"),
                    line_number: i + 1,
                    match_text: "x".into(),
                    snippet: vec![SnippetLine { line_number: i + 1, text: format!("line {i} x") }],
                    char_start: 5,
                    char_end: 6,
                })
                .collect(),
        )
    }

    fn index(query_digest: &str) -> IndexRecord {
        IndexRecord {
            shape: "shape".into(),
            query_digest: query_digest.into(),
            paths: vec![PathBuf::from("/r")],
        }
    }

    #[test]
    fn test_open_creates_database() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path().join("nested/cache"), CacheLimits::default()).unwrap();
        assert!(store.db_path().exists());
        assert_eq!(store.stats().unwrap().total_entries, 0);
    }

    #[test]
    fn test_put_then_get_returns_copy() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path(), CacheLimits::default()).unwrap();
        let payload = matches(3);

        let report = store
            .put(CacheNamespace::Search, "k1", &payload, &scope("/r/a"), None)
            .unwrap();
        assert!(report.size_bytes > 0);

        let entry = store.get(CacheNamespace::Search, "k1").unwrap().unwrap();
        assert_eq!(entry.payload, payload);
        assert_eq!(entry.scope, scope("/r/a"));
        assert_eq!(entry.size_bytes, report.size_bytes);
        assert_eq!(entry.expires_at - entry.created_at, ChronoDuration::days(7));
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path(), CacheLimits::default()).unwrap();
        store
            .put(CacheNamespace::Search, "same", &CachePayload::Text("a".into()), &scope("/r/a"), None)
            .unwrap();
        assert!(store.get(CacheNamespace::Elaborate, "same").unwrap().is_none());
    }

    #[test]
    fn test_zero_ttl_always_misses() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path(), limits(0, u64::MAX)).unwrap();
        store
            .put(CacheNamespace::Search, "k", &matches(1), &scope("/r/a"), None)
            .unwrap();
        assert!(store.get(CacheNamespace::Search, "k").unwrap().is_none());
    }

    #[test]
    fn test_huge_ttl_does_not_wrap() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path(), limits(u64::MAX, u64::MAX)).unwrap();
        store
            .put(CacheNamespace::Search, "k", &matches(1), &scope("/r/a"), None)
            .unwrap();
        let entry = store.get(CacheNamespace::Search, "k").unwrap().unwrap();
        assert!(entry.expires_at > entry.created_at);
        assert_eq!(store.sweep_expired().unwrap(), 0);
    }

    #[test]
    fn test_expired_entries_are_absent_then_swept() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path(), limits(1, u64::MAX)).unwrap();
        let t0 = Utc::now();
        store
            .put_at(CacheNamespace::Search, "k", &matches(1), &scope("/r/a"), None, t0)
            .unwrap();

        assert!(store.get_at(CacheNamespace::Search, "k", t0 + ChronoDuration::hours(23)).unwrap().is_some());
        assert!(store.get_at(CacheNamespace::Search, "k", t0 + ChronoDuration::days(1)).unwrap().is_none());

        assert_eq!(store.sweep_expired_at(t0 + ChronoDuration::days(2)).unwrap(), 1);
        assert_eq!(store.stats().unwrap().total_entries, 0);
    }

    #[test]
    fn test_clear_by_namespace() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path(), CacheLimits::default()).unwrap();
        store.put(CacheNamespace::Search, "s", &matches(1), &scope("/r/a"), None).unwrap();
        store
            .put(CacheNamespace::Elaborate, "e", &CachePayload::Text("t".into()), &scope("/r/a"), None)
            .unwrap();

        assert_eq!(store.clear(Some(CacheNamespace::Search)).unwrap(), 1);
        assert!(store.get(CacheNamespace::Search, "s").unwrap().is_none());
        assert!(store.get(CacheNamespace::Elaborate, "e").unwrap().is_some());

        assert_eq!(store.clear(None).unwrap(), 1);
        assert_eq!(store.stats().unwrap().total_entries, 0);
    }

    #[test]
    fn test_eviction_removes_oldest_first() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path(), limits(7, u64::MAX)).unwrap();
        let t0 = Utc::now();
        let payload = matches(5);
        let mut size = 0;
        for (i, key) in ["old", "mid", "new"].iter().enumerate() {
            size = store
                .put_at(CacheNamespace::Search, key, &payload, &scope("/r/a"), None, t0 + ChronoDuration::seconds(i as i64))
                .unwrap()
                .size_bytes;
        }

        let report = store.evict_to_fit_at(size * 2, t0 + ChronoDuration::seconds(10)).unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.bytes_after, size * 2);
        let now = t0 + ChronoDuration::seconds(10);
        assert!(store.get_at(CacheNamespace::Search, "old", now).unwrap().is_none());
        assert!(store.get_at(CacheNamespace::Search, "mid", now).unwrap().is_some());
        assert!(store.get_at(CacheNamespace::Search, "new", now).unwrap().is_some());
    }

    #[test]
    fn test_eviction_prefers_expired_entries() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path(), limits(1, u64::MAX)).unwrap();
        let t0 = Utc::now();
        store
            .put_at(CacheNamespace::Search, "fresh", &matches(2), &scope("/r/a"), None, t0)
            .unwrap();
        store
            .put_at(CacheNamespace::Search, "stale", &matches(2), &scope("/r/a"), None, t0 - ChronoDuration::days(3))
            .unwrap();

        let report = store.evict_to_fit_at(u64::MAX, t0).unwrap();
        assert_eq!(report.expired_removed, 1);
        assert_eq!(report.evicted, 0);
        assert!(store.get_at(CacheNamespace::Search, "fresh", t0).unwrap().is_some());
    }

    #[test]
    fn test_put_keeps_store_within_bound() {
        let temp = TempDir::new().unwrap();
        let probe = CacheStore::open(temp.path().join("probe"), CacheLimits::default()).unwrap();
        let one = probe
            .put(CacheNamespace::Search, "p", &matches(20), &scope("/r/a"), None)
            .unwrap()
            .size_bytes;

        let store = CacheStore::open(temp.path().join("bounded"), limits(7, one * 3)).unwrap();
        for i in 0..10 {
            store
                .put(CacheNamespace::Search, &format!("k{i}"), &matches(20), &scope("/r/a"), None)
                .unwrap();
            let stats = store.stats().unwrap();
            assert!(stats.total_bytes <= one * 3 + one, "bytes {} after put {}", stats.total_bytes, i);
        }
        // The newest entry survives
        assert!(store.get(CacheNamespace::Search, "k9").unwrap().is_some());
    }

    #[test]
    fn test_put_supersedes_same_query() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path(), CacheLimits::default()).unwrap();
        store
            .put(CacheNamespace::Search, "before-edit", &matches(1), &scope("/r/a"), Some(&index("q1")))
            .unwrap();
        store
            .put(CacheNamespace::Search, "other-query", &matches(1), &scope("/r/a"), Some(&index("q2")))
            .unwrap();

        let report = store
            .put(CacheNamespace::Search, "after-edit", &matches(2), &scope("/r/a"), Some(&index("q1")))
            .unwrap();
        assert_eq!(report.superseded, 1);
        assert!(store.get(CacheNamespace::Search, "before-edit").unwrap().is_none());
        assert!(store.get(CacheNamespace::Search, "other-query").unwrap().is_some());
        assert!(store.get(CacheNamespace::Search, "after-edit").unwrap().is_some());
    }

    #[test]
    fn test_closed_store_is_unavailable() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path(), CacheLimits::default()).unwrap();
        let clone = store.clone();
        store.close().unwrap();
        let err = clone.get(CacheNamespace::Search, "k").unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable { .. }));
        assert!(err.is_store_failure());
    }

    #[test]
    fn test_held_write_lock_times_out() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(
            temp.path(),
            CacheLimits {
                lock_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        )
        .unwrap();

        let blocker = Connection::open(store.db_path()).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE;").unwrap();

        let err = store
            .put(CacheNamespace::Search, "k", &matches(1), &scope("/r/a"), None)
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));

        // Readers are not blocked by the writer
        assert!(store.get(CacheNamespace::Search, "k").unwrap().is_none());

        blocker.execute_batch("ROLLBACK;").unwrap();
        assert!(store.put(CacheNamespace::Search, "k", &matches(1), &scope("/r/a"), None).is_ok());
    }

    #[test]
    fn test_open_on_unusable_path_fails() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("not-a-dir");
        std::fs::write(&file, "x").unwrap();
        let err = CacheStore::open(&file, CacheLimits::default()).unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable { .. }));
    }

    #[test]
    fn test_schema_change_drops_entries() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path(), CacheLimits::default()).unwrap();
        store.put(CacheNamespace::Search, "k", &matches(1), &scope("/r/a"), None).unwrap();

        let conn = Connection::open(store.db_path()).unwrap();
        conn.execute("UPDATE meta SET value = 'older' WHERE key = 'schema_hash'", []).unwrap();
        drop(conn);

        let reopened = CacheStore::open(temp.path(), CacheLimits::default()).unwrap();
        assert!(reopened.get(CacheNamespace::Search, "k").unwrap().is_none());
    }

    #[test]
    fn test_concurrent_puts_from_independent_handles() {
        use std::thread;

        let temp = TempDir::new().unwrap();
        let dir = temp.path().to_path_buf();
        CacheStore::open(&dir, CacheLimits::default()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let dir = dir.clone();
                thread::spawn(move || {
                    let store = CacheStore::open(&dir, CacheLimits::default()).unwrap();
                    for j in 0..5 {
                        store
                            .put(CacheNamespace::Search, &format!("k{i}-{j}"), &matches(2), &scope("/r/a"), None)
                            .unwrap();
                        // Same key from every thread: last writer wins, never torn
                        store
                            .put(CacheNamespace::Search, "shared", &matches(i + 1), &scope("/r/a"), None)
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let store = CacheStore::open(&dir, CacheLimits::default()).unwrap();
        assert_eq!(store.stats().unwrap().total_entries, 8 * 5 + 1);
        match store.get(CacheNamespace::Search, "shared").unwrap().unwrap().payload {
            CachePayload::Matches(ms) => assert!((1..=8).contains(&ms.len())),
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
