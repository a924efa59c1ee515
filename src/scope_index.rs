//! Scope index and scoped reuse
//!
//! Every stored entry gets an index row recording which query produced it:
//! its shape (all fields but the paths), its full query digest and its roots.
//! A narrower query can then be answered from a broader entry when the files
//! it would visit are all recorded in that entry's scope with identical
//! signatures. Files outside the narrow scope may have changed freely.

use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::cache::{short_key, CacheStore};
use crate::errors::Result;
use crate::fingerprint;
use crate::models::{CacheNamespace, CachePayload, Query};
use crate::signature::ScopeSignature;

pub(crate) const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS scope_index (
        namespace TEXT NOT NULL,
        key TEXT NOT NULL,
        shape TEXT NOT NULL,
        query_digest TEXT NOT NULL,
        paths TEXT NOT NULL,
        PRIMARY KEY (namespace, key),
        FOREIGN KEY (namespace, key) REFERENCES entries(namespace, key) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_scope_shape ON scope_index(namespace, shape);
    CREATE INDEX IF NOT EXISTS idx_scope_query ON scope_index(namespace, query_digest);
";

/// Index row written alongside an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub shape: String,
    pub query_digest: String,
    pub paths: Vec<PathBuf>,
}

impl IndexRecord {
    pub fn for_query(namespace: CacheNamespace, query: &Query) -> Self {
        Self {
            shape: fingerprint::shape_digest(namespace, query),
            query_digest: fingerprint::query_digest(namespace, query),
            paths: query.paths().to_vec(),
        }
    }

    /// Record for a key with no path set: only supersession applies
    pub fn for_fingerprint(fingerprint: &str) -> Self {
        Self {
            shape: fingerprint.to_string(),
            query_digest: fingerprint.to_string(),
            paths: Vec::new(),
        }
    }
}

/// A stored entry that may cover a narrower query
#[derive(Debug, Clone)]
pub(crate) struct ScopeCandidate {
    pub key: String,
    pub paths: Vec<PathBuf>,
}

/// A narrower result served from a broader entry
#[derive(Debug, Clone)]
pub struct ScopedHit {
    pub source_key: String,
    pub payload: CachePayload,
}

/// Insert the index row for `key` and drop older entries of the same query.
///
/// Runs inside the caller's write transaction. Returns how many entries were superseded.
pub(crate) fn register(conn: &Connection, namespace: CacheNamespace, key: &str, record: &IndexRecord) -> Result<usize> {
    let paths = serde_json::to_string(&record.paths)?;
    conn.execute(
        "INSERT OR REPLACE INTO scope_index (namespace, key, shape, query_digest, paths)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![namespace.as_str(), key, record.shape, record.query_digest, paths],
    )?;

    let superseded = conn.execute(
        "DELETE FROM entries WHERE namespace = ?1 AND key != ?2 AND key IN (
             SELECT key FROM scope_index WHERE namespace = ?1 AND query_digest = ?3
         )",
        params![namespace.as_str(), key, record.query_digest],
    )?;
    Ok(superseded)
}

/// Unexpired entries with the given shape, newest first
pub(crate) fn candidates(
    conn: &Connection,
    namespace: CacheNamespace,
    shape: &str,
    now_ms: i64,
) -> Result<Vec<ScopeCandidate>> {
    let mut stmt = conn.prepare(
        "SELECT s.key, s.paths FROM scope_index s
         JOIN entries e ON e.namespace = s.namespace AND e.key = s.key
         WHERE s.namespace = ?1 AND s.shape = ?2 AND e.expires_at > ?3
         ORDER BY e.created_at DESC, s.key",
    )?;
    let rows = stmt.query_map(params![namespace.as_str(), shape, now_ms], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (key, paths) = row?;
        match serde_json::from_str::<Vec<PathBuf>>(&paths) {
            Ok(paths) => out.push(ScopeCandidate { key, paths }),
            Err(e) => log::warn!("Ignoring malformed scope index row {}: {}", short_key(&key), e),
        }
    }
    Ok(out)
}

/// Find a broader stored result that provably answers `query` over `fresh`.
///
/// `fresh` is the signature of exactly the files the narrow traversal visited.
/// A candidate qualifies when it has the same shape, different roots that
/// cover the query's roots, and a recorded scope that contains every file of
/// `fresh` with an identical signature. The returned payload is filtered to
/// those files. Only the search namespace takes part.
pub fn find_reusable(
    store: &CacheStore,
    namespace: CacheNamespace,
    query: &Query,
    fresh: &ScopeSignature,
) -> Result<Option<ScopedHit>> {
    if namespace != CacheNamespace::Search {
        return Ok(None);
    }

    let shape = fingerprint::shape_digest(namespace, query);
    for candidate in store.scope_candidates(namespace, &shape)? {
        if candidate.paths.as_slice() == query.paths() || !query.is_covered_by(&candidate.paths) {
            continue;
        }

        let Some(entry) = store.get(namespace, &candidate.key)? else {
            continue;
        };

        match entry.scope.restrict_to(fresh.paths()) {
            Some(restricted) if &restricted == fresh => {}
            Some(_) => {
                log::debug!("Scoped reuse rejected: {} has stale signatures", short_key(&candidate.key));
                continue;
            }
            None => {
                log::debug!(
                    "Scoped reuse rejected: {} did not visit every file in scope",
                    short_key(&candidate.key)
                );
                continue;
            }
        }

        let files: HashSet<&Path> = fresh.paths().collect();
        return Ok(Some(ScopedHit {
            source_key: candidate.key,
            payload: entry.payload.restricted_to(&files),
        }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLimits;
    use crate::models::{Match, QueryOptions};
    use crate::signature::ContentSignature;
    use tempfile::TempDir;

    fn sig(path: &str, size: u64) -> ContentSignature {
        ContentSignature {
            path: PathBuf::from(path),
            size_bytes: size,
            mtime_nanos: 7,
            content_hash: None,
        }
    }

    fn hit(path: &str) -> Match {
        Match {
            file_path: path.into(),
            line_number: 1,
            match_text: "x".into(),
            snippet: vec![],
            char_start: 0,
            char_end: 1,
        }
    }

    /// Store a broad result over /repo with three files
    fn seed(store: &CacheStore) -> Query {
        let broad = Query::new("x", ["/repo"], QueryOptions::default());
        let scope = ScopeSignature::new([sig("/repo/a.txt", 1), sig("/repo/src/b.txt", 2), sig("/repo/src/c.txt", 3)]);
        let payload = CachePayload::Matches(vec![hit("/repo/a.txt"), hit("/repo/src/b.txt"), hit("/repo/src/c.txt")]);
        let key = fingerprint::digest(CacheNamespace::Search, &broad, &scope);
        store
            .put(
                CacheNamespace::Search,
                &key,
                &payload,
                &scope,
                Some(&IndexRecord::for_query(CacheNamespace::Search, &broad)),
            )
            .unwrap();
        broad
    }

    fn open() -> (TempDir, CacheStore) {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path(), CacheLimits::default()).unwrap();
        (temp, store)
    }

    #[test]
    fn test_reuse_filters_to_narrow_scope() {
        let (_temp, store) = open();
        let broad = seed(&store);
        let narrow = broad.with_paths(["/repo/src"]);
        let fresh = ScopeSignature::new([sig("/repo/src/b.txt", 2), sig("/repo/src/c.txt", 3)]);

        let hit = find_reusable(&store, CacheNamespace::Search, &narrow, &fresh).unwrap().unwrap();
        match hit.payload {
            CachePayload::Matches(ms) => {
                let files: Vec<_> = ms.iter().map(|m| m.file_path.as_str()).collect();
                assert_eq!(files, vec!["/repo/src/b.txt", "/repo/src/c.txt"]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_changes_outside_narrow_scope_do_not_matter() {
        let (_temp, store) = open();
        let broad = seed(&store);
        let narrow = broad.with_paths(["/repo/src/b.txt"]);
        // a.txt and c.txt may have changed; only b.txt is checked
        let fresh = ScopeSignature::new([sig("/repo/src/b.txt", 2)]);
        assert!(find_reusable(&store, CacheNamespace::Search, &narrow, &fresh).unwrap().is_some());
    }

    #[test]
    fn test_stale_file_in_scope_blocks_reuse() {
        let (_temp, store) = open();
        let broad = seed(&store);
        let narrow = broad.with_paths(["/repo/src"]);
        let fresh = ScopeSignature::new([sig("/repo/src/b.txt", 2), sig("/repo/src/c.txt", 99)]);
        assert!(find_reusable(&store, CacheNamespace::Search, &narrow, &fresh).unwrap().is_none());
    }

    #[test]
    fn test_file_unknown_to_broad_scope_blocks_reuse() {
        let (_temp, store) = open();
        let broad = seed(&store);
        let narrow = broad.with_paths(["/repo/src"]);
        let fresh = ScopeSignature::new([sig("/repo/src/b.txt", 2), sig("/repo/src/new.txt", 1)]);
        assert!(find_reusable(&store, CacheNamespace::Search, &narrow, &fresh).unwrap().is_none());
    }

    #[test]
    fn test_uncovered_or_different_shape_is_not_reused() {
        let (_temp, store) = open();
        let broad = seed(&store);
        let fresh = ScopeSignature::new([sig("/repo/src/b.txt", 2)]);

        let outside = broad.with_paths(["/elsewhere"]);
        assert!(find_reusable(&store, CacheNamespace::Search, &outside, &fresh).unwrap().is_none());

        let other_case = Query::new(
            "x",
            ["/repo/src"],
            QueryOptions { case_sensitive: true, ..Default::default() },
        );
        assert!(find_reusable(&store, CacheNamespace::Search, &other_case, &fresh).unwrap().is_none());
    }

    #[test]
    fn test_elaborate_namespace_never_reuses() {
        let (_temp, store) = open();
        let broad = seed(&store);
        let narrow = broad.with_paths(["/repo/src"]);
        let fresh = ScopeSignature::new([sig("/repo/src/b.txt", 2)]);
        assert!(find_reusable(&store, CacheNamespace::Elaborate, &narrow, &fresh).unwrap().is_none());
    }

    #[test]
    fn test_index_rows_follow_their_entries() {
        let (_temp, store) = open();
        let broad = seed(&store);
        store.clear(None).unwrap();

        let shape = fingerprint::shape_digest(CacheNamespace::Search, &broad);
        assert!(store.scope_candidates(CacheNamespace::Search, &shape).unwrap().is_empty());
    }
}
