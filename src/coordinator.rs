//! Cache coordinator
//!
//! Runs every search and elaboration through the same sequence: derive the
//! exact key, look it up, try scoped reuse (search only), otherwise compute
//! and store. Store problems never fail an operation. Lookups degrade to a
//! miss and writes are skipped, with a warning in both cases.

use std::path::Path;
use std::time::Duration;

use crate::cache::{short_key, CacheLimits, CacheStore};
use crate::elaborate::context::wider_context;
use crate::elaborate::{ElaborationRequest, Elaborator};
use crate::engine::MatchEngine;
use crate::errors::{Error, Result};
use crate::fingerprint;
use crate::models::{
    CacheMode, CacheNamespace, CachePayload, CacheSource, Finding, Match, ModelParams, Outcome, Query,
};
use crate::scanner::{FileScanner, ScanOptions};
use crate::scope_index::{self, IndexRecord};
use crate::signature::{scope_signature_of, signature_with_mode, ScopeSignature, SignatureMode};

pub struct CacheCoordinator {
    store: Option<CacheStore>,
    mode: CacheMode,
    signature_mode: SignatureMode,
    budget: Option<Duration>,
}

impl CacheCoordinator {
    /// Coordinator over an already opened store, or none at all
    pub fn new(store: Option<CacheStore>) -> Self {
        Self {
            store,
            mode: CacheMode::Normal,
            signature_mode: SignatureMode::Metadata,
            budget: None,
        }
    }

    /// Open the store in `dir`. If it cannot be opened, every operation runs uncached.
    pub fn open(dir: impl AsRef<Path>, limits: CacheLimits) -> Self {
        let dir = dir.as_ref();
        match CacheStore::open(dir, limits) {
            Ok(store) => Self::new(Some(store)),
            Err(e) => {
                log::warn!("Cache disabled for this run: {}", e);
                Self::new(None)
            }
        }
    }

    /// Match-time budget for searches (`None` = unbounded)
    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_signature_mode(mut self, mode: SignatureMode) -> Self {
        self.signature_mode = mode;
        self
    }

    pub fn set_cache_mode(&mut self, mode: CacheMode) {
        log::debug!("Cache mode set to {}", mode);
        self.mode = mode;
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.mode
    }

    pub fn store(&self) -> Option<&CacheStore> {
        self.store.as_ref()
    }

    /// The store to use for this operation, if any
    fn active_store(&self) -> Option<&CacheStore> {
        match self.mode {
            CacheMode::Normal => self.store.as_ref().filter(|s| !s.is_closed()),
            CacheMode::Disabled => None,
        }
    }

    /// Remove every entry, or every entry of one namespace. A missing store clears nothing.
    pub fn clear_cache(&self, namespace: Option<CacheNamespace>) -> Result<usize> {
        match &self.store {
            Some(store) => store.clear(namespace),
            None => Ok(0),
        }
    }

    pub fn close(&self) -> Result<()> {
        match &self.store {
            Some(store) => store.close(),
            None => Ok(()),
        }
    }

    /// Check the pattern and exclusion globs without touching files or the cache
    pub fn validate(query: &Query) -> Result<()> {
        MatchEngine::new(query)?;
        FileScanner::new(ScanOptions::from(query.options()))?;
        Ok(())
    }

    pub fn search(&self, query: &Query) -> Result<Vec<Match>> {
        Ok(self.search_with_outcome(query)?.value)
    }

    /// Search with provenance.
    ///
    /// The pattern and exclusion globs are validated before any file or cache
    /// access. A scan that runs past the budget fails and is not cached.
    pub fn search_with_outcome(&self, query: &Query) -> Result<Outcome<Vec<Match>>> {
        let engine = MatchEngine::new(query)?.with_budget(self.budget);
        let scanner = FileScanner::new(ScanOptions::from(query.options()))?;

        let scan = scanner.scan(query.paths());
        let (scope, errors) = scope_signature_of(&scan.files, self.signature_mode);
        for e in &errors {
            log::warn!("Skipping file: {}", e);
        }
        let files: Vec<_> = scope.paths().map(Path::to_path_buf).collect();

        let namespace = CacheNamespace::Search;
        let key = fingerprint::digest(namespace, query, &scope);

        let Some(store) = self.active_store() else {
            let output = engine.scan(&files)?;
            return Ok(Outcome {
                value: output.matches,
                source: CacheSource::Uncached,
                key: Some(key),
            });
        };

        if let Some(matches) = lookup_matches(store, namespace, &key) {
            log::debug!("Cache hit for search {}", short_key(&key));
            return Ok(Outcome {
                value: matches,
                source: CacheSource::Hit,
                key: Some(key),
            });
        }

        match scope_index::find_reusable(store, namespace, query, &scope) {
            Ok(Some(hit)) => {
                if let CachePayload::Matches(matches) = hit.payload {
                    log::debug!(
                        "Search {} served from broader entry {}",
                        short_key(&key),
                        short_key(&hit.source_key)
                    );
                    return Ok(Outcome {
                        value: matches,
                        source: CacheSource::ScopedReuse { source_key: hit.source_key },
                        key: Some(key),
                    });
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("Scoped reuse lookup failed, computing instead: {}", e),
        }

        log::debug!("Cache miss for search {}", short_key(&key));
        let output = engine.scan(&files)?;

        store_best_effort(
            store,
            namespace,
            &key,
            &CachePayload::Matches(output.matches.clone()),
            &scope,
            &IndexRecord::for_query(namespace, query),
        );

        Ok(Outcome {
            value: output.matches,
            source: CacheSource::Computed,
            key: Some(key),
        })
    }

    pub async fn elaborate(
        &self,
        finding: &Finding,
        context_window_lines: usize,
        params: &ModelParams,
        elaborator: &dyn Elaborator,
        timeout: Option<Duration>,
    ) -> Result<String> {
        Ok(self
            .elaborate_with_outcome(finding, context_window_lines, params, elaborator, timeout)
            .await?
            .value)
    }

    /// Elaborate with provenance.
    ///
    /// The key covers the finding fingerprint and the source file's signature,
    /// so editing the file invalidates the elaboration. Failures, empty
    /// replies and timeouts are returned and never stored.
    pub async fn elaborate_with_outcome(
        &self,
        finding: &Finding,
        context_window_lines: usize,
        params: &ModelParams,
        elaborator: &dyn Elaborator,
        timeout: Option<Duration>,
    ) -> Result<Outcome<String>> {
        let namespace = CacheNamespace::Elaborate;
        let source_path = crate::models::normalize_path(Path::new(&finding.file_path));

        let fp = fingerprint::finding_digest(finding, context_window_lines, params);
        let scope = match signature_with_mode(&source_path, self.signature_mode) {
            Ok(sig) => ScopeSignature::new([sig]),
            Err(e) => {
                log::debug!("No signature for elaboration source: {}", e);
                ScopeSignature::default()
            }
        };
        let key = fingerprint::elaboration_digest(&fp, &scope);

        let store = self.active_store();
        if let Some(store) = store {
            if let Some(text) = lookup_text(store, namespace, &key) {
                log::debug!("Cache hit for elaboration {}", short_key(&key));
                return Ok(Outcome {
                    value: text,
                    source: CacheSource::Hit,
                    key: Some(key),
                });
            }
            log::debug!("Cache miss for elaboration {}", short_key(&key));
        }

        let request = ElaborationRequest {
            file_path: source_path.clone(),
            line_number: finding.line_number,
            match_text: finding.match_text.clone(),
            snippet: finding.snippet.clone(),
            wider_context: wider_context(&source_path, finding.line_number, context_window_lines),
            params: params.clone(),
        };
        let target = request.target();

        let reply = match timeout {
            Some(after) => match tokio::time::timeout(after, elaborator.elaborate(&request)).await {
                Ok(reply) => reply,
                Err(_) => return Err(Error::ElaborationTimeout { target, after }),
            },
            None => elaborator.elaborate(&request).await,
        };

        let text = reply
            .map_err(|e| Error::Elaboration {
                target: target.clone(),
                source: e.into(),
            })?
            .trim()
            .to_string();
        if text.is_empty() {
            return Err(Error::Elaboration {
                target,
                source: "model returned an empty reply".into(),
            });
        }

        let Some(store) = store else {
            return Ok(Outcome {
                value: text,
                source: CacheSource::Uncached,
                key: Some(key),
            });
        };

        store_best_effort(
            store,
            namespace,
            &key,
            &CachePayload::Text(text.clone()),
            &scope,
            &IndexRecord::for_fingerprint(&fp),
        );

        Ok(Outcome {
            value: text,
            source: CacheSource::Computed,
            key: Some(key),
        })
    }
}

fn lookup(store: &CacheStore, namespace: CacheNamespace, key: &str) -> Option<CachePayload> {
    match store.get(namespace, key) {
        Ok(entry) => entry.map(|e| e.payload),
        Err(e) => {
            log::warn!("Cache lookup failed, treating as a miss: {}", e);
            None
        }
    }
}

fn lookup_matches(store: &CacheStore, namespace: CacheNamespace, key: &str) -> Option<Vec<Match>> {
    match lookup(store, namespace, key)? {
        CachePayload::Matches(matches) => Some(matches),
        CachePayload::Text(_) => None,
    }
}

fn lookup_text(store: &CacheStore, namespace: CacheNamespace, key: &str) -> Option<String> {
    match lookup(store, namespace, key)? {
        CachePayload::Text(text) => Some(text),
        CachePayload::Matches(_) => None,
    }
}

fn store_best_effort(
    store: &CacheStore,
    namespace: CacheNamespace,
    key: &str,
    payload: &CachePayload,
    scope: &ScopeSignature,
    record: &IndexRecord,
) {
    match store.put(namespace, key, payload, scope, Some(record)) {
        Ok(report) => {
            if report.superseded > 0 {
                log::debug!("Replaced {} older {} entries for the same query", report.superseded, namespace);
            }
            if let Some(eviction) = report.eviction {
                log::debug!(
                    "Evicted {} entries ({} expired) to fit the size limit",
                    eviction.evicted,
                    eviction.expired_removed
                );
            }
        }
        Err(e) => log::warn!("Failed to store {} result {}: {}", namespace, short_key(key), e),
    }
}
