//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use scopecache::elaborate::{ElaborationRequest, Elaborator};
use scopecache::{CacheCoordinator, CacheLimits, ModelParams, Query, QueryOptions};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

/// Write `files` (relative path, contents) under `root`, creating directories
pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (rel, contents) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }
}

/// Set a file's modification time without changing its contents
pub fn set_mtime(path: &Path, secs_from_epoch: u64) {
    let file = fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs_from_epoch))
        .unwrap();
}

pub fn coordinator(cache_dir: &Path) -> CacheCoordinator {
    CacheCoordinator::open(cache_dir, CacheLimits::default())
}

pub fn coordinator_with(cache_dir: &Path, limits: CacheLimits) -> CacheCoordinator {
    CacheCoordinator::open(cache_dir, limits)
}

/// Case-insensitive literal query with default options
pub fn literal(pattern: &str, roots: &[PathBuf]) -> Query {
    Query::new(pattern, roots, QueryOptions::default())
}

pub fn entry_count(coordinator: &CacheCoordinator) -> u64 {
    coordinator
        .store()
        .map(|s| s.stats().unwrap().total_entries)
        .unwrap_or(0)
}

pub fn model() -> ModelParams {
    ModelParams {
        provider: "gemini".into(),
        model: "gemini-2.5-flash".into(),
        api_base: None,
    }
}

/// What the fake elaborator does on each call
pub enum Behaviour {
    Reply(String),
    Fail(String),
    Stall(Duration),
}

/// Elaborator that records its calls instead of reaching a model
pub struct FakeElaborator {
    behaviour: Behaviour,
    calls: AtomicUsize,
    requests: Mutex<Vec<ElaborationRequest>>,
}

impl FakeElaborator {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::new(Behaviour::Reply(text.to_string()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ElaborationRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Elaborator for FakeElaborator {
    async fn elaborate(&self, request: &ElaborationRequest) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        match &self.behaviour {
            Behaviour::Reply(text) => Ok(text.clone()),
            Behaviour::Fail(message) => anyhow::bail!("{}", message),
            Behaviour::Stall(delay) => {
                tokio::time::sleep(*delay).await;
                Ok("too late".to_string())
            }
        }
    }
}
