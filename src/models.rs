//! Core data models for scopecache
//!
//! `Query` and `Finding` are the inputs the cache keys on; `Match` and
//! `CachePayload` are what it stores. Everything here is an immutable value:
//! the store hands out copies, never references into its own state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use strum::{Display, EnumString};

use crate::signature::ScopeSignature;

/// Logical partition of the cache. Entries never match across namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CacheNamespace {
    Search,
    Elaborate,
}

impl CacheNamespace {
    pub const ALL: [CacheNamespace; 2] = [CacheNamespace::Search, CacheNamespace::Elaborate];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheNamespace::Search => "search",
            CacheNamespace::Elaborate => "elaborate",
        }
    }
}

/// Whether the coordinator consults the store at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CacheMode {
    #[default]
    Normal,
    /// Bypass the store for every operation without touching existing entries
    Disabled,
}

/// Search options other than the pattern and the paths
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryOptions {
    /// Treat the pattern as a regular expression
    pub is_regex: bool,
    /// Match case exactly (default: case-insensitive)
    pub case_sensitive: bool,
    /// Lines of context captured on each side of a match
    pub context_lines: usize,
    /// Directory name globs excluded from traversal, on top of the defaults
    pub exclude_dirs: Vec<String>,
    /// File name globs excluded from traversal, on top of the defaults
    pub exclude_files: Vec<String>,
    /// Descend into dot-files and dot-directories
    pub include_hidden: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            is_regex: false,
            case_sensitive: false,
            context_lines: 3,
            exclude_dirs: Vec::new(),
            exclude_files: Vec::new(),
            include_hidden: false,
        }
    }
}

/// A normalized search request.
///
/// Construction canonicalizes every field (trimmed pattern; absolute, sorted,
/// deduplicated paths; sorted, deduplicated exclusion globs), so two queries
/// compare equal exactly when they would produce the same result set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    pattern: String,
    options: QueryOptions,
    paths: Vec<PathBuf>,
}

impl Query {
    pub fn new<I, P>(pattern: impl Into<String>, paths: I, options: QueryOptions) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let pattern = pattern.into().trim().to_string();

        let mut options = options;
        options.exclude_dirs = normalize_globs(&options.exclude_dirs);
        options.exclude_files = normalize_globs(&options.exclude_files);

        Self {
            pattern,
            options,
            paths: normalize_paths(paths),
        }
    }

    /// Same query over a different set of roots
    pub fn with_paths<I, P>(&self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            pattern: self.pattern.clone(),
            options: self.options.clone(),
            paths: normalize_paths(paths),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn is_regex(&self) -> bool {
        self.options.is_regex
    }

    pub fn case_sensitive(&self) -> bool {
        self.options.case_sensitive
    }

    pub fn context_lines(&self) -> usize {
        self.options.context_lines
    }

    /// True when every root of `self` equals or lies beneath some root of `broader`
    pub fn is_covered_by(&self, broader: &[PathBuf]) -> bool {
        self.paths
            .iter()
            .all(|narrow| broader.iter().any(|root| narrow.starts_with(root)))
    }
}

fn normalize_paths<I, P>(paths: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut out: Vec<PathBuf> = paths
        .into_iter()
        .map(|p| normalize_path(p.as_ref()))
        .collect();
    out.sort();
    out.dedup();
    out
}

fn normalize_globs(globs: &[String]) -> Vec<String> {
    let mut out: Vec<String> = globs
        .iter()
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Make a path absolute and fold `.`/`..` lexically, without touching the file system
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// One line of a match's context window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnippetLine {
    /// Line number in the file (1-indexed)
    pub line_number: usize,
    /// Line text without its terminator
    pub text: String,
}

/// One occurrence of the pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    /// Absolute path of the file
    pub file_path: String,
    /// Line containing the match (1-indexed)
    pub line_number: usize,
    /// Matched text, in the file's original case
    pub match_text: String,
    /// Context window around the match line, clamped to the file
    pub snippet: Vec<SnippetLine>,
    /// Start of the match within its line, in characters (0-indexed, inclusive)
    pub char_start: usize,
    /// End of the match within its line, in characters (exclusive)
    pub char_end: usize,
}

impl Match {
    /// The snippet entry for the matching line itself
    pub fn match_line(&self) -> Option<&SnippetLine> {
        self.snippet.iter().find(|l| l.line_number == self.line_number)
    }

    /// Plain-text snippet with the matched span wrapped in `>>> <<<`
    pub fn render_snippet(&self) -> String {
        self.snippet
            .iter()
            .map(|line| {
                if line.line_number == self.line_number {
                    let (before, matched, after) = split_chars(&line.text, self.char_start, self.char_end);
                    format!(
                        "{:>4}: {} >>> {} <<< {}",
                        line.line_number,
                        before.trim_end(),
                        matched,
                        after.trim_start()
                    )
                } else {
                    format!("{:>4}: {}", line.line_number, line.text)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Split `text` into (before, span, after) using character offsets, clamped to the text
pub fn split_chars(text: &str, start: usize, end: usize) -> (&str, &str, &str) {
    let byte_at = |chars: usize| {
        text.char_indices()
            .nth(chars)
            .map(|(i, _)| i)
            .unwrap_or(text.len())
    };
    let start_byte = byte_at(start);
    let end_byte = byte_at(end.max(start));
    (&text[..start_byte], &text[start_byte..end_byte], &text[end_byte..])
}

/// Stable identity of one elaboration target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub file_path: String,
    pub line_number: usize,
    #[serde(default)]
    pub match_text: String,
    /// Rendered snippet text, as shown to the model
    pub snippet: String,
}

impl From<&Match> for Finding {
    fn from(m: &Match) -> Self {
        Self {
            file_path: m.file_path.clone(),
            line_number: m.line_number,
            match_text: m.match_text.clone(),
            snippet: m.render_snippet(),
        }
    }
}

/// Model selection that affects elaboration output. Never carries the API key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelParams {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

/// What a cache entry stores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum CachePayload {
    Matches(Vec<Match>),
    Text(String),
}

impl CachePayload {
    /// Keep only matches in `files`. Text payloads are returned unchanged.
    pub fn restricted_to(&self, files: &std::collections::HashSet<&Path>) -> CachePayload {
        match self {
            CachePayload::Matches(matches) => CachePayload::Matches(
                matches
                    .iter()
                    .filter(|m| files.contains(Path::new(&m.file_path)))
                    .cloned()
                    .collect(),
            ),
            CachePayload::Text(text) => CachePayload::Text(text.clone()),
        }
    }
}

/// A stored result and the scope it was computed over
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub namespace: CacheNamespace,
    pub payload: CachePayload,
    pub scope: ScopeSignature,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Bytes occupied in the store (compressed payload plus encoded scope)
    pub size_bytes: u64,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// How an operation's result was obtained. Only exposed for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CacheSource {
    /// Exact key found in the store
    Hit,
    /// Filtered from a broader entry
    ScopedReuse { source_key: String },
    /// Computed and written back
    Computed,
    /// Computed with the store bypassed or unavailable
    Uncached,
}

/// A result plus its provenance
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub source: CacheSource,
    /// Exact-match key for this operation, when one was derived
    pub key: Option<String>,
}

/// Per-namespace occupancy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceStats {
    pub namespace: CacheNamespace,
    pub entries: u64,
    pub bytes: u64,
}

/// Store occupancy snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub cache_dir: String,
    pub namespaces: Vec<NamespaceStats>,
    pub total_entries: u64,
    pub total_bytes: u64,
    pub expired_entries: u64,
    pub size_limit_bytes: u64,
}
