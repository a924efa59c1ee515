//! Match and snippet engine
//!
//! Scans a resolved file list for one query and produces matches ordered by
//! file path, line and offset. Each match carries its own context window and
//! the character span of the hit; nothing here decides how a hit is displayed.

use rayon::prelude::*;
use regex::{Regex, RegexBuilder};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::errors::{Error, Result};
use crate::models::{Match, Query, SnippetLine};

/// Bytes inspected when deciding whether a file is binary
pub const BINARY_SAMPLE_BYTES: usize = 1024;

/// Ceiling for the compiled regex program and its lazy DFA
const REGEX_SIZE_LIMIT: usize = 10 * 1024 * 1024;

enum Matcher {
    /// Case-sensitive literal: plain substring search
    Literal(String),
    /// Regex mode, or a case-insensitive literal compiled as an escaped regex
    Pattern(Regex),
}

impl Matcher {
    /// Byte ranges of every non-empty, non-overlapping hit in `line`
    fn find_all(&self, line: &str) -> Vec<(usize, usize)> {
        match self {
            Matcher::Literal(needle) => line
                .match_indices(needle.as_str())
                .map(|(start, hit)| (start, start + hit.len()))
                .collect(),
            Matcher::Pattern(re) => re
                .find_iter(line)
                .filter(|m| !m.is_empty())
                .map(|m| (m.start(), m.end()))
                .collect(),
        }
    }
}

/// Matches plus the files that could not be read
#[derive(Debug, Default)]
pub struct EngineOutput {
    pub matches: Vec<Match>,
    pub skipped: Vec<PathBuf>,
    pub binary_files: usize,
}

enum FileResult {
    Matches(Vec<Match>),
    Binary,
    Unreadable(PathBuf),
}

pub struct MatchEngine {
    matcher: Matcher,
    context_lines: usize,
    budget: Option<Duration>,
    threads: usize,
}

impl MatchEngine {
    /// Compile `query`'s pattern. Fails with `QuerySyntax` before any file is read.
    pub fn new(query: &Query) -> Result<Self> {
        let pattern = query.pattern();
        if pattern.is_empty() {
            return Err(Error::query_syntax(pattern, "pattern is empty"));
        }

        let matcher = if query.is_regex() {
            Matcher::Pattern(compile(pattern, pattern, query.case_sensitive())?)
        } else if query.case_sensitive() {
            Matcher::Literal(pattern.to_string())
        } else {
            Matcher::Pattern(compile(&regex::escape(pattern), pattern, false)?)
        };

        Ok(Self {
            matcher,
            context_lines: query.context_lines(),
            budget: None,
            threads: 0,
        })
    }

    /// Bound the whole scan. `None` or zero disables the budget.
    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget.filter(|b| !b.is_zero());
        self
    }

    /// Worker threads for `scan` (0 = auto)
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// All matches in already-decoded text
    pub fn find_in_text(&self, file_path: &str, text: &str) -> Vec<Match> {
        let lines: Vec<&str> = text.lines().collect();
        let mut matches = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            for (start, end) in self.matcher.find_all(line) {
                let char_start = line[..start].chars().count();
                let char_end = char_start + line[start..end].chars().count();

                matches.push(Match {
                    file_path: file_path.to_string(),
                    line_number: idx + 1,
                    match_text: line[start..end].to_string(),
                    snippet: self.snippet(&lines, idx),
                    char_start,
                    char_end,
                });
            }
        }

        matches
    }

    /// Context window around `idx`, clamped to the file
    fn snippet(&self, lines: &[&str], idx: usize) -> Vec<SnippetLine> {
        let first = idx.saturating_sub(self.context_lines);
        let last = idx.saturating_add(self.context_lines).min(lines.len().saturating_sub(1));
        (first..=last)
            .map(|i| SnippetLine {
                line_number: i + 1,
                text: lines[i].to_string(),
            })
            .collect()
    }

    fn scan_one(&self, path: &Path) -> FileResult {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Skipping {}: {}", path.display(), e);
                return FileResult::Unreadable(path.to_path_buf());
            }
        };

        if is_binary(&bytes[..bytes.len().min(BINARY_SAMPLE_BYTES)]) {
            log::debug!("Skipping binary file {}", path.display());
            return FileResult::Binary;
        }

        let text = decode_text(bytes);
        FileResult::Matches(self.find_in_text(&path.to_string_lossy(), &text))
    }

    /// Scan `files` in parallel.
    ///
    /// Unreadable files are skipped with a warning. Running past the budget
    /// abandons the scan with `BudgetExceeded`.
    pub fn scan(&self, files: &[PathBuf]) -> Result<EngineOutput> {
        let started = Instant::now();
        let deadline = self.budget.map(|b| started + b);
        let exceeded = AtomicBool::new(false);

        let run = || -> Vec<FileResult> {
            files
                .par_iter()
                .map(|path| {
                    if exceeded.load(Ordering::Relaxed) {
                        return FileResult::Matches(Vec::new());
                    }
                    if deadline.is_some_and(|d| Instant::now() > d) {
                        exceeded.store(true, Ordering::Relaxed);
                        return FileResult::Matches(Vec::new());
                    }
                    self.scan_one(path)
                })
                .collect()
        };

        let results = match rayon::ThreadPoolBuilder::new().num_threads(self.thread_count()).build() {
            Ok(pool) => pool.install(run),
            Err(e) => {
                log::warn!("Failed to build scan thread pool, using the global pool: {}", e);
                run()
            }
        };

        if exceeded.load(Ordering::Relaxed) || deadline.is_some_and(|d| Instant::now() > d) {
            return Err(Error::BudgetExceeded {
                elapsed_ms: started.elapsed().as_millis() as u64,
                budget_ms: self.budget.map(|b| b.as_millis() as u64).unwrap_or(0),
            });
        }

        let mut output = EngineOutput::default();
        for result in results {
            match result {
                FileResult::Matches(matches) => output.matches.extend(matches),
                FileResult::Binary => output.binary_files += 1,
                FileResult::Unreadable(path) => output.skipped.push(path),
            }
        }

        output.matches.sort_by(|a, b| {
            Path::new(&a.file_path)
                .cmp(Path::new(&b.file_path))
                .then(a.line_number.cmp(&b.line_number))
                .then(a.char_start.cmp(&b.char_start))
        });

        log::debug!(
            "Scanned {} files in {:?}: {} matches, {} skipped, {} binary",
            files.len(),
            started.elapsed(),
            output.matches.len(),
            output.skipped.len(),
            output.binary_files
        );

        Ok(output)
    }

    fn thread_count(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        // Leave some headroom on busy machines
        ((num_cpus::get() as f64 * 0.8).ceil() as usize).max(1)
    }
}

fn compile(source: &str, shown: &str, case_sensitive: bool) -> Result<Regex> {
    RegexBuilder::new(source)
        .case_insensitive(!case_sensitive)
        .size_limit(REGEX_SIZE_LIMIT)
        .dfa_size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| Error::query_syntax(shown, e.to_string()))
}

/// NUL anywhere in the sample, or non-UTF-8 content with more than 20% non-text bytes
pub fn is_binary(sample: &[u8]) -> bool {
    if sample.is_empty() {
        return false;
    }
    if sample.contains(&0) {
        return true;
    }

    match std::str::from_utf8(sample) {
        Ok(_) => return false,
        // Multi-byte sequence cut off by the sample boundary
        Err(e) if e.error_len().is_none() => return false,
        Err(_) => {}
    }

    let non_text = sample
        .iter()
        .filter(|&&b| !matches!(b, 0x20..=0x7e | b'\n' | b'\r' | b'\t' | 0x0c | 0x08))
        .count();
    non_text * 5 > sample.len()
}

/// UTF-8, or Latin-1 when the bytes are not valid UTF-8
pub fn decode_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => e.into_bytes().iter().map(|&b| b as char).collect(),
    }
}
