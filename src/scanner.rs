//! File discovery for a query's roots
//!
//! Turns the query's paths into the ordered, deduplicated list of absolute
//! file paths the engine scans and the signature covers. Only the rules here
//! exclude files: `.gitignore` and friends are not consulted.

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::errors::{Error, Result};
use crate::models::{normalize_path, QueryOptions};

pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &[".git", "__pycache__", "venv", "node_modules", ".hg", ".svn"];

pub const DEFAULT_EXCLUDED_FILES: &[&str] = &["*.log", "*.tmp", "*.swp", "*.bak"];

/// Extensions dropped without opening the file
const BINARY_EXTENSIONS: &[&str] = &[
    // Compiled code
    "pyc", "pyo", "o", "so", "obj", "dll", "exe", "class", "jar",
    // Archives
    "zip", "tar", "gz", "bz2", "rar", "7z", "iso",
    // Images
    "png", "jpg", "jpeg", "gif", "bmp", "tiff", "ico",
    // Audio/video
    "mp3", "wav", "ogg", "mp4", "avi", "mov", "flv", "mkv",
    // Documents
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "odt",
    // Data
    "db", "sqlite", "dat",
];

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Extra directory globs (base name or root-relative path)
    pub exclude_dirs: Vec<String>,
    /// Extra file globs (base name or root-relative path)
    pub exclude_files: Vec<String>,
    pub include_hidden: bool,
}

impl From<&QueryOptions> for ScanOptions {
    fn from(opts: &QueryOptions) -> Self {
        Self {
            exclude_dirs: opts.exclude_dirs.clone(),
            exclude_files: opts.exclude_files.clone(),
            include_hidden: opts.include_hidden,
        }
    }
}

/// Result of resolving a set of roots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Absolute, sorted, deduplicated
    pub files: Vec<PathBuf>,
    /// Roots that do not exist
    pub missing: Vec<PathBuf>,
}

/// Compiled exclusion rules
#[derive(Debug, Clone)]
struct Rules {
    dirs: GlobSet,
    files: GlobSet,
    include_hidden: bool,
}

impl Rules {
    fn is_hidden(name: &str) -> bool {
        name.starts_with('.') && name != "." && name != ".."
    }

    fn rejects_dir(&self, path: &Path, root: &Path) -> bool {
        let name = file_name(path);
        if !self.include_hidden && Self::is_hidden(&name) {
            return true;
        }
        self.dirs.is_match(&name) || self.dirs.is_match(relative_to(path, root))
    }

    fn rejects_file(&self, path: &Path, root: &Path) -> bool {
        let name = file_name(path);
        if !self.include_hidden && Self::is_hidden(&name) {
            return true;
        }
        if has_binary_extension(path) {
            log::trace!("Skipping {} (binary extension)", path.display());
            return true;
        }
        self.files.is_match(&name) || self.files.is_match(relative_to(path, root))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn relative_to<'a>(path: &'a Path, root: &Path) -> &'a Path {
    path.strip_prefix(root).unwrap_or(path)
}

fn has_binary_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            BINARY_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// `build/` and `build/*` both mean "the directory build"
fn directory_glob(pattern: &str) -> &str {
    pattern
        .strip_suffix("/*")
        .or_else(|| pattern.strip_suffix('/'))
        .unwrap_or(pattern)
}

fn build_globset<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::query_syntax(pattern, format!("invalid exclusion glob: {}", e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::query_syntax("<exclusions>", format!("failed to build exclusion set: {}", e)))
}

pub struct FileScanner {
    rules: Rules,
}

impl FileScanner {
    /// Compile the default and user exclusion rules.
    ///
    /// A malformed user glob is reported as `QuerySyntax`, before any file is touched.
    pub fn new(options: ScanOptions) -> Result<Self> {
        let dirs = build_globset(
            DEFAULT_EXCLUDED_DIRS
                .iter()
                .copied()
                .chain(options.exclude_dirs.iter().map(|p| directory_glob(p))),
        )?;
        // A trailing slash marks a directory-only pattern
        let files = build_globset(
            DEFAULT_EXCLUDED_FILES.iter().copied().chain(
                options
                    .exclude_files
                    .iter()
                    .map(String::as_str)
                    .filter(|p| !p.ends_with('/')),
            ),
        )?;

        Ok(Self {
            rules: Rules {
                dirs,
                files,
                include_hidden: options.include_hidden,
            },
        })
    }

    /// Resolve `roots` into the files a search visits
    pub fn scan(&self, roots: &[PathBuf]) -> ScanOutcome {
        let mut files = BTreeSet::new();
        let mut missing = Vec::new();

        for root in roots {
            let root = normalize_path(root);
            if !root.exists() {
                log::warn!("Path does not exist: {}", root.display());
                missing.push(root);
                continue;
            }

            if root.is_file() {
                let parent = root.parent().unwrap_or(&root).to_path_buf();
                if self.accepts_explicit_file(&root, &parent) {
                    files.insert(root);
                }
                continue;
            }

            self.walk(&root, &mut files);
        }

        ScanOutcome {
            files: files.into_iter().collect(),
            missing,
        }
    }

    /// A file named directly as a root skips the hidden check but not the file rules
    fn accepts_explicit_file(&self, path: &Path, parent: &Path) -> bool {
        let relaxed = Rules {
            include_hidden: true,
            ..self.rules.clone()
        };
        !relaxed.rejects_file(path, parent)
    }

    fn walk(&self, root: &Path, files: &mut BTreeSet<PathBuf>) {
        let dir_rules = self.rules.clone();
        let walk_root = root.to_path_buf();

        let walker = WalkBuilder::new(root)
            .standard_filters(false)
            .follow_links(false)
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let is_dir = entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
                !is_dir || !dir_rules.rejects_dir(entry.path(), &walk_root)
            })
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                    continue;
                }
            };

            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }

            let path = entry.path();
            if self.rules.rejects_file(path, root) {
                continue;
            }
            files.insert(path.to_path_buf());
        }
    }
}
