//! Cache key derivation
//!
//! Every key is a blake3 digest over a canonical, length-prefixed encoding of
//! its inputs. Nothing run-specific (timestamps, process ids, hash map order)
//! takes part, so identical inputs give identical keys across processes.
//!
//! Three digests exist per search query:
//! - `digest`: namespace + full query + scope signature (the exact-match key)
//! - `query_digest`: namespace + full query (identifies "the same question" across file states)
//! - `shape_digest`: namespace + query without its paths (groups queries eligible for scoped reuse)

use std::path::Path;

use crate::models::{CacheNamespace, Finding, ModelParams, Query};
use crate::signature::ScopeSignature;

/// Bumped whenever the encoding below changes meaning
const KEY_VERSION: &str = "scopecache-key-v1";

/// Length-prefixed field writer over a blake3 hasher
struct KeyWriter {
    hasher: blake3::Hasher,
}

impl KeyWriter {
    fn new(namespace: CacheNamespace) -> Self {
        let mut writer = Self { hasher: blake3::Hasher::new() };
        writer.field("version", KEY_VERSION.as_bytes());
        writer.field("namespace", namespace.as_str().as_bytes());
        writer
    }

    fn field(&mut self, name: &str, value: &[u8]) -> &mut Self {
        self.hasher.update(&(name.len() as u64).to_le_bytes());
        self.hasher.update(name.as_bytes());
        self.hasher.update(&(value.len() as u64).to_le_bytes());
        self.hasher.update(value);
        self
    }

    fn flag(&mut self, name: &str, value: bool) -> &mut Self {
        self.field(name, &[value as u8])
    }

    fn number(&mut self, name: &str, value: u64) -> &mut Self {
        self.field(name, &value.to_le_bytes())
    }

    fn list<'a>(&mut self, name: &str, items: impl ExactSizeIterator<Item = &'a [u8]>) -> &mut Self {
        self.number(name, items.len() as u64);
        for item in items {
            self.field(name, item);
        }
        self
    }

    fn scope(&mut self, scope: &ScopeSignature) -> &mut Self {
        self.field("scope", b"");
        scope.hash_into(&mut self.hasher);
        self
    }

    fn finish(&self) -> String {
        self.hasher.finalize().to_hex().to_string()
    }
}

fn write_query_shape(writer: &mut KeyWriter, query: &Query) {
    let opts = query.options();
    writer
        .field("pattern", query.pattern().as_bytes())
        .flag("is_regex", opts.is_regex)
        .flag("case_sensitive", opts.case_sensitive)
        .number("context_lines", opts.context_lines as u64)
        .list("exclude_dirs", opts.exclude_dirs.iter().map(|s| s.as_bytes()))
        .list("exclude_files", opts.exclude_files.iter().map(|s| s.as_bytes()))
        .flag("include_hidden", opts.include_hidden);
}

fn write_query_paths(writer: &mut KeyWriter, query: &Query) {
    writer.list(
        "paths",
        query.paths().iter().map(|p| p.as_os_str().as_encoded_bytes()),
    );
}

/// Exact-match key for `query` over the files described by `scope`
pub fn digest(namespace: CacheNamespace, query: &Query, scope: &ScopeSignature) -> String {
    let mut writer = KeyWriter::new(namespace);
    write_query_shape(&mut writer, query);
    write_query_paths(&mut writer, query);
    writer.scope(scope);
    writer.finish()
}

/// Key for the query alone, independent of file state
pub fn query_digest(namespace: CacheNamespace, query: &Query) -> String {
    let mut writer = KeyWriter::new(namespace);
    write_query_shape(&mut writer, query);
    write_query_paths(&mut writer, query);
    writer.finish()
}

/// Key for every field except `paths`
pub fn shape_digest(namespace: CacheNamespace, query: &Query) -> String {
    let mut writer = KeyWriter::new(namespace);
    write_query_shape(&mut writer, query);
    writer.finish()
}

/// Stable identity of an elaboration request, independent of which report named the finding
pub fn finding_digest(finding: &Finding, context_window_lines: usize, params: &ModelParams) -> String {
    let file = crate::models::normalize_path(Path::new(&finding.file_path));
    let snippet_hash = blake3::hash(finding.snippet.as_bytes());

    let mut writer = KeyWriter::new(CacheNamespace::Elaborate);
    writer
        .field("file_path", file.as_os_str().as_encoded_bytes())
        .number("line_number", finding.line_number as u64)
        .field("match_text", finding.match_text.as_bytes())
        .field("snippet_hash", snippet_hash.as_bytes())
        .number("context_window_lines", context_window_lines as u64)
        .field("provider", params.provider.to_lowercase().as_bytes())
        .field("model", params.model.as_bytes())
        .field("api_base", params.api_base.as_deref().unwrap_or("").as_bytes());
    writer.finish()
}

/// Exact-match key for an elaboration: finding fingerprint plus the source file's signature
pub fn elaboration_digest(finding_fingerprint: &str, scope: &ScopeSignature) -> String {
    let mut writer = KeyWriter::new(CacheNamespace::Elaborate);
    writer.field("finding", finding_fingerprint.as_bytes());
    writer.scope(scope);
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueryOptions;
    use crate::signature::ContentSignature;
    use std::path::PathBuf;

    fn scope(entries: &[(&str, u64, u64)]) -> ScopeSignature {
        ScopeSignature::new(entries.iter().map(|(p, size, mtime)| ContentSignature {
            path: PathBuf::from(p),
            size_bytes: *size,
            mtime_nanos: *mtime,
            content_hash: None,
        }))
    }

    fn base_query() -> Query {
        Query::new("hello world", ["/repo"], QueryOptions::default())
    }

    #[test]
    fn test_digest_is_deterministic() {
        let s = scope(&[("/repo/a", 1, 2), ("/repo/b", 3, 4)]);
        let first = digest(CacheNamespace::Search, &base_query(), &s);
        let second = digest(CacheNamespace::Search, &base_query(), &s.clone());
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn test_digest_ignores_input_ordering() {
        let s1 = scope(&[("/repo/a", 1, 2), ("/repo/b", 3, 4)]);
        let s2 = scope(&[("/repo/b", 3, 4), ("/repo/a", 1, 2)]);
        let q1 = Query::new("x", ["/r2", "/r1"], QueryOptions::default());
        let q2 = Query::new("x ", ["/r1", "/r2", "/r1"], QueryOptions::default());
        assert_eq!(
            digest(CacheNamespace::Search, &q1, &s1),
            digest(CacheNamespace::Search, &q2, &s2)
        );
    }

    #[test]
    fn test_every_field_changes_digest() {
        let s = scope(&[("/repo/a", 1, 2)]);
        let base = digest(CacheNamespace::Search, &base_query(), &s);

        let variants = vec![
            Query::new("hello worlds", ["/repo"], QueryOptions::default()),
            Query::new("hello world", ["/repo/sub"], QueryOptions::default()),
            Query::new("hello world", ["/repo"], QueryOptions { is_regex: true, ..Default::default() }),
            Query::new("hello world", ["/repo"], QueryOptions { case_sensitive: true, ..Default::default() }),
            Query::new("hello world", ["/repo"], QueryOptions { context_lines: 4, ..Default::default() }),
            Query::new("hello world", ["/repo"], QueryOptions { include_hidden: true, ..Default::default() }),
            Query::new(
                "hello world",
                ["/repo"],
                QueryOptions { exclude_dirs: vec!["build".into()], ..Default::default() },
            ),
            Query::new(
                "hello world",
                ["/repo"],
                QueryOptions { exclude_files: vec!["*.md".into()], ..Default::default() },
            ),
        ];
        for q in &variants {
            assert_ne!(digest(CacheNamespace::Search, q, &s), base, "query {:?}", q);
        }

        assert_ne!(digest(CacheNamespace::Elaborate, &base_query(), &s), base);
        assert_ne!(digest(CacheNamespace::Search, &base_query(), &scope(&[("/repo/a", 1, 3)])), base);
        assert_ne!(digest(CacheNamespace::Search, &base_query(), &scope(&[("/repo/a", 2, 2)])), base);
    }

    #[test]
    fn test_exclusion_lists_are_not_ambiguous() {
        // ["a,b"] vs ["a", "b"] and dirs vs files must stay distinct
        let s = ScopeSignature::default();
        let q = |dirs: Vec<&str>, files: Vec<&str>| {
            Query::new(
                "x",
                ["/r"],
                QueryOptions {
                    exclude_dirs: dirs.into_iter().map(String::from).collect(),
                    exclude_files: files.into_iter().map(String::from).collect(),
                    ..Default::default()
                },
            )
        };
        let a = digest(CacheNamespace::Search, &q(vec!["a,b"], vec![]), &s);
        let b = digest(CacheNamespace::Search, &q(vec!["a", "b"], vec![]), &s);
        let c = digest(CacheNamespace::Search, &q(vec![], vec!["a", "b"]), &s);
        assert_ne!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn test_shape_digest_ignores_paths_only() {
        let broad = base_query();
        let narrow = broad.with_paths(["/repo/src"]);
        assert_eq!(
            shape_digest(CacheNamespace::Search, &broad),
            shape_digest(CacheNamespace::Search, &narrow)
        );
        assert_ne!(
            query_digest(CacheNamespace::Search, &broad),
            query_digest(CacheNamespace::Search, &narrow)
        );
        let case = Query::new("hello world", ["/repo"], QueryOptions { case_sensitive: true, ..Default::default() });
        assert_ne!(
            shape_digest(CacheNamespace::Search, &broad),
            shape_digest(CacheNamespace::Search, &case)
        );
    }

    #[test]
    fn test_finding_digest_fields() {
        let finding = Finding {
            file_path: "/repo/src/lib.rs".into(),
            line_number: 10,
            match_text: "foo".into(),
            snippet: "  10: >>> foo <<<".into(),
        };
        let params = ModelParams {
            provider: "gemini".into(),
            model: "gemini-2.5-flash".into(),
            api_base: None,
        };
        let base = finding_digest(&finding, 10, &params);
        assert_eq!(base, finding_digest(&finding.clone(), 10, &params.clone()));

        assert_ne!(base, finding_digest(&finding, 5, &params));
        assert_ne!(base, finding_digest(&Finding { line_number: 11, ..finding.clone() }, 10, &params));
        assert_ne!(base, finding_digest(&Finding { snippet: "other".into(), ..finding.clone() }, 10, &params));
        assert_ne!(
            base,
            finding_digest(&finding, 10, &ModelParams { model: "gemini-2.5-pro".into(), ..params.clone() })
        );
        // Provider names are case-insensitive
        assert_eq!(
            base,
            finding_digest(&finding, 10, &ModelParams { provider: "Gemini".into(), ..params.clone() })
        );
    }

    #[test]
    fn test_elaboration_digest_tracks_source_file() {
        let fp = "abc";
        let before = elaboration_digest(fp, &scope(&[("/repo/src/lib.rs", 100, 1)]));
        let after = elaboration_digest(fp, &scope(&[("/repo/src/lib.rs", 101, 1)]));
        assert_ne!(before, after);
        assert_eq!(before, elaboration_digest(fp, &scope(&[("/repo/src/lib.rs", 100, 1)])));
    }
}
