//! Build-time payload schema hash
//!
//! Hashes every source file that defines what the cache writes to disk. The
//! result is exported as `CACHE_SCHEMA_HASH`; `CacheStore::open` compares it with
//! the hash recorded in `cache.db` and drops all entries when they differ, so a
//! changed `Match` layout or key derivation never serves stale payloads.
//!
//! ## Format-defining files:
//! - src/models.rs: payload types (Match, SnippetLine, CachePayload)
//! - src/cache.rs: SQLite schema and payload encoding
//! - src/scope_index.rs: scope index schema
//! - src/fingerprint.rs: key derivation
//! - src/signature.rs: signature encoding

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

const SCHEMA_FILES: &[&str] = &[
    "src/models.rs",
    "src/cache.rs",
    "src/scope_index.rs",
    "src/fingerprint.rs",
    "src/signature.rs",
];

fn main() {
    let schema_hash = compute_schema_hash();

    println!("cargo:rustc-env=CACHE_SCHEMA_HASH={}", schema_hash);

    for file in SCHEMA_FILES {
        println!("cargo:rerun-if-changed={}", file);
    }
}

fn compute_schema_hash() -> String {
    let mut hasher = blake3::Hasher::new();

    // Sorted so the hash does not depend on declaration order above
    let files: BTreeSet<&str> = SCHEMA_FILES.iter().copied().collect();

    for file_path in files {
        let path = Path::new(file_path);
        let content = fs::read(path)
            .unwrap_or_else(|e| panic!("Failed to read schema file {}: {}", file_path, e));

        hasher.update(file_path.as_bytes());
        hasher.update(&[0]);
        hasher.update(&content);
    }

    hasher.finalize().to_hex()[..16].to_string()
}
