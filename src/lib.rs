//! scopecache: pattern search and LLM elaboration over code trees
//!
//! Results are cached against a fingerprint of the query and of every file
//! the query touched (size and modification time), so repeated searches over
//! unchanged files are served from disk, and a search narrowed to a
//! subdirectory can be answered from an earlier, broader result.
//!
//! # Architecture
//!
//! - **Scanner**: resolves roots to the filtered file set a query covers
//! - **Engine**: literal/regex matching with context snippets
//! - **Fingerprint / Signature**: deterministic cache keys and staleness detection
//! - **Cache / ScopeIndex**: SQLite store with TTL, size eviction and subset reuse
//! - **Coordinator**: lookup, reuse, compute and store for search and elaboration
//!
//! # Example Usage
//!
//! ```no_run
//! use scopecache::{CacheCoordinator, CacheLimits, Query, QueryOptions};
//!
//! # fn main() -> scopecache::Result<()> {
//! let coordinator = CacheCoordinator::open(".scopecache", CacheLimits::default());
//! let query = Query::new("TODO", ["src"], QueryOptions::default());
//! let matches = coordinator.search(&query)?;
//!
//! println!("Found {} matches", matches.len());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod elaborate;
pub mod engine;
pub mod errors;
pub mod fingerprint;
pub mod formatter;
pub mod mcp;
pub mod models;
pub mod output;
pub mod scanner;
pub mod scope_index;
pub mod signature;

// Re-export commonly used types
pub use cache::{CacheLimits, CacheStore};
pub use coordinator::CacheCoordinator;
pub use errors::{Error, Result};
pub use models::{CacheMode, CacheNamespace, CacheSource, Finding, Match, ModelParams, Query, QueryOptions};
