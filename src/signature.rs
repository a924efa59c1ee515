//! Per-file change fingerprints
//!
//! A `ContentSignature` is read from metadata only (size and modification
//! time), so computing it costs one `stat` regardless of file size. A file
//! rewritten with identical size inside the file system's mtime granularity
//! keeps its signature; `SignatureMode::Content` closes that gap at the cost of
//! hashing every byte.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::errors::{Error, Result};

/// How much work goes into each file's signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureMode {
    /// Size and modification time only
    #[default]
    Metadata,
    /// Metadata plus a blake3 hash of the contents
    Content,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentSignature {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Modification time in nanoseconds since the Unix epoch (0 if unavailable)
    pub mtime_nanos: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// Signature of one file from its metadata
pub fn signature_of(path: &Path) -> Result<ContentSignature> {
    signature_with_mode(path, SignatureMode::Metadata)
}

pub fn signature_with_mode(path: &Path, mode: SignatureMode) -> Result<ContentSignature> {
    let metadata = std::fs::metadata(path).map_err(|source| Error::ScanIo {
        path: path.to_path_buf(),
        source,
    })?;

    let content_hash = match mode {
        SignatureMode::Metadata => None,
        SignatureMode::Content => Some(hash_file(path)?),
    };

    Ok(ContentSignature {
        path: path.to_path_buf(),
        size_bytes: metadata.len(),
        mtime_nanos: file_mtime_nanos(&metadata),
        content_hash,
    })
}

fn file_mtime_nanos(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_nanos() as u64)
        .unwrap_or(0)
}

fn hash_file(path: &Path) -> Result<String> {
    let io_err = |source| Error::ScanIo { path: path.to_path_buf(), source };
    let file = File::open(path).map_err(io_err)?;
    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 64 * 1024];

    loop {
        let read = reader.read(&mut buf).map_err(io_err)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// The signatures of every file a traversal visited, sorted by path
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeSignature(Vec<ContentSignature>);

impl ScopeSignature {
    pub fn new(signatures: impl IntoIterator<Item = ContentSignature>) -> Self {
        let mut sigs: Vec<ContentSignature> = signatures.into_iter().collect();
        sigs.sort_by(|a, b| a.path.cmp(&b.path));
        sigs.dedup_by(|a, b| a.path == b.path);
        Self(sigs)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContentSignature> {
        self.0.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.0.iter().map(|s| s.path.as_path())
    }

    pub fn get(&self, path: &Path) -> Option<&ContentSignature> {
        self.0
            .binary_search_by(|s| s.path.as_path().cmp(path))
            .ok()
            .map(|idx| &self.0[idx])
    }

    /// The sub-signature covering exactly `files`, or `None` if any of them is absent here
    pub fn restrict_to<'a>(&self, files: impl IntoIterator<Item = &'a Path>) -> Option<ScopeSignature> {
        let mut out = Vec::new();
        for path in files {
            out.push(self.get(path)?.clone());
        }
        Some(ScopeSignature::new(out))
    }

    /// Feed a length-prefixed canonical encoding into `hasher`
    pub fn hash_into(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&(self.0.len() as u64).to_le_bytes());
        for sig in &self.0 {
            let path = sig.path.as_os_str().as_encoded_bytes();
            hasher.update(&(path.len() as u64).to_le_bytes());
            hasher.update(path);
            hasher.update(&sig.size_bytes.to_le_bytes());
            hasher.update(&sig.mtime_nanos.to_le_bytes());
            match &sig.content_hash {
                Some(h) => {
                    hasher.update(&[1]);
                    hasher.update(h.as_bytes());
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }
    }

    /// JSON form stored next to each entry.
    ///
    /// Paths must be valid UTF-8. A scope containing any other path fails to
    /// encode, so results over it are returned but never stored.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let sig: ScopeSignature = serde_json::from_slice(bytes)?;
        // Re-sort in case the stored form predates the ordering rule
        Ok(ScopeSignature::new(sig.0))
    }
}

/// Signatures for `files`, computed in parallel.
///
/// Files whose metadata cannot be read are left out of the scope and returned
/// as `ScanIo` errors for the caller to log.
pub fn scope_signature_of(files: &[PathBuf], mode: SignatureMode) -> (ScopeSignature, Vec<Error>) {
    let results: Vec<Result<ContentSignature>> = files
        .par_iter()
        .map(|path| signature_with_mode(path, mode))
        .collect();

    let mut sigs = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(sig) => sigs.push(sig),
            Err(e) => errors.push(e),
        }
    }

    (ScopeSignature::new(sigs), errors)
}
