//! Artifact store: opaque-URI object storage plus parquet helpers.
//!
//! The core treats URIs (`<scheme>://<bucket>/<key>`) as opaque strings;
//! only this crate interprets them. The default backend maps every URI onto
//! a local filesystem root, which keeps single-node deployments and tests
//! free of external services.

pub mod parquet_io;
pub mod uris;

pub use parquet_io::{batches_to_parquet, parquet_to_batches};
pub use uris::{background_sample_uri, dataset_uri, model_uri, parse_uri, ParsedUri};

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid artifact URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}

/// Object storage contract used by the pipeline and handlers.
///
/// Implementations are cheap to clone and safe to share across steps.
pub trait ArtifactStore: Send + Sync {
    /// Write an object, replacing any existing one at the URI.
    fn put_bytes(&self, uri: &str, data: &[u8]) -> Result<()>;

    /// Read an object.
    fn get_bytes(&self, uri: &str) -> Result<Vec<u8>>;

    /// Delete an object if present. Missing objects are not an error.
    fn delete(&self, uri: &str) -> Result<()>;

    /// Whether an object exists at the URI.
    fn exists(&self, uri: &str) -> Result<bool>;
}

/// Filesystem-backed store. `<scheme>://<bucket>/<key>` maps to
/// `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, uri: &str) -> Result<PathBuf> {
        let parsed = parse_uri(uri)?;
        Ok(self.root.join(parsed.bucket).join(parsed.key))
    }
}

impl ArtifactStore for LocalArtifactStore {
    fn put_bytes(&self, uri: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(uri)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write-then-rename so readers never observe a partial object.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        info!("Wrote artifact {} ({} bytes)", uri, data.len());
        Ok(())
    }

    fn get_bytes(&self, uri: &str) -> Result<Vec<u8>> {
        let path = self.path_for(uri)?;
        if !path.exists() {
            return Err(StoreError::NotFound(uri.to_string()));
        }
        Ok(fs::read(path)?)
    }

    fn delete(&self, uri: &str) -> Result<()> {
        let path = self.path_for(uri)?;
        if path.exists() {
            fs::remove_file(&path)?;
            debug!("Deleted artifact {}", uri);
        }
        Ok(())
    }

    fn exists(&self, uri: &str) -> Result<bool> {
        Ok(self.path_for(uri)?.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        let uri = "s3://analytics/datasets/dataset_1.parquet";

        store.put_bytes(uri, b"hello").unwrap();
        assert!(store.exists(uri).unwrap());
        assert_eq!(store.get_bytes(uri).unwrap(), b"hello");
    }

    #[test]
    fn test_put_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        let uri = "file://bucket/key.bin";

        store.put_bytes(uri, b"one").unwrap();
        store.put_bytes(uri, b"two").unwrap();
        assert_eq!(store.get_bytes(uri).unwrap(), b"two");
    }

    #[test]
    fn test_delete_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        store.delete("file://bucket/absent").unwrap();
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        assert!(matches!(
            store.get_bytes("file://bucket/absent"),
            Err(StoreError::NotFound(_))
        ));
    }
}
