//! Object-store backends used to hold published warehouse tables.
//!
//! Every backend replaces an object in a single step: readers observe either the
//! previous bytes or the new bytes for a key, never a prefix of the new upload.

mod local;
mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

pub use local::LocalBucketStore;
pub use s3::{S3BucketStore, S3Config};

#[derive(Debug, Error)]
pub enum BucketError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("sdk error: {0}")]
    Sdk(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl BucketError {
    fn from_sdk(err: impl fmt::Display) -> Self {
        Self::Sdk(err.to_string())
    }
}

/// Keys are `/`-separated relative paths; empty and `..` segments are rejected on
/// every backend so a key means the same object everywhere.
pub(crate) fn check_key(key: &str) -> Result<(), BucketError> {
    if key.is_empty() || key.split('/').any(|segment| segment.is_empty() || segment == "..") {
        return Err(BucketError::Configuration(format!(
            "invalid object key '{key}'"
        )));
    }
    Ok(())
}

#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Replace the object stored at `key` with `bytes`.
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), BucketError>;
    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError>;
    /// Human-readable location used in logs, e.g. `s3://bucket` or a directory.
    fn describe(&self) -> String;
}
