use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{check_key, BucketError, BucketStore};

/// Filesystem backend rooted at a directory.
///
/// Objects are written to a hidden sibling file and renamed over the target, so a
/// crash mid-write leaves the previous object in place.
#[derive(Debug, Clone)]
pub struct LocalBucketStore {
    root: PathBuf,
}

impl LocalBucketStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, BucketError> {
        check_key(key)?;
        Ok(self.root.join(key))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> BucketError {
    BucketError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl BucketStore for LocalBucketStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<(), BucketError> {
        let target = self.object_path(key)?;
        let parent = target
            .parent()
            .ok_or_else(|| BucketError::Configuration(format!("object key '{key}' has no parent")))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|err| io_error(parent, err))?;

        let file_name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = parent.join(format!(".{file_name}.partial"));

        let mut file = fs::File::create(&staging)
            .await
            .map_err(|err| io_error(&staging, err))?;
        file.write_all(&bytes)
            .await
            .map_err(|err| io_error(&staging, err))?;
        file.sync_all()
            .await
            .map_err(|err| io_error(&staging, err))?;
        drop(file);

        fs::rename(&staging, &target)
            .await
            .map_err(|err| io_error(&target, err))?;
        debug!(path = %target.display(), bytes = bytes.len(), "replaced local object");
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError> {
        let path = self.object_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BucketError::NotFound(key.to_string()))
            }
            Err(err) => Err(io_error(&path, err)),
        }
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}
