//! Object storage for profile pictures.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::config::Storage as StorageConfig;
use crate::error::{Error, Result};

/// Accepted picture formats with their extensions.
const PICTURE_FORMATS: &[(&str, &[&str])] = &[
    ("image/png", &["png"]),
    ("image/jpeg", &["jpg", "jpeg"]),
    ("image/webp", &["webp"]),
    ("image/gif", &["gif"]),
];

/// Port for bucket-based object storage.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    async fn make_bucket(&self, bucket: &str) -> Result<()>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<()>;

    /// Remove an object. Missing objects are not an error.
    async fn remove_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// Public address of an object.
    fn object_url(&self, bucket: &str, key: &str) -> String;
}

/// Check a picture and return the extension it must be stored with.
pub fn picture_extension(
    filename: &str,
    content_type: &str,
    size: usize,
    max_size: usize,
) -> Result<&'static str> {
    if size == 0 {
        return Err(Error::InvalidPicture);
    }
    if size > max_size {
        return Err(Error::PictureTooLarge {
            size,
            max: max_size,
        });
    }

    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .ok_or(Error::InvalidPicture)?;

    PICTURE_FORMATS
        .iter()
        .find(|(mime, _)| mime.eq_ignore_ascii_case(content_type))
        .and_then(|(_, extensions)| {
            extensions.iter().copied().find(|e| *e == extension)
        })
        .ok_or(Error::InvalidPicture)
}

/// Filesystem object storage: buckets are directories under `root`,
/// served by whatever stands behind `public_url`.
#[derive(Debug, Clone)]
pub struct FsObjectStorage {
    root: PathBuf,
    public_url: String,
}

impl FsObjectStorage {
    /// Create a new [`FsObjectStorage`].
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            root: config.root.clone(),
            public_url: config.public_url.trim_end_matches('/').to_string(),
        }
    }

    /// Resolve a relative path, refusing anything escaping `root`.
    fn resolve(&self, parts: &[&str]) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for part in parts {
            let relative = Path::new(part);
            if relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
            {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid object path {part:?}"),
                )));
            }
            path.push(relative);
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectStorage for FsObjectStorage {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let path = self.resolve(&[bucket])?;
        Ok(tokio::fs::try_exists(&path).await? && path.is_dir())
    }

    async fn make_bucket(&self, bucket: &str) -> Result<()> {
        let path = self.resolve(&[bucket])?;
        tokio::fs::create_dir_all(&path).await?;
        tracing::info!(bucket, path = %path.display(), "bucket created");
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<()> {
        let path = self.resolve(&[bucket, key])?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        tracing::debug!(bucket, key, content_type, size = data.len(), "object stored");
        Ok(())
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.resolve(&[bucket, key])?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(bucket, key, "object removed");
                Ok(())
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{bucket}/{key}", self.public_url)
    }
}
