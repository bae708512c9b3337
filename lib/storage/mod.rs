//! Object storage for uploaded CSV blobs.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::{ObjectStore, PutPayload};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("invalid object key {key:?}: {message}")]
    InvalidKey { key: String, message: String },

    #[error("presigned upload URLs are not supported by this store")]
    SigningUnsupported,

    #[error("storage configuration error: {0}")]
    Config(String),
}

/// Blob operations the pipeline needs from object storage.
pub trait BlobStore: Send + Sync {
    fn get_full_object<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Bytes, StorageError>>;

    fn put_object<'a>(
        &'a self,
        key: &'a str,
        bytes: Bytes,
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    fn delete_object<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>>;

    fn object_exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StorageError>>;

    /// Issues a write-capable URL for `key` valid for `expires_in`.
    fn upload_url<'a>(
        &'a self,
        key: &'a str,
        expires_in: Duration,
    ) -> BoxFuture<'a, Result<String, StorageError>>;
}

/// [`BlobStore`] backed by any `object_store` implementation.
pub struct ObjectStoreBlobs {
    store: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
}

impl ObjectStoreBlobs {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            signer: None,
        }
    }

    /// S3 bucket configured from the standard `AWS_*` environment variables.
    pub fn s3_from_env(bucket: &str) -> Result<Self, StorageError> {
        let s3 = Arc::new(
            AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .build()?,
        );
        Ok(Self {
            store: s3.clone(),
            signer: Some(s3),
        })
    }

    pub fn local(root: &std::path::Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(root).map_err(|err| {
            StorageError::Config(format!("cannot create {}: {err}", root.display()))
        })?;
        Ok(Self::new(Arc::new(LocalFileSystem::new_with_prefix(root)?)))
    }
}

fn object_path(key: &str) -> Result<Path, StorageError> {
    Path::parse(key).map_err(|err| StorageError::InvalidKey {
        key: key.to_string(),
        message: err.to_string(),
    })
}

fn map_not_found(key: &str, err: object_store::Error) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::NotFound(key.to_string()),
        other => StorageError::ObjectStore(other),
    }
}

impl BlobStore for ObjectStoreBlobs {
    fn get_full_object<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Bytes, StorageError>> {
        Box::pin(async move {
            let path = object_path(key)?;
            let result = self
                .store
                .get(&path)
                .await
                .map_err(|err| map_not_found(key, err))?;
            Ok(result.bytes().await?)
        })
    }

    fn put_object<'a>(
        &'a self,
        key: &'a str,
        bytes: Bytes,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let path = object_path(key)?;
            self.store.put(&path, PutPayload::from(bytes)).await?;
            Ok(())
        })
    }

    fn delete_object<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let path = object_path(key)?;
            self.store
                .delete(&path)
                .await
                .map_err(|err| map_not_found(key, err))
        })
    }

    fn object_exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StorageError>> {
        Box::pin(async move {
            let path = object_path(key)?;
            match self.store.head(&path).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(err) => Err(err.into()),
            }
        })
    }

    fn upload_url<'a>(
        &'a self,
        key: &'a str,
        expires_in: Duration,
    ) -> BoxFuture<'a, Result<String, StorageError>> {
        Box::pin(async move {
            let signer = self.signer.as_ref().ok_or(StorageError::SigningUnsupported)?;
            let path = object_path(key)?;
            let url = signer
                .signed_url(reqwest::Method::PUT, &path, expires_in)
                .await?;
            Ok(url.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn memory_blobs() -> ObjectStoreBlobs {
        ObjectStoreBlobs::new(Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn full_object_reads_back_what_was_written() {
        let blobs = memory_blobs();
        blobs
            .put_object("uploads/s1/job/file.csv", Bytes::from_static(b"name,price\n"))
            .await
            .expect("put should succeed");

        let bytes = blobs
            .get_full_object("uploads/s1/job/file.csv")
            .await
            .expect("get should succeed");
        assert_eq!(&bytes[..], b"name,price\n");
        assert!(blobs
            .object_exists("uploads/s1/job/file.csv")
            .await
            .expect("head should succeed"));
    }

    #[tokio::test]
    async fn missing_objects_are_reported_as_not_found() {
        let blobs = memory_blobs();

        let err = blobs
            .get_full_object("uploads/missing.csv")
            .await
            .expect_err("missing object should fail");
        assert!(matches!(err, StorageError::NotFound(_)));
        assert!(!blobs
            .object_exists("uploads/missing.csv")
            .await
            .expect("head should succeed"));
    }

    #[tokio::test]
    async fn deleted_objects_no_longer_exist() {
        let blobs = memory_blobs();
        blobs
            .put_object("a.csv", Bytes::from_static(b"x"))
            .await
            .expect("put should succeed");
        blobs.delete_object("a.csv").await.expect("delete should succeed");

        assert!(!blobs.object_exists("a.csv").await.expect("head should succeed"));
    }

    #[tokio::test]
    async fn upload_url_requires_a_signing_store() {
        let err = memory_blobs()
            .upload_url("a.csv", Duration::from_secs(60))
            .await
            .expect_err("in-memory store cannot sign");
        assert!(matches!(err, StorageError::SigningUnsupported));
    }
}
