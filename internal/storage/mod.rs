use crate::events::NotificationBatch;
use crate::metadata::MergedMetadata;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod s3;
pub mod sigv4;

pub use s3::S3Store;

/// Streaming object body.
pub type ByteStream = BoxStream<'static, Result<Bytes, StoreError>>;

/// The record returned by a stat operation. All fields are read-only once
/// returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub content_type: String,
    pub user_metadata: BTreeMap<String, String>,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store reported that the object key does not exist.
    NoSuchKey,
    /// The store reported that the bucket does not exist.
    NoSuchBucket,
    /// Anything else: transport failures, auth failures, unexpected statuses.
    Unexpected(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NoSuchKey => write!(f, "The specified key does not exist."),
            StoreError::NoSuchBucket => write!(f, "The specified bucket does not exist"),
            StoreError::Unexpected(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// The object-store operations the pipeline needs. `S3Store` is the real
/// implementation; tests substitute an in-memory one.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError>;

    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StoreError>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ByteStream, StoreError>;

    /// Server-side copy with the given metadata, replacing (not extending)
    /// stored metadata. Returns the destination etag.
    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        meta: &MergedMetadata,
    ) -> Result<String, StoreError>;

    async fn remove_object(&self, bucket: &str, key: &str) -> Result<(), StoreError>;

    /// Recursive listing of every key in the bucket.
    async fn list_objects(&self, bucket: &str) -> Result<Vec<String>, StoreError>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError>;

    /// Subscribe to the store's native object-created notification channel.
    /// The channel closes when `shutdown` is cancelled or the upstream
    /// connection ends.
    async fn watch_bucket(
        &self,
        bucket: &str,
        shutdown: CancellationToken,
    ) -> Result<mpsc::Receiver<NotificationBatch>, StoreError>;
}

/// Canonicalize a user-metadata name the way http header names print:
/// first letter of each dash-separated segment upper-cased. Keeps stat
/// results stable regardless of how the wire lower-cased them.
pub fn canonical_meta_key(name: &str) -> String {
    name.split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::{canonical_meta_key, StoreError};

    #[test]
    fn canonical_meta_key_title_cases_segments() {
        assert_eq!(canonical_meta_key("uploadpaths"), "Uploadpaths");
        assert_eq!(canonical_meta_key("uploaddir"), "Uploaddir");
        assert_eq!(canonical_meta_key("x-origin"), "X-Origin");
        assert_eq!(canonical_meta_key("Uploadpaths"), "Uploadpaths");
    }

    #[test]
    fn no_such_key_displays_store_sentinel() {
        assert_eq!(
            StoreError::NoSuchKey.to_string(),
            "The specified key does not exist."
        );
    }
}
