use crate::events::NotificationBatch;
use crate::metadata::MergedMetadata;
use crate::storage::{BlobStore, ByteStream, ObjectInfo, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What the in-memory store keeps per object. The content-disposition is a
/// real header on the wire, so it lives next to content-type rather than in
/// the user metadata map.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_type: String,
    pub content_disposition: String,
    pub user_metadata: BTreeMap<String, String>,
    pub etag: String,
}

/// In-memory `BlobStore` for tests: bucket maps, a pluggable notification
/// feed per bucket, and a one-shot copy failure for abort-path tests.
#[derive(Default)]
pub struct MemoryStore {
    buckets: Mutex<BTreeMap<String, BTreeMap<String, StoredObject>>>,
    feeds: Mutex<BTreeMap<String, mpsc::Receiver<NotificationBatch>>>,
    fail_copy: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn with_buckets(names: &[&str]) -> Arc<Self> {
        let store = Self::default();
        {
            let mut buckets = store.buckets.lock().expect("buckets lock");
            for name in names {
                buckets.insert(name.to_string(), BTreeMap::new());
            }
        }
        Arc::new(store)
    }

    pub fn put(&self, bucket: &str, key: &str, body: &[u8], content_type: &str) {
        let etag = format!("{:x}", md5::compute(body));
        let object = StoredObject {
            body: body.to_vec(),
            content_type: content_type.to_string(),
            content_disposition: String::new(),
            user_metadata: BTreeMap::new(),
            etag,
        };
        self.buckets
            .lock()
            .expect("buckets lock")
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.buckets
            .lock()
            .expect("buckets lock")
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .lock()
            .expect("buckets lock")
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn fail_next_copy(&self, message: &str) {
        *self.fail_copy.lock().expect("fail lock") = Some(message.to_string());
    }

    /// Register the notification feed `watch_bucket` will hand out for this
    /// bucket. The returned sender is the test's event source.
    pub fn watch_feed(&self, bucket: &str) -> mpsc::Sender<NotificationBatch> {
        let (tx, rx) = mpsc::channel(8);
        self.feeds
            .lock()
            .expect("feeds lock")
            .insert(bucket.to_string(), rx);
        tx
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError> {
        Ok(self
            .buckets
            .lock()
            .expect("buckets lock")
            .contains_key(bucket))
    }

    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StoreError> {
        let buckets = self.buckets.lock().expect("buckets lock");
        let objects = buckets.get(bucket).ok_or(StoreError::NoSuchBucket)?;
        let object = objects.get(key).ok_or(StoreError::NoSuchKey)?;
        Ok(ObjectInfo {
            key: key.to_string(),
            content_type: object.content_type.clone(),
            user_metadata: object.user_metadata.clone(),
            etag: object.etag.clone(),
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ByteStream, StoreError> {
        let body = {
            let buckets = self.buckets.lock().expect("buckets lock");
            let objects = buckets.get(bucket).ok_or(StoreError::NoSuchBucket)?;
            objects.get(key).ok_or(StoreError::NoSuchKey)?.body.clone()
        };
        // Two chunks so hashing exercises the streaming path.
        let middle = body.len() / 2;
        let chunks = vec![
            Ok(Bytes::copy_from_slice(&body[..middle])),
            Ok(Bytes::copy_from_slice(&body[middle..])),
        ];
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        meta: &MergedMetadata,
    ) -> Result<String, StoreError> {
        if let Some(message) = self.fail_copy.lock().expect("fail lock").take() {
            return Err(StoreError::Unexpected(message));
        }
        let mut buckets = self.buckets.lock().expect("buckets lock");
        let source = buckets
            .get(src_bucket)
            .ok_or(StoreError::NoSuchBucket)?
            .get(src_key)
            .ok_or(StoreError::NoSuchKey)?
            .clone();

        let mut user_metadata = meta.user_metadata.clone();
        let content_type = user_metadata
            .remove("content-type")
            .unwrap_or_else(|| source.content_type.clone());
        let content_disposition = user_metadata.remove("content-disposition").unwrap_or_default();
        let etag = source.etag.clone();
        let copied = StoredObject {
            body: source.body,
            content_type,
            content_disposition,
            user_metadata,
            etag: etag.clone(),
        };
        buckets
            .get_mut(dst_bucket)
            .ok_or(StoreError::NoSuchBucket)?
            .insert(dst_key.to_string(), copied);
        Ok(etag)
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let mut buckets = self.buckets.lock().expect("buckets lock");
        buckets
            .get_mut(bucket)
            .ok_or(StoreError::NoSuchBucket)?
            .remove(key);
        Ok(())
    }

    async fn list_objects(&self, bucket: &str) -> Result<Vec<String>, StoreError> {
        let buckets = self.buckets.lock().expect("buckets lock");
        Ok(buckets
            .get(bucket)
            .ok_or(StoreError::NoSuchBucket)?
            .keys()
            .cloned()
            .collect())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError> {
        let mut buckets = self.buckets.lock().expect("buckets lock");
        let etag = format!("{:x}", md5::compute(&body));
        buckets
            .get_mut(bucket)
            .ok_or(StoreError::NoSuchBucket)?
            .insert(
                key.to_string(),
                StoredObject {
                    body: body.to_vec(),
                    content_type: content_type.to_string(),
                    content_disposition: String::new(),
                    user_metadata: BTreeMap::new(),
                    etag,
                },
            );
        Ok(())
    }

    async fn watch_bucket(
        &self,
        bucket: &str,
        _shutdown: CancellationToken,
    ) -> Result<mpsc::Receiver<NotificationBatch>, StoreError> {
        self.feeds
            .lock()
            .expect("feeds lock")
            .remove(bucket)
            .ok_or_else(|| {
                StoreError::Unexpected(format!("no notification feed registered for {bucket}"))
            })
    }
}

/// A one-record batch shaped like the store's object-created events.
pub fn put_batch(bucket: &str, key: &str, sequencer: &str) -> NotificationBatch {
    use crate::events::{BucketRecord, NotificationRecord, ObjectRecord, S3Entity};
    NotificationBatch {
        records: vec![NotificationRecord {
            event_name: "s3:ObjectCreated:Put".to_string(),
            s3: S3Entity {
                bucket: BucketRecord {
                    name: bucket.to_string(),
                },
                object: ObjectRecord {
                    key: key.to_string(),
                    size: None,
                    etag: None,
                    sequencer: sequencer.to_string(),
                },
            },
        }],
        err: None,
    }
}
