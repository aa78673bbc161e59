use crate::index::{TransferIndex, TransferRecord};
use crate::metadata;
use crate::obs::Metrics;
use crate::storage::{BlobStore, StoreError};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// How a single transfer failed. Abort skips the object and keeps the loop
/// alive; Fatal means a consistency-threatening condition the supervisor
/// must see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    Abort(String),
    Fatal(String),
}

/// Lower-cased filename extension of a key, including the dot, with `.jpeg`
/// folded into `.jpg`. Empty when the final path element has no dot.
pub fn to_extension(key: &str) -> String {
    let name = key.rsplit('/').next().unwrap_or(key);
    let ext = match name.rfind('.') {
        Some(idx) => name[idx..].to_lowercase(),
        None => String::new(),
    };
    if ext == ".jpeg" {
        return ".jpg".to_string();
    }
    ext
}

/// Archive key for a body digest: `hh/hh/<64-hex><ext>`.
pub fn archive_key(sha256_hex: &str, ext: &str) -> String {
    format!(
        "{}/{}/{}{}",
        &sha256_hex[0..2],
        &sha256_hex[2..4],
        sha256_hex,
        ext
    )
}

/// Runs the dedup procedure for one uploaded object: stat, stream-hash,
/// stat destination, merge metadata, copy, confirm, delete. Synchronous
/// within one invocation; the caller acks afterwards.
pub struct Transferrer {
    store: Arc<dyn BlobStore>,
    inbox: String,
    archive: String,
    metrics: Arc<Metrics>,
}

impl Transferrer {
    pub fn new(store: Arc<dyn BlobStore>, inbox: &str, archive: &str, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            inbox: inbox.to_string(),
            archive: archive.to_string(),
            metrics,
        }
    }

    pub async fn transfer(
        &self,
        key: &str,
        ext: &str,
        index: Option<&mut TransferIndex>,
    ) -> Result<(), TransferError> {
        // The record came from a source of truth; a missing source is an
        // ordering or purge bug that must not be masked.
        let uploaded = self
            .store
            .stat_object(&self.inbox, key)
            .await
            .map_err(|err| {
                TransferError::Fatal(format!(
                    "failed to stat source object {key} in {}: {err}",
                    self.inbox
                ))
            })?;

        let sha256_hex = self.hash_object(key).await?;
        tracing::debug!(hex = %sha256_hex, "sha256");
        let blob_name = archive_key(&sha256_hex, ext);
        tracing::info!(key = %key, write = %format!("{}/{}", self.archive, blob_name), "transferring");

        let existing = match self.store.stat_object(&self.archive, &blob_name).await {
            Ok(info) => {
                tracing::info!(key = %blob_name, meta = ?info.user_metadata, "destination path already exists");
                self.metrics.duplicates.inc();
                Some(info)
            }
            Err(StoreError::NoSuchKey) => {
                tracing::debug!(key = %blob_name, "destination path is new");
                None
            }
            Err(err) => {
                return Err(TransferError::Fatal(format!(
                    "failed to stat destination path {blob_name} in {}: {err}",
                    self.archive
                )))
            }
        };

        let meta = metadata::new_metadata(&uploaded, existing.as_ref());
        // Guards against a merger misconfiguration; downloads depend on it.
        if meta
            .user_metadata
            .get("content-disposition")
            .map(String::is_empty)
            .unwrap_or(true)
        {
            return Err(TransferError::Fatal(
                "expected a content-disposition header".to_string(),
            ));
        }

        let etag = match self
            .store
            .copy_object(&self.inbox, key, &self.archive, &blob_name, &meta)
            .await
        {
            Ok(etag) => etag,
            Err(err) => {
                tracing::error!(key = %key, archive = %self.archive, error = %err, "failed to transfer");
                return Err(TransferError::Abort(format!("copy failed for {key}: {err}")));
            }
        };
        tracing::debug!(bucket = %self.archive, key = %blob_name, etag = %etag, "copied");

        // Copy gives little feedback, so confirm the destination before
        // touching the inbox.
        self.store
            .stat_object(&self.archive, &blob_name)
            .await
            .map_err(|err| {
                TransferError::Fatal(format!(
                    "destination blob {blob_name} not found after copy: {err}"
                ))
            })?;

        tracing::debug!(key = %key, bucket = %self.inbox, "destination existence confirmed, deleting inbox item");
        self.store
            .remove_object(&self.inbox, key)
            .await
            .map_err(|err| {
                TransferError::Fatal(format!(
                    "failed to clean up after blob copy, inbox item {key} probably still exists: {err}"
                ))
            })?;

        if let Some(index) = index {
            let replaced = existing.is_some();
            index.append(TransferRecord {
                format_version: 1,
                upload: key.to_string(),
                key: blob_name.clone(),
                replaced,
                metareplaced: replaced && meta.replace_metadata,
                etag,
                meta: meta.user_metadata.clone(),
            });
        }

        self.metrics.transfers_completed.inc();
        Ok(())
    }

    async fn hash_object(&self, key: &str) -> Result<String, TransferError> {
        let mut stream = self
            .store
            .get_object(&self.inbox, key)
            .await
            .map_err(|err| {
                TransferError::Fatal(format!(
                    "failed to read source object {key} in {}: {err}",
                    self.inbox
                ))
            })?;
        let mut hasher = Sha256::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| {
                TransferError::Fatal(format!(
                    "failed to read source object {key} to checksum: {err}"
                ))
            })?;
            hasher.update(&chunk);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::{archive_key, to_extension, TransferError, Transferrer};
    use crate::index::TransferIndex;
    use crate::obs::Metrics;
    use crate::test_support::MemoryStore;
    use std::sync::Arc;

    const HI_SHA256: &str = "8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4";

    #[test]
    fn to_extension_lowercases_and_folds_jpeg() {
        assert_eq!(to_extension("photos/a.JPEG"), ".jpg");
        assert_eq!(to_extension("photos/a.Jpeg"), ".jpg");
        assert_eq!(to_extension("photos/a.jpeg"), ".jpg");
        assert_eq!(to_extension("a.PNG"), ".png");
        assert_eq!(to_extension("archive.tar.gz"), ".gz");
        assert_eq!(to_extension("noext"), "");
        assert_eq!(to_extension("dir.d/noext"), "");
        assert_eq!(to_extension(".profile"), ".profile");
    }

    #[test]
    fn archive_key_shards_by_leading_hex() {
        assert_eq!(
            archive_key(HI_SHA256, ".jpg"),
            format!("8f/43/{HI_SHA256}.jpg")
        );
        assert_eq!(archive_key(HI_SHA256, ""), format!("8f/43/{HI_SHA256}"));
    }

    fn transferrer(store: &Arc<MemoryStore>, metrics: &Arc<Metrics>) -> Transferrer {
        let blob_store: Arc<dyn crate::storage::BlobStore> = store.clone();
        Transferrer::new(blob_store, "inbox", "archive", metrics.clone())
    }

    #[tokio::test]
    async fn transfer_moves_new_object_into_archive() {
        let store = MemoryStore::with_buckets(&["inbox", "archive"]);
        store.put("inbox", "photos/a.JPEG", b"hi", "image/jpeg");
        let metrics = Metrics::new();
        let subject = transferrer(&store, &metrics);

        subject
            .transfer("photos/a.JPEG", ".jpg", None)
            .await
            .expect("transfer");

        let blob = store
            .object("archive", &format!("8f/43/{HI_SHA256}.jpg"))
            .expect("archived object");
        assert_eq!(blob.content_type, "image/jpeg");
        assert_eq!(blob.content_disposition, "attachment; filename=\"a.JPEG\"");
        assert_eq!(
            blob.user_metadata.get("Uploadpaths").map(String::as_str),
            Some("photos/a.JPEG")
        );
        assert_eq!(
            blob.user_metadata.get("Uploaddir").map(String::as_str),
            Some("photos/")
        );
        assert!(store.object("inbox", "photos/a.JPEG").is_none());
        assert_eq!(metrics.transfers_completed.get(), 1);
        assert_eq!(metrics.duplicates.get(), 0);
    }

    #[tokio::test]
    async fn transfer_merges_metadata_for_duplicate_bodies() {
        let store = MemoryStore::with_buckets(&["inbox", "archive"]);
        store.put("inbox", "photos/a.JPEG", b"hi", "image/jpeg");
        let metrics = Metrics::new();
        let subject = transferrer(&store, &metrics);
        subject
            .transfer("photos/a.JPEG", ".jpg", None)
            .await
            .expect("first transfer");

        store.put("inbox", "reup/a.jpg", b"hi", "image/jpeg");
        subject
            .transfer("reup/a.jpg", ".jpg", None)
            .await
            .expect("second transfer");

        let blob = store
            .object("archive", &format!("8f/43/{HI_SHA256}.jpg"))
            .expect("archived object");
        assert_eq!(
            blob.user_metadata.get("Uploadpaths").map(String::as_str),
            Some("photos/a.JPEG; reup/a.jpg")
        );
        assert_eq!(
            blob.user_metadata.get("Uploaddir").map(String::as_str),
            Some("photos/; reup/")
        );
        assert_eq!(metrics.duplicates.get(), 1);
        assert_eq!(metrics.transfers_completed.get(), 2);
    }

    #[tokio::test]
    async fn transfer_keeps_provenance_duplicate_free() {
        let store = MemoryStore::with_buckets(&["inbox", "archive"]);
        store.put("inbox", "p/x", b"hi", "text/plain");
        let metrics = Metrics::new();
        let subject = transferrer(&store, &metrics);
        subject.transfer("p/x", "", None).await.expect("first");

        store.put("inbox", "p/x", b"hi", "text/plain");
        subject.transfer("p/x", "", None).await.expect("second");

        let blob = store
            .object("archive", &format!("8f/43/{HI_SHA256}"))
            .expect("archived object");
        assert_eq!(
            blob.user_metadata.get("Uploadpaths").map(String::as_str),
            Some("p/x")
        );
    }

    #[tokio::test]
    async fn transfer_appends_index_records() {
        let store = MemoryStore::with_buckets(&["inbox", "archive"]);
        store.put("inbox", "a.txt", b"hi", "text/plain");
        let metrics = Metrics::new();
        let subject = transferrer(&store, &metrics);
        let mut index = TransferIndex::new();

        subject
            .transfer("a.txt", ".txt", Some(&mut index))
            .await
            .expect("transfer");

        assert_eq!(index.size(), 1);
        let (body, _) = index
            .serialize("application/jsonlines")
            .expect("serialize");
        let line: serde_json::Value =
            serde_json::from_slice(body.trim_ascii_end()).expect("json line");
        assert_eq!(line["upload"], "a.txt");
        assert_eq!(line["key"], format!("8f/43/{HI_SHA256}.txt"));
        assert_eq!(line["replaced"], false);
        assert_eq!(line["metareplaced"], false);
    }

    #[tokio::test]
    async fn missing_source_is_fatal() {
        let store = MemoryStore::with_buckets(&["inbox", "archive"]);
        let metrics = Metrics::new();
        let subject = transferrer(&store, &metrics);
        let err = subject.transfer("ghost.txt", ".txt", None).await.unwrap_err();
        assert!(matches!(err, TransferError::Fatal(_)));
    }

    #[tokio::test]
    async fn copy_failure_aborts_without_touching_inbox() {
        let store = MemoryStore::with_buckets(&["inbox", "archive"]);
        store.put("inbox", "a.txt", b"hi", "text/plain");
        store.fail_next_copy("simulated copy outage");
        let metrics = Metrics::new();
        let subject = transferrer(&store, &metrics);

        let err = subject.transfer("a.txt", ".txt", None).await.unwrap_err();
        assert!(matches!(err, TransferError::Abort(_)));
        assert!(store.object("inbox", "a.txt").is_some());
        assert_eq!(metrics.transfers_completed.get(), 0);
    }
}
