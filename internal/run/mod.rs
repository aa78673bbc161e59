use crate::events::{InboxWatcher, StandaloneWatcher, TransferResult, WatchError};
use crate::index::{TransferIndex, INDEX_CONTENT_TYPE, INDEX_WRITE_DIR};
use crate::kafka::BrokerWatcher;
use crate::obs::{Metrics, TRIGGER_LISTING, TRIGGER_NOTIFICATION};
use crate::storage::BlobStore;
use crate::transfer::{to_extension, TransferError, Transferrer};
use crate::util::config::Config;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const BUCKET_CHECK_INITIAL: Duration = Duration::from_millis(250);
const BUCKET_CHECK_RETRIES: u32 = 10;

/// How a watcher session ended when it did not end in an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Batch work finished; the process should exit cleanly.
    Completed,
    /// The notification stream closed because shutdown was requested.
    Shutdown,
}

/// Session-level failure. Recoverable sessions are rebuilt after the
/// configured restart delay; Fatal propagates to `main`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    Recoverable(String),
    Fatal(String),
}

/// Run one watcher session: verify buckets, drain the inbox listing, then
/// consume notifications until the stream ends (long-running modes) or the
/// drain completes (batch mode).
pub async fn run_session(
    config: &Config,
    store: Arc<dyn BlobStore>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) -> Result<SessionOutcome, RunError> {
    let watcher = if config.batch {
        tracing::info!("batch mode enabled, no listener will be created");
        wait_for_buckets(&store, config).await?;
        None
    } else if let Some(broker_config) = config.broker.clone() {
        tracing::info!("starting broker bucket notifications listener");
        let watcher = BrokerWatcher::connect(broker_config, metrics.clone(), shutdown.child_token())
            .map_err(RunError::Fatal)?;
        wait_for_buckets(&store, config).await?;
        Some(InboxWatcher::Broker(watcher))
    } else {
        wait_for_buckets(&store, config).await?;
        tracing::info!("starting standalone bucket notifications listener");
        let uploads = store
            .watch_bucket(&config.inbox, shutdown.clone())
            .await
            .map_err(|err| RunError::Fatal(format!("notification subscribe failed: {err}")))?;
        Some(InboxWatcher::Standalone(StandaloneWatcher::new(uploads)))
    };

    run_with_watcher(config, store, metrics, shutdown, watcher).await
}

/// The drain + notification loop, with the watcher already built. Split out
/// so tests can drive broker batches without a live broker.
pub(crate) async fn run_with_watcher(
    config: &Config,
    store: Arc<dyn BlobStore>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
    watcher: Option<InboxWatcher>,
) -> Result<SessionOutcome, RunError> {
    let broker_mode = matches!(watcher, Some(InboxWatcher::Broker(_)));
    let transferrer = Transferrer::new(store.clone(), &config.inbox, &config.archive, metrics.clone());
    let mut index = config.batch.then(TransferIndex::new);

    tracing::info!("listing existing inbox objects");
    let existing = store
        .list_objects(&config.inbox)
        .await
        .map_err(|err| RunError::Recoverable(format!("list object error: {err}")))?;
    for key in existing {
        if broker_mode {
            // The consumer group's committed offsets are authoritative for
            // anything uploaded before this session.
            tracing::warn!(key = %key, "existing ignored; consumer offsets should track prior uploads");
            continue;
        }
        tracing::info!(key = %key, "existing inbox object to be transferred");
        metrics
            .transfers_initiated
            .with_label_values(&[TRIGGER_LISTING])
            .inc();
        match transferrer
            .transfer(&key, &to_extension(&key), index.as_mut())
            .await
        {
            Ok(()) | Err(TransferError::Abort(_)) => {}
            Err(TransferError::Fatal(msg)) => return Err(RunError::Fatal(msg)),
        }
    }

    if config.batch {
        if config.index_write {
            if let Some(index) = &index {
                if index.size() > 0 {
                    write_index(&store, config, index).await?;
                }
            }
        }
        return Ok(SessionOutcome::Completed);
    }

    let mut watcher = match watcher {
        Some(watcher) => watcher,
        None => return Err(RunError::Fatal("no watcher constructed".to_string())),
    };

    while let Some(batch) = watcher.recv().await {
        if let Some(err) = &batch.err {
            match err {
                WatchError::Recoverable(msg) => {
                    tracing::info!(error = %msg, "notification abort, which we think is a timeout");
                    return Err(RunError::Recoverable(msg.clone()));
                }
                WatchError::Fatal(msg) => {
                    return Err(RunError::Fatal(format!("notification error: {msg}")))
                }
            }
        }

        let mut all_ok = true;
        for record in &batch.records {
            let mut key = record.s3.object.key.clone();
            if watcher.url_decodes_keys() {
                key = urldecode_key(&key)
                    .map_err(|err| RunError::Fatal(format!("url decoding failed for {key}: {err}")))?;
            }
            let bucket_name = &record.s3.bucket.name;
            tracing::info!(bucket = %bucket_name, key = %key, "notification record");
            if bucket_name != &config.inbox {
                tracing::error!(
                    name = %bucket_name,
                    expected = %config.inbox,
                    "unexpected notification bucket, ignoring"
                );
                metrics.ignored_unexpected_bucket.inc();
                continue;
            }
            metrics
                .transfers_initiated
                .with_label_values(&[TRIGGER_NOTIFICATION])
                .inc();
            match transferrer.transfer(&key, &to_extension(&key), None).await {
                Ok(()) => {}
                Err(TransferError::Abort(_)) => all_ok = false,
                Err(TransferError::Fatal(msg)) => return Err(RunError::Fatal(msg)),
            }
        }

        if batch.records.is_empty() {
            continue;
        }
        if all_ok {
            // Transfers are synchronous and their errors stop the loop, so
            // the batch can be acked here.
            watcher
                .ack(TransferResult::Ok, &batch)
                .map_err(RunError::Fatal)?;
        } else if let InboxWatcher::Standalone(standalone) = &watcher {
            standalone.ack(TransferResult::Failed);
        }
        // In broker mode a failed batch stays pending; the uncommitted
        // offset redelivers it after restart.
    }

    if shutdown.is_cancelled() {
        tracing::info!("notification stream closed on shutdown");
        return Ok(SessionOutcome::Shutdown);
    }
    Err(RunError::Fatal(
        "listener exited without an error, or we failed to handle an error".to_string(),
    ))
}

async fn write_index(
    store: &Arc<dyn BlobStore>,
    config: &Config,
    index: &TransferIndex,
) -> Result<(), RunError> {
    let key = format!(
        "{}/{}.jsonlines",
        INDEX_WRITE_DIR,
        Utc::now().format("%Y-%m-%dt%H%M%S")
    );
    let (body, size) = index
        .serialize(INDEX_CONTENT_TYPE)
        .map_err(|err| RunError::Fatal(format!("failed to get index serializer: {err}")))?;
    store
        .put_object(&config.archive, &key, body, INDEX_CONTENT_TYPE)
        .await
        .map_err(|err| RunError::Fatal(format!("failed to write index {key}: {err}")))?;
    tracing::info!(key = %key, size, "wrote index");
    Ok(())
}

async fn wait_for_buckets(store: &Arc<dyn BlobStore>, config: &Config) -> Result<(), RunError> {
    for name in [&config.inbox, &config.archive] {
        assert_bucket_exists(store, name, BUCKET_CHECK_INITIAL, BUCKET_CHECK_RETRIES)
            .await
            .map_err(RunError::Fatal)?;
    }
    tracing::info!(inbox = %config.inbox, archive = %config.archive, "bucket existence confirmed");
    Ok(())
}

/// Existence check with exponential backoff; exhaustion is fatal because
/// nothing downstream can work without both buckets.
async fn assert_bucket_exists(
    store: &Arc<dyn BlobStore>,
    name: &str,
    initial: Duration,
    retries: u32,
) -> Result<(), String> {
    let mut delay = initial;
    for attempt in 0..=retries {
        let failure = match store.bucket_exists(name).await {
            Ok(true) => return Ok(()),
            Ok(false) => format!("non-existent bucket: {name}"),
            Err(err) => err.to_string(),
        };
        if attempt == retries {
            break;
        }
        tracing::warn!(name = %name, attempt, error = %failure, "bucket existence check failed");
        sleep(delay).await;
        delay *= 2;
    }
    Err(format!("failed to verify bucket existence: {name}"))
}

/// Broker payloads arrive query-escaped (`/` as `%2F`, space as `+`).
fn urldecode_key(key: &str) -> Result<String, String> {
    let plus_decoded = key.replace('+', " ");
    percent_encoding::percent_decode_str(&plus_decoded)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::{
        assert_bucket_exists, run_session, run_with_watcher, urldecode_key, RunError,
        SessionOutcome,
    };
    use crate::events::{InboxWatcher, NotificationBatch, WatchError};
    use crate::kafka::{AckPending, AckTracker, BrokerWatcher};
    use crate::obs::Metrics;
    use crate::storage::BlobStore;
    use crate::test_support::{put_batch, MemoryStore};
    use crate::util::config::Config;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    const HI_SHA256: &str = "8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4";

    fn config(batch: bool, index_write: bool) -> Config {
        Config {
            inbox: "inbox".to_string(),
            archive: "archive".to_string(),
            host: "localhost:9000".to_string(),
            secure: false,
            access_key: "minio".to_string(),
            secret_key: "minio123".to_string(),
            metrics_listen: ":2112".to_string(),
            trace: false,
            batch,
            batchmetrics: false,
            restart_delay: Duration::from_secs(1),
            index_write,
            broker: None,
        }
    }

    fn as_blob_store(store: &Arc<MemoryStore>) -> Arc<dyn BlobStore> {
        store.clone()
    }

    #[test]
    fn urldecode_key_unescapes_query_style() {
        assert_eq!(
            urldecode_key("photos%2Fa.JPEG").expect("decode"),
            "photos/a.JPEG"
        );
        assert_eq!(urldecode_key("a+b.txt").expect("decode"), "a b.txt");
        assert_eq!(urldecode_key("plain.txt").expect("decode"), "plain.txt");
    }

    #[tokio::test]
    async fn batch_mode_drains_inbox_and_completes() {
        let store = MemoryStore::with_buckets(&["inbox", "archive"]);
        store.put("inbox", "photos/a.JPEG", b"hi", "image/jpeg");
        store.put("inbox", "docs/b.txt", b"other", "text/plain");
        let metrics = Metrics::new();

        let outcome = run_session(
            &config(true, false),
            as_blob_store(&store),
            metrics.clone(),
            CancellationToken::new(),
        )
        .await
        .expect("session");

        assert_eq!(outcome, SessionOutcome::Completed);
        assert!(store.keys("inbox").is_empty());
        assert_eq!(store.keys("archive").len(), 2);
        assert!(store
            .object("archive", &format!("8f/43/{HI_SHA256}.jpg"))
            .is_some());
        assert_eq!(
            metrics
                .transfers_initiated
                .with_label_values(&["listing"])
                .get(),
            2
        );
        assert_eq!(metrics.transfers_completed.get(), 2);
    }

    #[tokio::test]
    async fn batch_mode_writes_index_artifact() {
        let store = MemoryStore::with_buckets(&["inbox", "archive"]);
        store.put("inbox", "a.txt", b"hi", "text/plain");
        store.put("inbox", "b.txt", b"yo", "text/plain");
        let metrics = Metrics::new();

        run_session(
            &config(true, true),
            as_blob_store(&store),
            metrics,
            CancellationToken::new(),
        )
        .await
        .expect("session");

        let index_keys: Vec<String> = store
            .keys("archive")
            .into_iter()
            .filter(|key| key.starts_with("deduplication-index/"))
            .collect();
        assert_eq!(index_keys.len(), 1);
        assert!(index_keys[0].ends_with(".jsonlines"));
        let index = store.object("archive", &index_keys[0]).expect("index body");
        assert_eq!(index.content_type, "application/jsonlines");
        let text = String::from_utf8(index.body).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: serde_json::Value = serde_json::from_str(line).expect("json line");
            assert_eq!(parsed["v"], 1);
            assert!(parsed["upload"].is_string());
            assert!(parsed["key"].is_string());
            assert!(parsed["meta"].is_object());
        }
    }

    #[tokio::test]
    async fn batch_mode_without_transfers_writes_no_index() {
        let store = MemoryStore::with_buckets(&["inbox", "archive"]);
        let metrics = Metrics::new();
        run_session(
            &config(true, true),
            as_blob_store(&store),
            metrics,
            CancellationToken::new(),
        )
        .await
        .expect("session");
        assert!(store.keys("archive").is_empty());
    }

    #[tokio::test]
    async fn standalone_mode_transfers_notified_objects() {
        let store = MemoryStore::with_buckets(&["inbox", "archive"]);
        let feed = store.watch_feed("inbox");
        let shutdown = CancellationToken::new();
        let metrics = Metrics::new();

        let session = tokio::spawn({
            let config = config(false, false);
            let store = as_blob_store(&store);
            let metrics = metrics.clone();
            let shutdown = shutdown.clone();
            async move { run_session(&config, store, metrics, shutdown).await }
        });

        // Let the startup listing see an empty inbox, then upload.
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.put("inbox", "photos/a.JPEG", b"hi", "image/jpeg");
        feed.send(put_batch("inbox", "photos/a.JPEG", "seq-1"))
            .await
            .expect("send");
        shutdown.cancel();
        drop(feed);

        let outcome = session.await.expect("join").expect("session");
        assert_eq!(outcome, SessionOutcome::Shutdown);
        let blob = store
            .object("archive", &format!("8f/43/{HI_SHA256}.jpg"))
            .expect("archived");
        assert_eq!(blob.content_disposition, "attachment; filename=\"a.JPEG\"");
        assert!(store.object("inbox", "photos/a.JPEG").is_none());
        assert_eq!(
            metrics
                .transfers_initiated
                .with_label_values(&["notification"])
                .get(),
            1
        );
        assert_eq!(metrics.transfers_completed.get(), 1);
        assert_eq!(metrics.duplicates.get(), 0);
    }

    #[tokio::test]
    async fn unexpected_bucket_records_are_ignored() {
        let store = MemoryStore::with_buckets(&["inbox", "archive"]);
        let feed = store.watch_feed("inbox");
        let shutdown = CancellationToken::new();
        let metrics = Metrics::new();

        feed.send(put_batch("other", "a.txt", "seq-1"))
            .await
            .expect("send");
        shutdown.cancel();
        drop(feed);

        run_session(
            &config(false, false),
            as_blob_store(&store),
            metrics.clone(),
            shutdown,
        )
        .await
        .expect("session");

        assert_eq!(metrics.ignored_unexpected_bucket.get(), 1);
        assert_eq!(metrics.transfers_completed.get(), 0);
        assert!(store.keys("archive").is_empty());
    }

    #[tokio::test]
    async fn recoverable_stream_error_ends_session_recoverably() {
        let store = MemoryStore::with_buckets(&["inbox", "archive"]);
        let feed = store.watch_feed("inbox");
        let metrics = Metrics::new();

        feed.send(NotificationBatch::from_error(WatchError::Recoverable(
            "unexpected end of JSON input".to_string(),
        )))
        .await
        .expect("send");

        let err = run_session(
            &config(false, false),
            as_blob_store(&store),
            metrics,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RunError::Recoverable(_)));
    }

    #[tokio::test]
    async fn fatal_stream_error_ends_session_fatally() {
        let store = MemoryStore::with_buckets(&["inbox", "archive"]);
        let feed = store.watch_feed("inbox");
        let metrics = Metrics::new();

        feed.send(NotificationBatch::from_error(WatchError::Fatal(
            "unrecognized".to_string(),
        )))
        .await
        .expect("send");

        let err = run_session(
            &config(false, false),
            as_blob_store(&store),
            metrics,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RunError::Fatal(_)));
    }

    #[tokio::test]
    async fn clean_stream_end_without_shutdown_is_fatal() {
        let store = MemoryStore::with_buckets(&["inbox", "archive"]);
        let feed = store.watch_feed("inbox");
        let metrics = Metrics::new();
        drop(feed);

        let err = run_session(
            &config(false, false),
            as_blob_store(&store),
            metrics,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RunError::Fatal(_)));
    }

    #[tokio::test]
    async fn missing_bucket_fails_the_session() {
        let store = MemoryStore::with_buckets(&["inbox"]);
        let err = assert_bucket_exists(
            &as_blob_store(&store),
            "archive",
            Duration::from_millis(1),
            2,
        )
        .await
        .unwrap_err();
        assert!(err.contains("failed to verify bucket existence"));
    }

    #[tokio::test]
    async fn broker_mode_skips_listing_and_commits_on_ack() {
        let store = MemoryStore::with_buckets(&["inbox", "archive"]);
        store.put("inbox", "leftover.txt", b"old", "text/plain");
        store.put("inbox", "photos/a.JPEG", b"hi", "image/jpeg");
        let metrics = Metrics::new();
        let shutdown = CancellationToken::new();

        let tracker = Arc::new(AckTracker::new(metrics.acks_pending.clone()));
        let committed = Arc::new(Mutex::new(Vec::new()));
        let recorder = committed.clone();
        tracker.set_commit(Box::new(move |entry: &AckPending| {
            recorder.lock().expect("lock").push(entry.clone());
            Ok(())
        }));
        tracker
            .expect(AckPending {
                sequencer: "seq-1".to_string(),
                topic: "uploads".to_string(),
                partition: 0,
                offset: 42,
            })
            .expect("expect");

        let (tx, rx) = mpsc::channel(1);
        // Keys arrive query-escaped from the broker payload.
        tx.send(put_batch("inbox", "photos%2Fa.JPEG", "seq-1"))
            .await
            .expect("send");
        shutdown.cancel();
        drop(tx);
        let watcher = InboxWatcher::Broker(BrokerWatcher::from_parts(rx, tracker.clone()));

        let outcome = run_with_watcher(
            &config(false, false),
            as_blob_store(&store),
            metrics.clone(),
            shutdown,
            Some(watcher),
        )
        .await
        .expect("session");

        assert_eq!(outcome, SessionOutcome::Shutdown);
        // Startup listing is logged, never transferred, in broker mode.
        assert!(store.object("inbox", "leftover.txt").is_some());
        assert!(store
            .object("archive", &format!("8f/43/{HI_SHA256}.jpg"))
            .is_some());
        let committed = committed.lock().expect("lock");
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].offset, 42);
        assert_eq!(tracker.pending_size(), 0);
    }

    #[tokio::test]
    async fn broker_mode_leaves_failed_batches_pending() {
        let store = MemoryStore::with_buckets(&["inbox", "archive"]);
        store.put("inbox", "a.txt", b"hi", "text/plain");
        store.fail_next_copy("simulated copy outage");
        let metrics = Metrics::new();
        let shutdown = CancellationToken::new();

        let tracker = Arc::new(AckTracker::new(metrics.acks_pending.clone()));
        let committed = Arc::new(Mutex::new(Vec::new()));
        let recorder = committed.clone();
        tracker.set_commit(Box::new(move |entry: &AckPending| {
            recorder.lock().expect("lock").push(entry.clone());
            Ok(())
        }));
        tracker
            .expect(AckPending {
                sequencer: "seq-1".to_string(),
                topic: "uploads".to_string(),
                partition: 0,
                offset: 7,
            })
            .expect("expect");

        let (tx, rx) = mpsc::channel(1);
        tx.send(put_batch("inbox", "a.txt", "seq-1"))
            .await
            .expect("send");
        shutdown.cancel();
        drop(tx);
        let watcher = InboxWatcher::Broker(BrokerWatcher::from_parts(rx, tracker.clone()));

        let outcome = run_with_watcher(
            &config(false, false),
            as_blob_store(&store),
            metrics,
            shutdown,
            Some(watcher),
        )
        .await
        .expect("session");

        assert_eq!(outcome, SessionOutcome::Shutdown);
        assert!(committed.lock().expect("lock").is_empty());
        assert_eq!(tracker.pending_size(), 1);
        assert!(store.object("inbox", "a.txt").is_some());
    }
}
