use crate::events::{NotificationBatch, NotificationEvent, TransferResult, WatchError};
use crate::obs::Metrics;
use prometheus::IntGauge;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bootstrap: Vec<String>,
    pub topics: Vec<String>,
    pub consumer_group: String,
    pub fetch_max_wait: Duration,
    /// Records whose key does not start with this prefix are dropped.
    pub key_prefix: Option<String>,
}

/// A notification emitted downstream but not yet acked, pinned to the broker
/// record that delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPending {
    /// Domain-unique correlation id from the store's notification record.
    pub sequencer: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

pub type CommitFn = Box<dyn Fn(&AckPending) -> Result<(), String> + Send + Sync>;

/// Correlates in-flight notifications with broker records and commits offsets
/// when a transfer succeeds. Commits are serialized through the caller; the
/// broker client tracks the max committed offset per partition, so acks that
/// arrive out of delivery order are safe.
pub struct AckTracker {
    pending: Mutex<Vec<AckPending>>,
    commit: Mutex<Option<CommitFn>>,
    acks_pending: IntGauge,
}

impl AckTracker {
    pub fn new(acks_pending: IntGauge) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            commit: Mutex::new(None),
            acks_pending,
        }
    }

    /// The commit function is wired after the broker client exists; acking
    /// before that is an invariant violation.
    pub fn set_commit(&self, commit: CommitFn) {
        *self.commit.lock().expect("commit lock") = Some(commit);
    }

    pub fn expect(&self, entry: AckPending) -> Result<(), String> {
        if entry.sequencer.is_empty() {
            return Err("refusing to record pending ack without a sequencer".to_string());
        }
        self.pending.lock().expect("pending lock").push(entry);
        self.acks_pending.inc();
        tracing::debug!("recorded pending ack");
        Ok(())
    }

    /// Remove the pending entry matching the batch and commit its offset.
    /// Every error here threatens at-least-once semantics and is fatal to
    /// the caller.
    pub fn ack(&self, result: TransferResult, batch: &NotificationBatch) -> Result<(), String> {
        let sequencer = batch_sequencer(batch)?;
        let entry = self.remove(&sequencer)?;
        if result != TransferResult::Ok {
            return Err(format!(
                "ack for failed transfers not implemented (sequencer {sequencer})"
            ));
        }
        let commit = self.commit.lock().expect("commit lock");
        let commit = commit
            .as_ref()
            .ok_or_else(|| "ack called prior to broker client initialization".to_string())?;
        commit(&entry).map_err(|err| {
            format!(
                "offset commit failed for {}[{}]@{}: {err}",
                entry.topic, entry.partition, entry.offset
            )
        })?;
        tracing::info!(
            topic = %entry.topic,
            partition = entry.partition,
            offset = entry.offset,
            "committed offset"
        );
        self.acks_pending.dec();
        Ok(())
    }

    pub fn pending_size(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }

    fn remove(&self, sequencer: &str) -> Result<AckPending, String> {
        let mut pending = self.pending.lock().expect("pending lock");
        if pending.is_empty() {
            return Err("ack requested but there are no pending records".to_string());
        }
        let index = pending
            .iter()
            .position(|entry| entry.sequencer == sequencer)
            .ok_or_else(|| format!("failed to find unacked record for sequencer {sequencer}"))?;
        Ok(pending.remove(index))
    }
}

/// The store assigns exactly one record per broker-delivered notification;
/// anything else means the correlation id is unusable.
fn batch_sequencer(batch: &NotificationBatch) -> Result<String, String> {
    if batch.records.len() != 1 {
        return Err(format!(
            "unsupported record count for ack: {}",
            batch.records.len()
        ));
    }
    let sequencer = &batch.records[0].s3.object.sequencer;
    if sequencer.is_empty() {
        return Err("missing record uniqueness value".to_string());
    }
    Ok(sequencer.clone())
}

/// Key-prefix filter over raw record keys. Misses increment the filtered
/// counter labelled with the prefix.
pub fn filter_predicate(
    key_prefix: Option<String>,
    metrics: &Metrics,
) -> Box<dyn Fn(&[u8]) -> bool + Send> {
    match key_prefix {
        None => Box::new(|_| true),
        Some(prefix) => {
            let ignored = metrics.ignored_filtered.with_label_values(&[prefix.as_str()]);
            tracing::info!(prefix = %prefix, "record filter enabled on key");
            Box::new(move |key: &[u8]| {
                let hit = key.starts_with(prefix.as_bytes());
                if !hit {
                    ignored.inc();
                }
                hit
            })
        }
    }
}

/// Watcher backed by a broker consumer group. A background task polls,
/// decodes and filters records, registers pending acks, and feeds a bounded
/// channel; the channel is the back-pressure seam, so the consumer never
/// advances past what the orchestrator has absorbed.
pub struct BrokerWatcher {
    uploads: mpsc::Receiver<NotificationBatch>,
    tracker: Arc<AckTracker>,
}

impl BrokerWatcher {
    pub fn connect(
        config: BrokerConfig,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Result<Self, String> {
        let consumer: StreamConsumer = client_config(&config)
            .create()
            .map_err(|err| format!("broker client failure: {err}"))?;
        let topics = config
            .topics
            .iter()
            .map(String::as_str)
            .collect::<Vec<&str>>();
        consumer
            .subscribe(&topics)
            .map_err(|err| format!("broker subscribe failed: {err}"))?;
        let consumer = Arc::new(consumer);

        let tracker = Arc::new(AckTracker::new(metrics.acks_pending.clone()));
        let commit_consumer = consumer.clone();
        tracker.set_commit(Box::new(move |entry: &AckPending| {
            let mut offsets = TopicPartitionList::new();
            offsets
                .add_partition_offset(&entry.topic, entry.partition, Offset::Offset(entry.offset + 1))
                .map_err(|err| format!("offset list build failed: {err}"))?;
            commit_consumer
                .commit(&offsets, CommitMode::Sync)
                .map_err(|err| err.to_string())
        }));

        let filter = filter_predicate(config.key_prefix.clone(), &metrics);
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(poll_loop(consumer, filter, tracker.clone(), tx, shutdown));

        Ok(Self {
            uploads: rx,
            tracker,
        })
    }

    #[cfg(test)]
    pub fn from_parts(uploads: mpsc::Receiver<NotificationBatch>, tracker: Arc<AckTracker>) -> Self {
        Self { uploads, tracker }
    }

    pub async fn recv(&mut self) -> Option<NotificationBatch> {
        self.uploads.recv().await
    }

    pub fn ack(&self, result: TransferResult, batch: &NotificationBatch) -> Result<(), String> {
        self.tracker.ack(result, batch)
    }

    pub fn pending_size(&self) -> usize {
        self.tracker.pending_size()
    }
}

fn client_config(config: &BrokerConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap.join(","))
        .set("group.id", &config.consumer_group)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set(
            "fetch.wait.max.ms",
            config.fetch_max_wait.as_millis().to_string(),
        );
    client
}

async fn poll_loop(
    consumer: Arc<StreamConsumer>,
    filter: Box<dyn Fn(&[u8]) -> bool + Send>,
    tracker: Arc<AckTracker>,
    tx: mpsc::Sender<NotificationBatch>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = consumer.recv() => message,
        };
        // Copy what we need out of the borrowed message before any await.
        let (topic, partition, offset, payload) = match message {
            Ok(message) => {
                let topic = message.topic().to_string();
                let partition = message.partition();
                let offset = message.offset();
                if !filter(message.key().unwrap_or_default()) {
                    tracing::debug!(topic = %topic, partition, offset, "filtered out");
                    continue;
                }
                let payload = message.payload().unwrap_or_default().to_vec();
                (topic, partition, offset, payload)
            }
            Err(err) => {
                let fatal = WatchError::Fatal(format!("non-retryable consumer error: {err}"));
                let _ = tx.send(NotificationBatch::from_error(fatal)).await;
                break;
            }
        };

        let event: NotificationEvent = match serde_json::from_slice(&payload) {
            Ok(event) => event,
            Err(err) => {
                // No skip-and-count here: an undecodable record means an
                // admin must move the consumer group offset.
                let fatal = WatchError::Fatal(format!(
                    "failed to decode notification at {topic}[{partition}]@{offset}: {err}"
                ));
                let _ = tx.send(NotificationBatch::from_error(fatal)).await;
                break;
            }
        };
        if event.records.is_empty() {
            tracing::error!(topic = %topic, partition, offset, "got notification with zero records");
        }
        tracing::info!(topic = %topic, partition, offset, "got notification");

        let batch = NotificationBatch::from_event(event);
        let mut register_err = None;
        for record in &batch.records {
            let entry = AckPending {
                sequencer: record.s3.object.sequencer.clone(),
                topic: topic.clone(),
                partition,
                offset,
            };
            if let Err(err) = tracker.expect(entry) {
                register_err = Some(err);
                break;
            }
        }
        if let Some(err) = register_err {
            let _ = tx
                .send(NotificationBatch::from_error(WatchError::Fatal(err)))
                .await;
            break;
        }

        if tx.send(batch).await.is_err() {
            break;
        }
    }
}
