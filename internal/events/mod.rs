use crate::kafka::BrokerWatcher;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Outcome reported back to a watcher for a delivered batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferResult {
    Ok,
    Failed,
}

/// Severity of a notification-stream error. Recoverable ends the watcher
/// session and lets the orchestrator rebuild; Fatal ends the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    Recoverable(String),
    Fatal(String),
}

impl WatchError {
    pub fn message(&self) -> &str {
        match self {
            WatchError::Recoverable(msg) | WatchError::Fatal(msg) => msg,
        }
    }
}

// Known benign parse signatures emitted by notification transports when a
// long poll times out mid-document. Everything else crashloops on purpose.
const RECOVERABLE_SIGNATURES: [&str; 2] = [
    "unexpected end of JSON input",
    "readObjectStart: expect { or n, but found ",
];

/// Classify a transport-reported error message.
pub fn classify_error_message(message: &str) -> WatchError {
    for signature in RECOVERABLE_SIGNATURES {
        if message.starts_with(signature) {
            return WatchError::Recoverable(message.to_string());
        }
    }
    WatchError::Fatal(message.to_string())
}

/// Classify a JSON decode failure from the notification stream. Truncated
/// documents look exactly like the long-poll timeouts above and reuse their
/// signature.
pub fn classify_parse_failure(err: &serde_json::Error) -> WatchError {
    if err.is_eof() {
        return classify_error_message(&format!("unexpected end of JSON input: {err}"));
    }
    WatchError::Fatal(format!("notification decode failed: {err}"))
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BucketRecord {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObjectRecord {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(rename = "eTag", default)]
    pub etag: Option<String>,
    /// Monotonic per-object-event unique id assigned by the store.
    #[serde(default)]
    pub sequencer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct S3Entity {
    #[serde(default)]
    pub bucket: BucketRecord,
    #[serde(default)]
    pub object: ObjectRecord,
}

/// One object-created record as the store serializes it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationRecord {
    #[serde(rename = "eventName", default)]
    pub event_name: String,
    #[serde(default)]
    pub s3: S3Entity,
}

/// The envelope both the native channel and broker payloads use.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<NotificationRecord>,
}

/// What a watcher delivers downstream: zero or more records, or an error.
#[derive(Debug, Clone, Default)]
pub struct NotificationBatch {
    pub records: Vec<NotificationRecord>,
    pub err: Option<WatchError>,
}

impl NotificationBatch {
    pub fn from_event(event: NotificationEvent) -> Self {
        Self {
            records: event.records,
            err: None,
        }
    }

    pub fn from_error(err: WatchError) -> Self {
        Self {
            records: Vec::new(),
            err: Some(err),
        }
    }
}

/// The two ways upload notifications reach us. Discriminated once at
/// startup; both expose the same stream + ack capabilities.
pub enum InboxWatcher {
    Standalone(StandaloneWatcher),
    Broker(BrokerWatcher),
}

impl InboxWatcher {
    pub async fn recv(&mut self) -> Option<NotificationBatch> {
        match self {
            InboxWatcher::Standalone(watcher) => watcher.recv().await,
            InboxWatcher::Broker(watcher) => watcher.recv().await,
        }
    }

    /// Acknowledge a delivered batch. Errors are invariant violations the
    /// caller treats as fatal.
    pub fn ack(&self, result: TransferResult, batch: &NotificationBatch) -> Result<(), String> {
        match self {
            InboxWatcher::Standalone(watcher) => {
                watcher.ack(result);
                Ok(())
            }
            InboxWatcher::Broker(watcher) => watcher.ack(result, batch),
        }
    }

    /// Broker payloads quote `/` as `%2F`, so keys need URL-decoding.
    pub fn url_decodes_keys(&self) -> bool {
        matches!(self, InboxWatcher::Broker(_))
    }
}

/// Watcher backed by the store's native bucket-notification channel. The
/// native channel has no replay, so ack is a no-op.
pub struct StandaloneWatcher {
    uploads: mpsc::Receiver<NotificationBatch>,
}

impl StandaloneWatcher {
    pub fn new(uploads: mpsc::Receiver<NotificationBatch>) -> Self {
        Self { uploads }
    }

    pub async fn recv(&mut self) -> Option<NotificationBatch> {
        self.uploads.recv().await
    }

    pub fn ack(&self, result: TransferResult) {
        if result == TransferResult::Failed {
            tracing::error!("nack on transfer failure not implemented");
        } else {
            tracing::debug!("ack is a no-op for the native notification channel");
        }
    }
}
