use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;

pub const INDEX_CONTENT_TYPE: &str = "application/jsonlines";
pub const INDEX_WRITE_DIR: &str = "deduplication-index";

/// One line of the batch index, in the persisted jsonlines schema.
#[derive(Debug, Clone, Serialize)]
pub struct TransferRecord {
    #[serde(rename = "v")]
    pub format_version: i8,
    /// The original upload path in the inbox.
    pub upload: String,
    /// The blob key for read access in the archive.
    pub key: String,
    /// True if the target existed before the copy (identical body).
    pub replaced: bool,
    /// True if existing metadata was rewritten; false when the target was new.
    pub metareplaced: bool,
    /// Etag of the archive object after the copy.
    pub etag: String,
    /// The metadata written.
    pub meta: BTreeMap<String, String>,
}

/// Append-only in-memory log of completed transfers.
#[derive(Debug, Default)]
pub struct TransferIndex {
    entries: Vec<TransferRecord>,
}

impl TransferIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn append(&mut self, entry: TransferRecord) {
        self.entries.push(entry);
    }

    /// Serialize the index body and its byte count for upload.
    pub fn serialize(&self, content_type: &str) -> Result<(Bytes, i64), String> {
        if content_type != INDEX_CONTENT_TYPE {
            return Err(format!("unsupported content-type {content_type}"));
        }
        let mut buf = Vec::new();
        for entry in &self.entries {
            let line = serde_json::to_vec(entry)
                .map_err(|err| format!("index entry serialize failed: {err}"))?;
            buf.extend_from_slice(&line);
            buf.push(b'\n');
        }
        let len = buf.len() as i64;
        Ok((Bytes::from(buf), len))
    }
}
