use crate::events::{
    classify_error_message, classify_parse_failure, NotificationBatch, NotificationEvent,
};
use crate::metadata::MergedMetadata;
use crate::storage::sigv4::{encode_query_pairs, payload_hash, uri_encode_path, RequestSigner};
use crate::storage::{canonical_meta_key, BlobStore, ByteStream, ObjectInfo, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use quick_xml::de::from_str;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const META_PREFIX: &str = "x-amz-meta-";
const OBJECT_CREATED_PUT: &str = "s3:ObjectCreated:Put";

#[derive(Debug, Clone)]
pub struct S3Config {
    pub host: String,
    pub secure: bool,
    pub access_key: String,
    pub secret_key: String,
    pub trace: bool,
}

/// MinIO/S3 client speaking the wire protocol directly: SigV4-signed
/// requests over reqwest, XML response decoding, and the store's streaming
/// bucket-notification extension.
pub struct S3Store {
    http: reqwest::Client,
    base_url: String,
    host: String,
    signer: RequestSigner,
    trace: bool,
}

impl S3Store {
    pub fn new(config: &S3Config) -> Result<Self, String> {
        if config.host.is_empty() {
            return Err("object store host not configured".to_string());
        }
        let scheme = if config.secure { "https" } else { "http" };
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| format!("http client build failed: {err}"))?;
        Ok(Self {
            http,
            base_url: format!("{scheme}://{}", config.host),
            host: config.host.clone(),
            signer: RequestSigner::new(&config.access_key, &config.secret_key, "us-east-1"),
            trace: config.trace,
        })
    }

    async fn request(
        &self,
        method: Method,
        bucket: &str,
        key: &str,
        query: &[(String, String)],
        amz_headers: &[(String, String)],
        plain_headers: &[(String, String)],
        body: Option<Bytes>,
    ) -> Result<reqwest::Response, StoreError> {
        let path = if key.is_empty() {
            format!("/{bucket}")
        } else {
            uri_encode_path(&format!("{bucket}/{key}"))
        };
        let mut sorted = query.to_vec();
        sorted.sort();
        let query_string = encode_query_pairs(&sorted);

        let hash = match &body {
            Some(bytes) => payload_hash(bytes),
            None => payload_hash(b""),
        };
        let signed =
            self.signer
                .sign(method.as_str(), &self.host, &path, &query_string, amz_headers, &hash, Utc::now());

        let mut headers = HeaderMap::new();
        for (name, value) in signed
            .iter()
            .chain(amz_headers.iter())
            .chain(plain_headers.iter())
        {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| StoreError::Unexpected(format!("bad header name: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| StoreError::Unexpected(format!("bad header value: {err}")))?;
            headers.insert(name, value);
        }

        let url = if query_string.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query_string)
        };

        let mut request = self.http.request(method.clone(), &url).headers(headers);
        if let Some(bytes) = body {
            request = request.body(bytes);
        }
        let response = request
            .send()
            .await
            .map_err(|err| StoreError::Unexpected(format!("{method} {url} failed: {err}")))?;
        if self.trace {
            tracing::info!(method = %method, url = %url, status = %response.status(), "store request");
        }
        Ok(response)
    }
}

async fn error_from_response(response: reqwest::Response) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if let Ok(parsed) = from_str::<ErrorResponse>(&body) {
        return match parsed.code.as_str() {
            "NoSuchKey" => StoreError::NoSuchKey,
            "NoSuchBucket" => StoreError::NoSuchBucket,
            code => StoreError::Unexpected(format!(
                "{code}: {}",
                parsed.message.unwrap_or_else(|| status.to_string())
            )),
        };
    }
    if status == StatusCode::NOT_FOUND {
        return StoreError::NoSuchKey;
    }
    StoreError::Unexpected(format!("unexpected status {status}"))
}

fn object_info_from_headers(key: &str, headers: &HeaderMap) -> ObjectInfo {
    let mut user_metadata = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        if let Some(rest) = name.strip_prefix(META_PREFIX) {
            if let Ok(value) = value.to_str() {
                user_metadata.insert(canonical_meta_key(rest), value.to_string());
            }
        }
    }
    let content_type = headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let etag = headers
        .get(reqwest::header::ETAG)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .trim_matches('"')
        .to_string();
    ObjectInfo {
        key: key.to_string(),
        content_type,
        user_metadata,
        etag,
    }
}

/// Split metadata into copy-request headers. The content-type and
/// content-disposition entries travel as real headers; the rest as
/// `x-amz-meta-*`.
fn copy_headers(meta: &MergedMetadata) -> (Vec<(String, String)>, Vec<(String, String)>) {
    let mut amz_headers = Vec::new();
    let mut plain_headers = Vec::new();
    for (name, value) in &meta.user_metadata {
        let lowered = name.to_lowercase();
        match lowered.as_str() {
            "content-type" | "content-disposition" => {
                plain_headers.push((lowered, value.clone()));
            }
            _ => amz_headers.push((format!("{META_PREFIX}{lowered}"), value.clone())),
        }
    }
    (amz_headers, plain_headers)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorResponse {
    code: String,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CopyObjectResult {
    e_tag: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    is_truncated: Option<bool>,
    #[serde(default)]
    next_continuation_token: Option<String>,
    #[serde(default)]
    contents: Vec<ListEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    key: String,
}

#[async_trait]
impl BlobStore for S3Store {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError> {
        let response = self
            .request(Method::HEAD, bucket, "", &[], &[], &[], None)
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(StoreError::Unexpected(format!(
                "bucket existence check got status {status}"
            ))),
        }
    }

    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StoreError> {
        let response = self
            .request(Method::HEAD, bucket, key, &[], &[], &[], None)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NoSuchKey);
        }
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(object_info_from_headers(key, response.headers()))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ByteStream, StoreError> {
        let response = self
            .request(Method::GET, bucket, key, &[], &[], &[], None)
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| StoreError::Unexpected(format!("body read failed: {err}"))));
        Ok(Box::pin(stream))
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        meta: &MergedMetadata,
    ) -> Result<String, StoreError> {
        let (mut amz_headers, plain_headers) = copy_headers(meta);
        amz_headers.push((
            "x-amz-copy-source".to_string(),
            uri_encode_path(&format!("{src_bucket}/{src_key}")),
        ));
        let directive = if meta.replace_metadata { "REPLACE" } else { "COPY" };
        amz_headers.push(("x-amz-metadata-directive".to_string(), directive.to_string()));

        let response = self
            .request(
                Method::PUT,
                dst_bucket,
                dst_key,
                &[],
                &amz_headers,
                &plain_headers,
                None,
            )
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        // A copy can fail after the 200 status line; the error arrives in
        // the body instead.
        let body = response
            .text()
            .await
            .map_err(|err| StoreError::Unexpected(format!("copy response read failed: {err}")))?;
        if let Ok(parsed) = from_str::<ErrorResponse>(&body) {
            return Err(StoreError::Unexpected(format!(
                "copy failed: {}: {}",
                parsed.code,
                parsed.message.unwrap_or_default()
            )));
        }
        let result: CopyObjectResult = from_str(&body)
            .map_err(|err| StoreError::Unexpected(format!("copy result decode failed: {err}")))?;
        Ok(result
            .e_tag
            .unwrap_or_default()
            .trim_matches('"')
            .to_string())
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let response = self
            .request(Method::DELETE, bucket, key, &[], &[], &[], None)
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(())
    }

    async fn list_objects(&self, bucket: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut query = vec![("list-type".to_string(), "2".to_string())];
            if let Some(token) = &continuation {
                query.push(("continuation-token".to_string(), token.clone()));
            }
            let response = self
                .request(Method::GET, bucket, "", &query, &[], &[], None)
                .await?;
            if !response.status().is_success() {
                return Err(error_from_response(response).await);
            }
            let body = response
                .text()
                .await
                .map_err(|err| StoreError::Unexpected(format!("list response read failed: {err}")))?;
            let result: ListBucketResult = from_str(&body)
                .map_err(|err| StoreError::Unexpected(format!("list decode failed: {err}")))?;
            keys.extend(result.contents.into_iter().map(|entry| entry.key));
            if result.is_truncated.unwrap_or(false) {
                continuation = result.next_continuation_token;
                if continuation.is_none() {
                    return Err(StoreError::Unexpected(
                        "truncated listing without continuation token".to_string(),
                    ));
                }
            } else {
                return Ok(keys);
            }
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError> {
        let content_type = vec![("content-type".to_string(), content_type.to_string())];
        let response = self
            .request(Method::PUT, bucket, key, &[], &[], &content_type, Some(body))
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(())
    }

    async fn watch_bucket(
        &self,
        bucket: &str,
        shutdown: CancellationToken,
    ) -> Result<mpsc::Receiver<NotificationBatch>, StoreError> {
        let query = vec![
            ("events".to_string(), OBJECT_CREATED_PUT.to_string()),
            ("prefix".to_string(), String::new()),
            ("suffix".to_string(), String::new()),
        ];
        let response = self
            .request(Method::GET, bucket, "", &query, &[], &[], None)
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(listen_loop(response, tx, shutdown));
        Ok(rx)
    }
}

/// Consume the store's ND-JSON notification stream and forward batches. A
/// connection cut mid-poll is the long-poll timeout case and surfaces as a
/// recoverable error; decode failures are classified by shape.
async fn listen_loop(
    response: reqwest::Response,
    tx: mpsc::Sender<NotificationBatch>,
    shutdown: CancellationToken,
) {
    let mut stream = response.bytes_stream();
    let mut buffer = LineBuffer::default();
    loop {
        let chunk = tokio::select! {
            _ = shutdown.cancelled() => break,
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for line in buffer.push(&bytes) {
                    match serde_json::from_slice::<NotificationEvent>(&line) {
                        Ok(event) => {
                            if tx.send(NotificationBatch::from_event(event)).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            let _ = tx
                                .send(NotificationBatch::from_error(classify_parse_failure(&err)))
                                .await;
                            return;
                        }
                    }
                }
            }
            Some(Err(err)) => {
                let err = classify_error_message(&format!("unexpected end of JSON input: {err}"));
                let _ = tx.send(NotificationBatch::from_error(err)).await;
                return;
            }
            None => {
                let message = if buffer.has_partial() {
                    "unexpected end of JSON input: stream closed mid-line"
                } else {
                    "unexpected end of JSON input: stream closed"
                };
                let err = classify_error_message(message);
                let _ = tx.send(NotificationBatch::from_error(err)).await;
                return;
            }
        }
    }
}

/// Accumulates stream chunks and yields complete, non-blank lines.
#[derive(Default)]
struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if !line.iter().all(|byte| byte.is_ascii_whitespace()) {
                lines.push(line);
            }
        }
        lines
    }

    fn has_partial(&self) -> bool {
        !self
            .buffer
            .iter()
            .all(|byte| byte.is_ascii_whitespace())
    }
}

#[cfg(test)]
mod tests {
    use super::{copy_headers, from_str, CopyObjectResult, ErrorResponse, LineBuffer, ListBucketResult};
    use crate::metadata::MergedMetadata;
    use std::collections::BTreeMap;

    #[test]
    fn decodes_list_bucket_result() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
            <ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
                <Name>inbox</Name>
                <IsTruncated>true</IsTruncated>
                <NextContinuationToken>token-1</NextContinuationToken>
                <Contents><Key>photos/a.JPEG</Key><Size>2</Size></Contents>
                <Contents><Key>docs/b.pdf</Key><Size>9</Size></Contents>
            </ListBucketResult>"#;
        let result: ListBucketResult = from_str(body).expect("decode");
        assert_eq!(result.is_truncated, Some(true));
        assert_eq!(result.next_continuation_token.as_deref(), Some("token-1"));
        let keys: Vec<&str> = result.contents.iter().map(|entry| entry.key.as_str()).collect();
        assert_eq!(keys, vec!["photos/a.JPEG", "docs/b.pdf"]);
    }

    #[test]
    fn decodes_empty_listing() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
            <ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
                <Name>inbox</Name>
                <IsTruncated>false</IsTruncated>
            </ListBucketResult>"#;
        let result: ListBucketResult = from_str(body).expect("decode");
        assert!(result.contents.is_empty());
        assert_eq!(result.is_truncated, Some(false));
    }

    #[test]
    fn decodes_copy_result_etag() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
            <CopyObjectResult>
                <LastModified>2024-01-01T00:00:00.000Z</LastModified>
                <ETag>"9f86d081884c7d65"</ETag>
            </CopyObjectResult>"#;
        let result: CopyObjectResult = from_str(body).expect("decode");
        assert_eq!(result.e_tag.as_deref(), Some("\"9f86d081884c7d65\""));
    }

    #[test]
    fn decodes_error_response_codes() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
            <Error>
                <Code>NoSuchKey</Code>
                <Message>The specified key does not exist.</Message>
            </Error>"#;
        let result: ErrorResponse = from_str(body).expect("decode");
        assert_eq!(result.code, "NoSuchKey");
    }

    #[test]
    fn line_buffer_splits_across_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"{\"Records\"").is_empty());
        assert!(buffer.has_partial());
        let lines = buffer.push(b":[]}\n \n{\"x\"");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], b"{\"Records\":[]}".to_vec());
        assert!(buffer.has_partial());
        let lines = buffer.push(b":1}\n");
        assert_eq!(lines.len(), 1);
        assert!(!buffer.has_partial());
    }

    #[test]
    fn copy_headers_splits_standard_and_user_metadata() {
        let mut user_metadata = BTreeMap::new();
        user_metadata.insert("content-type".to_string(), "image/jpeg".to_string());
        user_metadata.insert(
            "content-disposition".to_string(),
            "attachment; filename=\"a.JPEG\"".to_string(),
        );
        user_metadata.insert("Uploadpaths".to_string(), "photos/a.JPEG".to_string());
        let meta = MergedMetadata {
            user_metadata,
            replace_metadata: true,
        };
        let (amz_headers, plain_headers) = copy_headers(&meta);
        assert!(plain_headers
            .iter()
            .any(|(name, value)| name == "content-type" && value == "image/jpeg"));
        assert!(plain_headers
            .iter()
            .any(|(name, value)| name == "content-disposition"
                && value == "attachment; filename=\"a.JPEG\""));
        assert!(amz_headers
            .iter()
            .any(|(name, value)| name == "x-amz-meta-uploadpaths" && value == "photos/a.JPEG"));
    }
}
