use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Signs outgoing requests with AWS Signature Version 4, header style.
#[derive(Clone)]
pub struct RequestSigner {
    access_key: String,
    secret_key: String,
    region: String,
}

impl RequestSigner {
    pub fn new(access_key: &str, secret_key: &str, region: &str) -> Self {
        Self {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            region: region.to_string(),
        }
    }

    /// Produce the `x-amz-date`, `x-amz-content-sha256` and `authorization`
    /// headers for a request. `encoded_path` and `canonical_query` must be
    /// exactly what goes on the wire; `amz_headers` are any additional
    /// lower-cased `x-amz-*` headers the request carries.
    pub fn sign(
        &self,
        method: &str,
        host: &str,
        encoded_path: &str,
        canonical_query: &str,
        amz_headers: &[(String, String)],
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);

        let mut signed: Vec<(String, String)> = vec![
            ("host".to_string(), host.to_string()),
            (
                "x-amz-content-sha256".to_string(),
                payload_hash.to_string(),
            ),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        for (name, value) in amz_headers {
            signed.push((name.to_lowercase(), value.clone()));
        }
        signed.sort();

        let canonical_request = build_canonical_request(
            method,
            encoded_path,
            canonical_query,
            &signed,
            payload_hash,
        );
        let canonical_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
        let string_to_sign = build_string_to_sign(ALGORITHM, &amz_date, &scope, &canonical_hash);
        let signature = calculate_signature(
            &self.secret_key,
            &date_stamp,
            &self.region,
            &string_to_sign,
        );

        let signed_names = signed
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<&str>>()
            .join(";");
        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.access_key, scope, signed_names, signature
        );

        vec![
            ("x-amz-date".to_string(), amz_date),
            (
                "x-amz-content-sha256".to_string(),
                payload_hash.to_string(),
            ),
            ("authorization".to_string(), authorization),
        ]
    }
}

pub fn payload_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Percent-encode a key for use in a request path, leaving `/` intact.
pub fn uri_encode_path(path: &str) -> String {
    let segments = path.split('/').map(uri_encode).collect::<Vec<String>>();
    let mut out = segments.join("/");
    if !out.starts_with('/') {
        out.insert(0, '/');
    }
    out
}

/// Encode already-sorted query pairs the way the canonical request expects.
pub fn encode_query_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{}={}", uri_encode(key), uri_encode(value)))
        .collect::<Vec<String>>()
        .join("&")
}

fn build_canonical_request(
    method: &str,
    encoded_path: &str,
    canonical_query: &str,
    signed_headers: &[(String, String)],
    payload_hash: &str,
) -> String {
    let mut canonical_headers = String::new();
    for (name, value) in signed_headers {
        let normalized = value.split_whitespace().collect::<Vec<&str>>().join(" ");
        canonical_headers.push_str(&format!("{}:{}\n", name, normalized));
    }
    let signed_names = signed_headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<&str>>()
        .join(";");
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, encoded_path, canonical_query, canonical_headers, signed_names, payload_hash
    )
}

fn build_string_to_sign(algorithm: &str, amz_date: &str, scope: &str, canonical_hash: &str) -> String {
    format!("{}\n{}\n{}\n{}", algorithm, amz_date, scope, canonical_hash)
}

fn calculate_signature(secret: &str, date: &str, region: &str, string_to_sign: &str) -> String {
    let mut key = sign(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    key = sign(&key, region.as_bytes());
    key = sign(&key, b"s3");
    key = sign(&key, b"aws4_request");
    hex::encode(sign(&key, string_to_sign.as_bytes()))
}

fn sign(key: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(msg);
    mac.finalize().into_bytes().to_vec()
}

fn uri_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.as_bytes() {
        match *byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(*byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
