use crate::storage::ObjectInfo;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::BTreeMap;

// Separator follows the http header list convention, which is why `;` inside
// values must be escaped before joining.
const SEPARATOR: &str = "; ";

pub const UPLOAD_PATHS_KEY: &str = "Uploadpaths";
pub const UPLOAD_DIR_KEY: &str = "Uploaddir";

/// The metadata to write on the archive object, plus whether the store should
/// replace (rather than extend) what is already there.
#[derive(Debug, Clone)]
pub struct MergedMetadata {
    pub user_metadata: BTreeMap<String, String>,
    pub replace_metadata: bool,
}

fn encode_path(value: &str) -> String {
    value.replace(';', "%3B")
}

/// Append `value` to a `"; "`-separated list, skipping values already present.
pub fn append_path(list: &str, value: &str) -> String {
    let encoded = encode_path(value);
    if list.is_empty() {
        return encoded;
    }
    if list.split(SEPARATOR).any(|item| item == encoded) {
        return list.to_string();
    }
    format!("{list}{SEPARATOR}{encoded}")
}

fn basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Directory prefix of `key` with a trailing `/`, or `None` when the key has
/// no directory component.
fn dir_prefix(key: &str) -> Option<String> {
    key.rfind('/').map(|idx| format!("{}/", &key[..idx]))
}

// Attribute characters that survive RFC 5987 extended values unescaped.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

fn needs_extended_encoding(value: &str) -> bool {
    value.bytes().any(|byte| byte < 0x20 || byte >= 0x7f)
}

fn quote_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// RFC 2183/5987 rendering of a media type with one parameter, matching the
/// standard formatter: quoted-string for printable ASCII values, a
/// `key*=utf-8''…` extended value otherwise.
pub fn format_media_type(mediatype: &str, key: &str, value: &str) -> String {
    if needs_extended_encoding(value) {
        let encoded = utf8_percent_encode(value, ATTR_CHAR);
        return format!("{mediatype}; {key}*=utf-8''{encoded}");
    }
    format!("{mediatype}; {key}={}", quote_string(value))
}

/// Compute the archive object's user metadata from the uploaded object and
/// the archive object it collides with, if any. Provenance lists are
/// append-only and duplicate-free.
pub fn new_metadata(uploaded: &ObjectInfo, existing: Option<&ObjectInfo>) -> MergedMetadata {
    let mut meta = uploaded.user_metadata.clone();

    meta.insert("content-type".to_string(), uploaded.content_type.clone());
    meta.insert(
        "content-disposition".to_string(),
        format_media_type("attachment", "filename", basename(&uploaded.key)),
    );

    let prior = |key: &str| -> &str {
        existing
            .and_then(|info| info.user_metadata.get(key))
            .map(String::as_str)
            .unwrap_or("")
    };

    meta.insert(
        UPLOAD_PATHS_KEY.to_string(),
        append_path(prior(UPLOAD_PATHS_KEY), &uploaded.key),
    );

    let dirs = match dir_prefix(&uploaded.key) {
        Some(dir) => append_path(prior(UPLOAD_DIR_KEY), &dir),
        None => prior(UPLOAD_DIR_KEY).to_string(),
    };
    if !dirs.is_empty() {
        meta.insert(UPLOAD_DIR_KEY.to_string(), dirs);
    }

    MergedMetadata {
        user_metadata: meta,
        replace_metadata: true,
    }
}
