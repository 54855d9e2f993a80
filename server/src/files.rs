use crate::error::{ChatError, Result};
use anyhow::Context;
use bytes::Bytes;
use chat_protocol::AttachmentKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Metadata kept beside each stored blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub mime: String,
    pub kind: AttachmentKind,
    pub original_name: String,
    pub size: u64,
}

/// Upload result returned to the client, ready to be used as an attachment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Uploaded {
    pub url: String,
    pub kind: AttachmentKind,
    pub original_name: String,
}

/// File ids are lowercase sha256 hex digests.
pub fn is_file_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Determine the on-disk path for a file id within the store.
pub fn file_path<P: AsRef<Path>>(base: P, id: &str) -> PathBuf {
    let sub = &id[..2];
    base.as_ref().join(sub).join(id)
}

fn meta_path<P: AsRef<Path>>(base: P, id: &str) -> PathBuf {
    file_path(base, id).with_extension("json")
}

/// Pick a MIME type: sniffed magic bytes first, then the declared type, then the name.
pub fn detect_mime(data: &[u8], declared: Option<&str>, name: &str) -> String {
    if let Some(t) = infer::get(data) {
        return t.mime_type().to_string();
    }
    declared
        .filter(|m| !m.is_empty() && *m != "application/octet-stream")
        .map(str::to_string)
        .or_else(|| mime_guess::from_path(name).first().map(|m| m.to_string()))
        .unwrap_or_else(|| "application/octet-stream".into())
}

fn clean_name(name: &str) -> String {
    let base = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned: String = base.chars().filter(|c| !c.is_control() && *c != '"').take(255).collect();
    if cleaned.is_empty() {
        "file".into()
    } else {
        cleaned
    }
}

/// Save file data into a content-addressed store and describe it as an attachment.
pub async fn save_file<P: AsRef<Path>>(
    base: P,
    original_name: &str,
    declared_mime: Option<&str>,
    data: Bytes,
) -> Result<Uploaded> {
    if data.is_empty() {
        return Err(ChatError::InvalidInput("invalid_attachment"));
    }
    let mut hasher = Sha256::new();
    hasher.update(&data);
    let hash = format!("{:x}", hasher.finalize());
    let dir = base.as_ref().join(&hash[..2]);
    fs::create_dir_all(&dir).await.context("create file dir")?;

    let original_name = clean_name(original_name);
    let mime = detect_mime(&data, declared_mime, &original_name);
    let meta = FileMeta {
        kind: AttachmentKind::from_mime(&mime),
        mime,
        original_name: original_name.clone(),
        size: data.len() as u64,
    };
    fs::write(file_path(&base, &hash), &data)
        .await
        .context("write file")?;
    let json = serde_json::to_vec(&meta).context("encode file meta")?;
    fs::write(meta_path(&base, &hash), json)
        .await
        .context("write file meta")?;
    Ok(Uploaded {
        url: format!("/api/files/{}", hash),
        kind: meta.kind,
        original_name,
    })
}

/// Look up a stored file. Unknown or malformed ids are `NotFound`.
pub async fn load_meta<P: AsRef<Path>>(base: P, id: &str) -> Result<FileMeta> {
    if !is_file_id(id) {
        return Err(ChatError::NotFound);
    }
    let bytes = fs::read(meta_path(&base, id))
        .await
        .map_err(|_| ChatError::NotFound)?;
    let meta = serde_json::from_slice(&bytes).context("corrupt file meta")?;
    Ok(meta)
}
