use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::StorageClient;

#[derive(Debug, Clone)]
pub struct UploadItem {
    pub body: Bytes,
    pub content_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Avatar,
    CoverImage,
}

impl MediaKind {
    fn prefix(self) -> &'static str {
        match self {
            MediaKind::Avatar => "avatar",
            MediaKind::CoverImage => "cover",
        }
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("no file supplied")]
    Missing,
    #[error("upload failed: {0}")]
    Upload(#[source] anyhow::Error),
}

/// Stores one image and returns the URL it is served from.
pub async fn upload(
    storage: &dyn StorageClient,
    owner: Uuid,
    kind: MediaKind,
    item: Option<UploadItem>,
) -> Result<String, MediaError> {
    let item = item.filter(|i| !i.body.is_empty()).ok_or(MediaError::Missing)?;
    let ext = ext_from_mime(&item.content_type).unwrap_or("bin");
    let key = format!("users/{}/{}-{}.{}", owner, kind.prefix(), Uuid::new_v4(), ext);
    storage
        .put_object(&key, item.body, &item.content_type)
        .await
        .map_err(|e| {
            warn!(error = %e, %key, "media upload failed");
            MediaError::Upload(e)
        })?;
    debug!(%key, kind = ?kind, "media uploaded");
    Ok(storage.object_url(&key))
}

fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/heic" => Some("heic"),
        _ => None,
    }
}
