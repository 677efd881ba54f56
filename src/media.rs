use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::FieldErrors;

/// Accepted profile picture types and the extension each is stored under.
pub const ALLOWED_IMAGE_TYPES: [(&str, &str); 4] = [
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
];

const PROFILE_PICTURE_DIR: &str = "profile_pics";

/// Binary file persistence. File refs are opaque to callers.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn store(&self, bytes: &[u8], content_type: &str) -> io::Result<String>;
    fn url_of(&self, file_ref: &str) -> String;
    async fn delete(&self, file_ref: &str) -> io::Result<()>;
}

/// Checks a profile picture upload before it reaches the store.
/// Returns the normalised content type.
pub fn check_image_upload(
    content_type: Option<&str>,
    len: usize,
    max_bytes: usize,
) -> Result<&'static str, FieldErrors> {
    let essence = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();

    let Some((allowed, _)) = ALLOWED_IMAGE_TYPES.iter().find(|(t, _)| *t == essence) else {
        return Err(FieldErrors::single(
            "profile_picture",
            "Invalid file type. Please upload a JPEG, PNG, GIF, or WebP image.",
        ));
    };
    if len == 0 {
        return Err(FieldErrors::single("profile_picture", "No profile picture provided."));
    }
    if len > max_bytes {
        return Err(FieldErrors::single(
            "profile_picture",
            format!(
                "File too large. Please upload an image smaller than {}MB.",
                max_bytes / (1024 * 1024)
            ),
        ));
    }
    Ok(*allowed)
}

/// Stores files under a local directory that is served at `base_url`.
#[derive(Debug, Clone)]
pub struct LocalMediaStore {
    root: PathBuf,
    base_url: String,
}

impl LocalMediaStore {
    pub fn new(root: impl Into<PathBuf>, base_url: &str) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn resolve(&self, file_ref: &str) -> io::Result<PathBuf> {
        let relative = Path::new(file_ref);
        if relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            Ok(self.root.join(relative))
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing media ref outside the store: {file_ref}"),
            ))
        }
    }
}

#[async_trait]
impl MediaStore for LocalMediaStore {
    async fn store(&self, bytes: &[u8], content_type: &str) -> io::Result<String> {
        let extension = ALLOWED_IMAGE_TYPES
            .iter()
            .find(|(t, _)| *t == content_type)
            .map(|(_, ext)| *ext)
            .unwrap_or("bin");
        let file_ref = format!("{PROFILE_PICTURE_DIR}/{}.{extension}", Uuid::new_v4().simple());

        let path = self.resolve(&file_ref)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        info!("[MEDIA] Stored {} ({} bytes)", file_ref, bytes.len());
        Ok(file_ref)
    }

    fn url_of(&self, file_ref: &str) -> String {
        format!("{}/{}", self.base_url, file_ref)
    }

    async fn delete(&self, file_ref: &str) -> io::Result<()> {
        let path = self.resolve(file_ref)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("[MEDIA] Deleted {}", file_ref);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("[MEDIA] {} was already gone", file_ref);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
