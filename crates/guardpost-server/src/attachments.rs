use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs;
use tracing::{debug, info};

use guardpost_shared::AttachmentRef;

use crate::error::ServerError;

const MAX_EXTENSION_LEN: usize = 10;
const DEFAULT_FILE_NAME: &str = "attachment";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Validated attachment reference: a blake3 digest plus an optional
/// extension. Anything else (separators, `..`, other characters) is
/// rejected, so a reference can never escape the base directory.
fn parse_reference(reference: &str) -> Result<&str, ServerError> {
    let invalid = || ServerError::BadRequest(format!("Invalid attachment reference '{reference}'"));

    let (digest, ext) = match reference.split_once('.') {
        Some((digest, ext)) => (digest, Some(ext)),
        None => (reference, None),
    };

    if digest.len() != 64 || hex::decode(digest).is_err() {
        return Err(invalid());
    }
    if let Some(ext) = ext {
        if ext.is_empty()
            || ext.len() > MAX_EXTENSION_LEN
            || !ext.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(invalid());
        }
    }
    Ok(reference)
}

/// Lowercased alphanumeric extension of an uploaded file name, if any.
fn sanitized_extension(file_name: &str) -> Option<String> {
    let ext = Path::new(file_name).extension()?.to_str()?;
    let ext = ext.to_ascii_lowercase();
    (!ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LEN
        && ext.chars().all(|c| c.is_ascii_alphanumeric()))
    .then_some(ext)
}

/// Last path component of a client-supplied file name, for display only.
fn display_name(file_name: &str) -> String {
    let name = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty() {
        DEFAULT_FILE_NAME.to_string()
    } else {
        name.to_string()
    }
}

/// Content type served for a stored reference.
pub fn content_type(reference: &str) -> &'static str {
    match reference.rsplit_once('.').map(|(_, ext)| ext) {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Disk-backed, content-addressed attachment storage. Identical uploads
/// share one file.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    base_path: PathBuf,
    max_size: usize,
}

impl AttachmentStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::Internal(format!(
                "Failed to create attachment directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), max_size, "Attachment store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub async fn store(&self, file_name: &str, data: &[u8]) -> Result<AttachmentRef, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty attachment".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::PayloadTooLarge { max: self.max_size });
        }

        let digest = blake3::hash(data).to_hex();
        let reference = match sanitized_extension(file_name) {
            Some(ext) => format!("{digest}.{ext}"),
            None => digest.to_string(),
        };
        let path = self.base_path.join(&reference);

        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!(reference = %reference, "Attachment already stored");
        } else {
            // Write then rename so readers never see a partial file.
            let temp = self.base_path.join(format!(
                ".{reference}.{}.partial",
                TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
            ));
            fs::write(&temp, data)
                .await
                .map_err(|e| ServerError::TransientIo(format!("Failed to write attachment: {e}")))?;
            fs::rename(&temp, &path)
                .await
                .map_err(|e| ServerError::TransientIo(format!("Failed to commit attachment: {e}")))?;
            debug!(reference = %reference, size = data.len(), "Stored attachment");
        }

        Ok(AttachmentRef {
            file_path: reference,
            file_name: display_name(file_name),
        })
    }

    pub async fn load(&self, reference: &str) -> Result<Vec<u8>, ServerError> {
        let path = self.base_path.join(parse_reference(reference)?);

        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServerError::NotFound(format!("Attachment {reference}")))
            }
            Err(e) => Err(ServerError::TransientIo(format!(
                "Failed to read attachment {reference}: {e}"
            ))),
        }
    }

    /// Whether `reference` names a stored attachment.
    pub async fn contains(&self, reference: &str) -> bool {
        match parse_reference(reference) {
            Ok(valid) => fs::try_exists(self.base_path.join(valid))
                .await
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}
