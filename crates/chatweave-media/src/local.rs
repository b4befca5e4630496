//! Local filesystem media variant.
//!
//! Places files under `<MediaDownloadPath>/<sha1-prefix>/<name>` for an
//! operator-run static webserver to expose at `MediaServerDownload`.
//! Directories are created 0755, files written 0644.

use std::path::PathBuf;

use async_trait::async_trait;

use chatweave_types::{ChatweaveError, FileInfo, Result};

use crate::{file_bytes, join_url, sha1_prefix, MediaServer};

#[derive(Debug)]
pub struct LocalMedia {
    root: PathBuf,
    download_base: String,
}

impl LocalMedia {
    pub fn new(root: &str, download_base: &str) -> Self {
        Self {
            root: PathBuf::from(root),
            download_base: download_base.trim_end_matches('/').to_string(),
        }
    }
}

#[cfg(unix)]
async fn set_mode(path: &std::path::Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &std::path::Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl MediaServer for LocalMedia {
    async fn upload(&self, file: &FileInfo) -> Result<String> {
        let data = file_bytes(file)?;
        let sha = sha1_prefix(data);

        let dir = self.root.join(&sha);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ChatweaveError::Media {
                reason: format!("mkdir {} failed: {e}", dir.display()),
            })?;
        set_mode(&dir, 0o755).await.map_err(|e| ChatweaveError::Media {
            reason: format!("chmod {} failed: {e}", dir.display()),
        })?;

        let path = dir.join(&file.name);
        tracing::debug!(path = %path.display(), bytes = data.len(), "media placed locally");

        tokio::fs::write(&path, data)
            .await
            .map_err(|e| ChatweaveError::Media {
                reason: format!("write {} failed: {e}", path.display()),
            })?;
        set_mode(&path, 0o644).await.map_err(|e| ChatweaveError::Media {
            reason: format!("chmod {} failed: {e}", path.display()),
        })?;

        Ok(join_url(&self.download_base, &format!("{sha}/{}", file.name)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
