//! Upload staging area
//!
//! Uploads land here first and are merged into the image on commit.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{AppError, Result};

/// Prefix of in-flight upload files
const TEMP_PREFIX: &str = ".upload_";

/// FAT long file names are limited to 255 characters
const MAX_NAME_LEN: usize = 255;

/// Reduce a client-supplied file name to a safe base name.
///
/// Returns an empty string when nothing usable is left.
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned = base.replace(['\0', ':', '*', '?', '"', '<', '>', '|'], "_");
    let cleaned = cleaned.trim_start_matches('.');
    cleaned.chars().take(MAX_NAME_LEN).collect()
}

/// Upload staging directory
pub struct UploadStaging {
    dir: PathBuf,
}

impl UploadStaging {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            AppError::Internal(format!("Failed to create upload directory: {}", e))
        })
    }

    /// Staged item names, sorted. A missing directory is empty.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names: Vec<String> = entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| !n.starts_with(TEMP_PREFIX))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Paths of every staged file or directory
    pub fn items(&self) -> Result<Vec<PathBuf>> {
        Ok(self.list()?.into_iter().map(|n| self.dir.join(n)).collect())
    }

    /// Stream a multipart field into the staging area, replacing any staged
    /// file of the same name. Returns the stored name and byte count.
    pub async fn save_field(
        &self,
        file_name: &str,
        mut field: axum::extract::multipart::Field<'_>,
    ) -> Result<(String, u64)> {
        let name = sanitize_filename(file_name);
        if name.is_empty() {
            return Err(AppError::BadRequest(format!(
                "Invalid filename: {:?}",
                file_name
            )));
        }
        self.ensure_dir()?;

        let temp_path = self
            .dir
            .join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4()));
        let final_path = self.dir.join(&name);

        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create temp file: {}", e)))?;

        let mut bytes_written: u64 = 0;
        loop {
            let chunk = match field.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    return Err(AppError::BadRequest(format!(
                        "Failed to read upload chunk: {}",
                        e
                    )));
                }
            };
            bytes_written += chunk.len() as u64;
            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(AppError::Internal(format!("Failed to write chunk: {}", e)));
            }
        }

        file.flush()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to flush file: {}", e)))?;
        drop(file);

        tokio::fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| {
                let _ = std::fs::remove_file(&temp_path);
                AppError::Internal(format!("Failed to rename temp file: {}", e))
            })?;

        info!("Staged upload: {} ({} bytes)", name, bytes_written);
        Ok((name, bytes_written))
    }

    /// Drop leftovers of interrupted uploads
    pub fn remove_partial_uploads(&self) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                debug!("Removing partial upload {}", entry.path().display());
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\a.txt"), "a.txt");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename("what?.txt"), "what_.txt");
        assert_eq!(sanitize_filename(".."), "");
        assert_eq!(sanitize_filename("dir/"), "");
        assert_eq!(sanitize_filename(&"é".repeat(300)).chars().count(), 255);
    }

    #[test]
    fn test_list_skips_partial_uploads() {
        let dir = TempDir::new().unwrap();
        let staging = UploadStaging::new(dir.path().join("upload"));
        assert!(staging.list().unwrap().is_empty());

        staging.ensure_dir().unwrap();
        fs::write(staging.dir().join("b.txt"), b"b").unwrap();
        fs::write(staging.dir().join("a.txt"), b"a").unwrap();
        fs::create_dir(staging.dir().join("folder")).unwrap();
        fs::write(staging.dir().join(".upload_1234"), b"partial").unwrap();

        assert_eq!(staging.list().unwrap(), vec!["a.txt", "b.txt", "folder"]);
        assert_eq!(staging.items().unwrap().len(), 3);

        staging.remove_partial_uploads();
        assert!(!staging.dir().join(".upload_1234").exists());
        assert!(staging.dir().join("a.txt").exists());
    }
}
