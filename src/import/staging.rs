//! Upload staging
//!
//! Uploads are streamed chunk by chunk into a file under the staging
//! directory, never materialized in memory. The size cap is enforced while
//! streaming: an upload of exactly the cap succeeds, one byte more fails
//! with `QuotaExceeded` and the partial file is removed.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::error::{DomainError, DomainResult};

/// A fully staged upload, ready to be referenced by an import job. The
/// file persists until the worker's cleanup stage deletes it.
#[derive(Debug, Clone)]
pub struct StagedUpload {
    pub path: PathBuf,
    pub bytes: u64,
}

pub struct StagedUploadWriter {
    file: BufWriter<File>,
    path: PathBuf,
    bytes: u64,
    max_bytes: u64,
}

impl StagedUploadWriter {
    pub async fn create(staging_dir: &Path, max_bytes: u64, chunk_bytes: usize) -> DomainResult<Self> {
        tokio::fs::create_dir_all(staging_dir)
            .await
            .map_err(|e| anyhow::anyhow!("cannot create staging dir: {e}"))?;

        // The temp file is persisted immediately; lifecycle is owned by the
        // import job, not this process.
        let (std_file, path) = tempfile::Builder::new()
            .prefix("import-")
            .suffix(".upload")
            .tempfile_in(staging_dir)
            .and_then(|f| f.keep().map_err(|e| e.error))
            .map_err(|e| anyhow::anyhow!("cannot create staging file: {e}"))?;

        Ok(Self {
            file: BufWriter::with_capacity(chunk_bytes, File::from_std(std_file)),
            path,
            bytes: 0,
            max_bytes,
        })
    }

    /// Append one chunk, rejecting the upload once it exceeds the cap.
    pub async fn append(&mut self, chunk: &[u8]) -> DomainResult<()> {
        let new_total = self.bytes + chunk.len() as u64;
        if new_total > self.max_bytes {
            return Err(DomainError::QuotaExceeded(format!(
                "upload exceeds the {} byte limit",
                self.max_bytes
            )));
        }

        self.file
            .write_all(chunk)
            .await
            .map_err(|e| DomainError::Transient(format!("staging write failed: {e}")))?;
        self.bytes = new_total;
        Ok(())
    }

    pub async fn finish(mut self) -> DomainResult<StagedUpload> {
        self.file
            .flush()
            .await
            .map_err(|e| DomainError::Transient(format!("staging flush failed: {e}")))?;
        Ok(StagedUpload {
            path: self.path,
            bytes: self.bytes,
        })
    }

    /// Remove the partial file after a rejected or aborted upload.
    pub async fn abort(self) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove aborted upload");
        }
    }
}

/// Delete a staged file; called from the worker's cleanup stage regardless
/// of import outcome.
pub async fn remove_staged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove staged upload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_at_cap_succeeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = StagedUploadWriter::create(dir.path(), 10, 4096).await.unwrap();
        writer.append(b"0123456789").await.expect("exactly at cap");
        let staged = writer.finish().await.unwrap();
        assert_eq!(staged.bytes, 10);
        assert!(staged.path.exists());
    }

    #[tokio::test]
    async fn test_upload_over_cap_fails_with_quota() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = StagedUploadWriter::create(dir.path(), 10, 4096).await.unwrap();
        writer.append(b"0123456789").await.unwrap();

        let err = writer.append(b"x").await.expect_err("cap + 1 must fail");
        assert!(matches!(err, DomainError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn test_abort_removes_partial_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = StagedUploadWriter::create(dir.path(), 100, 4096).await.unwrap();
        writer.append(b"partial").await.unwrap();
        let path = writer.path.clone();
        writer.abort().await;
        assert!(!path.exists(), "aborted upload must be cleaned up");
    }

    #[tokio::test]
    async fn test_remove_staged_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("gone.upload");
        // Must not panic or log an error for an already-removed file.
        remove_staged(&missing).await;
    }
}
