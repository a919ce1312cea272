use std::path::{Path, PathBuf};

use axum::extract::multipart::Field;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::AppError;

const FALLBACK_FILE_NAME: &str = "video";
pub(super) const UPLOAD_STORAGE_FAILED: &str = "failed to store uploaded video";

/// Streams one multipart field to `<uploads_dir>/<process_id>_<name>`.
/// A partially written file is removed when the stream fails.
pub(super) async fn store_video_field(
    uploads_dir: &Path,
    process_id: &str,
    field: Field<'_>,
) -> Result<PathBuf, AppError> {
    let file_name = sanitize_file_name(field.file_name());
    let path = uploads_dir.join(format!("{process_id}_{file_name}"));

    match write_field(&path, field).await {
        Ok(bytes) => {
            debug!(process_id, path = %path.display(), bytes, "Stored uploaded video");
            Ok(path)
        }
        Err(err) => {
            if let Err(remove_err) = tokio::fs::remove_file(&path).await {
                if remove_err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        path = %path.display(),
                        error = %remove_err,
                        "Failed to remove partial upload"
                    );
                }
            }
            Err(err)
        }
    }
}

async fn write_field(path: &Path, mut field: Field<'_>) -> Result<u64, AppError> {
    let mut file = File::create(path)
        .await
        .map_err(|e| storage_error(path, "create", e))?;

    let mut written = 0u64;
    while let Some(chunk) = field.chunk().await? {
        file.write_all(&chunk)
            .await
            .map_err(|e| storage_error(path, "write", e))?;
        written += chunk.len() as u64;
    }

    file.flush()
        .await
        .map_err(|e| storage_error(path, "flush", e))?;

    Ok(written)
}

/// The server path stays in the log; clients only see a generic detail.
fn storage_error(path: &Path, action: &str, err: std::io::Error) -> AppError {
    warn!(path = %path.display(), action, error = %err, "Upload storage failed");
    AppError::Internal(UPLOAD_STORAGE_FAILED.to_string())
}

/// Keeps only the last path component of a client-supplied file name.
pub(super) fn sanitize_file_name(raw: Option<&str>) -> String {
    let candidate = raw
        .unwrap_or_default()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|ch| !ch.is_control())
        .collect::<String>();
    let candidate = candidate.trim();

    if candidate.is_empty() || candidate == "." || candidate == ".." {
        FALLBACK_FILE_NAME.to_string()
    } else {
        candidate.to_string()
    }
}
