use std::path::Path;
use std::time::Duration;

use crate::download::copy::{idle_timeout_copy, CopyOptions, ProgressFn};
use crate::error::CoreError;
use crate::models::syncing_file::open_sparse_file;
use crate::services::sync_service::EncryptionMode;

/// Opens the source image and reads its size (design document's
/// preparation phase for `CloneToFileWithEncryption`: resolving the source,
/// before any byte movement starts).
pub async fn open_clone_source(src_image: &Path) -> Result<(tokio::fs::File, u64), CoreError> {
    let src = tokio::fs::File::open(src_image).await?;
    let size_hint = src.metadata().await?.len();
    Ok((src, size_hint))
}

/// Copies an already-opened source image into a freshly allocated
/// destination. The actual cipher behind `encrypt`/`decrypt` is an external
/// collaborator's concern — this core only threads the mode through so the
/// caller's intent is preserved in logs; bytes are copied as-is.
pub async fn copy_clone(
    mut src: tokio::fs::File,
    dst_path: &Path,
    size_hint: u64,
    encryption: EncryptionMode,
    buffer_size: usize,
    idle_timeout: Duration,
    progress: ProgressFn,
) -> Result<u64, CoreError> {
    tracing::info!(
        dst = %dst_path.display(),
        ?encryption,
        "cloning backing image"
    );

    let mut dst = open_sparse_file(dst_path, size_hint).await?;
    let opts = CopyOptions {
        buffer_size,
        idle_timeout,
        write_zero: false,
    };
    let written = idle_timeout_copy(&mut src, &mut dst, &opts, Some(&progress)).await?;
    dst.set_len(written).await?;
    Ok(written)
}

/// Convenience wrapper combining both phases, for callers that don't need
/// the preparation deadline split.
pub async fn clone_to_file(
    src_image: &Path,
    dst_path: &Path,
    encryption: EncryptionMode,
    buffer_size: usize,
    idle_timeout: Duration,
    progress: ProgressFn,
) -> Result<u64, CoreError> {
    let (src, size_hint) = open_clone_source(src_image).await?;
    copy_clone(src, dst_path, size_hint, encryption, buffer_size, idle_timeout, progress).await
}
