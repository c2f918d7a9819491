use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};

use crate::error::CoreError;

/// Lifecycle states from the design document's state machine. Serialized as
/// the lower/hyphen-case strings the HTTP surface is specified to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    Pending,
    Starting,
    InProgress,
    Ready,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Raw,
    Qcow2,
}

impl Default for FileType {
    fn default() -> Self {
        FileType::Raw
    }
}

/// Immutable identity plus the construction-time parameters supplied by the
/// registering caller (design document section 3).
#[derive(Debug, Clone)]
pub struct SyncingFileSpec {
    pub file_path: PathBuf,
    pub uuid: String,
    pub disk_uuid: String,
    pub expected_checksum: String,
    pub size: u64,
    pub file_type: FileType,
}

/// The mutable attributes guarded by the per-entity lock (design document
/// section 5: "never acquired while holding the service lock").
#[derive(Debug, Clone)]
struct MutableState {
    current_checksum: String,
    processed_size: u64,
    state: SyncState,
    message: String,
    modification_time: DateTime<Utc>,
}

/// JSON projection returned by the HTTP control surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub file_path: PathBuf,
    pub uuid: String,
    pub disk_uuid: String,
    pub expected_checksum: String,
    pub current_checksum: String,
    pub size: u64,
    pub processed_size: u64,
    pub progress: u32,
    pub state: SyncState,
    pub message: String,
    pub modification_time: DateTime<Utc>,
    pub file_type: FileType,
}

/// The central per-file entity. Holds a back-reference to nothing but its
/// own identity and mutable state — per the design document's note that a
/// `SyncingFile` must not hold a reference back to the owning service, only
/// to capability objects (the download handler) it was constructed with.
pub struct SyncingFile {
    pub file_path: PathBuf,
    pub uuid: String,
    pub disk_uuid: String,
    pub expected_checksum: String,
    pub size: u64,
    pub file_type: FileType,
    inner: RwLock<MutableState>,
    /// Bumped by the progress callback; read without locking for the
    /// common case of polling processed bytes from another task.
    processed_hint: AtomicU64,
    not_pending: Notify,
}

impl SyncingFile {
    pub fn new(spec: SyncingFileSpec) -> Arc<Self> {
        Arc::new(Self {
            file_path: spec.file_path,
            uuid: spec.uuid,
            disk_uuid: spec.disk_uuid,
            expected_checksum: spec.expected_checksum,
            size: spec.size,
            file_type: spec.file_type,
            inner: RwLock::new(MutableState {
                current_checksum: String::new(),
                processed_size: 0,
                state: SyncState::Pending,
                message: String::new(),
                modification_time: Utc::now(),
            }),
            processed_hint: AtomicU64::new(0),
            not_pending: Notify::new(),
        })
    }

    pub async fn snapshot(&self) -> FileInfo {
        let s = self.inner.read().await;
        FileInfo {
            file_path: self.file_path.clone(),
            uuid: self.uuid.clone(),
            disk_uuid: self.disk_uuid.clone(),
            expected_checksum: self.expected_checksum.clone(),
            current_checksum: s.current_checksum.clone(),
            size: self.size,
            processed_size: s.processed_size,
            progress: progress_percent(s.processed_size, self.size),
            state: s.state,
            message: s.message.clone(),
            modification_time: s.modification_time,
            file_type: self.file_type,
        }
    }

    pub async fn state(&self) -> SyncState {
        self.inner.read().await.state
    }

    /// Transition the entity and notify `wait_for_state_non_pending` waiters.
    async fn set_state(&self, state: SyncState, message: impl Into<String>) {
        let mut s = self.inner.write().await;
        s.state = state;
        s.message = message.into();
        s.modification_time = Utc::now();
        if state != SyncState::Pending {
            drop(s);
            self.not_pending.notify_waiters();
        }
    }

    pub async fn mark_starting(&self) {
        self.set_state(SyncState::Starting, "").await;
    }

    pub async fn mark_in_progress(&self) {
        self.set_state(SyncState::InProgress, "").await;
    }

    /// Marks the entity `ready`. Sets `processed_size` to the full size so a
    /// `ready` entity always reports `progress = 100`, independent of
    /// whether every `record_progress` tick along the way landed its
    /// best-effort `try_write` (design document section 4.2: `ready` implies
    /// the file is fully materialized).
    pub async fn mark_ready(&self, checksum: String) {
        let mut s = self.inner.write().await;
        s.current_checksum = checksum;
        if self.size != 0 {
            s.processed_size = self.size;
        }
        s.state = SyncState::Ready;
        s.message.clear();
        s.modification_time = Utc::now();
        drop(s);
        self.not_pending.notify_waiters();
        self.processed_hint.fetch_max(self.size, Ordering::SeqCst);
    }

    pub async fn mark_failed(&self, err: &CoreError) {
        tracing::warn!(file_path = %self.file_path.display(), uuid = %self.uuid, error = %err, "syncing file failed");
        self.set_state(SyncState::Failed, err.to_string()).await;
    }

    /// Progress callback target for the idle-timeout copy pump: byte offsets
    /// must arrive in strictly non-decreasing order (design document
    /// section 4.4's ordering guarantee) — enforced here with `fetch_max`.
    pub fn record_progress(&self, processed: u64) {
        self.processed_hint.fetch_max(processed, Ordering::SeqCst);
        // `inner.processed_size` is the value surfaced by `snapshot`; keep it
        // in a best-effort try_write so the hot copy loop never blocks on the
        // service-facing read lock.
        if let Ok(mut s) = self.inner.try_write() {
            if processed > s.processed_size {
                s.processed_size = processed;
            }
        }
    }

    pub fn progress_callback(self: &Arc<Self>) -> Arc<dyn Fn(u64) + Send + Sync> {
        let this = self.clone();
        Arc::new(move |processed| this.record_progress(processed))
    }

    /// Blocks until the entity leaves `pending`, or fails with
    /// `PreparationTimeout` after `deadline`. Used by the HTTP dispatch
    /// layer so a register call can observe a well-defined state before
    /// replying (design document section 4.2).
    pub async fn wait_for_state_non_pending(
        &self,
        deadline: std::time::Duration,
    ) -> Result<SyncState, CoreError> {
        loop {
            let current = self.state().await;
            if current != SyncState::Pending {
                return Ok(current);
            }
            let notified = self.not_pending.notified();
            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep(deadline) => {
                    // Re-check once more in case of a race between the
                    // notification and the timer.
                    let current = self.state().await;
                    if current != SyncState::Pending {
                        return Ok(current);
                    }
                    return Err(CoreError::PreparationTimeout);
                }
            }
        }
    }

    /// The reuse-check optimization (design document section 4.2): if a
    /// file already exists at `file_path`, has the expected length, and
    /// (when supplied) the expected checksum, skip transfer entirely.
    pub async fn try_reuse(&self) -> Result<bool, CoreError> {
        let path = self.file_path.clone();
        let expected_size = self.size;
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(_) => return Ok(false),
        };
        if expected_size != 0 && metadata.len() != expected_size {
            return Ok(false);
        }
        if metadata.len() == 0 {
            return Ok(false);
        }
        let checksum = crate::checksum::sha512_file(&path).await?;
        if !self.expected_checksum.is_empty() && checksum != self.expected_checksum {
            return Ok(false);
        }
        self.mark_ready(checksum).await;
        Ok(true)
    }

    /// Post-transfer verification (design document section 4.2): truncate to
    /// the actual byte count, compute SHA-512, compare against the expected
    /// checksum if one was supplied, and transition to `ready`/`failed`.
    pub async fn verify_and_finish(&self, bytes_written: u64) -> Result<(), CoreError> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.file_path)
            .await?;
        file.set_len(bytes_written).await?;
        drop(file);

        if self.size != 0 && bytes_written != self.size {
            let err = CoreError::SizeMismatch {
                expected: self.size,
                actual: bytes_written,
            };
            self.mark_failed(&err).await;
            return Err(err);
        }

        let checksum = crate::checksum::sha512_file(&self.file_path).await?;
        if !self.expected_checksum.is_empty() && checksum != self.expected_checksum {
            let err = CoreError::ChecksumMismatch {
                expected: self.expected_checksum.clone(),
                actual: checksum,
            };
            self.mark_failed(&err).await;
            return Err(err);
        }

        self.mark_ready(checksum).await;
        Ok(())
    }
}

fn progress_percent(processed: u64, size: u64) -> u32 {
    if size == 0 {
        return 0;
    }
    let pct = (processed.saturating_mul(100) / size).min(100);
    pct as u32
}

/// Create (or truncate) the destination file and pre-size it to `size`
/// bytes. On filesystems that support sparse files this allocates no real
/// blocks for the hole, matching the assumption the idle-timeout copy
/// pump's zero-skip behavior relies on.
pub async fn open_sparse_file(path: &Path, size: u64) -> Result<tokio::fs::File, CoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    if size > 0 {
        file.set_len(size).await?;
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(size: u64, expected_checksum: &str) -> SyncingFileSpec {
        SyncingFileSpec {
            file_path: PathBuf::from("/tmp/does-not-matter"),
            uuid: "uuid1".into(),
            disk_uuid: "disk1".into(),
            expected_checksum: expected_checksum.into(),
            size,
            file_type: FileType::Raw,
        }
    }

    #[test]
    fn progress_percent_bounds() {
        assert_eq!(progress_percent(0, 0), 0);
        assert_eq!(progress_percent(50, 100), 50);
        assert_eq!(progress_percent(150, 100), 100);
        assert_eq!(progress_percent(0, 100), 0);
    }

    #[tokio::test]
    async fn new_entity_starts_pending() {
        let file = SyncingFile::new(spec(4096, ""));
        assert_eq!(file.state().await, SyncState::Pending);
        let info = file.snapshot().await;
        assert_eq!(info.progress, 0);
        assert!(info.message.is_empty());
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_bounded() {
        let file = SyncingFile::new(spec(1000, ""));
        file.record_progress(100);
        file.record_progress(50); // out-of-order update must not regress
        file.record_progress(2000); // must not exceed size in reported progress
        let info = file.snapshot().await;
        assert_eq!(info.progress, 100);
        assert!(info.processed_size >= 100);
    }

    #[tokio::test]
    async fn wait_for_state_non_pending_times_out() {
        let file = SyncingFile::new(spec(4096, ""));
        let result = file
            .wait_for_state_non_pending(std::time::Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(CoreError::PreparationTimeout)));
    }

    #[tokio::test]
    async fn wait_for_state_non_pending_observes_transition() {
        let file = SyncingFile::new(spec(4096, ""));
        let waiter = file.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_state_non_pending(std::time::Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        file.mark_starting().await;
        let result = handle.await.unwrap();
        assert_eq!(result.unwrap(), SyncState::Starting);
    }
}
