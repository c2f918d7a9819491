use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::download::copy::{idle_timeout_copy, CopyOptions};
use crate::download::handler::DownloadHandler;
use crate::error::CoreError;
use crate::models::syncing_file::{
    open_sparse_file, FileInfo, SyncingFile, SyncingFileSpec, SyncState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    Encrypt,
    Decrypt,
    Ignore,
}

/// The operation selected for a freshly registered entity (design document
/// section 4.2's operation table). Exactly one is legal per entity, and only
/// while the entity is `pending`.
pub enum SyncOperation {
    DownloadFromUrl {
        url: String,
    },
    Fetch {
        src_path: PathBuf,
    },
    Receive {
        port: u16,
    },
    CloneToFileWithEncryption {
        src_image: PathBuf,
        #[allow(dead_code)]
        src_uuid: String,
        #[allow(dead_code)]
        encryption: EncryptionMode,
        #[allow(dead_code)]
        credential: serde_json::Value,
    },
    RestoreFromBackupUrl {
        url: String,
        #[allow(dead_code)]
        credential: serde_json::Value,
        concurrency: usize,
    },
    /// The upload endpoint hands in the multipart field reader directly
    /// rather than a URL or path, since the bytes come from the HTTP request
    /// body itself.
    IdleTimeoutCopyToFile(Pin<Box<dyn AsyncRead + Send>>),
}

/// The outcome of the preparation phase (design document section 4.2): the
/// work needed to resolve a source and validate it before any byte
/// movement starts. Produced by `prepare_operation`, bounded by the
/// preparation deadline, and consumed by `execute_transfer`, which is not.
enum PreparedOp {
    DownloadFromUrl {
        url: String,
    },
    Fetch {
        src_path: PathBuf,
    },
    Receive {
        socket: TcpStream,
    },
    CloneToFileWithEncryption {
        src: tokio::fs::File,
        size_hint: u64,
        encryption: EncryptionMode,
    },
    RestoreFromBackupUrl {
        url: String,
        concurrency: usize,
    },
    IdleTimeoutCopyToFile(Pin<Box<dyn AsyncRead + Send>>),
}

/// Registry of active syncing files keyed by path and by UUID (design
/// document section 4.3), plus the HTTP-facing operations that drive them.
///
/// `gate` is the service lock from section 5: it protects only the two
/// index maps, is never held across I/O, and is always acquired before a
/// `SyncingFile`'s own lock — never the reverse.
pub struct SyncService {
    by_path: DashMap<PathBuf, Arc<SyncingFile>>,
    by_uuid: DashMap<String, Arc<SyncingFile>>,
    gate: RwLock<()>,
    pub config: Arc<AppConfig>,
    pub download_handler: Arc<dyn DownloadHandler>,
    /// Cancelled by `main.rs`'s shutdown signal. Raced against every
    /// background driver so a SIGINT/SIGTERM mid-transfer fails the entity
    /// instead of leaving it running against a dropped listener.
    shutdown: CancellationToken,
}

impl SyncService {
    pub fn new(
        config: Arc<AppConfig>,
        download_handler: Arc<dyn DownloadHandler>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            by_path: DashMap::new(),
            by_uuid: DashMap::new(),
            gate: RwLock::new(()),
            config,
            download_handler,
            shutdown,
        })
    }

    pub async fn list(&self) -> HashMap<String, FileInfo> {
        let _r = self.gate.read().await;
        let entities: Vec<Arc<SyncingFile>> =
            self.by_path.iter().map(|e| e.value().clone()).collect();
        drop(_r);

        let mut out = HashMap::with_capacity(entities.len());
        for entity in entities {
            let info = entity.snapshot().await;
            out.insert(info.file_path.to_string_lossy().into_owned(), info);
        }
        out
    }

    pub async fn get(&self, path: &Path) -> Result<FileInfo, CoreError> {
        let entity = self.lookup_by_path(path).await?;
        Ok(entity.snapshot().await)
    }

    async fn lookup_by_path(&self, path: &Path) -> Result<Arc<SyncingFile>, CoreError> {
        let _r = self.gate.read().await;
        self.by_path
            .get(path)
            .map(|e| e.value().clone())
            .ok_or_else(|| CoreError::NotFound(format!("no syncing file at {}", path.display())))
    }

    /// `checkAndInitSyncFile` from section 4.3: the only path that creates
    /// entities. Validates sector alignment, rejects duplicates on either
    /// key, inserts both index entries, and spawns the driver.
    pub async fn register(
        self: &Arc<Self>,
        spec: SyncingFileSpec,
        op: SyncOperation,
    ) -> Result<Arc<SyncingFile>, CoreError> {
        self.config.validate_size(spec.size)?;

        let entity = {
            let _w = self.gate.write().await;
            if self.by_path.contains_key(&spec.file_path) {
                return Err(CoreError::Conflict(format!(
                    "{} already registered",
                    spec.file_path.display()
                )));
            }
            if self.by_uuid.contains_key(&spec.uuid) {
                return Err(CoreError::Conflict(format!(
                    "uuid {} already registered",
                    spec.uuid
                )));
            }
            let entity = SyncingFile::new(spec);
            self.by_path.insert(entity.file_path.clone(), entity.clone());
            self.by_uuid.insert(entity.uuid.clone(), entity.clone());
            entity
        };

        self.clone().spawn_driver(entity.clone(), op);
        Ok(entity)
    }

    /// Cleanup with disk unlink (`Delete`) or without (`Forget`).
    pub async fn cleanup(&self, path: &Path, unlink: bool) -> Result<(), CoreError> {
        let file_path = {
            let _w = self.gate.write().await;
            let (_, entity) = self
                .by_path
                .remove(path)
                .ok_or_else(|| CoreError::NotFound(format!("no syncing file at {}", path.display())))?;
            self.by_uuid.remove(&entity.uuid);
            entity.file_path.clone()
        };

        if unlink {
            match tokio::fs::remove_file(&file_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CoreError::IoError(e.to_string())),
            }
        }
        Ok(())
    }

    /// Pushes a `ready` entity to a peer. Deliberately reads only a snapshot
    /// pointer under the service lock and releases it before touching the
    /// filesystem — the same race with a concurrent `Delete` the design
    /// document calls out in section 9's "Send endpoint racing with Delete"
    /// note. Reproduced as-is rather than strengthened (see DESIGN.md).
    pub async fn send_to_peer(&self, path: &Path, to_address: &str) -> Result<(), CoreError> {
        let entity = self.lookup_by_path(path).await?;
        if entity.state().await != SyncState::Ready {
            return Err(CoreError::InvalidArgument(
                "send-to-peer requires the entity to be ready".into(),
            ));
        }
        crate::peer::send_to_peer(&entity.file_path, to_address).await
    }

    /// Opens a `ready` file for streaming to an HTTP client. The route
    /// handler decides between the default gzip-compressed mode and the
    /// `forV2Creation=true` raw mode; this only enforces the "must be ready"
    /// precondition shared by both.
    pub async fn download_to_dst(&self, path: &Path) -> Result<(tokio::fs::File, u64, String), CoreError> {
        let entity = self.lookup_by_path(path).await?;
        if entity.state().await != SyncState::Ready {
            return Err(CoreError::Conflict(
                "only a ready file can be downloaded".into(),
            ));
        }
        let file = tokio::fs::File::open(&entity.file_path).await?;
        let metadata = file.metadata().await?;
        let name = entity
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "backing".into());
        Ok((file, metadata.len(), name))
    }

    /// Spawns the background driver that performs the reuse check and, if
    /// needed, the selected operation. Runs independently of the HTTP
    /// request that triggered `register` — the caller observes the result
    /// through `SyncingFile::wait_for_state_non_pending`.
    ///
    /// The preparation deadline is scoped to `prepare_operation` only —
    /// resolving the source and validating it before any byte movement
    /// starts. `execute_transfer` runs unbounded by it; once an entity
    /// enters `in-progress`, the idle-timeout copy pump inside each
    /// transfer is the sole timing authority (design document section
    /// 4.2), so a healthy multi-minute transfer is never killed just for
    /// outliving the 60s preparation window.
    fn spawn_driver(self: Arc<Self>, entity: Arc<SyncingFile>, op: SyncOperation) {
        tokio::spawn(async move {
            match entity.try_reuse().await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => {
                    entity.mark_failed(&e).await;
                    return;
                }
            }

            entity.mark_starting().await;
            let prep_timeout = self.config.preparation_timeout;
            let prepared = tokio::select! {
                result = tokio::time::timeout(prep_timeout, self.prepare_operation(&entity, op)) => {
                    match result {
                        Ok(Ok(prepared)) => prepared,
                        Ok(Err(e)) => {
                            entity.mark_failed(&e).await;
                            return;
                        }
                        Err(_) => {
                            entity.mark_failed(&CoreError::PreparationTimeout).await;
                            return;
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    entity.mark_failed(&CoreError::Cancelled).await;
                    return;
                }
            };

            tokio::select! {
                result = self.execute_transfer(&entity, prepared) => {
                    if let Err(e) = result {
                        entity.mark_failed(&e).await;
                    }
                }
                _ = self.shutdown.cancelled() => {
                    entity.mark_failed(&CoreError::Cancelled).await;
                }
            }
        });
    }

    /// Resolves and validates the selected operation's source — size
    /// discovery against a URL, waiting for a peer to connect, opening a
    /// local source image — without moving any bytes. Bounded by the
    /// preparation deadline in `spawn_driver`.
    async fn prepare_operation(&self, entity: &Arc<SyncingFile>, op: SyncOperation) -> Result<PreparedOp, CoreError> {
        match op {
            SyncOperation::DownloadFromUrl { url } => {
                let discovered = self.download_handler.size_of_url(&url).await?;
                if entity.size != 0 && discovered > 0 && discovered as u64 != entity.size {
                    return Err(CoreError::SourceError(format!(
                        "declared size {} disagrees with source-reported size {}",
                        entity.size, discovered
                    )));
                }
                Ok(PreparedOp::DownloadFromUrl { url })
            }

            SyncOperation::Fetch { src_path } => Ok(PreparedOp::Fetch { src_path }),

            SyncOperation::Receive { port } => {
                let socket = crate::peer::accept_peer_connection(port).await?;
                Ok(PreparedOp::Receive { socket })
            }

            SyncOperation::CloneToFileWithEncryption {
                src_image,
                src_uuid: _,
                encryption,
                credential: _,
            } => {
                let (src, size_hint) = crate::services::clone::open_clone_source(&src_image).await?;
                Ok(PreparedOp::CloneToFileWithEncryption {
                    src,
                    size_hint,
                    encryption,
                })
            }

            SyncOperation::RestoreFromBackupUrl {
                url,
                credential: _,
                concurrency,
            } => Ok(PreparedOp::RestoreFromBackupUrl { url, concurrency }),

            SyncOperation::IdleTimeoutCopyToFile(reader) => Ok(PreparedOp::IdleTimeoutCopyToFile(reader)),
        }
    }

    /// Moves bytes for a prepared operation, driving the entity through
    /// `in-progress` to post-transfer verification. Not wrapped in the
    /// preparation deadline — each branch's own idle-timeout copy pump (or,
    /// for `Fetch`, a local rename/copy with no remote party to stall) is
    /// the only thing that can make this hang.
    async fn execute_transfer(&self, entity: &Arc<SyncingFile>, prepared: PreparedOp) -> Result<(), CoreError> {
        match prepared {
            PreparedOp::DownloadFromUrl { url } => {
                entity.mark_in_progress().await;
                let written = self
                    .download_handler
                    .download_to_file(
                        &url,
                        &entity.file_path,
                        entity.size,
                        self.config.idle_timeout,
                        self.config.copy_buffer_bytes,
                        Some(entity.progress_callback()),
                    )
                    .await?;
                entity.verify_and_finish(written).await
            }

            PreparedOp::Fetch { src_path } => {
                entity.mark_in_progress().await;
                if let Some(parent) = entity.file_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                match tokio::fs::rename(&src_path, &entity.file_path).await {
                    Ok(()) => {}
                    Err(_) => {
                        tokio::fs::copy(&src_path, &entity.file_path).await?;
                    }
                }
                let metadata = tokio::fs::metadata(&entity.file_path).await?;
                entity.verify_and_finish(metadata.len()).await
            }

            PreparedOp::Receive { socket } => {
                entity.mark_in_progress().await;
                let written = crate::peer::copy_from_peer(
                    socket,
                    &entity.file_path,
                    entity.size,
                    self.config.idle_timeout,
                    self.config.copy_buffer_bytes,
                    entity.progress_callback(),
                )
                .await?;
                entity.verify_and_finish(written).await
            }

            PreparedOp::CloneToFileWithEncryption {
                src,
                size_hint,
                encryption,
            } => {
                entity.mark_in_progress().await;
                let written = crate::services::clone::copy_clone(
                    src,
                    &entity.file_path,
                    size_hint,
                    encryption,
                    self.config.copy_buffer_bytes,
                    self.config.idle_timeout,
                    entity.progress_callback(),
                )
                .await?;
                entity.verify_and_finish(written).await
            }

            PreparedOp::RestoreFromBackupUrl { url, concurrency } => {
                entity.mark_in_progress().await;
                let written = crate::services::backup_restore::restore_from_backup_url(
                    self.download_handler.as_ref(),
                    &url,
                    &entity.file_path,
                    entity.size,
                    concurrency,
                    self.config.idle_timeout,
                    self.config.copy_buffer_bytes,
                    entity.progress_callback(),
                )
                .await?;
                entity.verify_and_finish(written).await
            }

            PreparedOp::IdleTimeoutCopyToFile(mut reader) => {
                entity.mark_in_progress().await;
                let mut file = open_sparse_file(&entity.file_path, entity.size).await?;
                let opts = CopyOptions {
                    buffer_size: self.config.copy_buffer_bytes,
                    idle_timeout: self.config.idle_timeout,
                    write_zero: false,
                };
                let written =
                    idle_timeout_copy(&mut reader, &mut file, &opts, Some(&entity.progress_callback()))
                        .await?;
                file.set_len(written).await?;
                entity.verify_and_finish(written).await
            }
        }
    }

    /// Reserved auto-forget janitor (design document section 9: "Open
    /// question: whether this is intentional policy or a pending feature").
    /// Left as a stub that is constructed but never spawned unless
    /// `auto_forget_enabled` is set — see DESIGN.md.
    pub fn spawn_auto_forget_janitor(self: &Arc<Self>) {
        if !self.config.auto_forget_enabled {
            return;
        }
        let service = self.clone();
        let interval = self.config.auto_forget_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let entities: Vec<(PathBuf, Arc<SyncingFile>)> = {
                    let _r = service.gate.read().await;
                    service
                        .by_path
                        .iter()
                        .map(|e| (e.key().clone(), e.value().clone()))
                        .collect()
                };
                let mut stale = Vec::new();
                for (path, entity) in entities {
                    if matches!(entity.state().await, SyncState::Ready | SyncState::Failed) {
                        stale.push(path);
                    }
                }
                for path in stale {
                    if let Err(e) = service.cleanup(&path, false).await {
                        tracing::warn!(%e, path = %path.display(), "auto-forget cleanup failed");
                    }
                }
            }
        });
    }
}
