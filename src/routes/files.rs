use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Multipart, Path as AxumPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::error::CoreError;
use crate::models::syncing_file::{FileInfo, FileType, SyncingFileSpec};
use crate::services::sync_service::{EncryptionMode, SyncOperation};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_files))
        .route("/fetch", post(fetch))
        .route("/download-from-url", post(download_from_url))
        .route("/upload", post(upload))
        .route("/receive-from-peer", post(receive_from_peer))
        .route("/clone", post(clone_file))
        .route("/restore-from-backup-url", post(restore_from_backup_url))
        .route("/{id}", get(get_file).delete(delete_file))
        .route("/{id}/forget", delete(forget_file))
        .route("/{id}/send-to-peer", post(send_to_peer))
        .route(
            "/{id}/download",
            get(download_file).head(download_file),
        )
}

fn decode_path(id: &str) -> PathBuf {
    PathBuf::from(id)
}

fn default_expected_checksum() -> String {
    String::new()
}

fn default_size() -> u64 {
    0
}

fn default_file_type() -> FileType {
    FileType::Raw
}

async fn list_files(State(state): State<Arc<AppState>>) -> Json<std::collections::HashMap<String, FileInfo>> {
    Json(state.sync_service.list().await)
}

async fn get_file(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<FileInfo>, CoreError> {
    let path = decode_path(&id);
    Ok(Json(state.sync_service.get(&path).await?))
}

async fn delete_file(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<StatusCode, CoreError> {
    let path = decode_path(&id);
    state.sync_service.cleanup(&path, true).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn forget_file(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<StatusCode, CoreError> {
    let path = decode_path(&id);
    state.sync_service.cleanup(&path, false).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Registers the entity and blocks (bounded by the preparation deadline)
/// until it leaves `pending`, then returns the resulting snapshot — the
/// HTTP dispatch pattern described in design document section 4.2's
/// `WaitForStateNonPending`.
async fn register_and_wait(
    state: &Arc<AppState>,
    spec: SyncingFileSpec,
    op: SyncOperation,
) -> Result<Json<FileInfo>, CoreError> {
    let entity = state.sync_service.register(spec, op).await?;
    entity
        .wait_for_state_non_pending(state.config.preparation_timeout)
        .await?;
    Ok(Json(entity.snapshot().await))
}

#[derive(Deserialize)]
struct FetchQuery {
    #[serde(rename = "src-file-path")]
    src_file_path: String,
    #[serde(rename = "dst-file-path")]
    dst_file_path: String,
    uuid: String,
    #[serde(rename = "disk-uuid")]
    disk_uuid: String,
    #[serde(rename = "expected-checksum", default = "default_expected_checksum")]
    expected_checksum: String,
    #[serde(default = "default_size")]
    size: u64,
}

async fn fetch(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FetchQuery>,
) -> Result<Json<FileInfo>, CoreError> {
    let spec = SyncingFileSpec {
        file_path: PathBuf::from(q.dst_file_path),
        uuid: q.uuid,
        disk_uuid: q.disk_uuid,
        expected_checksum: q.expected_checksum,
        size: q.size,
        file_type: FileType::Raw,
    };
    let op = SyncOperation::Fetch {
        src_path: PathBuf::from(q.src_file_path),
    };
    register_and_wait(&state, spec, op).await
}

#[derive(Deserialize)]
struct DownloadFromUrlQuery {
    #[serde(rename = "file-path")]
    file_path: String,
    uuid: String,
    url: String,
    #[serde(rename = "disk-uuid")]
    disk_uuid: String,
    #[serde(rename = "expected-checksum", default = "default_expected_checksum")]
    expected_checksum: String,
    #[serde(default = "default_size")]
    size: u64,
    #[serde(rename = "data-engine", default)]
    #[allow(dead_code)]
    data_engine: Option<String>,
}

async fn download_from_url(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DownloadFromUrlQuery>,
) -> Result<Json<FileInfo>, CoreError> {
    let spec = SyncingFileSpec {
        file_path: PathBuf::from(q.file_path),
        uuid: q.uuid,
        disk_uuid: q.disk_uuid,
        expected_checksum: q.expected_checksum,
        size: q.size,
        file_type: FileType::Raw,
    };
    let op = SyncOperation::DownloadFromUrl { url: q.url };
    register_and_wait(&state, spec, op).await
}

#[derive(Deserialize)]
struct UploadQuery {
    #[serde(rename = "file-path")]
    file_path: String,
    uuid: String,
    #[serde(rename = "disk-uuid")]
    disk_uuid: String,
    #[serde(rename = "expected-checksum", default = "default_expected_checksum")]
    expected_checksum: String,
    #[serde(default = "default_size")]
    size: u64,
    #[serde(rename = "data-engine", default)]
    #[allow(dead_code)]
    data_engine: Option<String>,
}

/// `multipart/form-data` upload with field name `chunk`. The field's byte
/// stream is handed directly to the driver as an `AsyncRead`, so the
/// idle-timeout copy pump applies the same backpressure and sparse-skip
/// behavior as every other transfer source.
async fn upload(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<Json<FileInfo>, CoreError> {
    let mut chunk_reader: Option<std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| CoreError::InvalidArgument(format!("malformed multipart body: {e}")))?
    {
        if field.name() == Some("chunk") {
            let stream = field.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
            chunk_reader = Some(Box::pin(tokio_util::io::StreamReader::new(stream)));
            break;
        }
    }
    let reader = chunk_reader
        .ok_or_else(|| CoreError::InvalidArgument("missing multipart field 'chunk'".into()))?;

    let spec = SyncingFileSpec {
        file_path: PathBuf::from(q.file_path),
        uuid: q.uuid,
        disk_uuid: q.disk_uuid,
        expected_checksum: q.expected_checksum,
        size: q.size,
        file_type: FileType::Raw,
    };
    let op = SyncOperation::IdleTimeoutCopyToFile(reader);
    register_and_wait(&state, spec, op).await
}

#[derive(Deserialize)]
struct ReceiveFromPeerQuery {
    #[serde(rename = "file-path")]
    file_path: String,
    uuid: String,
    #[serde(rename = "disk-uuid")]
    disk_uuid: String,
    #[serde(rename = "expected-checksum", default = "default_expected_checksum")]
    expected_checksum: String,
    #[serde(default = "default_size")]
    size: u64,
    port: u16,
    #[serde(rename = "file-type", default = "default_file_type")]
    file_type: FileType,
}

async fn receive_from_peer(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ReceiveFromPeerQuery>,
) -> Result<Json<FileInfo>, CoreError> {
    let spec = SyncingFileSpec {
        file_path: PathBuf::from(q.file_path),
        uuid: q.uuid,
        disk_uuid: q.disk_uuid,
        expected_checksum: q.expected_checksum,
        size: q.size,
        file_type: q.file_type,
    };
    let op = SyncOperation::Receive { port: q.port };
    register_and_wait(&state, spec, op).await
}

#[derive(Deserialize)]
struct SendToPeerQuery {
    #[serde(rename = "to-address")]
    to_address: String,
}

async fn send_to_peer(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(q): Query<SendToPeerQuery>,
) -> Result<StatusCode, CoreError> {
    let path = decode_path(&id);
    state.sync_service.send_to_peer(&path, &q.to_address).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct CloneQuery {
    #[serde(rename = "file-path")]
    file_path: String,
    uuid: String,
    #[serde(rename = "disk-uuid")]
    disk_uuid: String,
    #[serde(rename = "expected-checksum", default = "default_expected_checksum")]
    expected_checksum: String,
    #[serde(default = "default_size")]
    size: u64,
    #[serde(rename = "backing-image")]
    backing_image: String,
    #[serde(rename = "backing-image-uuid")]
    backing_image_uuid: String,
    encryption: EncryptionMode,
}

async fn clone_file(
    State(state): State<Arc<AppState>>,
    Query(q): Query<CloneQuery>,
    body: axum::body::Bytes,
) -> Result<Json<FileInfo>, CoreError> {
    let credential = parse_credential_body(&body)?;
    let spec = SyncingFileSpec {
        file_path: PathBuf::from(q.file_path),
        uuid: q.uuid,
        disk_uuid: q.disk_uuid,
        expected_checksum: q.expected_checksum,
        size: q.size,
        file_type: FileType::Raw,
    };
    let op = SyncOperation::CloneToFileWithEncryption {
        src_image: PathBuf::from(q.backing_image),
        src_uuid: q.backing_image_uuid,
        encryption: q.encryption,
        credential,
    };
    register_and_wait(&state, spec, op).await
}

#[derive(Deserialize)]
struct RestoreFromBackupUrlQuery {
    #[serde(rename = "file-path")]
    file_path: String,
    uuid: String,
    #[serde(rename = "disk-uuid")]
    disk_uuid: String,
    #[serde(rename = "expected-checksum", default = "default_expected_checksum")]
    expected_checksum: String,
    #[serde(default = "default_size")]
    size: u64,
    #[serde(rename = "backup-url")]
    backup_url: String,
    #[serde(rename = "concurrent-limit")]
    concurrent_limit: usize,
}

async fn restore_from_backup_url(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RestoreFromBackupUrlQuery>,
    body: axum::body::Bytes,
) -> Result<Json<FileInfo>, CoreError> {
    let credential = parse_credential_body(&body)?;
    let spec = SyncingFileSpec {
        file_path: PathBuf::from(q.file_path),
        uuid: q.uuid,
        disk_uuid: q.disk_uuid,
        expected_checksum: q.expected_checksum,
        size: q.size,
        file_type: FileType::Raw,
    };
    let op = SyncOperation::RestoreFromBackupUrl {
        url: q.backup_url,
        credential,
        concurrency: q.concurrent_limit,
    };
    register_and_wait(&state, spec, op).await
}

fn parse_credential_body(body: &[u8]) -> Result<serde_json::Value, CoreError> {
    if body.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_slice(body)
        .map_err(|e| CoreError::InvalidArgument(format!("malformed credential JSON: {e}")))
}

#[derive(Deserialize, Default)]
struct DownloadQuery {
    #[serde(rename = "forV2Creation", default)]
    for_v2_creation: bool,
}

async fn download_file(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(q): Query<DownloadQuery>,
) -> Result<Response, CoreError> {
    let path = decode_path(&id);
    let (file, len, name) = state.sync_service.download_to_dst(&path).await?;

    if q.for_v2_creation {
        let stream = ReaderStream::new(file);
        let body = Body::from_stream(stream);
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, len.into());
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/octet-stream"),
        );
        Ok((headers, body).into_response())
    } else {
        let encoder = async_compression::tokio::bufread::GzipEncoder::new(tokio::io::BufReader::new(file));
        let stream = ReaderStream::new(encoder);
        let body = Body::from_stream(stream);
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, header::HeaderValue::from_static("gzip"));
        headers.insert(
            header::CONTENT_DISPOSITION,
            header::HeaderValue::from_str(&format!("attachment; filename=\"{name}.gz\""))
                .unwrap_or_else(|_| header::HeaderValue::from_static("attachment")),
        );
        Ok((headers, body).into_response())
    }
}
