use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::download::copy::{idle_timeout_copy, CopyOptions, ProgressFn};
use crate::error::CoreError;
use crate::models::syncing_file::open_sparse_file;

/// Thin peer-to-peer adapters (design document section 4.2's `Receive`/
/// `Send` operations and the standalone Peer Sender component). The actual
/// sparse-transfer wire protocol is delegated to an external library and is
/// explicitly out of scope here; this module moves raw bytes over a plain
/// TCP stream as a stand-in framing.
///
/// The preparation phase (binding the listener and waiting for the peer to
/// connect) is split from the byte-moving phase so a caller can bound only
/// the former with the preparation deadline, leaving the idle-timeout copy
/// pump as the sole timing authority once the connection is accepted
/// (design document section 4.2).
pub async fn accept_peer_connection(port: u16) -> Result<TcpStream, CoreError> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| CoreError::SourceError(format!("bind peer port {port}: {e}")))?;
    let (socket, peer_addr) = listener
        .accept()
        .await
        .map_err(|e| CoreError::SourceError(format!("accept on port {port}: {e}")))?;
    tracing::info!(%peer_addr, port, "accepted peer send connection");
    Ok(socket)
}

/// Copies the inbound byte stream from an already-accepted peer connection
/// into `dest_path` through the idle-timeout copy pump.
pub async fn copy_from_peer(
    mut socket: TcpStream,
    dest_path: &Path,
    size_hint: u64,
    idle_timeout: Duration,
    buffer_size: usize,
    progress: ProgressFn,
) -> Result<u64, CoreError> {
    let mut file = open_sparse_file(dest_path, size_hint).await?;
    let opts = CopyOptions {
        buffer_size,
        idle_timeout,
        write_zero: false,
    };
    let written = idle_timeout_copy(&mut socket, &mut file, &opts, Some(&progress)).await?;
    file.set_len(written).await?;
    Ok(written)
}

/// Convenience wrapper combining both phases, used directly by callers (and
/// tests) that don't need the preparation deadline split.
pub async fn receive_from_peer(
    port: u16,
    dest_path: &Path,
    size_hint: u64,
    idle_timeout: Duration,
    buffer_size: usize,
    progress: ProgressFn,
) -> Result<u64, CoreError> {
    let socket = accept_peer_connection(port).await?;
    copy_from_peer(socket, dest_path, size_hint, idle_timeout, buffer_size, progress).await
}

/// Pushes a completed file to another node's receiver endpoint. `to_address`
/// is `host:port` of the peer's `Receive` listener.
pub async fn send_to_peer(file_path: &Path, to_address: &str) -> Result<(), CoreError> {
    let mut file = tokio::fs::File::open(file_path).await?;
    let mut socket = TcpStream::connect(to_address)
        .await
        .map_err(|e| CoreError::SourceError(format!("connect to peer {to_address}: {e}")))?;
    tokio::io::copy(&mut file, &mut socket)
        .await
        .map_err(|e| CoreError::IoError(e.to_string()))?;
    socket.flush().await.map_err(|e| CoreError::IoError(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn receive_from_peer_writes_sent_bytes() {
        let port = 18372;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("received");

        let received_total = Arc::new(AtomicU64::new(0));
        let progress_total = received_total.clone();
        let progress: ProgressFn = Arc::new(move |n| {
            progress_total.store(n, Ordering::SeqCst);
        });

        let dest_clone = dest.clone();
        let server = tokio::spawn(async move {
            receive_from_peer(port, &dest_clone, 4096, Duration::from_secs(5), 1024, progress).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let payload = vec![0x5Au8; 4096];
        let payload_path = dir.path().join("payload");
        tokio::fs::write(&payload_path, &payload).await.unwrap();
        send_to_peer(&payload_path, &format!("127.0.0.1:{port}"))
            .await
            .unwrap();

        let written = server.await.unwrap().unwrap();
        assert_eq!(written, 4096);
        let on_disk = tokio::fs::read(&dest).await.unwrap();
        assert_eq!(on_disk, payload);
        assert_eq!(received_total.load(Ordering::SeqCst), 4096);
    }
}
