use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::error::CoreError;

/// Progress callback invoked with the cumulative byte count after every
/// successful write or sparse seek.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

pub struct CopyOptions {
    pub buffer_size: usize,
    pub idle_timeout: Duration,
    /// When false, an all-zero buffer is skipped (the writer is seeked
    /// forward instead of written to) to preserve sparseness.
    pub write_zero: bool,
}

/// Reader→writer pump with idle-timeout cancellation and sparse zero-block
/// skipping (design document section 4.4).
///
/// Each read is raced against an idle-timeout sleep with `tokio::select!` —
/// the Rust equivalent of the "timer goroutine watching a channel, reset on
/// every successful write" description: a read winning the race is exactly
/// one reset of the timer, and the timer winning is exactly the watchdog
/// firing. Progress callbacks are delivered in strictly increasing
/// byte-offset order because this loop makes no concurrent calls into the
/// writer or the progress callback.
pub async fn idle_timeout_copy<R, W>(
    reader: &mut R,
    writer: &mut W,
    opts: &CopyOptions,
    progress: Option<&ProgressFn>,
) -> Result<u64, CoreError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + AsyncSeek + Unpin,
{
    let mut buf = vec![0u8; opts.buffer_size.max(1)];
    let mut total: u64 = 0;

    loop {
        let read_result = tokio::select! {
            res = reader.read(&mut buf) => res,
            _ = tokio::time::sleep(opts.idle_timeout) => {
                return Err(CoreError::IdleTimeout);
            }
        };

        let n = read_result.map_err(|e| CoreError::IoError(e.to_string()))?;
        if n == 0 {
            break;
        }

        if !opts.write_zero && is_all_zero(&buf[..n]) {
            writer
                .seek(std::io::SeekFrom::Current(n as i64))
                .await
                .map_err(|e| CoreError::IoError(e.to_string()))?;
        } else {
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| CoreError::IoError(e.to_string()))?;
        }

        total += n as u64;
        if let Some(cb) = progress {
            cb(total);
        }
    }

    writer.flush().await.map_err(|e| CoreError::IoError(e.to_string()))?;
    Ok(total)
}

fn is_all_zero(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn copies_all_bytes() {
        let data = vec![0xAB; 10_000];
        let mut reader = Cursor::new(data.clone());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let mut file = tokio::fs::File::create(&path).await.unwrap();

        let opts = CopyOptions {
            buffer_size: 4096,
            idle_timeout: Duration::from_secs(5),
            write_zero: true,
        };
        let written = idle_timeout_copy(&mut reader, &mut file, &opts, None)
            .await
            .unwrap();
        assert_eq!(written, 10_000);

        let on_disk = tokio::fs::read(&path).await.unwrap();
        assert_eq!(on_disk, data);
    }

    #[tokio::test]
    async fn skips_zero_blocks_when_write_zero_false() {
        let mut data = vec![0u8; 8192];
        data[4096..4100].copy_from_slice(&[1, 2, 3, 4]);
        let mut reader = Cursor::new(data.clone());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse");
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .await
            .unwrap();
        file.set_len(8192).await.unwrap();

        let opts = CopyOptions {
            buffer_size: 4096,
            idle_timeout: Duration::from_secs(5),
            write_zero: false,
        };
        let written = idle_timeout_copy(&mut reader, &mut file, &opts, None)
            .await
            .unwrap();
        assert_eq!(written, 8192);

        let on_disk = tokio::fs::read(&path).await.unwrap();
        assert_eq!(on_disk, data);
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let data = vec![7u8; 9000];
        let mut reader = Cursor::new(data);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress");
        let mut file = tokio::fs::File::create(&path).await.unwrap();

        let last = Arc::new(AtomicU64::new(0));
        let last2 = last.clone();
        let cb: ProgressFn = Arc::new(move |processed| {
            let prev = last2.swap(processed, Ordering::SeqCst);
            assert!(processed >= prev);
        });

        let opts = CopyOptions {
            buffer_size: 4096,
            idle_timeout: Duration::from_secs(5),
            write_zero: true,
        };
        let written = idle_timeout_copy(&mut reader, &mut file, &opts, Some(&cb))
            .await
            .unwrap();
        assert_eq!(written, 9000);
        assert_eq!(last.load(Ordering::SeqCst), 9000);
    }

    #[tokio::test]
    async fn idle_timeout_fires_when_reader_stalls() {
        struct StallReader;
        impl AsyncRead for StallReader {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Pending
            }
        }

        let mut reader = StallReader;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stalled");
        let mut file = tokio::fs::File::create(&path).await.unwrap();

        let opts = CopyOptions {
            buffer_size: 4096,
            idle_timeout: Duration::from_millis(30),
            write_zero: true,
        };
        let result = idle_timeout_copy(&mut reader, &mut file, &opts, None).await;
        assert!(matches!(result, Err(CoreError::IdleTimeout)));
    }
}
