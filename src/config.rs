use std::path::PathBuf;
use std::time::Duration;

/// Operator-tunable settings. Defaults mirror the fixed constants from the
/// design document (120s idle timeout, 4KiB copy buffer, 512-byte sector
/// alignment); every one of them can be overridden via environment variable.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub root_dir: PathBuf,
    pub idle_timeout: Duration,
    pub preparation_timeout: Duration,
    pub copy_buffer_bytes: usize,
    pub sector_size: u64,
    pub mock_download_size: u64,
    /// Reserved for the disabled auto-forget janitor — constructed but not
    /// spawned unless explicitly enabled.
    pub auto_forget_enabled: bool,
    pub auto_forget_interval: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            port: std::env::var("SYNC_HTTP_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            root_dir: PathBuf::from(
                std::env::var("SYNC_ROOT_DIR").unwrap_or_else(|_| "/data/backing-images".into()),
            ),
            idle_timeout: Duration::from_secs(
                std::env::var("SYNC_IDLE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(120),
            ),
            preparation_timeout: Duration::from_secs(
                std::env::var("SYNC_PREP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
            copy_buffer_bytes: std::env::var("SYNC_COPY_BUFFER_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4096),
            sector_size: std::env::var("SYNC_SECTOR_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(512),
            mock_download_size: std::env::var("SYNC_MOCK_DOWNLOAD_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4096),
            auto_forget_enabled: std::env::var("SYNC_AUTO_FORGET_ENABLED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            auto_forget_interval: Duration::from_secs(
                std::env::var("SYNC_AUTO_FORGET_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(24 * 60 * 60),
            ),
        }
    }

    /// `size` must be a multiple of the sector size; zero means "unknown".
    pub fn validate_size(&self, size: u64) -> Result<(), crate::error::CoreError> {
        if size % self.sector_size != 0 {
            return Err(crate::error::CoreError::InvalidArgument(format!(
                "size {size} is not a multiple of the sector size ({})",
                self.sector_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unaligned_size() {
        let cfg = AppConfig {
            sector_size: 512,
            ..AppConfig::from_env()
        };
        assert!(cfg.validate_size(4097).is_err());
        assert!(cfg.validate_size(4096).is_ok());
        assert!(cfg.validate_size(0).is_ok());
    }
}
