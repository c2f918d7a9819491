use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::SyncService;

/// Shared application state. The Sync Service owns the registry; the
/// Syncing File entities inside it hold no back-reference to this struct
/// (design document section 9), only to the download handler capability
/// they were constructed with.
pub struct AppState {
    pub sync_service: Arc<SyncService>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(sync_service: Arc<SyncService>, config: Arc<AppConfig>) -> Self {
        Self { sync_service, config }
    }
}
