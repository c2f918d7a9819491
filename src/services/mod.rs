pub mod backup_restore;
pub mod clone;
pub mod sync_service;

pub use sync_service::{EncryptionMode, SyncOperation, SyncService};
