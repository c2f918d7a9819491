pub mod copy;
pub mod handler;

pub use handler::{DownloadHandler, HttpDownloadHandler, MockDownloadHandler};
