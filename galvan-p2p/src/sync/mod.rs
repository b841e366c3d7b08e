//! Chain synchronization: anti-DoS headers sync and block download
//! scheduling.

pub mod blocks;
pub mod headers;

pub use blocks::BlockDownloader;
pub use headers::{HeadersProcessResult, HeadersSyncPhase, HeadersSyncState};
