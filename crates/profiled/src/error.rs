//! Error types shared across the profiled daemon.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("bind failed: {0}")]
    BindFailed(std::net::SocketAddr),
}
