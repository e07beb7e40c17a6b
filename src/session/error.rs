use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("tracker error: {0}")]
    Tracker(#[from] crate::tracker::TrackerError),

    #[error("session is shut down")]
    Closed,
}
