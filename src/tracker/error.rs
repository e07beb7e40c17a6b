use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    /// The tracker's `failure reason` string. Permanently disables the
    /// tracker for this session.
    #[error("tracker refused announce: {0}")]
    Failure(String),

    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("every tracker failed or is disabled")]
    Exhausted,
}
