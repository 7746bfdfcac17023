use thiserror::Error;
use uuid::Uuid;

use crate::Status;

pub type DubResult<T> = Result<T, DubError>;

#[derive(Debug, Error)]
pub enum DubError {
    #[error("Video not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid file format: {0}. Allowed formats: mp4, avi, mov, mkv, webm")]
    InvalidFormat(String),

    #[error("Upload exceeds the maximum size of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("Video {id} cannot be dubbed while {status}")]
    InvalidState { id: Uuid, status: Status },

    #[error("Dubbing is already in progress for video {0}")]
    AlreadyInProgress(Uuid),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DubError {
    /// Wraps a failure of the incoming byte stream as an I/O error.
    pub fn stream<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        DubError::Io(std::io::Error::other(err))
    }
}
