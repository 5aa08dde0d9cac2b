use std::str::Utf8Error;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BlobError>;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Caller misuse: the requested operation is not defined for the
    /// content variant the blob currently holds.
    #[error("operation `{op}` is not supported for {kind} content")]
    Unsupported {
        op: &'static str,
        kind: &'static str,
    },
    #[error("Codec error: {0}")]
    Codec(String),
    /// Allocation failure during decode or pixel manipulation. Kept
    /// separate from `Codec` so callers can run the cache-clear
    /// recovery path on this kind only.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BlobError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, BlobError::OutOfMemory(_))
    }
}

impl From<Utf8Error> for BlobError {
    fn from(err: Utf8Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<image::ImageError> for BlobError {
    fn from(err: image::ImageError) -> Self {
        match err {
            // The decoder reports exceeded allocation limits through
            // its `Limits` kind; everything else is a plain codec
            // failure.
            image::ImageError::Limits(err) => {
                Self::OutOfMemory(err.to_string())
            }
            other => Self::Codec(other.to_string()),
        }
    }
}
