use thiserror::Error;

/// Error taxonomy for the block-device stack.
///
/// `BytesNotAvailable` is the signal the cache uses to tell the Chunker a
/// fetch is needed; it must never escape the full stack unless something
/// upstream is badly misconfigured.
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("bytes not available in cache")]
    BytesNotAvailable,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("read past end of device or mapping")]
    Eof,

    #[error("malformed build header: {0}")]
    HeaderMalformed(String),
}

impl BlockDeviceError {
    pub fn is_bytes_not_available(&self) -> bool {
        matches!(self, BlockDeviceError::BytesNotAvailable)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BlockDeviceError::Cancelled)
    }
}

// `std::io::Error` isn't `Clone`, so this is hand-rolled rather than
// derived; needed so multiple waiters on the same in-flight chunk fetch can
// each observe the one error the owning task recorded.
impl Clone for BlockDeviceError {
    fn clone(&self) -> Self {
        match self {
            BlockDeviceError::BytesNotAvailable => BlockDeviceError::BytesNotAvailable,
            BlockDeviceError::Io(e) => BlockDeviceError::Io(std::io::Error::new(e.kind(), e.to_string())),
            BlockDeviceError::Cancelled => BlockDeviceError::Cancelled,
            BlockDeviceError::Eof => BlockDeviceError::Eof,
            BlockDeviceError::HeaderMalformed(s) => BlockDeviceError::HeaderMalformed(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BlockDeviceError>;
