use cipher::InvalidLength;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Identifies which container a corrupt header belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    Gamecard,
    HashFs,
    Nca,
    Romfs,
    Save,
    Bucket,
    Ticket,
    Certificate,
}

/// Why the gamecard cannot be read right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReadyKind {
    NotInserted,
    Processing,
    LafwRequired,
    NoGcPatch,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to parse binary data: {0}")]
    BinaryParser(#[from] binrw::Error),
    #[error("Unable to parse string: {0}")]
    StringParser(#[from] core::str::Utf8Error),
    #[error("Gamecard not ready: {0:?}")]
    GamecardNotReady(NotReadyKind),
    #[error("Corrupt {0:?} header: {1}")]
    CorruptHeader(HeaderKind, String),
    #[error("Hash mismatch in {layer} at offset 0x{offset:X}")]
    HashMismatch { layer: &'static str, offset: u64 },
    #[error("Save data failed verification")]
    SaveCorrupt,
    #[error("Key not present: {0}")]
    KeyMissing(String),
    #[error("Crypto operation failed: {0}")]
    CryptoFailure(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Not supported: {0}")]
    UnsupportedVariant(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("RSA-OAEP label hash mismatch")]
    OaepLabelMismatch,
    #[error("RSA-OAEP plaintext prefix mismatch")]
    OaepPrefixMismatch,
    #[error("Operation aborted by caller")]
    Aborted,
}

impl From<InvalidLength> for Error {
    fn from(_: InvalidLength) -> Self {
        Error::CryptoFailure("Invalid key length".to_string())
    }
}

impl Error {
    /// True when retrying after a gamecard status change may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::GamecardNotReady(NotReadyKind::NotInserted | NotReadyKind::Processing)
        )
    }
}
