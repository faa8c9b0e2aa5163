use thiserror::Error;

pub type SfeResult<T> = Result<T, SfeError>;

#[derive(Debug, Error)]
pub enum SfeError {
    #[error("encryption module id \"{id}\" already registered by \"{display_name}\"")]
    ModuleAlreadyExists { id: String, display_name: String },

    #[error("encryption module does not exist: {0}")]
    ModuleDoesNotExist(String),

    #[error("header key \"{0}\" is reserved and can not be set by the encryption module")]
    HeaderKeyExists(String),

    #[error("invalid encryption header: {0}")]
    InvalidHeader(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SfeError {
    /// True for failures raised by the crypto layer while reading content.
    pub fn is_decryption_failure(&self) -> bool {
        matches!(self, SfeError::DecryptionFailed(_))
    }
}
