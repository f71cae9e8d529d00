use thiserror::Error;

#[derive(Debug, Error)]
pub enum NtvfsError {
    /// The image violates the on-disk format contract.
    #[error("Bogus format: {0}")]
    BogusFormat(String),

    /// A cross reference points outside valid bounds or at a reused record.
    #[error("Bogus offset: {0}")]
    BogusOffset(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Out of memory: {0}")]
    NoMemory(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("End of file: {0}")]
    Eof(String),

    #[error("Write protected: {0}")]
    WriteProtected(String),

    /// The image does not look like the expected filesystem at all.
    #[error("Unknown format: {0}")]
    UnknownFormat(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Filename too long: {0}")]
    FilenameTooLong(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl NtvfsError {
    /// True for errors that describe a damaged or hostile image rather than a caller mistake.
    pub fn is_corruption(&self) -> bool {
        matches!(self, NtvfsError::BogusFormat(_) | NtvfsError::BogusOffset(_))
    }
}
