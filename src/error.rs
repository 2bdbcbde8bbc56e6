use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Payload could not be shaped into a violation record at all
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Submission rejected by structural checks before dedup/store
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The resource is held by another operation, try again later
    #[error("Busy: {0}")]
    Busy(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Service error: {0}")]
    Service(String),
}

impl Error {
    /// True for errors caused by the input itself rather than by the environment
    pub fn is_input_error(&self) -> bool {
        matches!(self, Error::MalformedInput(_) | Error::Validation(_))
    }
}
