use thiserror::Error;

/// Fatal initialization and I/O errors. Data-path failures never surface
/// here; they become response flags and stats.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("config: {0}")]
    Config(String),
    #[error("invalid address '{0}'")]
    InvalidAddress(String),
}
