use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("invalid custom format index {0}")]
    InvalidFormat(u32),
    #[error("IO error")]
    IoError(#[from] std::io::Error),
}
