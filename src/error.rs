use thiserror::Error;

#[derive(Error, Debug)]
pub enum MedSqlError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Example index not found: {0}")]
    IndexNotFound(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("{0}")]
    DatabaseNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, MedSqlError>;
