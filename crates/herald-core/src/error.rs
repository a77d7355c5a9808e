use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeraldError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid timestamp: {value}")]
    InvalidTimestamp { value: String },

    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HeraldError {
    /// Short machine-readable code, used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            HeraldError::Config(_) => "CONFIG_ERROR",
            HeraldError::InvalidTimestamp { .. } => "INVALID_TIMESTAMP",
            HeraldError::UnknownTimezone(_) => "UNKNOWN_TIMEZONE",
            HeraldError::Serialization(_) => "SERIALIZATION_ERROR",
            HeraldError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, HeraldError>;
