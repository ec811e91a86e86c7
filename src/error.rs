use std::fmt::{Display, Formatter};

/// Rejections raised synchronously by the allocation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    NoShares,
    InsufficientAmount { total: u64, shares: u32 },
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::NoShares => write!(f, "a lottery needs at least one share"),
            ValidationError::InsufficientAmount { total, shares } => write!(
                f,
                "{} minor units cannot fill {} shares of at least 1 unit",
                total, shares
            ),
        }
    }
}

#[derive(Debug)]
pub enum AppError {
    Http(reqwest::Error),
    Json(serde_json::Error),
    Io(std::io::Error),
    Database(String),
    Validation(ValidationError),
    Generation(String),
    NotFound(String),
    Other(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Http(e) => write!(f, "{}", e),
            AppError::Json(e) => write!(f, "{}", e),
            AppError::Io(e) => write!(f, "{}", e),
            AppError::Database(s) => write!(f, "database: {}", s),
            AppError::Validation(e) => write!(f, "{}", e),
            AppError::Generation(s) => write!(f, "generation failed: {}", s),
            AppError::NotFound(s) => write!(f, "not found: {}", s),
            AppError::Other(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for AppError {}

impl From<reqwest::Error> for AppError {
    fn from(value: reqwest::Error) -> Self {
        AppError::Http(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        AppError::Json(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        AppError::Io(value)
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        AppError::Database(value.to_string())
    }
}

impl From<r2d2::Error> for AppError {
    fn from(value: r2d2::Error) -> Self {
        AppError::Database(value.to_string())
    }
}

impl From<ValidationError> for AppError {
    fn from(value: ValidationError) -> Self {
        AppError::Validation(value)
    }
}

impl From<String> for AppError {
    fn from(value: String) -> Self {
        AppError::Other(value)
    }
}

impl From<&str> for AppError {
    fn from(value: &str) -> Self {
        AppError::Other(value.to_string())
    }
}
