use thiserror::Error;

/// Rejections raised when a layer is appended to a position.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PositionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration errors:\n{}", format_problems(.0))]
    Invalid(Vec<String>),

    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

impl ConfigError {
    /// Problems collected during validation, empty for load failures.
    pub fn problems(&self) -> &[String] {
        match self {
            ConfigError::Invalid(problems) => problems,
            ConfigError::Load(_) => &[],
        }
    }
}

fn format_problems(problems: &[String]) -> String {
    problems
        .iter()
        .map(|p| format!("  - {}", p))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("price api returned status {0}")]
    Status(u16),

    #[error("no price data returned for {0}")]
    NoData(String),

    #[error("invalid price {price} for {symbol}")]
    InvalidPrice { symbol: String, price: f64 },

    #[error("invalid request url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage json error: {0}")]
    Json(#[from] serde_json::Error),
}
