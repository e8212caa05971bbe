use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Admin API error: {0}")]
    Admin(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("HTTP server error: {0}")]
    Http(String),
}

pub type Result<T> = std::result::Result<T, ScrapeError>;
